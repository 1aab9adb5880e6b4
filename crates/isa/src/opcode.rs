// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the instruction scheme
// ----------------------
//
// Tessera Core VM instructions are fixed-length 32-bit words:
//
//    MSB                             LSB
// 32 |---------------------------------| 0
//    |        24        |       8      | bits
//    |------------------|--------------|
//    | argument         | opcode       |
//    |------------------|--------------|
//
// the argument is a signed 24-bit number (sign extended on extraction).
// depending on the opcode it is an immediate value, a variable index,
// a jump displacement in words, or a literal displacement (see below).
//
// embedded literals
// -----------------
//
// string literals are embedded in the instruction stream itself, after the
// last instruction of the chunk. a `push_literal` instruction at word
// offset `i` references the literal object at word offset `i + arg + 1`:
//
//              |---------------------------------------------------|
//   word i --> | push_literal (arg = displacement)                 |
//              | ...                                               |
//              | halt                                              |
//  i+arg+1 --> | literal header: byte count (24 bits) | type (8)   |
//              | literal bytes packed into words, zero padded      |
//              |---------------------------------------------------|
//
// the only literal type the runtime itself inspects is the string type
// (broadcast hats carry their broadcast name this way); all other literal
// handling belongs to the interpreter.

/// the number of valid opcodes, for range checks
pub const MAX_OPCODE_NUMBER: usize = 0x0e;

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[allow(non_camel_case_types)]
pub enum Opcode {
    // stop the current task
    // () -> ()
    halt = 0x00,

    // reserve the local variable area of the chunk,
    // always the first instruction of a compiled chunk
    // (param local_count:i24) -> ()
    init_locals = 0x01,

    // (param immediate_number:i24) -> i32
    push_immediate = 0x02,

    // push an embedded literal object
    // (param displacement_in_words:i24) -> object
    push_literal = 0x03,

    // (operand value:any) -> ()
    pop = 0x04,

    // (param variable_index:i24) -> value
    push_var = 0x05,

    // (param variable_index:i24) (operand value:any) -> ()
    store_var = 0x06,

    // (param displacement_in_words:i24) -> ()
    jmp = 0x07,

    // (param displacement_in_words:i24) (operand condition:bool) -> ()
    jmp_false = 0x08,

    // call another chunk as a function
    // (param chunk_index:i24) -> ()
    call_function = 0x09,

    // (operand result:any) -> ()
    return_result = 0x0a,

    // suspend the current task for the given duration
    // (operand duration:i32) -> ()
    wait_micros = 0x0b,

    // (operand message:string) -> ()
    send_broadcast = 0x0c,

    // marker carried by broadcast hat chunks, a no-op when executed
    // () -> ()
    recv_broadcast = 0x0d,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        if value as usize >= MAX_OPCODE_NUMBER {
            return None;
        }
        let opcode = match value {
            0x00 => Opcode::halt,
            0x01 => Opcode::init_locals,
            0x02 => Opcode::push_immediate,
            0x03 => Opcode::push_literal,
            0x04 => Opcode::pop,
            0x05 => Opcode::push_var,
            0x06 => Opcode::store_var,
            0x07 => Opcode::jmp,
            0x08 => Opcode::jmp_false,
            0x09 => Opcode::call_function,
            0x0a => Opcode::return_result,
            0x0b => Opcode::wait_micros,
            0x0c => Opcode::send_broadcast,
            0x0d => Opcode::recv_broadcast,
            _ => return None,
        };
        Some(opcode)
    }
}

/// assemble an instruction word from an opcode and a signed 24-bit argument
pub fn encode_instruction(opcode: Opcode, arg: i32) -> u32 {
    ((arg as u32) << 8) | (opcode as u32)
}

/// the opcode field (low 8 bits) of an instruction word
pub fn opcode_of(word: u32) -> u8 {
    (word & 0xff) as u8
}

/// the argument field (high 24 bits, sign extended) of an instruction word
pub fn arg_of(word: u32) -> i32 {
    (word as i32) >> 8
}

// literal types, the low 8 bits of a literal header word
pub const LITERAL_TYPE_STRING: u8 = 1;

/// the word offset of the literal referenced by the `push_literal`
/// instruction at word offset `instruction_offset`
pub fn literal_offset(instruction_offset: usize, arg: i32) -> usize {
    (instruction_offset as i64 + arg as i64 + 1) as usize
}

/// build the words of an embedded string literal:
/// a header word followed by the UTF-8 bytes packed little-endian,
/// zero padded to a word boundary
pub fn encode_string_literal(text: &str) -> Vec<u32> {
    let bytes = text.as_bytes();
    let header = ((bytes.len() as u32) << 8) | (LITERAL_TYPE_STRING as u32);

    let mut words = vec![header];
    for quad in bytes.chunks(4) {
        let mut buf = [0u8; 4];
        buf[..quad.len()].copy_from_slice(quad);
        words.push(u32::from_le_bytes(buf));
    }
    words
}

/// read the embedded string literal whose header word is at
/// `header_offset`. returns None when the offset is out of range, the
/// literal is not a string, or the recorded length exceeds the code.
pub fn decode_string_literal(words: &[u32], header_offset: usize) -> Option<Vec<u8>> {
    let header = *words.get(header_offset)?;
    if (header & 0xff) as u8 != LITERAL_TYPE_STRING {
        return None;
    }

    let byte_count = (header >> 8) as usize;
    let word_count = byte_count.div_ceil(4);
    if header_offset + 1 + word_count > words.len() {
        return None;
    }

    let mut bytes = Vec::with_capacity(byte_count);
    for word in &words[header_offset + 1..header_offset + 1 + word_count] {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes.truncate(byte_count);
    Some(bytes)
}

/// helper object for building the instruction words of a chunk,
/// mainly used by unit tests and the IDE-side compiler.
///
/// `append_push_literal` records a patch site; the literal objects are
/// appended after the final instruction when `to_words` is called and the
/// displacements are fixed up then.
pub struct ChunkCodeBuilder {
    words: Vec<u32>,
    // (instruction word offset, literal text)
    pending_literals: Vec<(usize, String)>,
}

impl Default for ChunkCodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCodeBuilder {
    pub fn new() -> Self {
        Self {
            words: vec![],
            pending_literals: vec![],
        }
    }

    pub fn append_opcode(mut self, opcode: Opcode) -> Self {
        self.words.push(encode_instruction(opcode, 0));
        self
    }

    pub fn append_opcode_arg(mut self, opcode: Opcode, arg: i32) -> Self {
        self.words.push(encode_instruction(opcode, arg));
        self
    }

    pub fn append_push_literal(mut self, text: &str) -> Self {
        let offset = self.words.len();
        self.words.push(encode_instruction(Opcode::push_literal, 0));
        self.pending_literals.push((offset, text.to_owned()));
        self
    }

    pub fn to_words(mut self) -> Vec<u32> {
        for (offset, text) in &self.pending_literals {
            let displacement = self.words.len() as i32 - *offset as i32 - 1;
            self.words[*offset] = encode_instruction(Opcode::push_literal, displacement);
            self.words.extend(encode_string_literal(text));
        }
        self.words
    }
}
