// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// broadcast routing
// -----------------
//
// a broadcast is a named asynchronous event. the name is not registered
// anywhere: each receiving chunk carries it as an embedded string literal,
// placed by the compiler right after the chunk's `init_locals`:
//
//     init_locals
//     push_literal "name"   <-- the broadcast name
//     recv_broadcast
//     ...
//
// so matching a broadcast means peeking into the compiled code of every
// broadcast-hat chunk and comparing its literal byte-for-byte against the
// message. all of the opcode peeking goes through the decoding helpers in
// the isa crate, so an instruction format change stays localized there.

use tessera_isa::opcode::{arg_of, decode_string_literal, literal_offset, opcode_of, Opcode};
use tessera_isa::ChunkType;
use tessera_store::record::PERSISTENT_HEADER_WORDS;

use crate::{
    codec::{encode_long_frame, MessageType},
    host::HostAdapter,
    runtime::Runtime,
};

/// the broadcast name a chunk's code was compiled to receive, if its
/// preamble has the expected shape. `words` is the full code record,
/// header words included.
fn receiver_name(words: &[u32]) -> Option<Vec<u8>> {
    let first = *words.get(PERSISTENT_HEADER_WORDS)?;
    if opcode_of(first) != Opcode::init_locals as u8 {
        return None;
    }

    let literal_instruction_offset = PERSISTENT_HEADER_WORDS + 1;
    let second = *words.get(literal_instruction_offset)?;
    if opcode_of(second) != Opcode::push_literal as u8 {
        return None;
    }

    let header_offset = literal_offset(literal_instruction_offset, arg_of(second));
    decode_string_literal(words, header_offset)
}

impl<H: HostAdapter> Runtime<H> {
    /// start every broadcast-hat chunk whose literal matches the message
    /// byte-exactly. chunks whose task is already running are left alone
    /// (the start is idempotent); malformed chunks are skipped silently.
    pub fn start_receivers_of_broadcast(&mut self, message: &[u8]) {
        let mut receivers = vec![];
        for chunk_index in self.chunks.used_indexes() {
            let entry = self.chunks.get(chunk_index);
            if entry.chunk_type != ChunkType::BroadcastHat {
                continue;
            }
            let Some(code_ref) = entry.code else {
                continue;
            };
            let Some(words) = self.store.record_words(code_ref) else {
                continue;
            };
            if receiver_name(words).as_deref() == Some(message) {
                receivers.push(chunk_index);
            }
        }

        for chunk_index in receivers {
            self.start_task_for_chunk(chunk_index);
        }
    }

    /// forward a broadcast sent by a running script to the IDE.
    ///
    /// broadcasts are the IDE's window into script-to-script signalling,
    /// so they use the blocking queue rather than being droppable.
    pub fn send_broadcast_to_ide(&mut self, message: &[u8]) {
        let frame = encode_long_frame(MessageType::Broadcast, 0, message);
        self.queue_message_blocking(&frame);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tessera_isa::{
        opcode::{ChunkCodeBuilder, Opcode},
        ChunkType,
    };

    use crate::{host::LoopbackHost, runtime::Runtime, scheduler::TaskStatus};

    fn helper_broadcast_hat_body(name: &str) -> Vec<u8> {
        let words = ChunkCodeBuilder::new()
            .append_opcode_arg(Opcode::init_locals, 0)
            .append_push_literal(name)
            .append_opcode(Opcode::recv_broadcast)
            .append_opcode(Opcode::halt)
            .to_words();

        let mut body = vec![ChunkType::BroadcastHat as u8];
        for word in words {
            body.extend_from_slice(&word.to_le_bytes());
        }
        body
    }

    fn new_runtime() -> Runtime<LoopbackHost> {
        Runtime::new(LoopbackHost::new())
    }

    #[test]
    fn test_matching_broadcast_starts_receiver() {
        let mut runtime = new_runtime();
        runtime.store_code_chunk(2, &helper_broadcast_hat_body("go"));
        runtime.store_code_chunk(3, &helper_broadcast_hat_body("stop"));

        runtime.start_receivers_of_broadcast(b"go");

        assert_eq!(runtime.tasks.find_for_chunk(2), Some(0));
        assert_eq!(runtime.tasks.find_for_chunk(3), None);

        runtime.flush_output();
        let sent = runtime.host_mut().take_sent();
        assert_eq!(sent, vec![0xFA, 0x10, 2]); // one task-started frame
    }

    #[test]
    fn test_broadcast_while_running_does_not_fork() {
        let mut runtime = new_runtime();
        runtime.store_code_chunk(2, &helper_broadcast_hat_body("go"));

        runtime.start_receivers_of_broadcast(b"go");
        runtime.start_receivers_of_broadcast(b"go");

        let live = runtime
            .tasks
            .tasks
            .iter()
            .filter(|task| task.status != TaskStatus::Unused)
            .count();
        assert_eq!(live, 1);

        runtime.flush_output();
        assert_eq!(runtime.host_mut().take_sent(), vec![0xFA, 0x10, 2]);
    }

    #[test]
    fn test_name_comparison_is_byte_exact() {
        let mut runtime = new_runtime();
        runtime.store_code_chunk(1, &helper_broadcast_hat_body("go"));

        runtime.start_receivers_of_broadcast(b"g");
        runtime.start_receivers_of_broadcast(b"go!");
        runtime.start_receivers_of_broadcast(b"GO");

        assert_eq!(runtime.tasks.task_count, 0);
    }

    #[test]
    fn test_malformed_receiver_is_skipped() {
        let mut runtime = new_runtime();

        // a broadcast hat whose second instruction is not push_literal
        let words = ChunkCodeBuilder::new()
            .append_opcode_arg(Opcode::init_locals, 0)
            .append_opcode_arg(Opcode::push_immediate, 1)
            .append_opcode(Opcode::halt)
            .to_words();
        let mut body = vec![ChunkType::BroadcastHat as u8];
        for word in words {
            body.extend_from_slice(&word.to_le_bytes());
        }
        runtime.store_code_chunk(4, &body);

        runtime.start_receivers_of_broadcast(b"go");
        assert_eq!(runtime.tasks.task_count, 0);
    }

    #[test]
    fn test_non_hat_chunks_never_match() {
        let mut runtime = new_runtime();
        // same preamble shape, but a plain command chunk
        let mut body = helper_broadcast_hat_body("go");
        body[0] = ChunkType::CommandStack as u8;
        runtime.store_code_chunk(6, &body);

        runtime.start_receivers_of_broadcast(b"go");
        assert_eq!(runtime.tasks.task_count, 0);
    }

    #[test]
    fn test_send_broadcast_to_ide_frame() {
        let mut runtime = new_runtime();
        runtime.send_broadcast_to_ide(b"hello");
        runtime.flush_output();

        assert_eq!(
            runtime.host_mut().take_sent(),
            vec![0xFB, 0x1B, 0x00, 6, 0, b'h', b'e', b'l', b'l', b'o', 0xFE]
        );
    }
}
