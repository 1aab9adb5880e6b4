// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the wire protocol
// -----------------
//
// the IDE and the VM exchange two frame shapes over a best-effort byte
// channel. payload byte order is little-endian throughout.
//
// short frame, 3 bytes:
//
//              |------------------------------------------|
//              | 0xFA | message type (u8) | argument (u8) |
//              |------------------------------------------|
//
// long frame, 5 + N + 1 bytes:
//
//              |--------------------------------------------------------|
//              | 0xFB | message type (u8) | argument (u8) | lenLo (u8)  |
//              | lenHi (u8) | body byte 0 .. body byte N-1 | 0xFE       |
//              |--------------------------------------------------------|
//
// `len = lenLo | lenHi << 8` counts the body plus the closing terminator,
// i.e. `len = N + 1`. the argument byte carries a chunk, variable or
// comment index, or zero when unused.
//
// message types live in `[0x01, 0x20]`; the decoder treats anything else
// as line noise and resynchronizes on the next plausible frame start.

pub const SHORT_FRAME_START: u8 = 0xFA;
pub const LONG_FRAME_START: u8 = 0xFB;
pub const FRAME_TERMINATOR: u8 = 0xFE;

pub const MIN_MESSAGE_TYPE: u8 = 0x01;
pub const MAX_MESSAGE_TYPE: u8 = 0x20;

/// the assigned message type identifiers.
///
/// these are frozen: the IDE and every firmware version in the field agree
/// on them, so values may be added but never reused or renumbered.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageType {
    // IDE -> VM, long: first body byte is the chunk type, the rest is code
    ChunkCode = 0x01,
    // IDE -> VM, short
    DeleteChunk = 0x02,
    StartChunk = 0x03,
    StopChunk = 0x04,
    StartAll = 0x05,
    StopAll = 0x06,
    // IDE -> VM short request; VM -> IDE long reply with the encoded value
    GetVar = 0x07,
    // IDE -> VM, long: body is a type-prefixed value
    SetVar = 0x08,
    // IDE -> VM, short
    DeleteVar = 0x09,
    DeleteComment = 0x0a,
    GetVersion = 0x0c,
    GetAllCode = 0x0d,
    DeleteAllCode = 0x0e,
    SystemReset = 0x0f,
    // VM -> IDE, short
    TaskStarted = 0x10,
    TaskDone = 0x11,
    // VM -> IDE, long: body is the encoded result value
    TaskReturnedValue = 0x12,
    // VM -> IDE, long: body is an error code byte and a u32 location
    TaskError = 0x13,
    // VM -> IDE, long: a value produced while a task runs (say/print)
    OutputValue = 0x14,
    // VM -> IDE, long: version text and board type
    VersionReply = 0x16,
    // both directions, short: keep-alive echo
    Ping = 0x1a,
    // both directions, long: broadcast message text
    Broadcast = 0x1b,
    // IDE -> VM, long (first body byte is the attribute id); also replayed
    // VM -> IDE in a full code dump
    ChunkAttribute = 0x1c,
    // IDE -> VM, long
    VarName = 0x1d,
    Comment = 0x1e,
    CommentPosition = 0x1f,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let message_type = match value {
            0x01 => MessageType::ChunkCode,
            0x02 => MessageType::DeleteChunk,
            0x03 => MessageType::StartChunk,
            0x04 => MessageType::StopChunk,
            0x05 => MessageType::StartAll,
            0x06 => MessageType::StopAll,
            0x07 => MessageType::GetVar,
            0x08 => MessageType::SetVar,
            0x09 => MessageType::DeleteVar,
            0x0a => MessageType::DeleteComment,
            0x0c => MessageType::GetVersion,
            0x0d => MessageType::GetAllCode,
            0x0e => MessageType::DeleteAllCode,
            0x0f => MessageType::SystemReset,
            0x10 => MessageType::TaskStarted,
            0x11 => MessageType::TaskDone,
            0x12 => MessageType::TaskReturnedValue,
            0x13 => MessageType::TaskError,
            0x14 => MessageType::OutputValue,
            0x16 => MessageType::VersionReply,
            0x1a => MessageType::Ping,
            0x1b => MessageType::Broadcast,
            0x1c => MessageType::ChunkAttribute,
            0x1d => MessageType::VarName,
            0x1e => MessageType::Comment,
            0x1f => MessageType::CommentPosition,
            _ => return None,
        };
        Some(message_type)
    }
}

/// a byte that could start a message type field.
/// the resynchronization scan accepts any value in range, assigned or not;
/// unknown-but-in-range types are consumed and ignored by the dispatcher.
pub fn is_legal_message_type(value: u8) -> bool {
    (MIN_MESSAGE_TYPE..=MAX_MESSAGE_TYPE).contains(&value)
}

pub fn encode_short_frame(message_type: MessageType, arg: u8) -> [u8; 3] {
    [SHORT_FRAME_START, message_type as u8, arg]
}

pub fn encode_long_frame(message_type: MessageType, arg: u8, body: &[u8]) -> Vec<u8> {
    // the length field counts the body plus the terminator
    let len = body.len() + 1;

    let mut frame = Vec::with_capacity(5 + len);
    frame.push(LONG_FRAME_START);
    frame.push(message_type as u8);
    frame.push(arg);
    frame.push((len & 0xff) as u8);
    frame.push((len >> 8) as u8);
    frame.extend_from_slice(body);
    frame.push(FRAME_TERMINATOR);
    frame
}
