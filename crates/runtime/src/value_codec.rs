// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the value payload encoding
// --------------------------
//
// variable reads/writes, task results and "say" output all carry a tagged
// value as a message body:
//
//              |---------------------------------------|
//              | type tag (u8) | payload (N bytes)     |
//              |---------------------------------------|
//
// - tag 1, integer: 4 bytes, little-endian two's complement
// - tag 2, string:  UTF-8 bytes, no terminator
// - tag 3, boolean: 1 byte, 1 = true, 0 = false
// - tag 4, byte array: the raw storage bytes
//
// the whole body is capped at 500 bytes; longer strings are truncated on
// encode (at a character boundary, so the payload stays valid UTF-8).
// decoding accepts tags 1-3; byte arrays only travel VM -> IDE.

use tessera_isa::Value;

pub const VALUE_TYPE_INT: u8 = 1;
pub const VALUE_TYPE_STRING: u8 = 2;
pub const VALUE_TYPE_BOOLEAN: u8 = 3;
pub const VALUE_TYPE_BYTE_ARRAY: u8 = 4;

pub const VALUE_BODY_CEILING: usize = 500;

pub fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Int(number) => {
            let mut body = vec![VALUE_TYPE_INT];
            body.extend_from_slice(&number.to_le_bytes());
            body
        }
        Value::Str(text) => {
            let mut end = text.len().min(VALUE_BODY_CEILING - 1);
            while !text.is_char_boundary(end) {
                end -= 1;
            }

            let mut body = vec![VALUE_TYPE_STRING];
            body.extend_from_slice(&text.as_bytes()[..end]);
            body
        }
        Value::Bool(flag) => {
            vec![VALUE_TYPE_BOOLEAN, u8::from(*flag)]
        }
        Value::ByteArray(bytes) => {
            let end = bytes.len().min(VALUE_BODY_CEILING - 1);
            let mut body = vec![VALUE_TYPE_BYTE_ARRAY];
            body.extend_from_slice(&bytes[..end]);
            body
        }
    }
}

/// decode a "set variable" body. returns None for an unknown tag, a
/// malformed payload, or a byte array (which the IDE never sends).
pub fn decode_value(body: &[u8]) -> Option<Value> {
    let (&tag, payload) = body.split_first()?;
    match tag {
        VALUE_TYPE_INT => {
            let bytes: [u8; 4] = payload.try_into().ok()?;
            Some(Value::Int(i32::from_le_bytes(bytes)))
        }
        VALUE_TYPE_STRING => {
            let text = std::str::from_utf8(payload).ok()?;
            Some(Value::Str(text.to_owned()))
        }
        VALUE_TYPE_BOOLEAN => {
            if payload.len() != 1 {
                return None;
            }
            Some(Value::Bool(payload[0] != 0))
        }
        _ => None,
    }
}
