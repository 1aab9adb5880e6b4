// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

use std::fmt::Display;

pub mod opcode;

// the script model
// ----------------
//
// a user program is not a single image, it is a collection of small
// independent scripts called "chunks". every chunk is compiled by the IDE
// into a short sequence of 32-bit instruction words and downloaded to the
// board one chunk at a time, identified by a stable small integer
// (the chunk index).
//
// the first instructions of a chunk determine when it runs:
//
// - a "start hat" chunk runs when the user presses start (or at power-on),
// - a "when condition hat" chunk runs whenever its condition becomes true,
// - a "broadcast hat" chunk runs when a matching broadcast message arrives,
// - command/reporter/function chunks only run when explicitly started
//   (or called from another chunk).

/// the kind of a code chunk.
///
/// the numeric values are part of the wire protocol (the first body byte of
/// a "chunk code" message) and of the persistent record format (the aux
/// byte of a chunk code record), so they must stay fixed.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkType {
    Unused = 0,
    CommandStack = 1,
    Reporter = 2,
    Function = 3,
    StartHat = 4,
    WhenConditionHat = 5,
    BroadcastHat = 6,
}

impl ChunkType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let chunk_type = match value {
            0 => ChunkType::Unused,
            1 => ChunkType::CommandStack,
            2 => ChunkType::Reporter,
            3 => ChunkType::Function,
            4 => ChunkType::StartHat,
            5 => ChunkType::WhenConditionHat,
            6 => ChunkType::BroadcastHat,
            _ => return None,
        };
        Some(chunk_type)
    }

    /// true for the chunk kinds that auto-start on "start all"
    pub fn is_startable_hat(&self) -> bool {
        matches!(self, ChunkType::StartHat | ChunkType::WhenConditionHat)
    }
}

/// the chunk attributes the IDE attaches to a chunk (editor position,
/// source text, the original block representation).
///
/// attributes are not interpreted by the VM, they are only persisted and
/// played back to the IDE on a full code dump.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkAttribute {
    Position = 0,
    Source = 1,
    SnapSource = 2,
}

pub const ATTRIBUTE_COUNT: u8 = 3;

impl ChunkAttribute {
    pub fn from_u8(value: u8) -> Option<Self> {
        let attribute = match value {
            0 => ChunkAttribute::Position,
            1 => ChunkAttribute::Source,
            2 => ChunkAttribute::SnapSource,
            _ => return None,
        };
        Some(attribute)
    }
}

/// a tagged runtime value.
///
/// the original firmware keeps values as tagged machine words pointing into
/// an object heap and checks them with class predicates. the heap is outside
/// this runtime, so values crossing the runtime boundary (variables, task
/// results, "say" output) are carried as this variant type instead, and the
/// wire encoder is a plain match on the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    Str(String),
    ByteArray(Vec<u8>),
}

impl Default for Value {
    /// a fresh (or deleted) variable slot holds integer zero
    fn default() -> Self {
        Value::Int(0)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Str(s) => write!(f, "{}", s),
            Value::ByteArray(bytes) => write!(f, "(byte array, {} bytes)", bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{ChunkType, Value};

    #[test]
    fn test_chunk_type_conversion() {
        assert_eq!(ChunkType::from_u8(0), Some(ChunkType::Unused));
        assert_eq!(ChunkType::from_u8(4), Some(ChunkType::StartHat));
        assert_eq!(ChunkType::from_u8(6), Some(ChunkType::BroadcastHat));
        assert_eq!(ChunkType::from_u8(7), None);

        assert!(ChunkType::StartHat.is_startable_hat());
        assert!(ChunkType::WhenConditionHat.is_startable_hat());
        assert!(!ChunkType::BroadcastHat.is_startable_hat());
        assert!(!ChunkType::CommandStack.is_startable_hat());
    }

    #[test]
    fn test_default_value() {
        assert_eq!(Value::default(), Value::Int(0));
    }
}
