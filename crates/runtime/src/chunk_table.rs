// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the chunk table
// ---------------
//
// a flat array of MAX_CHUNKS entries, indexed by the chunk index the IDE
// assigned when it downloaded the script. an entry is either unused (the
// sentinel chunk type and no code reference) or it points at the latest
// code record for that chunk in the record log.
//
// the table itself is volatile; the log is the durable copy. at boot (and
// after a log compaction) the table is rebuilt by replaying the log.

use tessera_isa::{ChunkType, ATTRIBUTE_COUNT};
use tessera_store::{code_store::RecordRef, record::RecordType};

use crate::{
    codec::{encode_long_frame, MessageType},
    host::HostAdapter,
    runtime::Runtime,
    MAX_CHUNKS,
};

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ChunkEntry {
    pub chunk_type: ChunkType,
    pub code: Option<RecordRef>,
}

impl Default for ChunkEntry {
    fn default() -> Self {
        Self {
            chunk_type: ChunkType::Unused,
            code: None,
        }
    }
}

pub struct ChunkTable {
    entries: Vec<ChunkEntry>,
}

impl Default for ChunkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkTable {
    pub fn new() -> Self {
        Self {
            entries: vec![ChunkEntry::default(); MAX_CHUNKS],
        }
    }

    pub fn get(&self, chunk_index: u8) -> ChunkEntry {
        self.entries[chunk_index as usize]
    }

    pub fn set(&mut self, chunk_index: u8, chunk_type: ChunkType, code: RecordRef) {
        self.entries[chunk_index as usize] = ChunkEntry {
            chunk_type,
            code: Some(code),
        };
    }

    pub fn clear(&mut self, chunk_index: u8) {
        self.entries[chunk_index as usize] = ChunkEntry::default();
    }

    pub fn is_used(&self, chunk_index: u8) -> bool {
        self.entries[chunk_index as usize].code.is_some()
    }

    /// the indexes of all occupied entries, ascending
    pub fn used_indexes(&self) -> Vec<u8> {
        (0..MAX_CHUNKS)
            .filter(|&index| self.entries[index].code.is_some())
            .map(|index| index as u8)
            .collect()
    }
}

impl<H: HostAdapter> Runtime<H> {
    /// the "chunk code" message: the first body byte is the chunk type,
    /// the rest is the compiled code. the record is appended to the log
    /// first and the table entry then binds to it.
    pub fn store_code_chunk(&mut self, chunk_index: u8, body: &[u8]) {
        let Some((&type_byte, code_bytes)) = body.split_first() else {
            return;
        };
        let Some(chunk_type) = ChunkType::from_u8(type_byte) else {
            log::debug!("chunk {} with unknown type {} ignored", chunk_index, type_byte);
            return;
        };
        if chunk_type == ChunkType::Unused || code_bytes.is_empty() {
            return;
        }

        let Some(record_ref) = self.persist(RecordType::ChunkCode, chunk_index, type_byte, code_bytes)
        else {
            return;
        };
        self.chunks.set(chunk_index, chunk_type, record_ref);
        log::debug!(
            "chunk {} stored, type {:?}, {} code bytes",
            chunk_index,
            chunk_type,
            code_bytes.len()
        );
    }

    /// the "chunk attribute" message: the first body byte is the
    /// attribute id, the rest is the attribute value. attributes are only
    /// persisted, never cached in the table.
    pub fn store_chunk_attribute(&mut self, chunk_index: u8, body: &[u8]) {
        let Some((&attribute_id, value)) = body.split_first() else {
            return;
        };
        if attribute_id >= ATTRIBUTE_COUNT {
            return;
        }
        self.persist(
            RecordType::ChunkAttribute,
            chunk_index,
            attribute_id,
            value,
        );
    }

    /// delete one chunk: stop its task first, then unbind the table entry
    /// and strike the chunk out of the log
    pub fn delete_code_chunk(&mut self, chunk_index: u8) {
        if !self.chunks.is_used(chunk_index) {
            return;
        }
        self.stop_task_for_chunk(chunk_index);
        self.chunks.clear(chunk_index);
        self.persist(RecordType::ChunkDeleted, chunk_index, 0, &[]);
    }

    /// the "delete all code" message: stop everything, then strike every
    /// occupied chunk out of the log
    pub fn delete_all_code(&mut self) {
        self.stop_all_tasks();
        for chunk_index in self.chunks.used_indexes() {
            self.chunks.clear(chunk_index);
            self.persist(RecordType::ChunkDeleted, chunk_index, 0, &[]);
        }
    }

    /// the "get all code" dump: compact the log down to its canonical
    /// minimum, then replay every chunk's code and attributes to the IDE.
    ///
    /// dump frames go through the blocking queue: the IDE asked for the
    /// dump, so it is draining its end of the line, and dropping parts of
    /// a dump would defeat its purpose.
    pub fn send_all_code(&mut self) {
        self.compact_store();

        for chunk_index in self.chunks.used_indexes() {
            let entry = self.chunks.get(chunk_index);
            let Some(code_ref) = entry.code else {
                continue;
            };
            let Some(code_bytes) = self.store.body_bytes(code_ref) else {
                continue;
            };

            let mut body = vec![entry.chunk_type as u8];
            body.extend_from_slice(&code_bytes);
            let frame = encode_long_frame(MessageType::ChunkCode, chunk_index, &body);
            self.queue_message_blocking(&frame);

            for attribute_id in 0..ATTRIBUTE_COUNT {
                let Some(attribute_ref) =
                    self.store.latest_chunk_attribute(chunk_index, attribute_id)
                else {
                    continue;
                };
                let Some(value) = self.store.body_bytes(attribute_ref) else {
                    continue;
                };

                let mut body = vec![attribute_id];
                body.extend_from_slice(&value);
                let frame =
                    encode_long_frame(MessageType::ChunkAttribute, chunk_index, &body);
                self.queue_message_blocking(&frame);
            }
        }
    }

    /// rebuild the chunk table by replaying the record log, the boot path
    /// after a power cycle
    pub fn restore_chunks_from_store(&mut self) {
        let mut restored: Vec<(u8, ChunkType, RecordRef)> = vec![];

        let mut cursor = self.store.record_after(None);
        while let Some(record_ref) = cursor {
            if let Some(header) = self.store.header(record_ref) {
                match header.record_type {
                    RecordType::ChunkCode => {
                        if let Some(chunk_type) = ChunkType::from_u8(header.aux) {
                            restored.retain(|(index, _, _)| *index != header.index);
                            restored.push((header.index, chunk_type, record_ref));
                        }
                    }
                    RecordType::ChunkDeleted => {
                        restored.retain(|(index, _, _)| *index != header.index);
                    }
                    _ => {}
                }
            }
            cursor = self.store.record_after(cursor);
        }

        for (chunk_index, chunk_type, record_ref) in restored {
            self.chunks.set(chunk_index, chunk_type, record_ref);
        }
    }
}
