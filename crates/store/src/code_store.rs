// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the append-only record log
// --------------------------
//
// chunk code, chunk attributes, variable names and comments are all kept in
// a single append-only log of records (see the `record` module for the
// record layout). updating a chunk means appending a newer code record,
// deleting it means appending a deletion record; nothing is overwritten in
// place. this mirrors how the data lives in flash on a real board, where
// rewriting a page is expensive but appending is cheap.
//
// the log is compacted when the IDE asks for a full code dump (and when an
// append runs out of room): the latest surviving record of every key is
// rewritten to the front of the log and everything else is discarded.
//
// compaction moves records, so a plain offset would dangle afterwards.
// a `RecordRef` therefore carries the log generation it was created in,
// and every dereference checks it: a stale reference reads as `None`
// instead of reading relocated data.

use std::collections::BTreeMap;

use crate::{
    record::{pack_body, unpack_body, RecordHeader, RecordType, PERSISTENT_HEADER_WORDS},
    StoreError, STORE_CAPACITY_IN_WORDS,
};

/// an opaque reference to a record in the log.
///
/// valid only for the generation of the log it was created in; after a
/// compaction all previously handed out references go stale and every
/// accessor returns `None` for them.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RecordRef {
    generation: u32,
    offset: usize,
}

pub struct CodeStore {
    words: Vec<u32>,
    capacity_in_words: usize,
    generation: u32,
}

impl Default for CodeStore {
    fn default() -> Self {
        Self::new(STORE_CAPACITY_IN_WORDS)
    }
}

impl CodeStore {
    pub fn new(capacity_in_words: usize) -> Self {
        Self {
            words: vec![],
            capacity_in_words,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn used_words(&self) -> usize {
        self.words.len()
    }

    pub fn free_words(&self) -> usize {
        self.capacity_in_words - self.words.len()
    }

    /// append a record and return a reference to it.
    /// fails when the log has no room for the record; the caller decides
    /// whether to compact and retry or to drop the record.
    pub fn append(
        &mut self,
        record_type: RecordType,
        index: u8,
        aux: u8,
        body: &[u8],
    ) -> Result<RecordRef, StoreError> {
        let (body_words, padding) = pack_body(body);

        let needed = PERSISTENT_HEADER_WORDS + body_words.len();
        if needed > self.free_words() {
            return Err(StoreError::new("The record log is full."));
        }

        let header = RecordHeader {
            record_type,
            index,
            aux,
            padding,
            body_word_count: body_words.len(),
        };

        let offset = self.words.len();
        self.words.extend_from_slice(&header.encode());
        self.words.extend_from_slice(&body_words);

        Ok(RecordRef {
            generation: self.generation,
            offset,
        })
    }

    fn check(&self, record_ref: RecordRef) -> Option<usize> {
        if record_ref.generation == self.generation && record_ref.offset < self.words.len() {
            Some(record_ref.offset)
        } else {
            None
        }
    }

    pub fn header(&self, record_ref: RecordRef) -> Option<RecordHeader> {
        let offset = self.check(record_ref)?;
        RecordHeader::decode(&self.words[offset..])
    }

    /// the whole record, header words included.
    /// chunk code references hand this slice to the interpreter, whose
    /// instruction pointer starts at `PERSISTENT_HEADER_WORDS`.
    pub fn record_words(&self, record_ref: RecordRef) -> Option<&[u32]> {
        let offset = self.check(record_ref)?;
        let header = RecordHeader::decode(&self.words[offset..])?;
        let end = offset + PERSISTENT_HEADER_WORDS + header.body_word_count;
        self.words.get(offset..end)
    }

    pub fn body_words(&self, record_ref: RecordRef) -> Option<&[u32]> {
        self.record_words(record_ref)
            .map(|words| &words[PERSISTENT_HEADER_WORDS..])
    }

    /// the body with the word padding stripped off again
    pub fn body_bytes(&self, record_ref: RecordRef) -> Option<Vec<u8>> {
        let header = self.header(record_ref)?;
        let body = self.body_words(record_ref)?;
        Some(unpack_body(body, header.body_byte_count()))
    }

    /// iterate the log in write order: `record_after(None)` is the first
    /// record, `record_after(Some(r))` the one written after `r`.
    pub fn record_after(&self, prev: Option<RecordRef>) -> Option<RecordRef> {
        let offset = match prev {
            None => 0,
            Some(record_ref) => {
                let offset = self.check(record_ref)?;
                let header = RecordHeader::decode(&self.words[offset..])?;
                offset + PERSISTENT_HEADER_WORDS + header.body_word_count
            }
        };

        if offset < self.words.len() {
            Some(RecordRef {
                generation: self.generation,
                offset,
            })
        } else {
            None
        }
    }

    /// the latest code record for a chunk, unless a later deletion record
    /// struck it out
    pub fn latest_chunk_code(&self, chunk_index: u8) -> Option<RecordRef> {
        let mut found = None;

        let mut cursor = self.record_after(None);
        while let Some(record_ref) = cursor {
            let header = self.header(record_ref)?;
            match header.record_type {
                RecordType::ChunkCode if header.index == chunk_index => {
                    found = Some(record_ref);
                }
                RecordType::ChunkDeleted if header.index == chunk_index => {
                    found = None;
                }
                _ => {}
            }
            cursor = self.record_after(cursor);
        }
        found
    }

    /// the latest attribute record for (chunk, attribute id), honoring
    /// chunk deletions
    pub fn latest_chunk_attribute(&self, chunk_index: u8, attribute_id: u8) -> Option<RecordRef> {
        let mut found = None;

        let mut cursor = self.record_after(None);
        while let Some(record_ref) = cursor {
            let header = self.header(record_ref)?;
            match header.record_type {
                RecordType::ChunkAttribute
                    if header.index == chunk_index && header.aux == attribute_id =>
                {
                    found = Some(record_ref);
                }
                RecordType::ChunkDeleted if header.index == chunk_index => {
                    found = None;
                }
                _ => {}
            }
            cursor = self.record_after(cursor);
        }
        found
    }

    /// rewrite the log keeping only the latest non-deleted record of every
    /// key, in index order. bumps the generation, so all outstanding
    /// `RecordRef`s go stale and must be re-resolved by the caller.
    pub fn compact(&mut self) {
        // (offset, length in words) per surviving key
        let mut chunk_code: BTreeMap<u8, (usize, usize)> = BTreeMap::new();
        let mut chunk_attributes: BTreeMap<(u8, u8), (usize, usize)> = BTreeMap::new();
        let mut var_names: BTreeMap<u8, (usize, usize)> = BTreeMap::new();
        let mut comments: BTreeMap<u8, (usize, usize)> = BTreeMap::new();
        let mut comment_positions: BTreeMap<u8, (usize, usize)> = BTreeMap::new();

        let mut cursor = self.record_after(None);
        while let Some(record_ref) = cursor {
            let header = match self.header(record_ref) {
                Some(header) => header,
                None => break,
            };
            let range = (
                record_ref.offset,
                PERSISTENT_HEADER_WORDS + header.body_word_count,
            );

            match header.record_type {
                RecordType::ChunkCode => {
                    chunk_code.insert(header.index, range);
                }
                RecordType::ChunkAttribute => {
                    chunk_attributes.insert((header.index, header.aux), range);
                }
                RecordType::ChunkDeleted => {
                    chunk_code.remove(&header.index);
                    chunk_attributes.retain(|(index, _), _| *index != header.index);
                }
                RecordType::VarName => {
                    var_names.insert(header.index, range);
                }
                RecordType::VarDeleted => {
                    var_names.remove(&header.index);
                }
                RecordType::Comment => {
                    comments.insert(header.index, range);
                }
                RecordType::CommentPosition => {
                    comment_positions.insert(header.index, range);
                }
                RecordType::CommentDeleted => {
                    comments.remove(&header.index);
                    comment_positions.remove(&header.index);
                }
            }
            cursor = self.record_after(cursor);
        }

        let mut survivors: Vec<(usize, usize)> = vec![];
        for (&chunk_index, &range) in &chunk_code {
            survivors.push(range);
            for (&(index, _), &attribute_range) in &chunk_attributes {
                if index == chunk_index {
                    survivors.push(attribute_range);
                }
            }
        }
        // attributes of chunks whose code record was never written
        for (&(index, _), &attribute_range) in &chunk_attributes {
            if !chunk_code.contains_key(&index) {
                survivors.push(attribute_range);
            }
        }
        survivors.extend(var_names.values());
        for (&comment_index, &range) in &comments {
            survivors.push(range);
            if let Some(&position_range) = comment_positions.get(&comment_index) {
                survivors.push(position_range);
            }
        }
        // positions of comments whose text record was never written
        for (&index, &position_range) in &comment_positions {
            if !comments.contains_key(&index) {
                survivors.push(position_range);
            }
        }

        let mut compacted = Vec::with_capacity(self.words.len());
        for (offset, length) in survivors {
            compacted.extend_from_slice(&self.words[offset..offset + length]);
        }

        log::debug!(
            "record log compacted: {} -> {} words",
            self.words.len(),
            compacted.len()
        );

        self.words = compacted;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{
        code_store::CodeStore,
        record::{RecordType, PERSISTENT_HEADER_WORDS},
    };

    fn collect_types_and_indexes(store: &CodeStore) -> Vec<(RecordType, u8)> {
        let mut result = vec![];
        let mut cursor = store.record_after(None);
        while let Some(record_ref) = cursor {
            let header = store.header(record_ref).unwrap();
            result.push((header.record_type, header.index));
            cursor = store.record_after(cursor);
        }
        result
    }

    #[test]
    fn test_append_and_read_back() {
        let mut store = CodeStore::new(64);

        let code: Vec<u8> = [0x0000_0001u32, 0x0000_0000u32]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        let record_ref = store
            .append(RecordType::ChunkCode, 3, 4, &code)
            .unwrap();

        let header = store.header(record_ref).unwrap();
        assert_eq!(header.record_type, RecordType::ChunkCode);
        assert_eq!(header.index, 3);
        assert_eq!(header.aux, 4);
        assert_eq!(header.body_word_count, 2);
        assert_eq!(header.body_byte_count(), 8);

        assert_eq!(store.body_words(record_ref).unwrap(), &[1, 0]);
        assert_eq!(store.body_bytes(record_ref).unwrap(), code);

        // the full record slice includes the header words
        let words = store.record_words(record_ref).unwrap();
        assert_eq!(words.len(), PERSISTENT_HEADER_WORDS + 2);
    }

    #[test]
    fn test_iteration_in_write_order() {
        let mut store = CodeStore::new(64);
        store.append(RecordType::ChunkCode, 1, 1, &[0, 0, 0, 0]).unwrap();
        store.append(RecordType::VarName, 2, 0, b"speed").unwrap();
        store.append(RecordType::Comment, 0, 0, b"hi").unwrap();

        assert_eq!(
            collect_types_and_indexes(&store),
            vec![
                (RecordType::ChunkCode, 1),
                (RecordType::VarName, 2),
                (RecordType::Comment, 0),
            ]
        );
    }

    #[test]
    fn test_append_fails_when_full() {
        let mut store = CodeStore::new(4);
        // 2 header words + 1 body word
        store.append(RecordType::VarName, 0, 0, b"abc").unwrap();
        assert!(store.append(RecordType::VarName, 1, 0, b"def").is_err());
        assert_eq!(store.used_words(), 3);
    }

    #[test]
    fn test_latest_chunk_code_honors_deletion() {
        let mut store = CodeStore::new(64);
        let first = store.append(RecordType::ChunkCode, 5, 1, &[1, 0, 0, 0]).unwrap();
        let second = store.append(RecordType::ChunkCode, 5, 1, &[2, 0, 0, 0]).unwrap();

        assert_ne!(first, second);
        assert_eq!(store.latest_chunk_code(5), Some(second));

        store.append(RecordType::ChunkDeleted, 5, 0, &[]).unwrap();
        assert_eq!(store.latest_chunk_code(5), None);

        // a re-install after the deletion becomes current again
        let third = store.append(RecordType::ChunkCode, 5, 1, &[3, 0, 0, 0]).unwrap();
        assert_eq!(store.latest_chunk_code(5), Some(third));
    }

    #[test]
    fn test_stale_reference_after_compaction() {
        let mut store = CodeStore::new(64);
        let record_ref = store.append(RecordType::ChunkCode, 0, 1, &[1, 0, 0, 0]).unwrap();

        store.compact();

        assert_eq!(store.header(record_ref), None);
        assert_eq!(store.record_words(record_ref), None);
        assert_eq!(store.body_bytes(record_ref), None);

        // re-resolving through the new generation works
        let fresh = store.latest_chunk_code(0).unwrap();
        assert_eq!(store.body_words(fresh).unwrap(), &[1]);
    }

    #[test]
    fn test_compaction_keeps_latest_state_only() {
        let mut store = CodeStore::new(256);

        store.append(RecordType::ChunkCode, 1, 1, &[1, 0, 0, 0]).unwrap();
        store.append(RecordType::ChunkCode, 1, 1, &[2, 0, 0, 0]).unwrap(); // supersedes
        store.append(RecordType::ChunkAttribute, 1, 0, &[9, 9, 9, 9]).unwrap();
        store.append(RecordType::ChunkCode, 2, 4, &[3, 0, 0, 0]).unwrap();
        store.append(RecordType::ChunkDeleted, 2, 0, &[]).unwrap(); // chunk 2 gone
        store.append(RecordType::VarName, 0, 0, b"speed").unwrap();
        store.append(RecordType::VarName, 1, 0, b"old").unwrap();
        store.append(RecordType::VarDeleted, 1, 0, &[]).unwrap(); // var 1 gone
        store.append(RecordType::Comment, 3, 0, b"note").unwrap();
        store.append(RecordType::CommentPosition, 3, 0, &[10, 0, 20, 0]).unwrap();

        store.compact();

        assert_eq!(
            collect_types_and_indexes(&store),
            vec![
                (RecordType::ChunkCode, 1),
                (RecordType::ChunkAttribute, 1),
                (RecordType::VarName, 0),
                (RecordType::Comment, 3),
                (RecordType::CommentPosition, 3),
            ]
        );

        // the surviving chunk 1 record is the latest one
        let code = store.latest_chunk_code(1).unwrap();
        assert_eq!(store.body_words(code).unwrap(), &[2]);

        // compacting an already minimal log changes nothing but the generation
        let generation = store.generation();
        let before = store.used_words();
        store.compact();
        assert_eq!(store.used_words(), before);
        assert_eq!(store.generation(), generation + 1);
    }

    #[test]
    fn test_compaction_frees_room_for_appends() {
        // room for exactly three 3-word records
        let mut store = CodeStore::new(9);
        store.append(RecordType::ChunkCode, 0, 1, &[1, 0, 0, 0]).unwrap();
        store.append(RecordType::ChunkCode, 0, 1, &[2, 0, 0, 0]).unwrap();
        store.append(RecordType::ChunkCode, 0, 1, &[3, 0, 0, 0]).unwrap();
        assert!(store.append(RecordType::ChunkCode, 0, 1, &[4, 0, 0, 0]).is_err());

        store.compact();
        assert_eq!(store.used_words(), 3);

        let record_ref = store.append(RecordType::ChunkCode, 0, 1, &[4, 0, 0, 0]).unwrap();
        assert_eq!(store.latest_chunk_code(0), Some(record_ref));
    }
}
