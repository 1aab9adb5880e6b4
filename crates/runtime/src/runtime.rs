// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

use tessera_isa::Value;
use tessera_store::{
    code_store::{CodeStore, RecordRef},
    record::RecordType,
};

use crate::{
    chunk_table::ChunkTable,
    codec::{encode_long_frame, encode_short_frame, MessageType},
    dispatcher::RCVBUF_SIZE,
    host::HostAdapter,
    output_ring::OutputRing,
    scheduler::TaskTable,
    value_codec::encode_value,
    MAX_VARS,
};

/// the owner of all runtime state.
///
/// the original firmware keeps these as file-scope globals; gathering them
/// into one struct keeps the VM embeddable (several instances, a simulator
/// next to a real port) without changing the single-threaded discipline:
/// every mutation goes through `&mut self`, from the dispatcher or from
/// the interpreter callbacks, never from an interrupt handler.
pub struct Runtime<H: HostAdapter> {
    pub(crate) host: H,
    pub(crate) store: CodeStore,
    pub(crate) chunks: ChunkTable,
    pub(crate) tasks: TaskTable,
    pub(crate) vars: Vec<Value>,
    pub(crate) output: OutputRing,

    // the partial in-flight inbound message
    pub(crate) rcv_buf: [u8; RCVBUF_SIZE],
    pub(crate) rcv_byte_count: usize,
    pub(crate) last_rcv_time: u32,
}

impl<H: HostAdapter> Runtime<H> {
    pub fn new(host: H) -> Self {
        Self::with_store(host, CodeStore::default())
    }

    /// boot with an existing record log (i.e. what survived in flash):
    /// the chunk table is rebuilt from the log before the first tick.
    pub fn with_store(host: H, store: CodeStore) -> Self {
        let mut runtime = Self {
            host,
            store,
            chunks: ChunkTable::new(),
            tasks: TaskTable::new(),
            vars: vec![Value::default(); MAX_VARS],
            output: OutputRing::new(),
            rcv_buf: [0; RCVBUF_SIZE],
            rcv_byte_count: 0,
            last_rcv_time: 0,
        };
        runtime.restore_chunks_from_store();
        runtime
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn store(&self) -> &CodeStore {
        &self.store
    }

    pub fn variable(&self, var_index: u8) -> Option<&Value> {
        self.vars.get(var_index as usize)
    }

    pub fn set_variable(&mut self, var_index: u8, value: Value) -> bool {
        match self.vars.get_mut(var_index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // outbound plumbing
    // ------------------------------------------------------------------

    /// queue a complete frame, or drop it as a whole when the ring is too
    /// full. a message is never partially queued.
    pub(crate) fn queue_message(&mut self, frame: &[u8]) -> bool {
        if !self.output.has_space(frame.len()) {
            log::warn!("output ring full, {} byte message dropped", frame.len());
            return false;
        }
        for &byte in frame {
            self.output.enqueue_byte(byte);
        }
        true
    }

    /// queue a frame that must not be dropped (full code dumps, broadcasts
    /// to the IDE), spin-draining the ring until it fits.
    ///
    /// this is the single inversion of the cooperative rule: while
    /// spinning, only output drains happen; the dispatcher and the
    /// interpreter do not run. only call it when the host is known to be
    /// accepting bytes, and never from the handler of a message that can
    /// itself be large.
    pub(crate) fn queue_message_blocking(&mut self, frame: &[u8]) {
        while !self.output.has_space(frame.len()) {
            self.output.drain_one(&mut self.host);
        }
        for &byte in frame {
            self.output.enqueue_byte(byte);
        }
    }

    /// drain queued output until the ring is empty or the transmitter
    /// stops taking bytes
    pub fn flush_output(&mut self) {
        while !self.output.is_empty() {
            let before = self.output.count();
            self.output.drain_one(&mut self.host);
            if self.output.count() == before {
                break;
            }
        }
    }

    pub fn pending_output_bytes(&self) -> usize {
        self.output.count()
    }

    /// a value produced while a task runs (the "say" / "print" path)
    pub fn output_value(&mut self, chunk_index: u8, value: &Value) {
        let body = encode_value(value);
        let frame = encode_long_frame(MessageType::OutputValue, chunk_index, &body);
        self.queue_message(&frame);
    }

    /// a human-readable status string, e.g. "All tasks stopped"
    pub(crate) fn send_diagnostic(&mut self, text: &str) {
        self.output_value(0, &Value::Str(text.to_owned()));
    }

    pub(crate) fn send_version(&mut self) {
        let text = format!(
            "{} {}",
            crate::runtime_version_string(),
            self.host.board_type()
        );
        let frame = encode_long_frame(MessageType::VersionReply, 0, text.as_bytes());
        self.queue_message(&frame);
    }

    pub(crate) fn send_ping_reply(&mut self) {
        let frame = encode_short_frame(MessageType::Ping, 0);
        self.queue_message(&frame);
    }

    // ------------------------------------------------------------------
    // persistence plumbing
    // ------------------------------------------------------------------

    /// append a record; when the log is full, compact once and retry, and
    /// drop the record if even that is not enough. returns the reference
    /// of the appended record, or None when it was dropped.
    pub(crate) fn persist(
        &mut self,
        record_type: RecordType,
        index: u8,
        aux: u8,
        body: &[u8],
    ) -> Option<RecordRef> {
        if let Ok(record_ref) = self.store.append(record_type, index, aux, body) {
            return Some(record_ref);
        }

        self.compact_store();
        match self.store.append(record_type, index, aux, body) {
            Ok(record_ref) => Some(record_ref),
            Err(error) => {
                log::warn!("record dropped: {}", error);
                None
            }
        }
    }

    /// compact the record log and re-resolve every outstanding code
    /// reference (chunk table entries and running tasks) against the new
    /// generation
    pub(crate) fn compact_store(&mut self) {
        self.store.compact();
        self.rebind_code_references();
    }

    fn rebind_code_references(&mut self) {
        for chunk_index in self.chunks.used_indexes() {
            let entry = self.chunks.get(chunk_index);
            match self.store.latest_chunk_code(chunk_index) {
                Some(record_ref) => self.chunks.set(chunk_index, entry.chunk_type, record_ref),
                None => self.chunks.clear(chunk_index),
            }
        }

        // a task keeps running across a compaction as long as its chunk's
        // current code still contains the task's instruction pointer;
        // otherwise its run is over and is reported as such
        let mut stopped_slots = vec![];
        for slot in 0..self.tasks.task_count {
            let task = &self.tasks.tasks[slot];
            if task.status == crate::scheduler::TaskStatus::Unused {
                continue;
            }
            let rebound = self
                .store
                .latest_chunk_code(task.current_chunk_index)
                .filter(|record_ref| {
                    self.store
                        .record_words(*record_ref)
                        .is_some_and(|words| task.ip < words.len())
                });
            match rebound {
                Some(record_ref) => self.tasks.tasks[slot].code = Some(record_ref),
                None => stopped_slots.push(slot),
            }
        }
        for slot in stopped_slots {
            self.finish_task(slot);
        }
    }
}
