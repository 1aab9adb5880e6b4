// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the task table
// --------------
//
// a fixed-size table of cooperative tasks. this module only manages the
// table: creation, cancellation and the matching rules. actually advancing
// a runnable task is the interpreter's job; it walks the first
// `task_count` entries round-robin, executes one quantum of byte code per
// runnable task, and reports terminations back through the `Runtime`
// notification methods below.
//
// two rules keep the table simple:
//
// - at most one live task per chunk index. starting a chunk that is
//   already running is a no-op (so a broadcast arriving twice does not
//   fork a second copy of the script).
// - `task_count` is tight: entries at and beyond it are unused, and it
//   shrinks as soon as the highest entries free up, so the interpreter's
//   round-robin never scans a long dead tail.

use tessera_isa::Value;
use tessera_store::{code_store::RecordRef, record::PERSISTENT_HEADER_WORDS};

use crate::{
    codec::{encode_long_frame, encode_short_frame, MessageType},
    host::HostAdapter,
    runtime::Runtime,
    value_codec::encode_value,
    MAX_TASKS,
};

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TaskStatus {
    Unused = 0,
    Running,
    // waiting until `wake_time`
    Waiting,
    // re-evaluating a "when condition" hat
    Polling,
    // finished, result value not yet reported
    DoneValue,
}

/// one runtime execution of a chunk.
///
/// `sp` and `fp` index the interpreter's per-task operand area; `fp == 0`
/// means the task is not inside a function call, and `current_chunk_index`
/// tracks the callee while it differs from the chunk the task was started
/// for.
#[derive(Debug, Clone)]
pub struct Task {
    pub status: TaskStatus,
    pub task_chunk_index: u8,
    pub current_chunk_index: u8,
    pub code: Option<RecordRef>,
    // word offset of the next instruction within the code record
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
    // microsecond deadline scratch for Waiting tasks
    pub wake_time: u32,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            status: TaskStatus::Unused,
            task_chunk_index: 0,
            current_chunk_index: 0,
            code: None,
            ip: 0,
            sp: 0,
            fp: 0,
            wake_time: 0,
        }
    }
}

pub struct TaskTable {
    pub tasks: Vec<Task>,
    // entries at `task_count` and beyond are unused
    pub task_count: usize,
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: vec![Task::default(); MAX_TASKS],
            task_count: 0,
        }
    }

    pub fn find_for_chunk(&self, chunk_index: u8) -> Option<usize> {
        (0..self.task_count).find(|&slot| {
            self.tasks[slot].status != TaskStatus::Unused
                && self.tasks[slot].task_chunk_index == chunk_index
        })
    }

    fn first_unused(&self) -> Option<usize> {
        (0..MAX_TASKS).find(|&slot| self.tasks[slot].status == TaskStatus::Unused)
    }

    fn tighten(&mut self) {
        while self.task_count > 0 && self.tasks[self.task_count - 1].status == TaskStatus::Unused {
            self.task_count -= 1;
        }
    }

    fn reset(&mut self) {
        for task in self.tasks.iter_mut() {
            *task = Task::default();
        }
        self.task_count = 0;
    }
}

impl<H: HostAdapter> Runtime<H> {
    /// start a task running the given chunk. idempotent: when a task for
    /// the chunk already exists nothing happens and nothing is emitted.
    /// emits a "task started" message on success, and the "No free task
    /// entries" diagnostic when the table is exhausted.
    pub fn start_task_for_chunk(&mut self, chunk_index: u8) {
        let entry = self.chunks.get(chunk_index);
        let Some(code) = entry.code else {
            return;
        };
        if self.tasks.find_for_chunk(chunk_index).is_some() {
            return;
        }
        let Some(slot) = self.tasks.first_unused() else {
            log::warn!("task table exhausted, chunk {} not started", chunk_index);
            self.send_diagnostic("No free task entries");
            return;
        };

        let task = &mut self.tasks.tasks[slot];
        task.status = TaskStatus::Running;
        task.task_chunk_index = chunk_index;
        task.current_chunk_index = chunk_index;
        task.code = Some(code);
        task.ip = PERSISTENT_HEADER_WORDS;
        task.sp = 0;
        task.fp = 0;
        task.wake_time = 0;

        if slot + 1 > self.tasks.task_count {
            self.tasks.task_count = slot + 1;
        }

        let frame = encode_short_frame(MessageType::TaskStarted, chunk_index);
        self.queue_message(&frame);
    }

    /// cancel the task running the given chunk, if any
    pub fn stop_task_for_chunk(&mut self, chunk_index: u8) {
        if let Some(slot) = self.tasks.find_for_chunk(chunk_index) {
            self.finish_task(slot);
        }
    }

    /// clear a task entry and report its termination; the single place a
    /// "task done" message is produced, so it is emitted exactly once per
    /// run
    pub(crate) fn finish_task(&mut self, slot: usize) {
        let chunk_index = self.tasks.tasks[slot].task_chunk_index;
        self.tasks.tasks[slot] = Task::default();
        self.tasks.tighten();

        let frame = encode_short_frame(MessageType::TaskDone, chunk_index);
        self.queue_message(&frame);
    }

    /// the "start all" button: a clean slate, then every start hat and
    /// condition hat gets a task
    pub fn start_all(&mut self) {
        self.stop_all_tasks();
        for chunk_index in self.chunks.used_indexes() {
            if self.chunks.get(chunk_index).chunk_type.is_startable_hat() {
                self.start_task_for_chunk(chunk_index);
            }
        }
    }

    /// stop everything. each live task is reported as done; the status is
    /// matched explicitly rather than trusting zeroed memory to mean
    /// "unused".
    pub fn stop_all_tasks(&mut self) {
        for slot in 0..self.tasks.task_count {
            if self.tasks.tasks[slot].status != TaskStatus::Unused {
                let chunk_index = self.tasks.tasks[slot].task_chunk_index;
                let frame = encode_short_frame(MessageType::TaskDone, chunk_index);
                self.queue_message(&frame);
            }
        }
        self.tasks.reset();
    }

    // ------------------------------------------------------------------
    // interpreter notifications
    // ------------------------------------------------------------------

    /// a task ran to completion without producing a value
    pub fn task_done(&mut self, slot: usize) {
        if slot < MAX_TASKS && self.tasks.tasks[slot].status != TaskStatus::Unused {
            self.finish_task(slot);
        }
    }

    /// a reporter task finished with a result; the value message itself
    /// signals the termination, no separate "task done" follows
    pub fn task_returned_value(&mut self, slot: usize, value: &Value) {
        if slot >= MAX_TASKS || self.tasks.tasks[slot].status == TaskStatus::Unused {
            return;
        }
        let chunk_index = self.tasks.tasks[slot].task_chunk_index;
        self.tasks.tasks[slot] = Task::default();
        self.tasks.tighten();

        let body = encode_value(value);
        let frame = encode_long_frame(MessageType::TaskReturnedValue, chunk_index, &body);
        self.queue_message(&frame);
    }

    /// a task hit a runtime error. the body carries the error code and
    /// the 32-bit location of the failing instruction for the IDE to
    /// highlight.
    pub fn task_error(&mut self, slot: usize, error_code: u8, location: u32) {
        if slot >= MAX_TASKS || self.tasks.tasks[slot].status == TaskStatus::Unused {
            return;
        }
        let chunk_index = self.tasks.tasks[slot].task_chunk_index;
        self.tasks.tasks[slot] = Task::default();
        self.tasks.tighten();

        let mut body = vec![error_code];
        body.extend_from_slice(&location.to_le_bytes());
        let frame = encode_long_frame(MessageType::TaskError, chunk_index, &body);
        self.queue_message(&frame);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tessera_isa::{ChunkType, Value};
    use tessera_store::record::PERSISTENT_HEADER_WORDS;

    use crate::{
        host::LoopbackHost, runtime::Runtime, scheduler::TaskStatus,
        test_support::helper_chunk_body, MAX_TASKS,
    };

    fn new_runtime_with_chunks(indexes: &[(u8, ChunkType)]) -> Runtime<LoopbackHost> {
        let mut runtime = Runtime::new(LoopbackHost::new());
        for (chunk_index, chunk_type) in indexes {
            runtime.store_code_chunk(*chunk_index, &helper_chunk_body(*chunk_type));
        }
        runtime.host_mut().take_sent();
        runtime
    }

    fn sent_frames(runtime: &mut Runtime<LoopbackHost>) -> Vec<u8> {
        runtime.flush_output();
        runtime.host_mut().take_sent()
    }

    #[test]
    fn test_start_task_initializes_entry() {
        let mut runtime = new_runtime_with_chunks(&[(3, ChunkType::CommandStack)]);
        runtime.start_task_for_chunk(3);

        let task = &runtime.tasks.tasks[0];
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.task_chunk_index, 3);
        assert_eq!(task.current_chunk_index, 3);
        assert_eq!(task.ip, PERSISTENT_HEADER_WORDS);
        assert_eq!(task.sp, 0);
        assert_eq!(task.fp, 0);
        assert_eq!(runtime.tasks.task_count, 1);

        assert_eq!(sent_frames(&mut runtime), vec![0xFA, 0x10, 3]);
    }

    #[test]
    fn test_start_is_idempotent() {
        // starting twice creates one task and one "task started" message
        let mut runtime = new_runtime_with_chunks(&[(3, ChunkType::CommandStack)]);
        runtime.start_task_for_chunk(3);
        runtime.start_task_for_chunk(3);

        assert_eq!(runtime.tasks.task_count, 1);
        assert_eq!(sent_frames(&mut runtime), vec![0xFA, 0x10, 3]);
    }

    #[test]
    fn test_start_without_code_is_ignored() {
        let mut runtime = new_runtime_with_chunks(&[]);
        runtime.start_task_for_chunk(7);
        assert_eq!(runtime.tasks.task_count, 0);
        assert_eq!(sent_frames(&mut runtime), Vec::<u8>::new());
    }

    #[test]
    fn test_stop_task_emits_done_and_tightens_count() {
        let mut runtime = new_runtime_with_chunks(&[
            (1, ChunkType::CommandStack),
            (2, ChunkType::CommandStack),
        ]);
        runtime.start_task_for_chunk(1);
        runtime.start_task_for_chunk(2);
        assert_eq!(runtime.tasks.task_count, 2);
        runtime.host_mut().take_sent();
        runtime.flush_output();
        runtime.host_mut().take_sent();

        // stopping the task in the last slot shrinks the count
        runtime.stop_task_for_chunk(2);
        assert_eq!(runtime.tasks.task_count, 1);
        assert_eq!(sent_frames(&mut runtime), vec![0xFA, 0x11, 2]);

        // stopping a chunk with no task emits nothing
        runtime.stop_task_for_chunk(2);
        assert_eq!(sent_frames(&mut runtime), Vec::<u8>::new());

        runtime.stop_task_for_chunk(1);
        assert_eq!(runtime.tasks.task_count, 0);
    }

    #[test]
    fn test_table_exhaustion_sends_diagnostic() {
        let chunks: Vec<(u8, ChunkType)> = (0..MAX_TASKS as u8 + 1)
            .map(|index| (index, ChunkType::CommandStack))
            .collect();
        let mut runtime = new_runtime_with_chunks(&chunks);

        for chunk_index in 0..MAX_TASKS as u8 {
            runtime.start_task_for_chunk(chunk_index);
        }
        runtime.flush_output();
        runtime.host_mut().take_sent();

        runtime.start_task_for_chunk(MAX_TASKS as u8);
        assert_eq!(runtime.tasks.task_count, MAX_TASKS);

        // the overflow produced an output-value frame with the diagnostic
        let sent = sent_frames(&mut runtime);
        assert_eq!(sent[1], 0x14);
        let text = std::str::from_utf8(&sent[6..sent.len() - 1]).unwrap();
        assert_eq!(text, "No free task entries");
    }

    #[test]
    fn test_start_all_starts_only_startable_hats() {
        let mut runtime = new_runtime_with_chunks(&[
            (0, ChunkType::CommandStack),
            (1, ChunkType::StartHat),
            (2, ChunkType::BroadcastHat),
            (3, ChunkType::WhenConditionHat),
        ]);

        runtime.start_all();

        assert_eq!(runtime.tasks.find_for_chunk(1), Some(0));
        assert_eq!(runtime.tasks.find_for_chunk(3), Some(1));
        assert_eq!(runtime.tasks.find_for_chunk(0), None);
        assert_eq!(runtime.tasks.find_for_chunk(2), None);
    }

    #[test]
    fn test_stop_all_reports_each_live_task_once() {
        let mut runtime = new_runtime_with_chunks(&[
            (1, ChunkType::CommandStack),
            (2, ChunkType::CommandStack),
        ]);
        runtime.start_task_for_chunk(1);
        runtime.start_task_for_chunk(2);
        runtime.flush_output();
        runtime.host_mut().take_sent();

        runtime.stop_all_tasks();
        assert_eq!(runtime.tasks.task_count, 0);
        assert_eq!(
            sent_frames(&mut runtime),
            vec![0xFA, 0x11, 1, 0xFA, 0x11, 2]
        );

        // a second stop-all has nothing left to report
        runtime.stop_all_tasks();
        assert_eq!(sent_frames(&mut runtime), Vec::<u8>::new());
    }

    #[test]
    fn test_task_returned_value_reports_and_clears() {
        let mut runtime = new_runtime_with_chunks(&[(5, ChunkType::Reporter)]);
        runtime.start_task_for_chunk(5);
        runtime.flush_output();
        runtime.host_mut().take_sent();

        runtime.task_returned_value(0, &Value::Int(42));
        assert_eq!(runtime.tasks.task_count, 0);

        let sent = sent_frames(&mut runtime);
        assert_eq!(sent[1], 0x12); // task returned value
        assert_eq!(sent[2], 5);
        assert_eq!(&sent[5..10], &[1, 42, 0, 0, 0]);

        // the notification is not repeatable once the slot is cleared
        runtime.task_returned_value(0, &Value::Int(42));
        assert_eq!(sent_frames(&mut runtime), Vec::<u8>::new());
    }

    #[test]
    fn test_task_error_carries_code_and_location() {
        let mut runtime = new_runtime_with_chunks(&[(9, ChunkType::CommandStack)]);
        runtime.start_task_for_chunk(9);
        runtime.flush_output();
        runtime.host_mut().take_sent();

        runtime.task_error(0, 17, 0x0102_0304);
        let sent = sent_frames(&mut runtime);
        assert_eq!(sent[1], 0x13); // task error
        assert_eq!(sent[2], 9);
        assert_eq!(&sent[5..10], &[17, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(runtime.tasks.task_count, 0);
    }

    #[test]
    fn test_at_most_one_task_per_chunk() {
        let mut runtime = new_runtime_with_chunks(&[
            (1, ChunkType::CommandStack),
            (2, ChunkType::CommandStack),
        ]);

        // interleave starts and stops, then check the invariant
        runtime.start_task_for_chunk(1);
        runtime.start_task_for_chunk(2);
        runtime.start_task_for_chunk(1);
        runtime.stop_task_for_chunk(1);
        runtime.start_task_for_chunk(1);
        runtime.start_task_for_chunk(1);

        for chunk_index in [1u8, 2] {
            let live = runtime
                .tasks
                .tasks
                .iter()
                .filter(|task| {
                    task.status != TaskStatus::Unused && task.task_chunk_index == chunk_index
                })
                .count();
            assert_eq!(live, 1);
        }
    }
}
