// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the message dispatcher
// ----------------------
//
// inbound bytes from the host accumulate in a fixed receive buffer until
// they form a complete frame, which is then dispatched to the component
// that handles it: the chunk table, the scheduler, the broadcast router or
// the variable slots.
//
// the byte channel is noisy and best-effort, so the decoder is built
// around resynchronization rather than rejection:
//
// - a buffer that does not begin with a frame start byte is scanned for
//   the next plausible frame start (a start byte followed by an in-range
//   message type) and everything before it is discarded.
// - an incomplete frame is given 20 ms from the last received byte to
//   finish; after that it is assumed truncated and the scan restarts one
//   byte in.
// - a long frame is only dispatched when its terminator byte is in place.
//
// the IDE knows the link drops things and refreshes its picture with a
// full code dump whenever it suspects loss.

use tessera_isa::Value;
use tessera_store::record::RecordType;

use crate::{
    codec::{
        encode_long_frame, is_legal_message_type, MessageType, FRAME_TERMINATOR,
        LONG_FRAME_START, SHORT_FRAME_START,
    },
    host::HostAdapter,
    runtime::Runtime,
    value_codec::{decode_value, encode_value},
    MAX_VARS,
};

pub const RCVBUF_SIZE: usize = 1024;

// a frame whose bytes pause longer than this is treated as truncated
pub const INTER_BYTE_TIMEOUT_MICROS: u32 = 20_000;

impl<H: HostAdapter> Runtime<H> {
    /// one cooperative tick of the runtime's I/O half:
    /// drain one outbound byte, collect inbound bytes, dispatch at most
    /// one message. the embedding calls this once per interpreter quantum.
    pub fn tick(&mut self) {
        self.output.drain_one(&mut self.host);
        self.receive_incoming_bytes();
        self.process_one_message();
    }

    fn receive_incoming_bytes(&mut self) {
        if self.rcv_byte_count == RCVBUF_SIZE {
            return;
        }
        let received = self.host.read_bytes(&mut self.rcv_buf[self.rcv_byte_count..]);
        if received > 0 {
            self.rcv_byte_count += received;
            self.last_rcv_time = self.host.microsecs();
            log::trace!("{} bytes received", received);
        }
    }

    fn process_one_message(&mut self) {
        if self.rcv_byte_count == 0 {
            return;
        }

        match self.rcv_buf[0] {
            SHORT_FRAME_START => {
                if self.rcv_byte_count < 3 {
                    self.resync_if_timed_out();
                    return;
                }
                let command = self.rcv_buf[1];
                let arg = self.rcv_buf[2];
                self.consume(3);
                self.handle_short_message(command, arg);
            }
            LONG_FRAME_START => {
                if self.rcv_byte_count < 5 {
                    self.resync_if_timed_out();
                    return;
                }
                // the length field counts the body plus the terminator
                let msg_length =
                    self.rcv_buf[3] as usize | ((self.rcv_buf[4] as usize) << 8);
                let total = 5 + msg_length;
                if self.rcv_byte_count < total
                    || self.rcv_buf[4 + msg_length] != FRAME_TERMINATOR
                {
                    // wait for the rest (or for a terminator that will
                    // never come; the timeout sorts the two cases out)
                    self.resync_if_timed_out();
                    return;
                }

                let command = self.rcv_buf[1];
                let arg = self.rcv_buf[2];
                let body = self.rcv_buf[5..5 + msg_length - 1].to_vec();
                self.consume(total);
                self.handle_long_message(command, arg, &body);
            }
            _ => self.skip_to_start_byte_after(0),
        }
    }

    /// a partial frame is allowed 20 ms of inter-byte silence before the
    /// decoder gives up on it
    fn resync_if_timed_out(&mut self) {
        let now = self.host.microsecs();
        if now.wrapping_sub(self.last_rcv_time) > INTER_BYTE_TIMEOUT_MICROS {
            log::debug!("receive timeout, resynchronizing");
            self.skip_to_start_byte_after(1);
        }
    }

    /// scan forward from `offset` for the next plausible frame start (a
    /// start byte whose following byte is a legal message type), shift it
    /// to the front of the buffer, or clear the buffer when there is none
    fn skip_to_start_byte_after(&mut self, offset: usize) {
        let mut index = offset;
        while index + 1 < self.rcv_byte_count {
            let byte = self.rcv_buf[index];
            if (byte == SHORT_FRAME_START || byte == LONG_FRAME_START)
                && is_legal_message_type(self.rcv_buf[index + 1])
            {
                self.consume(index);
                return;
            }
            index += 1;
        }
        self.rcv_byte_count = 0;
    }

    /// drop the first `count` buffered bytes
    fn consume(&mut self, count: usize) {
        self.rcv_buf.copy_within(count..self.rcv_byte_count, 0);
        self.rcv_byte_count -= count;
    }

    fn handle_short_message(&mut self, command: u8, arg: u8) {
        let Some(message_type) = MessageType::from_u8(command) else {
            log::debug!("unknown short message {:#04x} ignored", command);
            return;
        };

        match message_type {
            MessageType::DeleteChunk => self.delete_code_chunk(arg),
            MessageType::StartChunk => self.start_task_for_chunk(arg),
            MessageType::StopChunk => self.stop_task_for_chunk(arg),
            MessageType::StartAll => self.start_all(),
            MessageType::StopAll => {
                self.stop_all_tasks();
                self.send_diagnostic("All tasks stopped");
            }
            MessageType::GetVar => self.send_variable_value(arg),
            MessageType::DeleteVar => self.delete_variable(arg),
            MessageType::DeleteComment => {
                self.persist(RecordType::CommentDeleted, arg, 0, &[]);
            }
            MessageType::GetVersion => self.send_version(),
            MessageType::GetAllCode => self.send_all_code(),
            MessageType::DeleteAllCode => self.delete_all_code(),
            MessageType::SystemReset => self.host.system_reset(),
            MessageType::Ping => self.send_ping_reply(),
            _ => {
                log::debug!("unexpected short message {:?} ignored", message_type);
            }
        }
    }

    fn handle_long_message(&mut self, command: u8, arg: u8, body: &[u8]) {
        let Some(message_type) = MessageType::from_u8(command) else {
            log::debug!("unknown long message {:#04x} ignored", command);
            return;
        };

        match message_type {
            MessageType::ChunkCode => self.store_code_chunk(arg, body),
            MessageType::SetVar => self.set_variable_value(arg, body),
            MessageType::Broadcast => self.start_receivers_of_broadcast(body),
            MessageType::ChunkAttribute => self.store_chunk_attribute(arg, body),
            MessageType::VarName => {
                self.persist(RecordType::VarName, arg, 0, body);
            }
            MessageType::Comment => {
                self.persist(RecordType::Comment, arg, 0, body);
            }
            MessageType::CommentPosition => {
                // a position is exactly two 16-bit coordinates
                if body.len() == 4 {
                    self.persist(RecordType::CommentPosition, arg, 0, body);
                }
            }
            _ => {
                log::debug!("unexpected long message {:?} ignored", message_type);
            }
        }
    }

    /// reply to "get variable": a long frame of the same type carrying
    /// the encoded value
    fn send_variable_value(&mut self, var_index: u8) {
        if (var_index as usize) >= MAX_VARS {
            return;
        }
        let body = encode_value(&self.vars[var_index as usize]);
        let frame = encode_long_frame(MessageType::GetVar, var_index, &body);
        self.queue_message(&frame);
    }

    fn set_variable_value(&mut self, var_index: u8, body: &[u8]) {
        if (var_index as usize) >= MAX_VARS {
            return;
        }
        // an unknown value type leaves the slot untouched
        if let Some(value) = decode_value(body) {
            self.vars[var_index as usize] = value;
        }
    }

    /// reset the slot to integer zero and record the deletion
    fn delete_variable(&mut self, var_index: u8) {
        if (var_index as usize) >= MAX_VARS {
            return;
        }
        self.vars[var_index as usize] = Value::default();
        self.persist(RecordType::VarDeleted, var_index, 0, &[]);
    }
}
