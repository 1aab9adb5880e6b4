// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

// the Tessera Core VM runtime
// ---------------------------
//
// the runtime sits between three parties:
//
// - the IDE, talking over a byte channel (serial, USB or a socket) with
//   short framed messages: download/delete chunks, start/stop scripts,
//   read/write variables, request a full code dump.
// - the interpreter (external to this crate), which advances the runnable
//   tasks one quantum at a time and reports completions and errors back
//   through the `Runtime` methods.
// - the host board, abstracted by the `HostAdapter` trait: non-blocking
//   byte I/O, a free-running microsecond clock, and a reset hook.
//
// everything is single-threaded and cooperative. one logical tick is:
//
// 1. drain one byte of the output ring into the host send routine,
// 2. read whatever inbound bytes the host has buffered,
// 3. dispatch at most one complete message,
//
// and then the embedding gives the interpreter its quantum. there are no
// locks anywhere; all state lives in the `Runtime` owner struct so the VM
// stays embeddable (no process-wide globals).

pub mod broadcast;
pub mod chunk_table;
pub mod codec;
pub mod dispatcher;
pub mod host;
pub mod output_ring;
pub mod runtime;
pub mod scheduler;
pub mod value_codec;

pub const RUNTIME_CODE_NAME: &str = "Tessera";

// Semantic Versioning
// - https://semver.org/
pub const RUNTIME_MAJOR_VERSION: u16 = 1;
pub const RUNTIME_MINOR_VERSION: u16 = 0;
pub const RUNTIME_PATCH_VERSION: u16 = 0;

/// the version text reported by the "get version" message,
/// e.g. `Tessera 1.0.0`
pub fn runtime_version_string() -> String {
    format!(
        "{} {}.{}.{}",
        RUNTIME_CODE_NAME, RUNTIME_MAJOR_VERSION, RUNTIME_MINOR_VERSION, RUNTIME_PATCH_VERSION
    )
}

// table capacities.
// chunk indexes travel in the one-byte argument of a frame, so 256 is the
// natural ceiling for MAX_CHUNKS; the task and variable tables are sized
// for small boards.
pub const MAX_CHUNKS: usize = 256;
pub const MAX_TASKS: usize = 16;
pub const MAX_VARS: usize = 128;
