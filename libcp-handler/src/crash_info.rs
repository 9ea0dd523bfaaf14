// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! `CrashInfo`: the per-crash mutable accumulator the handler builds up over
//! the course of one invocation (`spec.md` §3).

#[derive(Debug, Clone)]
pub struct CrashInfo {
    pub name: String,
    pub thread_name: String,
    pub timestamp: u64,
    pub signal: i64,
    pub pid: i64,
    pub container_pid: i64,
    pub context_id: String,
    pub crash_id: String,
    pub vector_id: String,
    pub on_host: bool,
    /// Byte count of the streamed core; `CoredumpSize` in `info.crashdata`
    /// (`spec.md` §9: the original sets this field but never actually
    /// writes it from the traced data flow — computed here instead).
    pub coredump_size: u64,
}

impl CrashInfo {
    pub fn new(timestamp: u64, pid: i64, container_pid: i64, signal: i64, name: String) -> Self {
        Self {
            name,
            thread_name: String::new(),
            timestamp,
            signal,
            pid,
            container_pid,
            context_id: String::new(),
            crash_id: String::new(),
            vector_id: String::new(),
            on_host: true,
            coredump_size: 0,
        }
    }

    /// Session token used to correlate manager-side per-crash state:
    /// low 16 bits of `(pid | timestamp)` (`spec.md` §3).
    pub fn session_token(&self) -> u16 {
        libcp_common::protocol::session_token(self.pid, self.timestamp)
    }
}
