// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors that a caller branches on. Everything else propagates as
/// `anyhow::Error` with `.context(...)` attached at the call site.
#[derive(Debug, Error)]
pub enum CrashpipeError {
    #[error("frame rejected: {0}")]
    ProtocolReject(String),

    #[error("short read/write on {what}: expected {expected} bytes, got {actual}")]
    ShortIo {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream is forward-only: requested offset {target} is behind current offset {current}")]
    BackwardSeek { target: u64, current: u64 },
}
