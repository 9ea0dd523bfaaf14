// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The epilog wire protocol (`spec.md` §4.8): a fixed-layout header with up
//! to four variable-length argument slots, used by instrumented processes
//! to report `(pid, exit_signal)` plus a raw backtrace blob to the manager.
//! Bit-exact, little-endian, host byte order; no padding beyond what is
//! written explicitly below.

use crate::error::CrashpipeError;
use std::io::{Read, Write};

pub const ELOG_HASH_MAGIC: u16 = 0xFCDF;
pub const ELOG_VERSION: u32 = 0x0001;

/// Hard cap on the raw bytes (backtrace + optional userdata) the server
/// will read after the header (`spec.md` §4.8, §7).
pub const ELOG_MAX_RAW_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ELogType {
    New = 0,
}

impl ELogType {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::New),
            _ => None,
        }
    }
}

/// The `NEW` header payload: `process_pid` then `process_sig`, each `i64`.
/// `size_of_arg1 = size_of_arg2 = 8`; `size_of_arg3 = size_of_arg4 = 0`
/// (`spec.md` §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ELogHeader {
    pub pid: i64,
    pub signal: i64,
}

impl ELogHeader {
    /// Total on-wire size of the fixed header: magic + version + type +
    /// four size fields + the two i64 payload fields.
    pub const WIRE_LEN: usize = 2 + 4 + 2 + 2 * 4 + 8 + 8;

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CrashpipeError> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&ELOG_HASH_MAGIC.to_le_bytes());
        buf.extend_from_slice(&ELOG_VERSION.to_le_bytes());
        buf.extend_from_slice(&(ELogType::New as u16).to_le_bytes());
        buf.extend_from_slice(&8u16.to_le_bytes()); // size_of_arg1
        buf.extend_from_slice(&8u16.to_le_bytes()); // size_of_arg2
        buf.extend_from_slice(&0u16.to_le_bytes()); // size_of_arg3
        buf.extend_from_slice(&0u16.to_le_bytes()); // size_of_arg4
        buf.extend_from_slice(&self.pid.to_le_bytes());
        buf.extend_from_slice(&self.signal.to_le_bytes());
        w.write_all(&buf).map_err(|_| CrashpipeError::ShortIo {
            what: "epilog header",
            expected: buf.len(),
            actual: 0,
        })
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, CrashpipeError> {
        let mut buf = vec![0u8; Self::WIRE_LEN];
        r.read_exact(&mut buf).map_err(|_| CrashpipeError::ShortIo {
            what: "epilog header",
            expected: Self::WIRE_LEN,
            actual: 0,
        })?;

        let hash_magic = u16::from_le_bytes([buf[0], buf[1]]);
        if hash_magic != ELOG_HASH_MAGIC {
            return Err(CrashpipeError::ProtocolReject(format!(
                "bad epilog hash_magic 0x{hash_magic:04X}"
            )));
        }
        let version = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if version != ELOG_VERSION {
            tracing::warn!(version, "epilog client reports unexpected version");
        }
        let msg_type = u16::from_le_bytes([buf[6], buf[7]]);
        ELogType::from_u16(msg_type)
            .ok_or_else(|| CrashpipeError::ProtocolReject(format!("unknown epilog type {msg_type}")))?;

        let size1 = u16::from_le_bytes([buf[8], buf[9]]);
        let size2 = u16::from_le_bytes([buf[10], buf[11]]);
        if size1 != 8 || size2 != 8 {
            return Err(CrashpipeError::ProtocolReject(
                "epilog NEW payload sizes must be 8/8".into(),
            ));
        }

        let pid = i64::from_le_bytes(buf[16..24].try_into().map_err(|_| {
            CrashpipeError::ProtocolReject("malformed epilog pid".into())
        })?);
        let signal = i64::from_le_bytes(buf[24..32].try_into().map_err(|_| {
            CrashpipeError::ProtocolReject("malformed epilog signal".into())
        })?);

        Ok(Self { pid, signal })
    }
}
