// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The handler↔manager wire protocol: a fixed-size header followed by a
//! typed, fixed-size payload. Integer widths are load-bearing per
//! `spec.md` §9 and are never widened or narrowed here.

use crate::error::CrashpipeError;
use std::io::{Read, Write};

/// Fixed sentinel identifying a well-formed frame header. The reference
/// implementation never documented the exact value it used on the wire, so
/// this is an explicit choice (see DESIGN.md) rather than a carried-over
/// constant.
pub const HASH_MAGIC: u16 = 0xC5A1;

/// Length of the NUL-terminated build-version string embedded in every
/// header. `version[64]` in `spec.md` §6.
pub const VERSION_LEN: usize = 64;
/// Length of the fixed `tname`/`pname` fields in a `NEW` payload (`N` in
/// `spec.md` §6, required to be `>= 64`).
pub const NAME_LEN: usize = 64;
/// Length of the fixed `crash_id`/`vector_id`/`context_id` fields in an
/// `UPDATE` payload (`M` in `spec.md` §6, required to be `>= 17`: 16 hex
/// digits plus a NUL terminator).
pub const ID_LEN: usize = 17;
/// Length of the fixed `core_file` field in a `COMPLETE` payload (`P` in
/// `spec.md` §6, required to be `>= 1024`).
pub const PATH_LEN: usize = 1024;

/// The build version string stamped into every header. Co-released clients
/// and servers share this constant; a mismatch is logged but never rejects
/// the frame (`spec.md` §4.5, "Version negotiation: None").
pub const WIRE_PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    New = 0,
    Update = 1,
    Complete = 2,
    Failed = 3,
}

impl MessageType {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::New),
            1 => Some(Self::Update),
            2 => Some(Self::Complete),
            3 => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    New {
        pid: i64,
        coresig: i64,
        tstamp: u64,
        tname: String,
        pname: String,
    },
    Update {
        crash_id: String,
        vector_id: String,
        context_id: String,
    },
    Complete {
        core_file: String,
    },
    Failed,
}

impl MessagePayload {
    fn message_type(&self) -> MessageType {
        match self {
            Self::New { .. } => MessageType::New,
            Self::Update { .. } => MessageType::Update,
            Self::Complete { .. } => MessageType::Complete,
            Self::Failed => MessageType::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The build version string reported by the peer; compared against
    /// [`WIRE_PROTOCOL_VERSION`] by the caller, which decides whether to
    /// warn (never to reject: there is no version negotiation).
    pub version: String,
    pub session: u16,
    pub payload: MessagePayload,
}

/// Session token: low 16 bits of `(pid | timestamp)`, used to correlate
/// manager-side per-crash state across frames (`spec.md` §3).
pub fn session_token(pid: i64, timestamp: u64) -> u16 {
    (((pid as u64) | timestamp) & 0xFFFF) as u16
}

fn pack_fixed_str(s: &str, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn unpack_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl Message {
    pub fn new(session: u16, payload: MessagePayload) -> Self {
        Self {
            version: WIRE_PROTOCOL_VERSION.to_string(),
            session,
            payload,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        match &self.payload {
            MessagePayload::New {
                pid,
                coresig,
                tstamp,
                tname,
                pname,
            } => {
                let mut out = Vec::with_capacity(8 + 8 + 8 + NAME_LEN + NAME_LEN);
                out.extend_from_slice(&pid.to_le_bytes());
                out.extend_from_slice(&coresig.to_le_bytes());
                out.extend_from_slice(&tstamp.to_le_bytes());
                out.extend_from_slice(&pack_fixed_str(tname, NAME_LEN));
                out.extend_from_slice(&pack_fixed_str(pname, NAME_LEN));
                out
            }
            MessagePayload::Update {
                crash_id,
                vector_id,
                context_id,
            } => {
                let mut out = Vec::with_capacity(ID_LEN * 3);
                out.extend_from_slice(&pack_fixed_str(crash_id, ID_LEN));
                out.extend_from_slice(&pack_fixed_str(vector_id, ID_LEN));
                out.extend_from_slice(&pack_fixed_str(context_id, ID_LEN));
                out
            }
            MessagePayload::Complete { core_file } => pack_fixed_str(core_file, PATH_LEN),
            MessagePayload::Failed => Vec::new(),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CrashpipeError> {
        let payload = self.encode_payload();
        let mut header = Vec::with_capacity(2 + VERSION_LEN + 2 + 2 + 4);
        header.extend_from_slice(&HASH_MAGIC.to_le_bytes());
        header.extend_from_slice(&pack_fixed_str(&self.version, VERSION_LEN));
        header.extend_from_slice(&(self.payload.message_type() as u16).to_le_bytes());
        header.extend_from_slice(&self.session.to_le_bytes());
        header.extend_from_slice(&(payload.len() as u32).to_le_bytes());

        w.write_all(&header).map_err(|_| CrashpipeError::ShortIo {
            what: "message header",
            expected: header.len(),
            actual: 0,
        })?;
        if !payload.is_empty() {
            w.write_all(&payload).map_err(|_| CrashpipeError::ShortIo {
                what: "message payload",
                expected: payload.len(),
                actual: 0,
            })?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, CrashpipeError> {
        let header_len = 2 + VERSION_LEN + 2 + 2 + 4;
        let mut header = vec![0u8; header_len];
        r.read_exact(&mut header).map_err(|_| CrashpipeError::ShortIo {
            what: "message header",
            expected: header_len,
            actual: 0,
        })?;

        let hash_magic = u16::from_le_bytes([header[0], header[1]]);
        if hash_magic != HASH_MAGIC {
            return Err(CrashpipeError::ProtocolReject(format!(
                "bad hash_magic 0x{hash_magic:04X}"
            )));
        }
        let version = unpack_fixed_str(&header[2..2 + VERSION_LEN]);
        let mut off = 2 + VERSION_LEN;
        let msg_type = u16::from_le_bytes([header[off], header[off + 1]]);
        off += 2;
        let session = u16::from_le_bytes([header[off], header[off + 1]]);
        off += 2;
        let data_size = u32::from_le_bytes([header[off], header[off + 1], header[off + 2], header[off + 3]]) as usize;

        let msg_type = MessageType::from_u16(msg_type)
            .ok_or_else(|| CrashpipeError::ProtocolReject(format!("unknown message type {msg_type}")))?;

        // A zero-length payload must not allocate (spec.md §8 boundary case).
        // Only FAILED frames are legitimately empty; any other type with a
        // zero-length payload is a malformed frame.
        if data_size == 0 {
            return match msg_type {
                MessageType::Failed => Ok(Message {
                    version,
                    session,
                    payload: MessagePayload::Failed,
                }),
                MessageType::New | MessageType::Update | MessageType::Complete => Err(
                    CrashpipeError::ProtocolReject(format!("{msg_type:?} frame with zero-length payload")),
                ),
            };
        }

        Self::read_payload(r, msg_type, data_size, version, session)
    }

    fn read_payload<R: Read>(
        r: &mut R,
        msg_type: MessageType,
        data_size: usize,
        version: String,
        session: u16,
    ) -> Result<Self, CrashpipeError> {
        let mut buf = vec![0u8; data_size];
        r.read_exact(&mut buf).map_err(|_| CrashpipeError::ShortIo {
            what: "message payload",
            expected: data_size,
            actual: 0,
        })?;

        let payload = match msg_type {
            MessageType::New => {
                if buf.len() < 24 + NAME_LEN * 2 {
                    return Err(CrashpipeError::ProtocolReject("truncated NEW payload".into()));
                }
                let pid = i64::from_le_bytes(buf[0..8].try_into().map_err(|_| {
                    CrashpipeError::ProtocolReject("malformed NEW.pid".into())
                })?);
                let coresig = i64::from_le_bytes(buf[8..16].try_into().map_err(|_| {
                    CrashpipeError::ProtocolReject("malformed NEW.coresig".into())
                })?);
                let tstamp = u64::from_le_bytes(buf[16..24].try_into().map_err(|_| {
                    CrashpipeError::ProtocolReject("malformed NEW.tstamp".into())
                })?);
                let tname = unpack_fixed_str(&buf[24..24 + NAME_LEN]);
                let pname = unpack_fixed_str(&buf[24 + NAME_LEN..24 + NAME_LEN * 2]);
                MessagePayload::New {
                    pid,
                    coresig,
                    tstamp,
                    tname,
                    pname,
                }
            }
            MessageType::Update => {
                if buf.len() < ID_LEN * 3 {
                    return Err(CrashpipeError::ProtocolReject("truncated UPDATE payload".into()));
                }
                let crash_id = unpack_fixed_str(&buf[0..ID_LEN]);
                let vector_id = unpack_fixed_str(&buf[ID_LEN..ID_LEN * 2]);
                let context_id = unpack_fixed_str(&buf[ID_LEN * 2..ID_LEN * 3]);
                MessagePayload::Update {
                    crash_id,
                    vector_id,
                    context_id,
                }
            }
            MessageType::Complete => {
                if buf.len() < PATH_LEN {
                    return Err(CrashpipeError::ProtocolReject("truncated COMPLETE payload".into()));
                }
                MessagePayload::Complete {
                    core_file: unpack_fixed_str(&buf[0..PATH_LEN]),
                }
            }
            MessageType::Failed => MessagePayload::Failed,
        };

        Ok(Message {
            version,
            session,
            payload,
        })
    }
}
