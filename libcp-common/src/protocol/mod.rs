// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

pub mod epilog;
pub mod message;

pub use epilog::{ELogHeader, ELOG_HASH_MAGIC, ELOG_MAX_RAW_BYTES, ELOG_VERSION};
pub use message::{session_token, Message, MessagePayload, MessageType, HASH_MAGIC};
