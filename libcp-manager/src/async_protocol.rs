// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Async framing over the handler/epilog wire protocols defined in
//! `libcp-common`. The frame encode/decode logic in that crate is plain
//! `std::io::Read`/`Write` by design (the handler side is entirely
//! synchronous, per `spec.md` §5); here the event loop reads the fixed-size
//! pieces asynchronously off a `tokio::net::UnixStream` and then hands the
//! already-buffered bytes to the synchronous decoder, which never blocks on
//! an in-memory cursor.

use libcp_common::error::CrashpipeError;
use libcp_common::protocol::message::VERSION_LEN;
use libcp_common::protocol::{ELogHeader, Message};
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const HEADER_LEN: usize = 2 + VERSION_LEN + 2 + 2 + 4;
const DATA_SIZE_OFFSET: usize = 2 + VERSION_LEN + 2 + 2;

/// Reads one framed [`Message`] off `stream`. Returns `Ok(None)` on a clean
/// EOF before any header bytes arrive (the client disconnected between
/// messages); any other short read is a `CrashpipeError`.
pub async fn read_message(stream: &mut UnixStream) -> Result<Option<Message>, CrashpipeError> {
    let mut header = vec![0u8; HEADER_LEN];
    match read_exact_or_eof(stream, &mut header).await? {
        false => return Ok(None),
        true => {}
    }

    let data_size = u32::from_le_bytes(
        header[DATA_SIZE_OFFSET..DATA_SIZE_OFFSET + 4]
            .try_into()
            .expect("slice is exactly 4 bytes"),
    ) as usize;

    let mut frame = header;
    if data_size > 0 {
        let mut payload = vec![0u8; data_size];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|_| CrashpipeError::ShortIo {
                what: "message payload",
                expected: data_size,
                actual: 0,
            })?;
        frame.extend_from_slice(&payload);
    }

    let mut cursor = Cursor::new(frame);
    Message::read_from(&mut cursor).map(Some)
}

/// Writes one framed [`Message`] to `stream`.
pub async fn write_message(stream: &mut UnixStream, msg: &Message) -> Result<(), CrashpipeError> {
    let mut buf = Vec::new();
    msg.write_to(&mut buf)?;
    stream.write_all(&buf).await.map_err(|_| CrashpipeError::ShortIo {
        what: "message frame",
        expected: buf.len(),
        actual: 0,
    })
}

/// Reads one framed [`ELogHeader`] off `stream`.
pub async fn read_epilog_header(stream: &mut UnixStream) -> Result<Option<ELogHeader>, CrashpipeError> {
    let mut buf = vec![0u8; ELogHeader::WIRE_LEN];
    if !read_exact_or_eof(stream, &mut buf).await? {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    ELogHeader::read_from(&mut cursor).map(Some)
}

/// Like `AsyncReadExt::read_exact`, but treats an EOF on the very first byte
/// as `Ok(false)` instead of an error (a client that disconnects between
/// messages, not mid-frame).
async fn read_exact_or_eof(stream: &mut UnixStream, buf: &mut [u8]) -> Result<bool, CrashpipeError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|_| CrashpipeError::ShortIo {
                what: "frame header",
                expected: buf.len(),
                actual: filled,
            })?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CrashpipeError::ShortIo {
                what: "frame header",
                expected: buf.len(),
                actual: filled,
            });
        }
        filled += n;
    }
    Ok(true)
}
