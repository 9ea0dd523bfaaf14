// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The epilog-facing half of the manager's protocol (`spec.md` §4.8):
//! accepts a connection, reads one framed [`ELogHeader`], then reads raw
//! bytes (backtrace plus optional userdata) until EOF or the hard cap.
//! Mirrors `cdm-elogclt.c`'s `client_source_callback`: any bytes read at
//! all are journaled, even if the peer disconnected before the cap; only
//! a connection that produced zero bytes is discarded.

use crate::async_protocol;
use crate::journal::Journal;
use libcp_common::protocol::ELOG_MAX_RAW_BYTES;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};

pub fn bind(socket_path: &std::path::Path) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "epilog socket listening");
    Ok(listener)
}

pub async fn serve(listener: UnixListener, journal: Rc<RefCell<Journal>>) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "epilog socket accept failed");
                continue;
            }
        };
        let journal = Rc::clone(&journal);
        tokio::task::spawn_local(async move {
            if let Err(e) = serve_connection(stream, journal).await {
                tracing::warn!(error = %e, "epilog connection ended with an error");
            }
        });
    }
}

async fn serve_connection(mut stream: UnixStream, journal: Rc<RefCell<Journal>>) -> anyhow::Result<()> {
    let Some(header) = async_protocol::read_epilog_header(&mut stream).await? else {
        return Ok(());
    };
    tracing::info!(pid = header.pid, signal = header.signal, "epilog session opened");

    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if raw.len() >= ELOG_MAX_RAW_BYTES {
            tracing::warn!(pid = header.pid, "epilog raw payload hit the hard cap, truncating");
            break;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let remaining = ELOG_MAX_RAW_BYTES - raw.len();
        raw.extend_from_slice(&chunk[..n.min(remaining)]);
    }

    if raw.is_empty() {
        tracing::warn!(pid = header.pid, "epilog session produced no bytes, discarding");
        return Ok(());
    }
    journal.borrow().add_epilog_record(header.pid, &raw)?;
    Ok(())
}
