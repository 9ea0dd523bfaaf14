// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Handler-side connection to the manager's handler-protocol socket. Plain
//! blocking I/O (`spec.md` §5: "the handler... no concurrency primitives").
//! Connection failure degrades gracefully: the handler logs and continues
//! finishing the archive regardless (`spec.md` §4.4).

use libcp_common::protocol::{Message, MessagePayload};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

pub struct ManagerClient {
    stream: Option<UnixStream>,
    session: u16,
}

impl ManagerClient {
    /// Connects to the manager's handler socket, applying the configured
    /// send/receive timeout. A connection failure is not fatal: the handler
    /// still finishes the archive (`spec.md` §4.4), so this returns a client
    /// with no live connection rather than an error.
    pub fn connect(socket_path: &Path, timeout: Duration, session: u16) -> Self {
        match UnixStream::connect(socket_path) {
            Ok(stream) => {
                if let Err(e) = stream.set_write_timeout(Some(timeout)) {
                    tracing::warn!(error = %e, "failed to set manager socket write timeout");
                }
                if let Err(e) = stream.set_read_timeout(Some(timeout)) {
                    tracing::warn!(error = %e, "failed to set manager socket read timeout");
                }
                Self {
                    stream: Some(stream),
                    session,
                }
            }
            Err(e) => {
                tracing::warn!(path = %socket_path.display(), error = %e, "cannot connect to manager, continuing without IPC");
                Self {
                    stream: None,
                    session,
                }
            }
        }
    }

    fn send(&mut self, payload: MessagePayload) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let msg = Message::new(self.session, payload);
        if let Err(e) = msg.write_to(stream) {
            tracing::warn!(error = %e, "manager IPC send failed, dropping connection");
            self.stream = None;
        }
    }

    pub fn notify_new(&mut self, pid: i64, coresig: i64, tstamp: u64, tname: &str, pname: &str) {
        self.send(MessagePayload::New {
            pid,
            coresig,
            tstamp,
            tname: tname.to_string(),
            pname: pname.to_string(),
        });
    }

    pub fn notify_update(&mut self, crash_id: &str, vector_id: &str, context_id: &str) {
        self.send(MessagePayload::Update {
            crash_id: crash_id.to_string(),
            vector_id: vector_id.to_string(),
            context_id: context_id.to_string(),
        });
    }

    pub fn notify_complete(&mut self, core_file: &str) {
        self.send(MessagePayload::Complete {
            core_file: core_file.to_string(),
        });
    }

    pub fn notify_failed(&mut self) {
        self.send(MessagePayload::Failed);
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_to_missing_socket_degrades_gracefully() {
        let client = ManagerClient::connect(Path::new("/nonexistent/crashpipe.sock"), Duration::from_millis(50), 0);
        assert!(!client.is_connected());
    }

    #[test]
    fn sending_without_connection_does_not_panic() {
        let mut client = ManagerClient::connect(Path::new("/nonexistent/crashpipe.sock"), Duration::from_millis(50), 0);
        client.notify_new(1, 11, 0, "t", "p");
        client.notify_update("a", "b", "c");
        client.notify_complete("/tmp/x");
        client.notify_failed();
    }
}
