// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! systemd-style readiness/watchdog notification (SPEC_FULL.md §4.5,
//! SUPPLEMENT: grounded on `crashmanager/cdm-sdnotify.c` in
//! `original_source`, an ambient daemon-lifecycle concern dropped by the
//! spec's distillation). Sends the standard `sd_notify(3)` datagram
//! protocol to `$NOTIFY_SOCKET`; a no-op when that variable is unset, which
//! is the common case outside a systemd unit.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

pub struct SdNotify {
    socket: Option<UnixDatagram>,
}

impl SdNotify {
    pub fn from_env() -> Self {
        let socket = std::env::var("NOTIFY_SOCKET").ok().and_then(|path| {
            let datagram = match UnixDatagram::unbound() {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot create sd_notify datagram socket");
                    return None;
                }
            };
            if let Err(e) = datagram.connect(&path) {
                tracing::warn!(path, error = %e, "cannot connect to NOTIFY_SOCKET");
                return None;
            }
            Some(datagram)
        });
        Self { socket }
    }

    fn send(&self, msg: &str) {
        let Some(socket) = &self.socket else { return };
        if let Err(e) = socket.send(msg.as_bytes()) {
            tracing::warn!(error = %e, "sd_notify send failed");
        }
    }

    pub fn ready(&self) {
        self.send("READY=1");
    }

    pub fn watchdog_ping(&self) {
        self.send("WATCHDOG=1");
    }

    /// Half of `$WATCHDOG_USEC`, the interval the event loop should ping on
    /// (`spec.md` §9 "SUPPLEMENT" note). `None` when the variable is unset
    /// or unparsable, meaning the watchdog is disabled.
    pub fn watchdog_interval() -> Option<Duration> {
        let usec: u64 = std::env::var("WATCHDOG_USEC").ok()?.parse().ok()?;
        Some(Duration::from_micros(usec) / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_notify_socket_is_silently_a_no_op() {
        std::env::remove_var("NOTIFY_SOCKET");
        let notify = SdNotify::from_env();
        notify.ready();
        notify.watchdog_ping();
    }

    #[test]
    fn watchdog_interval_is_half_the_configured_usec() {
        std::env::set_var("WATCHDOG_USEC", "2000000");
        assert_eq!(SdNotify::watchdog_interval(), Some(Duration::from_secs(1)));
        std::env::remove_var("WATCHDOG_USEC");
    }

    #[test]
    fn missing_watchdog_usec_disables_the_watchdog() {
        std::env::remove_var("WATCHDOG_USEC");
        assert_eq!(SdNotify::watchdog_interval(), None);
    }
}
