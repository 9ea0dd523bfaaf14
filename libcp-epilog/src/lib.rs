// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The epilog client library (`spec.md` §4.8): installs signal handlers for
//! every core-generating signal, and on first delivery reports
//! `(pid, signal)` plus a raw backtrace to the manager's epilog socket
//! before re-raising the original signal.
//!
//! Grounded on `libcdhepilog/cdh-epilog.c` in `original_source` for the
//! signal set, the one-shot reentry guard, and the connect/write/re-raise
//! control flow; on `crashtracker/src/crash_handler.rs` in the example
//! pack for the idiomatic Rust shape of that same control flow (`nix`
//! `sigaction`, a `GlobalVarState`-style slot for the previous handler, and
//! `backtrace::trace_unsynchronized` for signal-context-safe frame
//! capture instead of `backtrace::Backtrace::new()`).
//!
//! A crash handler is, by construction, never unit-testable end to end: it
//! replaces process-wide signal disposition and calls `raise()`. Tests here
//! cover the parts that do not require delivering a real signal: handler
//! idempotency of the registration call, and the on-wire framing a crash
//! would produce.

use libcp_common::protocol::ELogHeader;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_EPILOG_SOCKET: &str = "/run/crashpipe/.epilog.sock";
const EPILOG_SOCKET_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_BACKTRACE_FRAMES: usize = 4096;

/// Every signal the handler installs itself for (`spec.md` §4.8, mirrors
/// `epilog_register_signal_handler`). `SIGIOT` is omitted: on Linux it is
/// literally `SIGABRT`, already in this list.
const CRASH_SIGNALS: &[Signal] = &[
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGBUS,
    Signal::SIGSYS,
    Signal::SIGTRAP,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGQUIT,
    Signal::SIGABRT,
    Signal::SIGSEGV,
];

/// Called from inside the signal handler after the backtrace has been
/// written, with the open socket so the caller can append its own data
/// before the handler closes the connection and re-raises. Must not raise
/// new signals (`cdh-epilog.h`'s documented contract).
pub type OnCrashCallback = fn(&mut dyn Write, signum: i32);

static HANDLER_EXECUTED: AtomicBool = AtomicBool::new(false);
static ON_CRASH_CALLBACK: Mutex<Option<OnCrashCallback>> = Mutex::new(None);

/// Installs the crash signal handlers. `callback`, if given, runs once the
/// backtrace has been sent, with the chance to write additional userdata
/// into the same connection.
pub fn register_crash_handlers(callback: Option<OnCrashCallback>) -> anyhow::Result<()> {
    *ON_CRASH_CALLBACK.lock().unwrap() = callback;
    for &sig in CRASH_SIGNALS {
        let action = SigAction::new(SigHandler::Handler(epilog_signal_handler), SaFlags::empty(), SigSet::empty());
        unsafe { signal::sigaction(sig, &action) }?;
    }
    tracing::info!(signals = CRASH_SIGNALS.len(), "epilog crash handlers registered");
    Ok(())
}

extern "C" fn epilog_signal_handler(signum: i32) {
    if HANDLER_EXECUTED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Some(mut stream) = connect() {
        let header = ELogHeader { pid: std::process::id() as i64, signal: signum as i64 };
        if header.write_to(&mut stream).is_ok() {
            let _ = write_backtrace(&mut stream);
            let _ = writeln!(stream, "\n[userdata]");
            if let Ok(guard) = ON_CRASH_CALLBACK.lock() {
                if let Some(callback) = *guard {
                    callback(&mut stream, signum);
                }
            }
        }
    }

    unregister_and_reraise(signum);
}

fn connect() -> Option<UnixStream> {
    let path = std::env::var("EPILOG_SOCK").unwrap_or_else(|_| DEFAULT_EPILOG_SOCKET.to_string());
    let stream = UnixStream::connect(&path).ok()?;
    let _ = stream.set_write_timeout(Some(EPILOG_SOCKET_TIMEOUT));
    Some(stream)
}

/// Signal-context frame capture: `backtrace::trace_unsynchronized` only
/// walks the stack and reads `ip`/`sp`, doing no symbol resolution, which
/// is the part of `backtrace` considered safe to call from a handler (see
/// the example pack's `emit_backtrace_by_frames`). Mirrors the original's
/// plain-text `backtrace_symbols_fd` framing: one frame per line.
///
/// # Safety
/// Must only be called from within the active crash signal handler, and
/// never re-entrantly (enforced by `HANDLER_EXECUTED` in the caller).
fn write_backtrace(stream: &mut UnixStream) -> std::io::Result<()> {
    writeln!(stream, "[backtrace]")?;
    let mut count = 0usize;
    let mut io_result = Ok(());
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if count >= MAX_BACKTRACE_FRAMES {
                return false;
            }
            io_result = writeln!(stream, "#{count} ip={:?} sp={:?}", frame.ip(), frame.sp());
            count += 1;
            io_result.is_ok()
        });
    }
    io_result
}

fn unregister_and_reraise(signum: i32) {
    for &sig in CRASH_SIGNALS {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let _ = unsafe { signal::sigaction(sig, &default) };
    }
    HANDLER_EXECUTED.store(false, Ordering::SeqCst);
    unsafe {
        libc::raise(signum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn registration_is_idempotent() {
        register_crash_handlers(None).unwrap();
        register_crash_handlers(None).unwrap();
    }

    #[test]
    fn a_connected_peer_observes_a_well_formed_header_and_marker() {
        let dir = tempfile_dir();
        let socket_path = dir.join("epilog-test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let mut client = UnixStream::connect(&socket_path).unwrap();
        let header = ELogHeader { pid: 4242, signal: libc::SIGSEGV as i64 };
        header.write_to(&mut client).unwrap();
        write_backtrace(&mut client).unwrap();
        drop(client);

        let (mut server, _) = listener.accept().unwrap();
        let decoded = ELogHeader::read_from(&mut server).unwrap();
        assert_eq!(decoded, header);

        let mut rest = String::new();
        std::io::Read::read_to_string(&mut server, &mut rest).unwrap();
        assert!(rest.starts_with("[backtrace]\n"));

        let _ = std::fs::remove_file(&socket_path);
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("libcp-epilog-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
