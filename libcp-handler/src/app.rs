// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Handler orchestration (`spec.md` §4.4, `cdh_application_execute` in
//! `original_source`). One run per crashing process: elevate niceness, check
//! disk headroom, open the archive, stream the core while deriving a
//! fingerprint, embed context, close, and report the outcome to the manager.
//!
//! The COMPLETE/FAILED decision mirrors the original's `status` variable
//! exactly: only argument/disk/archive-open/ELF-parse failures flip it to
//! FAILED. A failure writing `info.crashdata` or closing the archive is
//! logged but does not change the outcome — the archive is still reported
//! COMPLETE if it got far enough to stream the core.

use crate::archive::Archive;
use crate::context;
use crate::crash_info::CrashInfo;
use crate::manager_client::ManagerClient;
use libcp_common::config::{CommonConfig, CrashContextRule, CrashHandlerConfig};
use std::io::Read;
use std::path::PathBuf;

pub struct HandlerArgs {
    pub timestamp: u64,
    pub pid: i64,
    pub container_pid: i64,
    pub signal: i64,
    pub proc_name: String,
}

/// Applies the configured nice-value bump so the handler does not compete
/// with the rest of the system while it streams a potentially large core.
/// Best-effort: failure is logged, never fatal (`original_source`:
/// `nice(opt_nice_value)`'s return value is not checked either).
fn elevate_niceness(value: i64) {
    match nix::unistd::nice(value as i32) {
        Ok(_) => {}
        Err(e) => tracing::warn!(value, error = %e, "failed to elevate handler niceness"),
    }
}

/// Fails the run before anything is written if the crashdump filesystem does
/// not have at least `min_mb` megabytes free. Grounded on `check_disk_space`
/// in `cdh-application.c`: `free_sz = (f_bsize * f_bavail) >> 20`.
fn check_disk_space(path: &std::path::Path, min_mb: u64) -> bool {
    let stat = match nix::sys::statvfs::statvfs(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "statvfs failed");
            return false;
        }
    };
    let free_mb = (stat.block_size() * stat.blocks_available()) >> 20;
    if free_mb < min_mb {
        tracing::error!(path = %path.display(), free_mb, min_mb, "insufficient disk headroom for crashdump");
        return false;
    }
    true
}

fn archive_path(crashdump_directory: &std::path::Path, info: &CrashInfo) -> PathBuf {
    crashdump_directory.join(format!(
        "{}.{}.{}.cdh.tar.gz",
        info.name, info.pid, info.timestamp
    ))
}

/// Runs the full handler pipeline for one crash, reading the core from
/// stdin. Returns `true` on a COMPLETE outcome, `false` on FAILED; the
/// binary turns this into an exit code.
pub fn run(
    args: HandlerArgs,
    common: &CommonConfig,
    handler_cfg: &CrashHandlerConfig,
    rules: &[CrashContextRule],
) -> bool {
    run_with_core_reader(args, common, handler_cfg, rules, None)
}

/// Same as [`run`], but reads the core from `reader` instead of stdin when
/// given one. Exposed for tests that must not block on an actual stdin.
fn run_with_core_reader(
    args: HandlerArgs,
    common: &CommonConfig,
    handler_cfg: &CrashHandlerConfig,
    rules: &[CrashContextRule],
    reader: Option<Box<dyn Read>>,
) -> bool {
    elevate_niceness(handler_cfg.elevated_nice_value);

    let proc_name = context::resolve_procname(args.pid, &args.proc_name);
    let mut info = CrashInfo::new(args.timestamp, args.pid, args.container_pid, args.signal, proc_name);

    let mut mgr = ManagerClient::connect(
        &common.ipc_socket_path(),
        common.ipc_socket_timeout,
        info.session_token(),
    );
    mgr.notify_new(info.pid, info.signal, info.timestamp, &info.thread_name, &info.name);

    if let Err(e) = std::fs::create_dir_all(&common.crashdump_directory) {
        tracing::error!(dir = %common.crashdump_directory.display(), error = %e, "cannot create crashdump directory");
        mgr.notify_failed();
        return false;
    }

    if !check_disk_space(&common.crashdump_directory, handler_cfg.file_system_min_size_mb) {
        mgr.notify_failed();
        return false;
    }

    let out_path = archive_path(&common.crashdump_directory, &info);
    let mut archive = match Archive::create(&out_path) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(path = %out_path.display(), error = %e, "cannot open crashdump archive");
            mgr.notify_failed();
            return false;
        }
    };
    match reader {
        Some(r) => archive.stream_open_reader(r),
        None => archive.stream_open_stdin(),
    }

    context::generate_prestream(&mut archive, &mut info, rules);

    let succeeded = match crate::fingerprint::parse_and_derive(&info.name, &mut archive) {
        Ok((_parsed, fp)) => {
            info.crash_id = fp.crash_id.clone();
            info.vector_id = fp.vector_id.clone();
            mgr.notify_update(&info.crash_id, &info.vector_id, &info.context_id);

            match archive.read_all() {
                Ok(streamed) => info.coredump_size = streamed,
                Err(e) => tracing::warn!(error = %e, "failed to drain remaining core bytes"),
            }

            context::generate_poststream(&mut archive, &info, &fp, rules);
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to parse core, reporting failure");
            if let Err(e) = archive.read_all() {
                tracing::warn!(error = %e, "failed to drain remaining core bytes after parse failure");
            }
            false
        }
    };

    if let Err(e) = archive.close() {
        tracing::warn!(error = %e, "failed to close crashdump archive");
    }

    if succeeded {
        mgr.notify_complete(&out_path.to_string_lossy());
    } else {
        mgr.notify_failed();
    }
    succeeded
}
