// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Pre- and post-stream context records: namespace-identity hashing, the
//! `crashcontext-*` data sweep, and the `info.crashdata` text member
//! (`spec.md` §4.4).

use crate::archive::Archive;
use crate::crash_info::CrashInfo;
use crate::fingerprint::{Confidence, Fingerprint};
use libcp_common::config::CrashContextRule;
use libcp_common::namespace::NamespaceIdentity;
use std::path::Path;

/// Reads `Name:` from `/proc/<pid>/status` to correct the process name the
/// kernel passed on the handler's command line, then sanitizes it so it is
/// safe to use as a path component. Falls back to `fallback` when the
/// status file cannot be read. Grounded on `cdh_context_get_procname` /
/// the `g_strdelimit(name, ":/\\!*", '_')` call in `original_source`.
pub fn resolve_procname(pid: i64, fallback: &str) -> String {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("Name:"))
                .map(|name| name.trim().to_string())
        })
        .unwrap_or_else(|| fallback.to_string());

    raw.replace([':', '/', '\\', '!', '*'], "_")
}

/// Computes `context_id`/`on_host` by comparing the handler's own namespace
/// links to the crashing process' (`spec.md` §4.4): true iff all seven
/// match.
pub fn update_context_id(info: &mut CrashInfo) {
    let own = NamespaceIdentity::read_for_pid(std::process::id() as i64);
    let proc = NamespaceIdentity::read_for_pid(info.pid);
    info.context_id = proc.context_id();
    info.on_host = proc.on_host(&own).into_iter().all(|matched| matched);
}

/// Embeds a regular file's content into the archive as a tar member named
/// after its basename. Best-effort: an unreadable path is logged and
/// skipped, it does not abort the handler.
fn dump_file_to(archive: &mut Archive, path: &Path) {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "crashcontext data path unreadable");
            return;
        }
    };
    if !metadata.is_file() {
        tracing::warn!(path = %path.display(), "crashcontext data path is not a regular file");
        return;
    }
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read crashcontext data path");
            return;
        }
    };
    let member_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    if archive.create_file(&member_name, bytes.len() as u64).is_ok() {
        archive.write_file(&bytes);
        archive.finish_file(bytes.len() as u64);
    }
}

/// Sweeps `crashcontext-*` rules whose `ProcName` matches and whose
/// `PostCore` flag equals `postcore`, embedding each matching `DataPath`.
fn sweep_rules(archive: &mut Archive, info: &CrashInfo, rules: &[CrashContextRule], postcore: bool) {
    for rule in rules {
        if !rule.proc_name.is_match(&info.name) {
            continue;
        }
        if rule.post_core != postcore {
            continue;
        }
        let path = rule.interpolated_path(info.pid);
        dump_file_to(archive, Path::new(&path));
    }
}

pub fn generate_prestream(archive: &mut Archive, info: &mut CrashInfo, rules: &[CrashContextRule]) {
    update_context_id(info);
    sweep_rules(archive, info, rules, false);
}

pub fn generate_poststream(
    archive: &mut Archive,
    info: &CrashInfo,
    fp: &Fingerprint,
    rules: &[CrashContextRule],
) {
    let confidence = confidence_label(fp.confidence);
    tracing::info!(
        process = %info.name,
        pid = info.pid,
        crash_id = %fp.crash_id,
        vector_id = %fp.vector_id,
        confidence,
        signal = info.signal,
        "crash fingerprinted"
    );

    let body = format!(
        "ProcessName = {}\nProcessThread = {}\nCrashTimestamp = {}\n\
         ProcessHostID = {}\nProcessContainerID = {}\nCrashSignal = {}\n\
         CrashID = {}\nVectorID = {}\nContextID = {}\nConfidence = {}\n\
         CoredumpSize = {}\n",
        info.name,
        info.thread_name,
        info.timestamp,
        info.pid,
        info.container_pid,
        info.signal,
        fp.crash_id,
        fp.vector_id,
        info.context_id,
        confidence,
        info.coredump_size,
    );
    let body = body.into_bytes();

    if archive.create_file("info.crashdata", body.len() as u64).is_ok() {
        archive.write_file(&body);
        archive.finish_file(body.len() as u64);
    } else {
        tracing::warn!("failed to embed info.crashdata into archive");
    }

    sweep_rules(archive, info, rules, true);
}

pub fn confidence_label(c: Confidence) -> &'static str {
    match c {
        Confidence::High => "high",
        Confidence::Medium => "medium",
        Confidence::Low => "low",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn fingerprint_stub() -> Fingerprint {
        Fingerprint {
            crash_id: "0".repeat(16),
            vector_id: "1".repeat(16),
            confidence: Confidence::High,
            ip_file_offset: None,
            ip_module: None,
            ra_file_offset: None,
            ra_module: None,
        }
    }

    #[test]
    fn info_crashdata_embeds_all_documented_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(&dir.path().join("t.cdh.tar.gz")).unwrap();
        let info = CrashInfo::new(1_700_000_000, 4242, 4242, 11, "crashy".into());
        generate_poststream(&mut archive, &info, &fingerprint_stub(), &[]);
        archive.close().unwrap();
    }

    #[test]
    fn sweep_rules_filters_by_postcore_and_procname() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data.txt");
        std::fs::write(&data, b"hello").unwrap();

        let mut archive = Archive::create(&dir.path().join("t.cdh.tar.gz")).unwrap();
        let info = CrashInfo::new(0, 1, 1, 11, "crashy".into());
        let rules = vec![CrashContextRule {
            name: "crashcontext-x".into(),
            proc_name: Regex::new("^crashy$").unwrap(),
            post_core: false,
            data_path: data.to_string_lossy().into_owned(),
        }];
        sweep_rules(&mut archive, &info, &rules, false);
        sweep_rules(&mut archive, &info, &rules, true);
    }

    #[test]
    fn confidence_label_matches_three_tier_scale() {
        assert_eq!(confidence_label(Confidence::High), "high");
        assert_eq!(confidence_label(Confidence::Medium), "medium");
        assert_eq!(confidence_label(Confidence::Low), "low");
    }

    #[test]
    fn unreadable_data_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::create(&dir.path().join("t.cdh.tar.gz")).unwrap();
        dump_file_to(&mut archive, Path::new("/does/not/exist"));
    }
}
