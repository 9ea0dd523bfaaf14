// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Resolving a human-readable container name for a crash's `context_id`
//! (`spec.md` §4.5: "derive a human-readable container name by comparing
//! the handler's own pid namespace to the reported `context_id`, if an
//! optional container enumerator is present").
//!
//! The container runtime itself (LXC in the original) is out of scope, so
//! lookup is behind [`ContainerEnumerator`]; nothing implements it by
//! default. The comparison below is preserved bit-for-bit from
//! `get_container_name_for_context` in `original_source`, including its
//! inverted `!=` check (see DESIGN.md): a container is reported as the
//! match when its own context id does **not** equal the crash's.

use libcp_common::namespace::NamespaceIdentity;

pub trait ContainerEnumerator {
    /// Active containers as `(name, init_pid)` pairs.
    fn active_containers(&self) -> Vec<(String, i64)>;
}

/// Mirrors `get_container_name_for_context`: the first running container
/// whose own context id differs from `ctxid` is reported as the match.
pub fn container_name_for_context(enumerator: &dyn ContainerEnumerator, ctxid: &str) -> Option<String> {
    for (name, init_pid) in enumerator.active_containers() {
        let tmp_id = NamespaceIdentity::read_for_pid(init_pid).context_id();
        if tmp_id != ctxid {
            return Some(name);
        }
    }
    None
}

/// The log-time name shown alongside an UPDATE message (`spec.md` §4.5).
/// Mirrors `process_message`'s `CDM_CORE_UPDATE` branch exactly, including
/// its inverted comparison (see DESIGN.md): the manager's own context is
/// compared against the crash's reported `context_id`, and the crash is
/// labeled `"Host"` when they **differ** rather than when they match.
pub fn resolve_context_name(own_pid: i64, crash_context_id: &str, enumerator: Option<&dyn ContainerEnumerator>) -> String {
    let own_ctx = NamespaceIdentity::read_for_pid(own_pid).context_id();
    if own_ctx != crash_context_id {
        "Host".to_string()
    } else {
        enumerator
            .and_then(|e| container_name_for_context(e, crash_context_id))
            .unwrap_or_default()
    }
}
