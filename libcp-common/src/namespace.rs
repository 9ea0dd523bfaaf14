// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Process-namespace identity (`spec.md` §4.4, §9): `context_id` fingerprints
//! the container a crashing process ran in by hashing the concatenation of
//! its `/proc/<pid>/ns/*` symlink targets, and `on_host` records whether each
//! individual namespace link matches the handler's own (i.e. whether the
//! handler itself is running inside the same container as the crash).

use crate::jenkins::{hash_to_hex16, jenkins64};
use std::path::Path;

/// Order is significant: it is part of the hashed byte stream, so changing
/// it changes every `context_id` ever produced.
const NAMESPACE_KINDS: [&str; 7] = ["cgroup", "ipc", "mnt", "net", "pid", "user", "uts"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceIdentity {
    /// One entry per `NAMESPACE_KINDS`, in order. `None` when the link could
    /// not be read (kernel built without that namespace, or permission
    /// denied) — such links contribute nothing to the hash, mirroring the
    /// original's "skip what we can't read" behavior.
    pub links: Vec<Option<String>>,
}

impl NamespaceIdentity {
    pub fn read_for_pid(pid: i64) -> Self {
        let links = NAMESPACE_KINDS
            .iter()
            .map(|kind| read_ns_link(pid, kind))
            .collect();
        Self { links }
    }

    /// `context_id` is the Jenkins-64 hash of the namespace links
    /// concatenated in `NAMESPACE_KINDS` order, unresolved links contributing
    /// an empty string.
    pub fn context_id(&self) -> String {
        let mut buf = String::new();
        for link in &self.links {
            buf.push_str(link.as_deref().unwrap_or(""));
        }
        hash_to_hex16(jenkins64(buf.as_bytes()))
    }

    /// Per-namespace comparison against another identity (normally the
    /// handler's own). A `None` either side cannot be "on host", since there
    /// is nothing to compare.
    pub fn on_host(&self, other: &NamespaceIdentity) -> Vec<bool> {
        self.links
            .iter()
            .zip(other.links.iter())
            .map(|(a, b)| matches!((a, b), (Some(x), Some(y)) if x == y))
            .collect()
    }
}

fn read_ns_link(pid: i64, kind: &str) -> Option<String> {
    let path = format!("/proc/{pid}/ns/{kind}");
    std::fs::read_link(Path::new(&path))
        .ok()
        .map(|target| target.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_id_is_deterministic_for_same_links() {
        let a = NamespaceIdentity {
            links: vec![Some("pid:[123]".to_string()), None],
        };
        let b = NamespaceIdentity {
            links: vec![Some("pid:[123]".to_string()), None],
        };
        assert_eq!(a.context_id(), b.context_id());
    }

    #[test]
    fn context_id_differs_when_a_link_differs() {
        let a = NamespaceIdentity {
            links: vec![Some("pid:[123]".to_string())],
        };
        let b = NamespaceIdentity {
            links: vec![Some("pid:[456]".to_string())],
        };
        assert_ne!(a.context_id(), b.context_id());
    }

    #[test]
    fn on_host_is_false_when_either_side_unresolved() {
        let a = NamespaceIdentity {
            links: vec![Some("pid:[1]".to_string()), None],
        };
        let b = NamespaceIdentity {
            links: vec![Some("pid:[1]".to_string()), Some("net:[2]".to_string())],
        };
        assert_eq!(a.on_host(&b), vec![true, false]);
    }

    #[test]
    fn reading_nonexistent_pid_yields_all_none() {
        let identity = NamespaceIdentity::read_for_pid(i64::MAX);
        assert!(identity.links.iter().all(Option::is_none));
        assert_eq!(identity.context_id(), hash_to_hex16(jenkins64(b"")));
    }
}
