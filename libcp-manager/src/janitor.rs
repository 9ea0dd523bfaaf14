// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The quota-driven janitor (`spec.md` §4.7): fires when the journal's
//! tracked archives violate any of three disk-quota predicates, and evicts
//! exactly one victim per dispatch.

use crate::journal::Journal;

#[derive(Clone)]
pub struct Janitor {
    pub min_dir_size_mb: u64,
    pub max_dir_size_mb: u64,
    pub max_file_count: u64,
}

impl Janitor {
    /// `spec.md` §4.7: fire when `data_size > max_dir_size`, or
    /// `entry_count > max_file_count`, or the remaining headroom
    /// (`max_dir_size - data_size`) drops below `min_dir_size`.
    pub fn should_fire(&self, journal: &Journal) -> anyhow::Result<bool> {
        let data_size_mb = journal.get_data_size()? >> 20;
        let entry_count = journal.get_entry_count()?;

        if data_size_mb > self.max_dir_size_mb {
            return Ok(true);
        }
        if entry_count > self.max_file_count {
            return Ok(true);
        }
        if self.max_dir_size_mb.saturating_sub(data_size_mb) < self.min_dir_size_mb {
            return Ok(true);
        }
        Ok(false)
    }

    /// Removes exactly one victim: unlinks the archive (a missing file is
    /// tolerated, it may already have been cleaned up out of band), then
    /// marks the journal row removed. Callers re-evaluate [`Self::should_fire`]
    /// on the next loop turn rather than looping here, so one dispatch never
    /// blocks the event loop for long.
    pub fn evict_one(&self, journal: &Journal) -> anyhow::Result<Option<String>> {
        let Some(victim) = journal.get_victim()? else {
            return Ok(None);
        };
        match std::fs::remove_file(&victim.file_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        journal.set_removed(&victim.file_path, true)?;
        tracing::info!(path = %victim.file_path, id = victim.id, "janitor evicted archive");
        Ok(Some(victim.file_path))
    }

    /// Evicts victims until [`Self::should_fire`] reports the quota
    /// satisfied or no candidate remains. Callers invoke this after every
    /// journal mutation that can move the quota (a new row, a transfer
    /// completion) rather than relying solely on a timer, so a burst that
    /// needs several evictions converges in one dispatch instead of one
    /// eviction per tick.
    pub fn enforce(&self, journal: &Journal) {
        loop {
            match self.should_fire(journal) {
                Ok(true) => match self.evict_one(journal) {
                    Ok(Some(_)) => continue,
                    Ok(None) => {
                        tracing::warn!("janitor fired but found no eviction candidate");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "janitor eviction failed");
                        break;
                    }
                },
                Ok(false) => break,
                Err(e) => {
                    tracing::error!(error = %e, "janitor quota check failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal_with_one_archive(dir: &std::path::Path, size_bytes: u64) -> Journal {
        let journal = Journal::open_in_memory();
        let path = dir.join("crashy.1.1.cdh.tar.gz");
        std::fs::write(&path, vec![0u8; size_bytes as usize]).unwrap();
        journal
            .add_crash("crashy", &"0".repeat(16), &"1".repeat(16), &"2".repeat(16), path.to_str().unwrap(), 1, 11, 1)
            .unwrap();
        journal.set_transfer(path.to_str().unwrap(), true).unwrap();
        journal
    }

    #[test]
    fn fires_when_data_size_exceeds_max() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_with_one_archive(dir.path(), 2 * 1024 * 1024);
        let janitor = Janitor {
            min_dir_size_mb: 0,
            max_dir_size_mb: 1,
            max_file_count: 1000,
        };
        assert!(janitor.should_fire(&journal).unwrap());
    }

    #[test]
    fn fires_when_entry_count_exceeds_max() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_with_one_archive(dir.path(), 1024);
        let janitor = Janitor {
            min_dir_size_mb: 0,
            max_dir_size_mb: 1000,
            max_file_count: 0,
        };
        assert!(janitor.should_fire(&journal).unwrap());
    }

    #[test]
    fn does_not_fire_when_within_quota() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_with_one_archive(dir.path(), 1024);
        let janitor = Janitor {
            min_dir_size_mb: 0,
            max_dir_size_mb: 1000,
            max_file_count: 1000,
        };
        assert!(!janitor.should_fire(&journal).unwrap());
    }

    #[test]
    fn evict_one_removes_file_and_marks_journal_row() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_with_one_archive(dir.path(), 1024);
        let janitor = Janitor {
            min_dir_size_mb: 0,
            max_dir_size_mb: 0,
            max_file_count: 0,
        };
        let evicted = janitor.evict_one(&journal).unwrap().unwrap();
        assert!(!std::path::Path::new(&evicted).exists());
        assert_eq!(journal.get_entry_count().unwrap(), 0);
    }

    #[test]
    fn evict_one_tolerates_an_already_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_with_one_archive(dir.path(), 1024);
        let path = dir.path().join("crashy.1.1.cdh.tar.gz");
        std::fs::remove_file(&path).unwrap();
        let janitor = Janitor {
            min_dir_size_mb: 0,
            max_dir_size_mb: 0,
            max_file_count: 0,
        };
        assert!(janitor.evict_one(&journal).unwrap().is_some());
    }

    #[test]
    fn enforce_evicts_until_entry_count_quota_is_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open_in_memory();
        for i in 0..10 {
            let path = dir.path().join(format!("crashy.{i}.1.cdh.tar.gz"));
            std::fs::write(&path, b"x").unwrap();
            journal
                .add_crash("crashy", &"0".repeat(16), &"1".repeat(16), &"2".repeat(16), path.to_str().unwrap(), i, 11, i as u64)
                .unwrap();
            journal.set_transfer(path.to_str().unwrap(), true).unwrap();
        }
        let janitor = Janitor {
            min_dir_size_mb: 0,
            max_dir_size_mb: 1000,
            max_file_count: 2,
        };
        janitor.enforce(&journal);
        assert_eq!(journal.get_entry_count().unwrap(), 2);
    }
}
