// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The durable crash journal (`spec.md` §4.7): a single-file `rusqlite`
//! database, one table (`crashes`), row id = `jenkins64(file_path)`. Rows
//! are inserted on COMPLETE/FAILED and never deleted; eviction only flips
//! `removed`.

use anyhow::Context;
use libcp_common::jenkins::jenkins64;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct Journal {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRow {
    pub id: u64,
    pub procname: String,
    pub crash_id: String,
    pub vector_id: String,
    pub context_id: String,
    pub file_path: String,
    pub pid: i64,
    pub signal: i64,
    pub timestamp: u64,
    pub transferred: bool,
    pub removed: bool,
}

impl Journal {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open journal database {}", path.display()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS crashes (
                id          INTEGER PRIMARY KEY,
                procname    TEXT NOT NULL,
                crash_id    TEXT NOT NULL,
                vector_id   TEXT NOT NULL,
                context_id  TEXT NOT NULL,
                file_path   TEXT NOT NULL UNIQUE,
                pid         INTEGER NOT NULL,
                signal      INTEGER NOT NULL,
                timestamp   INTEGER NOT NULL,
                transferred INTEGER NOT NULL DEFAULT 0,
                removed     INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .context("cannot create crashes table")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS epilog_records (
                pid       INTEGER PRIMARY KEY,
                backtrace BLOB NOT NULL
            )",
            [],
        )
        .context("cannot create epilog_records table")?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("in-memory sqlite connection");
        conn.execute(
            "CREATE TABLE crashes (
                id          INTEGER PRIMARY KEY,
                procname    TEXT NOT NULL,
                crash_id    TEXT NOT NULL,
                vector_id   TEXT NOT NULL,
                context_id  TEXT NOT NULL,
                file_path   TEXT NOT NULL UNIQUE,
                pid         INTEGER NOT NULL,
                signal      INTEGER NOT NULL,
                timestamp   INTEGER NOT NULL,
                transferred INTEGER NOT NULL DEFAULT 0,
                removed     INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE TABLE epilog_records (
                pid       INTEGER PRIMARY KEY,
                backtrace BLOB NOT NULL
            )",
            [],
        )
        .unwrap();
        Self { conn }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_crash(
        &self,
        procname: &str,
        crash_id: &str,
        vector_id: &str,
        context_id: &str,
        file_path: &str,
        pid: i64,
        signal: i64,
        timestamp: u64,
    ) -> anyhow::Result<u64> {
        let id = jenkins64(file_path.as_bytes());
        self.conn
            .execute(
                "INSERT INTO crashes
                 (id, procname, crash_id, vector_id, context_id, file_path, pid, signal, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(file_path) DO NOTHING",
                params![
                    id as i64,
                    procname,
                    crash_id,
                    vector_id,
                    context_id,
                    file_path,
                    pid,
                    signal,
                    timestamp as i64,
                ],
            )
            .context("cannot insert crash row")?;
        tracing::info!(id, file_path, "journal row inserted");
        Ok(id)
    }

    pub fn set_transfer(&self, file_path: &str, transferred: bool) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE crashes SET transferred = ?1 WHERE file_path = ?2",
                params![transferred, file_path],
            )
            .context("cannot update transferred flag")?;
        tracing::debug!(file_path, transferred, "journal row transfer flag updated");
        Ok(())
    }

    pub fn set_removed(&self, file_path: &str, removed: bool) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE crashes SET removed = ?1 WHERE file_path = ?2",
                params![removed, file_path],
            )
            .context("cannot update removed flag")?;
        tracing::debug!(file_path, removed, "journal row removed flag updated");
        Ok(())
    }

    pub fn get_entry_count(&self) -> anyhow::Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM crashes WHERE removed = 0", [], |r| r.get(0))
            .context("cannot count journal entries")?;
        Ok(n as u64)
    }

    /// Sums the on-disk byte size of every non-removed archive. Missing
    /// files (already unlinked out of band) contribute zero rather than
    /// failing the whole query.
    pub fn get_data_size(&self) -> anyhow::Result<u64> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_path FROM crashes WHERE removed = 0")
            .context("cannot prepare data-size query")?;
        let paths = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .context("cannot read crash file paths")?;
        let mut total = 0u64;
        for path in paths {
            let path = path.context("malformed file_path row")?;
            total += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(total)
    }

    /// Oldest `removed=false, transferred=true` row; falls back to the
    /// oldest `removed=false` row if none has been transferred yet
    /// (`spec.md` §4.7).
    pub fn get_victim(&self) -> anyhow::Result<Option<JournalRow>> {
        if let Some(row) = self.query_one_row(
            "SELECT * FROM crashes WHERE removed = 0 AND transferred = 1 ORDER BY timestamp ASC LIMIT 1",
        )? {
            return Ok(Some(row));
        }
        self.query_one_row("SELECT * FROM crashes WHERE removed = 0 ORDER BY timestamp ASC LIMIT 1")
    }

    /// Rows the manager still owes a transfer attempt, used at startup to
    /// resume shipping after a restart.
    pub fn get_untransferred(&self) -> anyhow::Result<Vec<JournalRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM crashes WHERE transferred = 0 AND removed = 0")
            .context("cannot prepare untransferred query")?;
        let rows = stmt
            .query_map([], Self::row_from)
            .context("cannot read untransferred rows")?
            .collect::<Result<Vec<_>, _>>()
            .context("malformed journal row")?;
        Ok(rows)
    }

    pub fn archive_exist(&self, file_path: &str) -> anyhow::Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM crashes WHERE file_path = ?1", params![file_path], |r| r.get(0))
            .optional()
            .context("cannot check archive existence")?;
        Ok(exists.is_some())
    }

    /// Appends (overwriting any prior record for the same pid, which a
    /// reused pid would otherwise collide on) a backtrace blob captured by
    /// the epilog client (`spec.md` §4.8: "On clean read, appends an
    /// `EpilogRecord` to the journal").
    pub fn add_epilog_record(&self, pid: i64, backtrace: &[u8]) -> anyhow::Result<()> {
        self.conn
            .execute(
                "INSERT INTO epilog_records (pid, backtrace) VALUES (?1, ?2)
                 ON CONFLICT(pid) DO UPDATE SET backtrace = excluded.backtrace",
                params![pid, backtrace],
            )
            .context("cannot insert epilog record")?;
        tracing::info!(pid, bytes = backtrace.len(), "epilog record journaled");
        Ok(())
    }

    pub fn get_epilog_record(&self, pid: i64) -> anyhow::Result<Option<Vec<u8>>> {
        self.conn
            .query_row("SELECT backtrace FROM epilog_records WHERE pid = ?1", params![pid], |r| r.get(0))
            .optional()
            .context("cannot read epilog record")
    }

    fn query_one_row(&self, sql: &str) -> anyhow::Result<Option<JournalRow>> {
        self.conn
            .query_row(sql, [], Self::row_from)
            .optional()
            .context("cannot query journal row")
    }

    fn row_from(row: &rusqlite::Row) -> rusqlite::Result<JournalRow> {
        Ok(JournalRow {
            id: row.get::<_, i64>("id")? as u64,
            procname: row.get("procname")?,
            crash_id: row.get("crash_id")?,
            vector_id: row.get("vector_id")?,
            context_id: row.get("context_id")?,
            file_path: row.get("file_path")?,
            pid: row.get("pid")?,
            signal: row.get("signal")?,
            timestamp: row.get::<_, i64>("timestamp")? as u64,
            transferred: row.get("transferred")?,
            removed: row.get("removed")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(j: &Journal, path: &str, ts: u64) -> u64 {
        j.add_crash("crashy", "0".repeat(16).as_str(), "1".repeat(16).as_str(), "2".repeat(16).as_str(), path, 42, 11, ts)
            .unwrap()
    }

    #[test]
    fn add_crash_id_is_jenkins_hash_of_path() {
        let j = Journal::open_in_memory();
        let id = sample(&j, "/var/crash/a.cdh.tar.gz", 1);
        assert_eq!(id, jenkins64(b"/var/crash/a.cdh.tar.gz"));
    }

    #[test]
    fn inserting_same_path_twice_is_a_no_op() {
        let j = Journal::open_in_memory();
        sample(&j, "/var/crash/a.cdh.tar.gz", 1);
        sample(&j, "/var/crash/a.cdh.tar.gz", 2);
        assert_eq!(j.get_entry_count().unwrap(), 1);
    }

    #[test]
    fn victim_prefers_oldest_transferred_row() {
        let j = Journal::open_in_memory();
        sample(&j, "/var/crash/old.cdh.tar.gz", 1);
        sample(&j, "/var/crash/new.cdh.tar.gz", 2);
        j.set_transfer("/var/crash/new.cdh.tar.gz", true).unwrap();
        let victim = j.get_victim().unwrap().unwrap();
        assert_eq!(victim.file_path, "/var/crash/new.cdh.tar.gz");
    }

    #[test]
    fn victim_falls_back_to_oldest_untransferred_row() {
        let j = Journal::open_in_memory();
        sample(&j, "/var/crash/old.cdh.tar.gz", 1);
        sample(&j, "/var/crash/new.cdh.tar.gz", 2);
        let victim = j.get_victim().unwrap().unwrap();
        assert_eq!(victim.file_path, "/var/crash/old.cdh.tar.gz");
    }

    #[test]
    fn removed_rows_are_excluded_from_entry_count() {
        let j = Journal::open_in_memory();
        sample(&j, "/var/crash/a.cdh.tar.gz", 1);
        j.set_removed("/var/crash/a.cdh.tar.gz", true).unwrap();
        assert_eq!(j.get_entry_count().unwrap(), 0);
    }

    #[test]
    fn archive_exist_reflects_journal_membership() {
        let j = Journal::open_in_memory();
        assert!(!j.archive_exist("/var/crash/a.cdh.tar.gz").unwrap());
        sample(&j, "/var/crash/a.cdh.tar.gz", 1);
        assert!(j.archive_exist("/var/crash/a.cdh.tar.gz").unwrap());
    }

    #[test]
    fn epilog_record_roundtrips_by_pid() {
        let j = Journal::open_in_memory();
        assert_eq!(j.get_epilog_record(42).unwrap(), None);
        j.add_epilog_record(42, b"frame0\nframe1\n").unwrap();
        assert_eq!(j.get_epilog_record(42).unwrap(), Some(b"frame0\nframe1\n".to_vec()));
    }

    #[test]
    fn epilog_record_for_reused_pid_overwrites_the_previous_one() {
        let j = Journal::open_in_memory();
        j.add_epilog_record(42, b"old").unwrap();
        j.add_epilog_record(42, b"new").unwrap();
        assert_eq!(j.get_epilog_record(42).unwrap(), Some(b"new".to_vec()));
    }
}
