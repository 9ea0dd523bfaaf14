// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The background transfer worker (`spec.md` §4.6): a single auxiliary OS
//! thread draining a bounded handoff queue, shipping each archive through a
//! pluggable [`ArchiveShipper`], and posting completions back to the event
//! loop rather than touching the journal directly (`spec.md` §5: "the
//! worker thread communicates completion by posting back to the main
//! loop").

use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// Abstracts the real wire shipper, which is out of scope (`spec.md` §1:
/// "the archive shipper's wire protocol... abstract ship file F, call back
/// when done").
pub trait ArchiveShipper: Send + 'static {
    fn ship(&self, file_path: &Path) -> anyhow::Result<()>;
}

/// Copies the archive into a configured sink directory. Stands in for the
/// real wire shipper (`spec.md` §4.6).
pub struct CopyToDirShipper {
    pub sink_dir: PathBuf,
}

impl ArchiveShipper for CopyToDirShipper {
    fn ship(&self, file_path: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.sink_dir)?;
        let dest = self.sink_dir.join(file_path.file_name().unwrap_or_default());
        std::fs::copy(file_path, dest)?;
        Ok(())
    }
}

pub struct TransferTask {
    pub file_path: String,
}

pub struct TransferCompletion {
    pub file_path: String,
    pub ok: bool,
}

/// Spawns the single-slot worker thread. Returns the sending half of the
/// task queue and the receiving half of the completion channel; the event
/// loop owns both ends and is the only writer to the journal.
pub fn spawn_worker(
    shipper: Box<dyn ArchiveShipper>,
) -> (mpsc::Sender<TransferTask>, mpsc::Receiver<TransferCompletion>) {
    let (task_tx, mut task_rx) = mpsc::channel::<TransferTask>(64);
    let (done_tx, done_rx) = mpsc::channel::<TransferCompletion>(64);

    std::thread::spawn(move || {
        while let Some(task) = task_rx.blocking_recv() {
            let ok = match shipper.ship(Path::new(&task.file_path)) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(path = %task.file_path, error = %e, "archive transfer failed");
                    false
                }
            };
            let completion = TransferCompletion {
                file_path: task.file_path,
                ok,
            };
            if done_tx.blocking_send(completion).is_err() {
                break;
            }
        }
    });

    (task_tx, done_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingShipper;
    impl ArchiveShipper for FailingShipper {
        fn ship(&self, _file_path: &Path) -> anyhow::Result<()> {
            anyhow::bail!("shipper unavailable")
        }
    }

    #[tokio::test]
    async fn successful_ship_reports_ok_completion() {
        let src_dir = tempfile::tempdir().unwrap();
        let sink_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("crashy.1.1.cdh.tar.gz");
        std::fs::write(&src, b"archive bytes").unwrap();

        let (tx, mut rx) = spawn_worker(Box::new(CopyToDirShipper {
            sink_dir: sink_dir.path().to_path_buf(),
        }));
        tx.send(TransferTask {
            file_path: src.to_string_lossy().into_owned(),
        })
        .await
        .unwrap();

        let completion = rx.recv().await.unwrap();
        assert!(completion.ok);
        assert!(sink_dir.path().join("crashy.1.1.cdh.tar.gz").exists());
    }

    #[tokio::test]
    async fn failed_ship_reports_failed_completion_not_an_error() {
        let (tx, mut rx) = spawn_worker(Box::new(FailingShipper));
        tx.send(TransferTask {
            file_path: "/nonexistent/crashy.1.1.cdh.tar.gz".into(),
        })
        .await
        .unwrap();
        let completion = rx.recv().await.unwrap();
        assert!(!completion.ok);
    }
}
