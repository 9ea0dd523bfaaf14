// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The handler-facing half of the manager's protocol (`spec.md` §4.5): one
//! `HandlerClient` state machine per accepted connection, driven entirely
//! by `spawn_local` tasks on the single-threaded event loop so every
//! journal/transfer access stays serialized without locking.
//!
//! Grounded on `cdm-client.c`'s `client_source_callback`/`process_message`
//! in `original_source`, with one documented deviation (DESIGN.md): the
//! original's journal-insert guard requires `complete_data`, which a bare
//! `FAILED` session never sets, so a FAILED-only session never reaches
//! `cdm_journal_add_crash` there. `spec.md` §4.5/§8 test 2 is explicit that
//! FAILED must still journal, so this is implemented as written in the
//! spec rather than carried over as a bug.

use crate::container_name::{self, ContainerEnumerator};
use crate::janitor::Janitor;
use crate::journal::Journal;
use crate::transfer::TransferTask;
use crate::async_protocol;
use libcp_common::protocol::MessagePayload;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

struct NewData {
    pid: i64,
    signal: i64,
    timestamp: u64,
    #[allow(dead_code)]
    thread_name: String,
    proc_name: String,
}

struct UpdateData {
    crash_id: String,
    vector_id: String,
    context_id: String,
}

/// Deterministic archive filename shared with the handler's own
/// `archive_path` (`libcp-handler/src/app.rs`): `{name}.{pid}.{timestamp}.cdh.tar.gz`.
/// The manager needs to recompute this independently for a `FAILED`
/// session, since that message carries no path on the wire.
fn archive_path(crashdump_directory: &std::path::Path, new: &NewData) -> PathBuf {
    crashdump_directory.join(format!("{}.{}.{}.cdh.tar.gz", new.proc_name, new.pid, new.timestamp))
}

struct HandlerClient {
    init_data: Option<NewData>,
    update_data: Option<UpdateData>,
}

impl HandlerClient {
    fn new() -> Self {
        Self {
            init_data: None,
            update_data: None,
        }
    }
}

/// Removes a stale socket file left behind by an unclean shutdown, then
/// binds, mirroring `get_receiver_unix_socket`'s pattern in the example
/// pack. Binding is synchronous-fast; callers await it before spawning
/// [`serve`] so a bad socket path fails startup instead of failing silently
/// inside a detached task.
pub fn bind(socket_path: &std::path::Path) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "handler socket listening");
    Ok(listener)
}

/// Accepts connections forever, spawning one `spawn_local` task per
/// connection. An `accept` error is logged and retried rather than ending
/// the loop, since a single misbehaving peer should never take down the
/// listener.
pub async fn serve(
    listener: UnixListener,
    crashdump_directory: std::path::PathBuf,
    journal: Rc<RefCell<Journal>>,
    transfer_tx: mpsc::Sender<TransferTask>,
    enumerator: Rc<Option<Box<dyn ContainerEnumerator>>>,
    own_pid: i64,
    janitor: Rc<Janitor>,
) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "handler socket accept failed");
                continue;
            }
        };
        let journal = Rc::clone(&journal);
        let transfer_tx = transfer_tx.clone();
        let enumerator = Rc::clone(&enumerator);
        let crashdump_directory = crashdump_directory.clone();
        let janitor = Rc::clone(&janitor);
        tokio::task::spawn_local(async move {
            if let Err(e) = serve_connection(stream, crashdump_directory, journal, transfer_tx, enumerator, own_pid, janitor).await {
                tracing::warn!(error = %e, "handler connection ended with an error");
            }
        });
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    crashdump_directory: std::path::PathBuf,
    journal: Rc<RefCell<Journal>>,
    transfer_tx: mpsc::Sender<TransferTask>,
    enumerator: Rc<Option<Box<dyn ContainerEnumerator>>>,
    own_pid: i64,
    janitor: Rc<Janitor>,
) -> anyhow::Result<()> {
    let mut client = HandlerClient::new();

    loop {
        let Some(msg) = async_protocol::read_message(&mut stream).await? else {
            return Ok(());
        };
        match msg.payload {
            MessagePayload::New { pid, coresig, tstamp, tname, pname } => {
                tracing::info!(pid, signal = coresig, procname = %pname, "handler session: NEW");
                client.init_data = Some(NewData {
                    pid,
                    signal: coresig,
                    timestamp: tstamp,
                    thread_name: tname,
                    proc_name: pname,
                });
            }
            MessagePayload::Update { crash_id, vector_id, context_id } => {
                let context_name = container_name::resolve_context_name(own_pid, &context_id, enumerator.as_deref());
                tracing::info!(crash_id, vector_id, context_id, context_name, "handler session: UPDATE");
                client.update_data = Some(UpdateData { crash_id, vector_id, context_id });
            }
            MessagePayload::Complete { core_file } => {
                tracing::info!(core_file, "handler session: COMPLETE");
                journal_terminal(&client, &journal, &janitor, Some(core_file.clone()), &crashdump_directory);
                if transfer_tx.send(TransferTask { file_path: core_file }).await.is_err() {
                    tracing::warn!("transfer worker channel closed, archive not queued");
                }
                return Ok(());
            }
            MessagePayload::Failed => {
                tracing::info!("handler session: FAILED");
                journal_terminal(&client, &journal, &janitor, None, &crashdump_directory);
                return Ok(());
            }
        }
    }
}

/// Inserts the journal row for a terminal message. `core_file` is `Some`
/// on COMPLETE (the handler reports the exact path it wrote); on FAILED it
/// is recomputed from `init_data` since the wire message carries none. A
/// successful insert can move the janitor's quota, so it runs immediately
/// after rather than waiting for the next timer tick.
fn journal_terminal(
    client: &HandlerClient,
    journal: &Rc<RefCell<Journal>>,
    janitor: &Janitor,
    core_file: Option<String>,
    crashdump_directory: &std::path::Path,
) {
    let Some(init) = &client.init_data else {
        tracing::warn!("terminal message with no preceding NEW, dropping session");
        return;
    };
    let file_path = core_file.unwrap_or_else(|| archive_path(crashdump_directory, init).to_string_lossy().into_owned());
    let (crash_id, vector_id, context_id) = match &client.update_data {
        Some(u) => (u.crash_id.as_str(), u.vector_id.as_str(), u.context_id.as_str()),
        None => ("", "", ""),
    };
    let journal_ref = journal.borrow();
    match journal_ref.add_crash(
        &init.proc_name,
        crash_id,
        vector_id,
        context_id,
        &file_path,
        init.pid,
        init.signal,
        init.timestamp,
    ) {
        Ok(_) => janitor.enforce(&journal_ref),
        Err(e) => tracing::error!(error = %e, file_path, "failed to insert journal row"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libcp_common::protocol::Message;
    use tokio::io::AsyncWriteExt;

    struct NoContainers;
    impl ContainerEnumerator for NoContainers {
        fn active_containers(&self) -> Vec<(String, i64)> {
            Vec::new()
        }
    }

    async fn drive(messages: Vec<MessagePayload>) -> (Journal, Option<TransferTask>) {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        let journal = Rc::new(RefCell::new(Journal::open_in_memory()));
        let (tx, mut rx) = mpsc::channel::<TransferTask>(4);
        let enumerator: Rc<Option<Box<dyn ContainerEnumerator>>> = Rc::new(Some(Box::new(NoContainers)));
        let janitor = Rc::new(Janitor { min_dir_size_mb: 0, max_dir_size_mb: 1_000_000, max_file_count: 1_000_000 });
        let dir = std::env::temp_dir();

        let local = tokio::task::LocalSet::new();
        let journal_clone = Rc::clone(&journal);
        local
            .run_until(async move {
                let server = tokio::task::spawn_local(serve_connection(server_sock, dir, journal_clone, tx, enumerator, 1, janitor));
                let mut client_sock = client_sock;
                for payload in messages {
                    let msg = Message::new(0, payload);
                    let mut buf = Vec::new();
                    msg.write_to(&mut buf).unwrap();
                    client_sock.write_all(&buf).await.unwrap();
                }
                drop(client_sock);
                server.await.unwrap().unwrap();
            })
            .await;

        let transfer_task = rx.try_recv().ok();
        (Rc::try_unwrap(journal).unwrap().into_inner(), transfer_task)
    }

    #[tokio::test]
    async fn complete_session_journals_and_enqueues_transfer() {
        let (journal, task) = drive(vec![
            MessagePayload::New { pid: 7, coresig: 11, tstamp: 100, tname: "t".into(), pname: "app".into() },
            MessagePayload::Update { crash_id: "a".repeat(16), vector_id: "b".repeat(16), context_id: "c".repeat(16) },
            MessagePayload::Complete { core_file: "/tmp/app.7.100.cdh.tar.gz".into() },
        ])
        .await;

        assert_eq!(journal.get_entry_count().unwrap(), 1);
        assert!(journal.archive_exist("/tmp/app.7.100.cdh.tar.gz").unwrap());
        assert_eq!(task.unwrap().file_path, "/tmp/app.7.100.cdh.tar.gz");
    }

    #[tokio::test]
    async fn failed_session_journals_without_a_transfer_task() {
        let (journal, task) = drive(vec![
            MessagePayload::New { pid: 8, coresig: 6, tstamp: 200, tname: "t".into(), pname: "app".into() },
            MessagePayload::Failed,
        ])
        .await;

        assert_eq!(journal.get_entry_count().unwrap(), 1);
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn terminal_message_with_no_new_is_dropped() {
        let (journal, task) = drive(vec![MessagePayload::Failed]).await;
        assert_eq!(journal.get_entry_count().unwrap(), 0);
        assert!(task.is_none());
    }
}
