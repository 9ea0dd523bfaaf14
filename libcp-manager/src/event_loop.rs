// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! Top-level wiring for the manager daemon (`spec.md` §4.5, §5): a single
//! OS thread running a `current_thread` Tokio runtime with a `LocalSet`, so
//! every handler/epilog connection task and the janitor tick share the
//! journal through an `Rc<RefCell<_>>` with no locking, while the transfer
//! worker remains the one real auxiliary OS thread.
//!
//! Grounded on `entry_points.rs`'s `async_receiver_entry_point_unix_listener`
//! in the example pack for the `Builder::new_current_thread` + accept-loop
//! shape, and on `cdm-client.c`'s `cdm_client_new`/`cdm_manager_main` in
//! `original_source` for the set of sources the loop drives each turn.

use crate::container_name::ContainerEnumerator;
use crate::journal::Journal;
use crate::sdnotify::SdNotify;
use crate::transfer::{self, ArchiveShipper, TransferTask};
use crate::{epilog_server, handler_server, janitor::Janitor};
use libcp_common::config::{CommonConfig, CrashManagerConfig};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Backstop cadence for the janitor, in case disk usage shifts outside of a
/// journaled mutation (stray files, manual intervention). The primary
/// trigger is [`Janitor::enforce`] called directly after every mutation
/// that can move the quota (`spec.md` §4.7/§5: re-evaluate on the next loop
/// turn, converging immediately rather than one eviction per tick).
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

pub struct ManagerServices {
    pub enumerator: Option<Box<dyn ContainerEnumerator>>,
    pub shipper: Box<dyn ArchiveShipper>,
}

/// Runs the manager daemon to completion. Binding both listener sockets
/// happens synchronously before anything is spawned, so a bad socket path
/// fails startup loudly instead of dying silently inside a detached task.
pub fn run(common: CommonConfig, manager_cfg: CrashManagerConfig, services: ManagerServices) -> anyhow::Result<()> {
    std::fs::create_dir_all(&common.run_directory)?;
    let handler_listener = handler_server::bind(&common.ipc_socket_path())?;
    let epilog_listener = epilog_server::bind(&common.epilog_socket_path())?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run_async(common, manager_cfg, services, handler_listener, epilog_listener))
}

async fn run_async(
    common: CommonConfig,
    manager_cfg: CrashManagerConfig,
    services: ManagerServices,
    handler_listener: tokio::net::UnixListener,
    epilog_listener: tokio::net::UnixListener,
) -> anyhow::Result<()> {
    let journal = Rc::new(RefCell::new(Journal::open(&manager_cfg.database_file)?));
    let enumerator = Rc::new(services.enumerator);
    let (transfer_tx, mut transfer_rx) = transfer::spawn_worker(services.shipper);

    for row in journal.borrow().get_untransferred()? {
        tracing::info!(file_path = %row.file_path, "resuming untransferred archive from a prior run");
        if transfer_tx.send(TransferTask { file_path: row.file_path }).await.is_err() {
            tracing::warn!("transfer worker unavailable at startup");
            break;
        }
    }

    let janitor = Rc::new(Janitor {
        min_dir_size_mb: manager_cfg.min_crashdump_dir_size_mb,
        max_dir_size_mb: manager_cfg.max_crashdump_dir_size_mb,
        max_file_count: manager_cfg.max_crashdump_archives,
    });
    janitor.enforce(&journal.borrow());

    let own_pid = std::process::id() as i64;

    tokio::task::spawn_local(handler_server::serve(
        handler_listener,
        common.crashdump_directory.clone(),
        Rc::clone(&journal),
        transfer_tx.clone(),
        enumerator,
        own_pid,
        Rc::clone(&janitor),
    ));
    tokio::task::spawn_local(epilog_server::serve(epilog_listener, Rc::clone(&journal)));

    let sd_notify = SdNotify::from_env();
    sd_notify.ready();
    tracing::info!("crash manager ready");

    let watchdog_interval = SdNotify::watchdog_interval();
    let mut janitor_tick = tokio::time::interval(JANITOR_INTERVAL);
    let mut watchdog_tick = watchdog_interval.map(tokio::time::interval);

    loop {
        tokio::select! {
            _ = janitor_tick.tick() => {
                janitor.enforce(&journal.borrow());
            }
            _ = conditional_tick(&mut watchdog_tick) => {
                sd_notify.watchdog_ping();
            }
            completion = transfer_rx.recv() => {
                match completion {
                    Some(c) => {
                        if c.ok {
                            if let Err(e) = journal.borrow().set_transfer(&c.file_path, true) {
                                tracing::error!(error = %e, file_path = %c.file_path, "failed to mark archive transferred");
                            }
                            janitor.enforce(&journal.borrow());
                        } else {
                            tracing::warn!(file_path = %c.file_path, "archive transfer failed, will not be retried automatically");
                        }
                    }
                    None => tracing::warn!("transfer worker channel closed"),
                }
            }
        }
    }
}

async fn conditional_tick(tick: &mut Option<tokio::time::Interval>) {
    match tick {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
