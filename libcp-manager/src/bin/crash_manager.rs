// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

use libcp_common::config::{BuildDefaults, CommonConfig, ConfigFile, CrashManagerConfig};
use libcp_manager::event_loop::{self, ManagerServices};
use libcp_manager::transfer::CopyToDirShipper;
use std::process::ExitCode;

const DEFAULT_CONFIG_PATH: &str = "/etc/crashpipe/crashpipe.conf";

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let mut config_path = DEFAULT_CONFIG_PATH.to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" | "--version" => {
                println!("crash-manager {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "-c" | "--config" => match args.next() {
                Some(path) => config_path = path,
                None => {
                    eprintln!("--config requires a path argument");
                    return ExitCode::FAILURE;
                }
            },
            other => {
                eprintln!("unrecognized argument: {other}");
                return ExitCode::FAILURE;
            }
        }
    }

    let defaults = BuildDefaults::default();
    let cfg = ConfigFile::load(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
        tracing::warn!(path = %config_path, error = %e, "using built-in defaults");
        ConfigFile::parse("")
    });
    let common = CommonConfig::from_file(&cfg, &defaults);
    let manager_cfg = CrashManagerConfig::from_file(&cfg, &common.run_directory);

    // The real wire shipper is out of scope (`spec.md` §1); this copies
    // shipped archives into a sibling directory as a concrete stand-in.
    let sink_dir = common.run_directory.join("shipped");
    let services = ManagerServices {
        enumerator: None,
        shipper: Box::new(CopyToDirShipper { sink_dir }),
    };

    match event_loop::run(common, manager_cfg, services) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "crash manager exited with an error");
            ExitCode::FAILURE
        }
    }
}
