// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! `crash-handler tstamp pid cpid sig procname`, core on stdin. Invoked
//! once per crash by the kernel's `core_pattern` pipe (`spec.md` §2, §4.4).

use libcp_common::config::{BuildDefaults, CommonConfig, ConfigFile, CrashHandlerConfig};
use libcp_handler::app::{self, HandlerArgs};
use std::process::ExitCode;

const DEFAULT_CONFIG_PATH: &str = "/etc/crashpipe/crashpipe.conf";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let Some(args) = parse_args(&argv) else {
        tracing::error!("usage: crash-handler tstamp pid cpid sig procname");
        return ExitCode::FAILURE;
    };

    let defaults = BuildDefaults::default();
    let config_path = std::env::var("CRASHPIPE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = ConfigFile::load(std::path::Path::new(&config_path)).unwrap_or_else(|e| {
        tracing::warn!(path = %config_path, error = %e, "using built-in defaults");
        ConfigFile::parse("")
    });

    let common = CommonConfig::from_file(&cfg, &defaults);
    let handler_cfg = CrashHandlerConfig::from_file(&cfg);
    let rules = libcp_common::config::crash_context_rules(&cfg);

    if app::run(args, &common, &handler_cfg, &rules) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn parse_args(argv: &[String]) -> Option<HandlerArgs> {
    if argv.len() < 6 {
        return None;
    }
    Some(HandlerArgs {
        timestamp: argv[1].parse().ok()?,
        pid: argv[2].parse().ok()?,
        container_pid: argv[3].parse().ok()?,
        signal: argv[4].parse().ok()?,
        proc_name: argv[5].clone(),
    })
}
