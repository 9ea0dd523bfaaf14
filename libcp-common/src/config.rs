// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The key-file configuration reader described in `spec.md` §6. No ini
//! crate appears anywhere in the teacher's dependency stack for this shape
//! of config (`libdd-common`'s own `config` module reads its environment
//! sourced settings by hand, in the same style used here); unknown keys are
//! ignored with a warning, missing optional keys fall back to the
//! documented defaults.

use anyhow::Context;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = String::from("common");

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line = raw_line, "ignoring malformed config line");
                continue;
            };
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Self { sections }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or(default).to_string()
    }

    pub fn get_u64(&self, section: &str, key: &str, default: u64) -> u64 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_i64(&self, section: &str, key: &str, default: i64) -> i64 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    /// Sections whose name starts with `prefix`, in file order (`BTreeMap`
    /// keeps section names sorted, which is immaterial here: each
    /// `crashcontext-*` rule is independent of the others' relative order).
    pub fn sections_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a BTreeMap<String, String>)> {
        self.sections
            .iter()
            .filter(move |(name, _)| name.starts_with(prefix))
            .map(|(name, kv)| (name.as_str(), kv))
    }
}

/// `[common]` section, shared by both binaries.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub user_name: String,
    pub group_name: String,
    pub crashdump_directory: PathBuf,
    pub run_directory: PathBuf,
    pub ipc_socket_file: String,
    pub ipc_socket_timeout: Duration,
    pub epilog_socket_file: String,
    pub epilog_socket_timeout: Duration,
}

impl CommonConfig {
    pub fn from_file(cfg: &ConfigFile, build_defaults: &BuildDefaults) -> Self {
        Self {
            user_name: cfg.get_string("common", "UserName", &build_defaults.user_name),
            group_name: cfg.get_string("common", "GroupName", &build_defaults.group_name),
            crashdump_directory: PathBuf::from(cfg.get_string(
                "common",
                "CrashdumpDirectory",
                &build_defaults.crashdump_directory,
            )),
            run_directory: PathBuf::from(cfg.get_string(
                "common",
                "RunDirectory",
                &build_defaults.run_directory,
            )),
            ipc_socket_file: cfg.get_string("common", "IpcSocketFile", "crashpipe.sock"),
            ipc_socket_timeout: Duration::from_secs(cfg.get_u64("common", "IpcSocketTimeout", 5)),
            epilog_socket_file: cfg.get_string("common", "EpilogSocketFile", ".epilog.sock"),
            epilog_socket_timeout: Duration::from_secs(cfg.get_u64("common", "EpilogSocketTimeout", 5)),
        }
    }

    pub fn ipc_socket_path(&self) -> PathBuf {
        self.run_directory.join(&self.ipc_socket_file)
    }

    /// Overridable by `$EPILOG_SOCK`, matching `libcdhepilog/cdh-epilog.c`'s
    /// client-side lookup in `original_source`.
    pub fn epilog_socket_path(&self) -> PathBuf {
        std::env::var("EPILOG_SOCK")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.run_directory.join(&self.epilog_socket_file))
    }
}

/// Build-time defaults, analogous to the `#define`d defaults in the
/// original C sources (`ARCHIVE_NAME_PATTERN`, default paths, ...).
#[derive(Debug, Clone)]
pub struct BuildDefaults {
    pub user_name: String,
    pub group_name: String,
    pub crashdump_directory: String,
    pub run_directory: String,
    pub default_config_path: String,
}

impl Default for BuildDefaults {
    fn default() -> Self {
        Self {
            user_name: "crashpipe".to_string(),
            group_name: "crashpipe".to_string(),
            crashdump_directory: "/var/spool/crashpipe".to_string(),
            run_directory: "/run/crashpipe".to_string(),
            default_config_path: "/etc/crashpipe/crashpipe.conf".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrashHandlerConfig {
    pub file_system_min_size_mb: u64,
    pub elevated_nice_value: i64,
}

impl CrashHandlerConfig {
    pub fn from_file(cfg: &ConfigFile) -> Self {
        Self {
            file_system_min_size_mb: cfg.get_u64("crashhandler", "FileSystemMinSize", 64),
            elevated_nice_value: cfg.get_i64("crashhandler", "ElevatedNiceValue", 5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrashManagerConfig {
    pub database_file: PathBuf,
    pub kernel_dump_source_dir: Option<PathBuf>,
    pub min_crashdump_dir_size_mb: u64,
    pub max_crashdump_dir_size_mb: u64,
    pub max_crashdump_archives: u64,
}

impl CrashManagerConfig {
    pub fn from_file(cfg: &ConfigFile, run_directory: &Path) -> Self {
        Self {
            database_file: PathBuf::from(cfg.get_string(
                "crashmanager",
                "DatabaseFile",
                &run_directory.join("crashpipe.db").to_string_lossy(),
            )),
            kernel_dump_source_dir: cfg
                .get("crashmanager", "KernelDumpSourceDir")
                .map(PathBuf::from),
            min_crashdump_dir_size_mb: cfg.get_u64("crashmanager", "MinCrashdumpDirSize", 32),
            max_crashdump_dir_size_mb: cfg.get_u64("crashmanager", "MaxCrashdumpDirSize", 1024),
            max_crashdump_archives: cfg.get_u64("crashmanager", "MaxCrashdumpArchives", 200),
        }
    }
}

/// A `[crashcontext-*]` rule (`spec.md` §6, §4.4).
#[derive(Debug, Clone)]
pub struct CrashContextRule {
    pub name: String,
    pub proc_name: Regex,
    pub post_core: bool,
    pub data_path: String,
}

impl CrashContextRule {
    /// Substitutes the literal `$$` marker in `DataPath` with the crashing
    /// process' pid (`spec.md` §4.4).
    pub fn interpolated_path(&self, pid: i64) -> String {
        self.data_path.replace("$$", &pid.to_string())
    }
}

pub fn crash_context_rules(cfg: &ConfigFile) -> Vec<CrashContextRule> {
    let mut rules = Vec::new();
    for (name, kv) in cfg.sections_with_prefix("crashcontext-") {
        let Some(pattern) = kv.get("ProcName") else {
            tracing::warn!(section = name, "crashcontext rule missing ProcName, skipping");
            continue;
        };
        let proc_name = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(section = name, error = %e, "invalid ProcName regex, skipping");
                continue;
            }
        };
        let post_core = matches!(
            kv.get("PostCore").map(|s| s.to_ascii_lowercase()).as_deref(),
            Some("1") | Some("true") | Some("yes") | Some("on")
        );
        let data_path = kv.get("DataPath").cloned().unwrap_or_default();
        if data_path.is_empty() {
            tracing::warn!(section = name, "crashcontext rule missing DataPath, skipping");
            continue;
        }
        rules.push(CrashContextRule {
            name: name.to_string(),
            proc_name,
            post_core,
            data_path,
        });
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# comment
[common]
UserName = crashd
CrashdumpDirectory = /data/crash

[crashmanager]
MaxCrashdumpDirSize = 800
MinCrashdumpDirSize = 50

[crashcontext-foo]
ProcName = ^my-app$
PostCore = true
DataPath = /proc/$$/status
"#;

    #[test]
    fn parses_sections_and_keys() {
        let cfg = ConfigFile::parse(SAMPLE);
        assert_eq!(cfg.get("common", "UserName"), Some("crashd"));
        assert_eq!(cfg.get_u64("crashmanager", "MaxCrashdumpDirSize", 0), 800);
    }

    #[test]
    fn unknown_key_falls_back_to_default() {
        let cfg = ConfigFile::parse(SAMPLE);
        assert_eq!(cfg.get_u64("crashmanager", "DoesNotExist", 42), 42);
    }

    #[test]
    fn crashcontext_rules_are_discovered_by_prefix() {
        let cfg = ConfigFile::parse(SAMPLE);
        let rules = crash_context_rules(&cfg);
        assert_eq!(rules.len(), 1);
        assert!(rules[0].proc_name.is_match("my-app"));
        assert!(rules[0].post_core);
        assert_eq!(rules[0].interpolated_path(77), "/proc/77/status");
    }

    #[test]
    fn malformed_line_is_ignored_not_fatal() {
        let cfg = ConfigFile::parse("[common]\nnotakeyvalue\nUserName = ok\n");
        assert_eq!(cfg.get("common", "UserName"), Some("ok"));
    }

    #[test]
    fn epilog_socket_path_honors_env_override() {
        std::env::remove_var("EPILOG_SOCK");
        let cfg = ConfigFile::parse("[common]\nRunDirectory = /run/crashpipe\n");
        let common = CommonConfig::from_file(&cfg, &BuildDefaults::default());
        assert_eq!(common.epilog_socket_path(), PathBuf::from("/run/crashpipe/.epilog.sock"));

        std::env::set_var("EPILOG_SOCK", "/tmp/custom.sock");
        assert_eq!(common.epilog_socket_path(), PathBuf::from("/tmp/custom.sock"));
        std::env::remove_var("EPILOG_SOCK");
    }
}
