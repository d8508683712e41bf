use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::net::{NicKind, WifiNetwork};

/// Boot-time configuration for a kernel instance.
///
/// Every field has a default so a config file only needs to name what it
/// changes; `{}` is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub hostname: String,
    /// Wall-time budget handed to the executor for one slice.
    pub slice_ms: u64,
    /// Default cumulative cpu quota for new processes.
    pub quota_ms: u64,
    /// Default cumulative memory quota for new processes.
    pub quota_mem: u64,
    /// Length of the per-process cpu history ring.
    pub cpu_history: usize,
    pub idle_base_ms: u64,
    pub idle_max_ms: u64,
    pub pty_capacity: usize,
    pub event_capacity: usize,
    pub console_capacity: usize,
    pub boot_dirs: Vec<BootDirectory>,
    pub nics: Vec<BootNic>,
    pub wifi_networks: Vec<WifiNetwork>,
    pub init: Option<InitProgram>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hostname: "sandbox".into(),
            slice_ms: 50,
            quota_ms: 60_000,
            quota_mem: 64 * 1024 * 1024,
            cpu_history: 60,
            idle_base_ms: 4,
            idle_max_ms: 256,
            pty_capacity: 64 * 1024,
            event_capacity: 4096,
            console_capacity: 1024,
            boot_dirs: default_boot_dirs(),
            nics: vec![BootNic {
                id: "lo".into(),
                mac: "00:00:00:00:00:00".into(),
                kind: NicKind::Wired,
                up: true,
                ip: Some("127.0.0.1".into()),
                netmask: Some("255.0.0.0".into()),
            }],
            wifi_networks: Vec::new(),
            init: None,
        }
    }
}

impl KernelConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("opening kernel config {}", path.display()))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing kernel config {}", path.display()))?;
        Ok(config)
    }

    pub fn with_init(mut self, init: InitProgram) -> Self {
        self.init = Some(init);
        self
    }
}

fn default_boot_dirs() -> Vec<BootDirectory> {
    [
        ("/bin", 0o755),
        ("/dev", 0o755),
        ("/etc", 0o755),
        ("/home", 0o755),
        ("/mnt", 0o755),
        ("/proc", 0o555),
        ("/tmp", 0o777),
        ("/var", 0o755),
    ]
    .into_iter()
    .map(|(path, mode)| BootDirectory {
        path: path.into(),
        mode,
    })
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootDirectory {
    pub path: String,
    #[serde(default = "default_dir_mode")]
    pub mode: u16,
}

fn default_dir_mode() -> u16 {
    0o755
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootNic {
    pub id: String,
    pub mac: String,
    #[serde(default)]
    pub kind: NicKind,
    #[serde(default)]
    pub up: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
}

/// The first process started at boot. When `source` is given it is written
/// to `path` before the kernel reads the program back from the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitProgram {
    pub path: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: KernelConfig = serde_json::from_str("{}").expect("parse config");
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.cpu_history, 60);
        assert!(config.boot_dirs.iter().any(|dir| dir.path == "/tmp"));
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config: KernelConfig = serde_json::from_value(serde_json::json!({
            "slice_ms": 10,
            "nics": [{"id": "eth0", "mac": "AA:BB:CC:DD:EE:01", "kind": "wifi"}],
            "init": {"path": "/bin/init"}
        }))
        .expect("parse config");

        assert_eq!(config.slice_ms, 10);
        assert_eq!(config.quota_ms, 60_000);
        assert_eq!(config.nics[0].kind, NicKind::Wifi);
        assert!(!config.nics[0].up);
        assert_eq!(config.init.expect("init").path, "/bin/init");
    }

    #[test]
    fn missing_config_file_reports_path() {
        let err = KernelConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }
}
