use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

const HEADER: &str = "//! manifest ";

/// Program manifest. `syscalls` becomes the process allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramManifest {
    #[serde(default)]
    pub name: String,
    pub syscalls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_mem: Option<u64>,
}

impl ProgramManifest {
    pub fn from_value(value: &serde_json::Value) -> KernelResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|err| KernelError::invalid(format!("bad manifest: {err}")))
    }

    /// Extract a `//! manifest {...}` header from the first non-blank line
    /// of program text. Text without a header has no manifest.
    pub fn from_source(code: &str) -> KernelResult<Option<Self>> {
        let Some(first) = code.lines().map(str::trim).find(|line| !line.is_empty()) else {
            return Ok(None);
        };
        let Some(json) = first.strip_prefix(HEADER) else {
            return Ok(None);
        };
        serde_json::from_str(json)
            .map(Some)
            .map_err(|err| KernelError::invalid(format!("bad manifest header: {err}")))
    }
}
