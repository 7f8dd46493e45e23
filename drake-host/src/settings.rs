//! Host settings (JSON file in the user's home directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use drake_core::{KeyPolicy, ShimConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamOverride {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct HostSettings {
    pub timeout_complete_ms: u32,
    pub timeout_incomplete_ms: u32,
    pub extra_params: Vec<ParamOverride>,
    pub mimic_timeout_ms: u64,
    /// `"reuse"` or `"monotonic"`.
    pub key_policy: String,
    pub key_quarantine_ms: u64,
    pub resume_on_pause: bool,
    /// Append logs to `<home>/drake.log` instead of stderr.
    pub debug_log: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            timeout_complete_ms: 80,
            timeout_incomplete_ms: 500,
            extra_params: Vec::new(),
            mimic_timeout_ms: 5_000,
            key_policy: "reuse".into(),
            key_quarantine_ms: 0,
            resume_on_pause: true,
            debug_log: false,
        }
    }
}

impl HostSettings {
    pub fn normalize(&mut self) {
        self.timeout_complete_ms = self.timeout_complete_ms.clamp(10, 10_000);
        self.timeout_incomplete_ms = self.timeout_incomplete_ms.clamp(10, 30_000);
        self.mimic_timeout_ms = self.mimic_timeout_ms.clamp(50, 60_000);
        self.key_policy = normalize_key_policy(&self.key_policy);
        self.key_quarantine_ms = self.key_quarantine_ms.min(600_000);
        self.extra_params = self
            .extra_params
            .iter()
            .map(|p| ParamOverride {
                key: p.key.trim().to_string(),
                value: p.value.trim().to_string(),
            })
            .filter(|p| !p.key.is_empty())
            .collect();
    }

    pub fn shim_config(&self) -> ShimConfig {
        let key_policy = match self.key_policy.as_str() {
            "monotonic" => KeyPolicy::Monotonic,
            _ => KeyPolicy::ReuseFirst {
                quarantine: Duration::from_millis(self.key_quarantine_ms),
            },
        };
        ShimConfig {
            timeout_complete_ms: self.timeout_complete_ms,
            timeout_incomplete_ms: self.timeout_incomplete_ms,
            extra_params: self
                .extra_params
                .iter()
                .map(|p| (p.key.clone(), p.value.clone()))
                .collect(),
            mimic_timeout: Duration::from_millis(self.mimic_timeout_ms),
            key_policy,
            resume_on_pause: self.resume_on_pause,
        }
    }
}

pub fn normalize_key_policy(value: &str) -> String {
    match value.trim().to_ascii_lowercase().as_str() {
        "monotonic" => "monotonic".into(),
        _ => "reuse".into(),
    }
}

/// `%APPDATA%` on Windows, `$HOME` elsewhere; the current directory if unset.
pub fn home_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let var = "APPDATA";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";

    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_settings_path() -> PathBuf {
    home_dir().join("drake").join("settings.json")
}

pub fn log_path() -> PathBuf {
    home_dir().join("drake.log")
}

pub fn load_settings(path: &Path) -> HostSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<HostSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &HostSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
