use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::queue::QueueConfig;

pub const DB_FILE: &str = "sheetledger.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default)]
    pub sheet_path: String,
    #[serde(default = "default_user")]
    pub user_id: String,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_placeholder_category")]
    pub placeholder_category: String,
}

fn default_user() -> String {
    "default".to_string()
}

fn default_min_interval_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_placeholder_category() -> String {
    "! Nog in te delen !".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            sheet_path: data_dir.join("ledger.csv").to_string_lossy().to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
            user_id: default_user(),
            min_interval_ms: default_min_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            placeholder_category: default_placeholder_category(),
        }
    }
}

impl Settings {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            min_interval: Duration::from_millis(self.min_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(DB_FILE)
    }

    /// Where the ledger sheet lives; falls back to `<data_dir>/ledger.csv`.
    pub fn sheet_path(&self) -> PathBuf {
        if self.sheet_path.is_empty() {
            PathBuf::from(&self.data_dir).join("ledger.csv")
        } else {
            PathBuf::from(&self.sheet_path)
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("sheetledger")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("sheetledger")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| LedgerError::Config(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn settings_file_exists() -> bool {
    settings_path().exists()
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}
