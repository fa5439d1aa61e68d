use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Directory that receives backup archives
    pub backup_dir: PathBuf,

    /// Parent of every test-restore directory
    pub restore_base_dir: PathBuf,

    /// Home directory used by home backups
    pub home_dir: PathBuf,

    /// Bound of each job's event channel
    pub event_capacity: usize,

    /// Number of operator log lines kept in memory
    pub log_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));

        Self {
            port: 8888,
            backup_dir: home_dir.join("RSR_backups"),
            restore_base_dir: home_dir.join("RSR_test_restore"),
            home_dir,
            event_capacity: 256,
            log_entries: 1000,
        }
    }
}

impl Config {
    /// Load config from environment
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(port) = std::env::var("RSR_PORT") {
            config.port = port.parse()?;
        }

        if let Ok(dir) = std::env::var("RSR_BACKUP_DIR") {
            config.backup_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("RSR_RESTORE_DIR") {
            config.restore_base_dir = PathBuf::from(dir);
        }

        if let Ok(capacity) = std::env::var("RSR_EVENT_CAPACITY") {
            config.event_capacity = capacity.parse()?;
        }

        if let Ok(entries) = std::env::var("RSR_LOG_ENTRIES") {
            config.log_entries = entries.parse()?;
        }

        // A zero-capacity channel would make every event a rendezvous
        if config.event_capacity == 0 {
            config.event_capacity = 1;
        }

        Ok(config)
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}
