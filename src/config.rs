// Client configuration for the Infinichat binary
// Persists the last-used server and account name as pretty JSON under the
// platform config directory. Passwords are never stored.

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use infinichat::connection::DEFAULT_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("infinichat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn load_config() -> Result<Option<ClientConfig>> {
    load_config_from(&get_config_dir()?.join("config.json"))
}

pub fn save_config(config: &ClientConfig) -> Result<()> {
    save_config_to(&get_config_dir()?.join("config.json"), config)
}

pub fn load_config_from(path: &Path) -> Result<Option<ClientConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let config: ClientConfig = serde_json::from_str(&contents)?;
    info!("loaded configuration for {} from {}", config.username, path.display());
    Ok(Some(config))
}

pub fn save_config_to(path: &Path, config: &ClientConfig) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;
    info!("configuration saved for {}", config.username);
    Ok(())
}
