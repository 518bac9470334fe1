use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::{broker::DEFAULT_FORWARD_TIMEOUT, keys::Identity, types::Address};

#[derive(Debug, Default, Deserialize)]
pub struct IdentityConfig {
    // hex encoded secp256k1 secret, takes precedence over the key file
    pub private_key: Option<String>,

    // file holding the hex encoded secret
    pub key_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LedgerConfig {
    // toml fixture seeding the in-memory ledger
    pub fixture: Option<String>,

    pub block_time_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TowerConfig {
    pub listen: Option<String>,

    // the tower's ledger account, defaults to the identity's address
    pub address: Option<Address>,

    pub forward_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    pub poll_interval_ms: Option<u64>,

    pub relay_timeout_secs: Option<u64>,
}

// config as read in from disk
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub tower: TowerConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config `{}`", path.display()))?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    // intervals drive tokio timers, which reject a zero period
    fn validate(&self) -> anyhow::Result<()> {
        if self.ledger.block_time_ms == Some(0) {
            anyhow::bail!("`ledger.block_time_ms` must be positive");
        }
        if self.session.poll_interval_ms == Some(0) {
            anyhow::bail!("`session.poll_interval_ms` must be positive");
        }
        Ok(())
    }

    /// Reads `path` if given, else `~/.meca/config.toml` when it exists, else defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        if let Some(path) = path {
            return Config::from_file(path);
        }
        let default_path = default_path()?;
        if default_path.exists() {
            Config::from_file(&default_path)
        } else {
            Ok(Config::default())
        }
    }

    /// `None` when neither a key nor a key file is configured.
    pub fn identity(&self) -> anyhow::Result<Option<Identity>> {
        if let Some(key) = &self.identity.private_key {
            return Identity::from_hex(key).map(Some);
        }
        if let Some(key_file) = &self.identity.key_file {
            let raw = fs::read_to_string(key_file)
                .with_context(|| format!("failed to read key file `{key_file}`"))?;
            return Identity::from_hex(&raw).map(Some);
        }
        Ok(None)
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.ledger.block_time_ms.unwrap_or(1_000))
    }

    pub fn listen(&self) -> String {
        self.tower
            .listen
            .clone()
            .unwrap_or_else(|| "127.0.0.1:7777".to_string())
    }

    pub fn forward_timeout(&self) -> Duration {
        self.tower
            .forward_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FORWARD_TIMEOUT)
    }

    // one block time unless configured
    pub fn poll_interval(&self) -> Duration {
        self.session
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.block_time())
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.session.relay_timeout_secs.unwrap_or(120))
    }
}

pub fn get_home_dir() -> anyhow::Result<String> {
    let err_msg = "Home dir is not available";
    let binding = home::home_dir()
        .ok_or_else(|| anyhow::Error::msg(err_msg))?;
    let home_dir = binding.to_str()
        .ok_or_else(|| anyhow::Error::msg(err_msg))?;
    Ok(home_dir.to_string())
}

pub fn default_path() -> anyhow::Result<PathBuf> {
    Ok(PathBuf::from(format!("{}/.meca/config.toml", get_home_dir()?)))
}
