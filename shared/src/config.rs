//! Configuration for Peertun
//!
//! Loaded from an optional peertun.yml, then overridden by PEERTUN_*
//! environment variables. Every field has a working default so both
//! binaries run with no configuration at all.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Tunnel configuration shared by both roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Session identifier both peers must agree on.
    /// Env: `PEERTUN_SESSION`. Default: `my-secret-tunnel`.
    #[serde(default = "default_session")]
    pub session_id: String,

    /// MQTT signaling broker as `host:port`.
    /// Env: `PEERTUN_BROKER`. Default: `test.mosquitto.org:1883`.
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Port the client-side HTTP listener binds to.
    /// Env: `PEERTUN_LISTEN_PORT`. Default: `8080`.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Hostname the host role forwards requests to.
    /// Env: `PEERTUN_TARGET_HOST`. Default: `127.0.0.1`.
    #[serde(default = "default_target_host")]
    pub target_host: String,

    /// Port the host role forwards requests to.
    /// Env: `PEERTUN_TARGET_PORT`. Default: `3000`.
    #[serde(default = "default_target_port")]
    pub target_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_id: default_session(),
            broker: default_broker(),
            listen_port: default_listen_port(),
            target_host: default_target_host(),
            target_port: default_target_port(),
        }
    }
}

fn default_session() -> String {
    "my-secret-tunnel".to_string()
}

fn default_broker() -> String {
    "test.mosquitto.org:1883".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

fn default_target_port() -> u16 {
    3000
}

impl Config {
    /// Load configuration: file (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply PEERTUN_* environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("PEERTUN_SESSION") {
            self.session_id = v;
        }
        if let Ok(v) = std::env::var("PEERTUN_BROKER") {
            self.broker = v;
        }
        if let Ok(v) = std::env::var("PEERTUN_LISTEN_PORT") {
            if let Ok(port) = v.parse() {
                self.listen_port = port;
            }
        }
        if let Ok(v) = std::env::var("PEERTUN_TARGET_HOST") {
            self.target_host = v;
        }
        if let Ok(v) = std::env::var("PEERTUN_TARGET_PORT") {
            if let Ok(port) = v.parse() {
                self.target_port = port;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.session_id.is_empty() {
            return Err(Error::Config("Session id cannot be empty".into()));
        }
        if self.broker.is_empty() {
            return Err(Error::Config("Broker address cannot be empty".into()));
        }
        if self.listen_port == 0 || self.target_port == 0 {
            return Err(Error::Config("Ports must be non-zero".into()));
        }
        Ok(())
    }

    /// Broker address split into `(host, port)`.
    pub fn broker_addr(&self) -> (String, u16) {
        match self.broker.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().unwrap_or(default_broker_port()),
            ),
            None => (self.broker.clone(), default_broker_port()),
        }
    }

    /// Search for a config file in standard locations.
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = ["peertun.yml", "peertun.yaml", ".peertun.yml"];

        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

fn default_broker_port() -> u16 {
    1883
}
