use anyhow::{Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size of every file chunk except the last
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Top level configuration
/// Layered: defaults < TOML file < ROOMDROP_* env vars
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub transfer: TransferConfig,
}

impl Config {
    /// Load config from `path`, or from the user config dir when no path is given.
    /// A missing file is not an error, defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "loading config file");
            figment = figment.merge(Toml::file(file));
        }

        figment
            .merge(Env::prefixed("ROOMDROP_").split("__"))
            .extract()
            .context("invalid configuration")
    }
}

/// `<config dir>/roomdrop/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "roomdrop").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Rooms older than this are deleted regardless of membership
    pub max_room_age_secs: u64,
    pub sweep_interval_secs: u64,
    /// Events buffered per client before further ones are dropped
    pub client_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_room_age_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            client_queue_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_room_age(&self) -> Duration {
        Duration::from_secs(self.max_room_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // interval() panics on zero
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn client_queue(&self) -> usize {
        // mpsc::channel() panics on zero
        self.client_queue_capacity.max(1)
    }
}

/// STUN/TURN server handed to the negotiation transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// Config for peer sessions and chunk transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub acceptance_timeout_secs: u64,
    pub negotiation_timeout_secs: u64,
    /// Sender waits until the channel's buffered amount is at or below this
    pub low_water_mark: usize,
    /// Offers declaring more bytes than this are refused without asking
    pub max_file_size: u64,
    pub ice_servers: Vec<IceServer>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            acceptance_timeout_secs: 30,
            negotiation_timeout_secs: 30,
            low_water_mark: 64 * 1024,
            max_file_size: 2 * 1024 * 1024 * 1024,
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::turn(
                    "turn:openrelay.metered.ca:80",
                    "openrelayproject",
                    "openrelayproject",
                ),
                IceServer::turn(
                    "turn:openrelay.metered.ca:443",
                    "openrelayproject",
                    "openrelayproject",
                ),
            ],
        }
    }
}

impl TransferConfig {
    pub fn acceptance_timeout(&self) -> Duration {
        Duration::from_secs(self.acceptance_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.transfer.chunk_size, 16384);
        assert_eq!(config.transfer.acceptance_timeout(), Duration::from_secs(30));
        assert_eq!(config.relay.max_room_age(), Duration::from_secs(86_400));
        assert_eq!(config.transfer.max_file_size, 2 << 30);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[relay]\nport = 8088\nsweep_interval_secs = 5\n\n[transfer]\nlow_water_mark = 1024\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.relay.port, 8088);
        assert_eq!(config.relay.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.transfer.low_water_mark, 1024);
        // untouched keys keep their defaults
        assert_eq!(config.relay.host, "0.0.0.0");
        assert_eq!(config.transfer.chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.relay.port, 3000);
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let relay = RelayConfig {
            sweep_interval_secs: 0,
            ..RelayConfig::default()
        };
        assert_eq!(relay.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_client_queue_is_clamped() {
        let relay = RelayConfig {
            client_queue_capacity: 0,
            ..RelayConfig::default()
        };
        assert_eq!(relay.client_queue(), 1);
        assert_eq!(RelayConfig::default().client_queue(), 256);
    }
}
