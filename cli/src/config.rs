// Configuration management for the circuitline CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/circuitline/config.json
// - Linux: ~/.config/circuitline/config.json
// - Windows: %APPDATA%\circuitline\config.json

use anyhow::{Context, Result};
use circuitline_core::{NodeConfig, RelayConfig, ReservationConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relays to reserve a slot on, each ending in /p2p/<relay-id>
    pub relays: Vec<String>,

    /// Application protocol spoken on sessions
    pub protocol: String,

    /// Key file path (defaults to the data directory)
    pub key_file: Option<String>,

    /// Directory for daily-rolled log files (stderr when unset)
    pub log_dir: Option<String>,

    /// Give up waiting for a reservation after this many seconds (0 waits forever)
    pub reservation_timeout: u64,

    /// Relay service settings
    pub relay_server: RelayServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    /// Port for the WebSocket listener
    pub listen_port: u16,

    /// Public addresses announced to reserving peers
    pub announce: Vec<String>,

    /// Reservation cap (unbounded when unset)
    pub max_reservations: Option<usize>,

    /// Publish reserved peers' circuit addresses
    pub advertise: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: crate::bootstrap::default_relays(),
            protocol: circuitline_core::DEFAULT_PROTOCOL.to_string(),
            key_file: None,
            log_dir: None,
            reservation_timeout: 0,
            relay_server: RelayServerConfig::default(),
        }
    }
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 3001,
            announce: Vec::new(),
            max_reservations: None,
            advertise: false,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("circuitline");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("circuitline");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the given file or the default location
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file()?,
        };
        let config = Self::load_from(&path)?;
        Ok((config, path))
    }

    /// Load config from file, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Resolved key file path
    pub fn key_path(&self) -> Result<PathBuf> {
        match &self.key_file {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("identity.key")),
        }
    }

    /// Peer node settings; an explicit relay replaces the configured ones
    pub fn node_config(&self, relay: Option<String>) -> NodeConfig {
        let relays = match relay {
            Some(relay) => vec![relay],
            None => self.relays.clone(),
        };
        NodeConfig {
            relays,
            protocol: self.protocol.clone(),
            reservation: ReservationConfig {
                timeout_secs: (self.reservation_timeout > 0).then_some(self.reservation_timeout),
                ..ReservationConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    /// Relay service settings; command-line values win over the file
    pub fn relay_config(
        &self,
        listen: Vec<String>,
        announce: Vec<String>,
        max_reservations: Option<usize>,
        advertise: bool,
    ) -> RelayConfig {
        let listen_addrs = if listen.is_empty() {
            vec![format!("/ip4/0.0.0.0/tcp/{}/ws", self.relay_server.listen_port)]
        } else {
            listen
        };
        let announce_addrs = if announce.is_empty() {
            self.relay_server.announce.clone()
        } else {
            announce
        };
        RelayConfig {
            listen_addrs,
            announce_addrs,
            max_reservations: max_reservations.or(self.relay_server.max_reservations),
            advertise: advertise || self.relay_server.advertise,
            ..RelayConfig::default()
        }
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "relays" => {
                self.relays = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "protocol" => {
                if !value.starts_with('/') {
                    anyhow::bail!("Protocol must start with '/'");
                }
                self.protocol = value.to_string();
            }
            "key_file" => self.key_file = optional(value),
            "log_dir" => self.log_dir = optional(value),
            "reservation_timeout" => {
                self.reservation_timeout = value.parse().context("Invalid number")?;
            }
            "relay_port" => {
                self.relay_server.listen_port = value.parse().context("Invalid port number")?;
            }
            "relay_announce" => {
                self.relay_server.announce = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "relay_max_reservations" => {
                self.relay_server.max_reservations = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().context("Invalid number")?)
                };
            }
            "relay_advertise" => {
                self.relay_server.advertise = value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "relays" => Some(self.relays.join(",")),
            "protocol" => Some(self.protocol.clone()),
            "key_file" => self.key_file.clone(),
            "log_dir" => self.log_dir.clone(),
            "reservation_timeout" => Some(self.reservation_timeout.to_string()),
            "relay_port" => Some(self.relay_server.listen_port.to_string()),
            "relay_announce" => Some(self.relay_server.announce.join(",")),
            "relay_max_reservations" => self.relay_server.max_reservations.map(|n| n.to_string()),
            "relay_advertise" => Some(self.relay_server.advertise.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("relays".to_string(), self.relays.len().to_string()),
            ("protocol".to_string(), self.protocol.clone()),
            (
                "key_file".to_string(),
                self.key_file.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(stderr)".to_string()),
            ),
            (
                "reservation_timeout".to_string(),
                match self.reservation_timeout {
                    0 => "(none)".to_string(),
                    secs => format!("{}s", secs),
                },
            ),
            ("relay_port".to_string(), self.relay_server.listen_port.to_string()),
            ("relay_announce".to_string(), self.relay_server.announce.len().to_string()),
            (
                "relay_max_reservations".to_string(),
                self.relay_server
                    .max_reservations
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "(unbounded)".to_string()),
            ),
            ("relay_advertise".to_string(), self.relay_server.advertise.to_string()),
        ]
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.relays.is_empty());
        assert_eq!(config.protocol, "/node-1");
        assert_eq!(config.relay_server.listen_port, 3001);
        assert!(config.relay_server.max_reservations.is_none());
    }

    #[test]
    fn test_created_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(config.relays, reloaded.relays);
    }

    #[test]
    fn test_set_get_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("reservation_timeout", "30").unwrap();
        config.set("relay_max_reservations", "8").unwrap();
        config.set("relays", "/ip4/1.2.3.4/tcp/1/p2p/x, /ip4/5.6.7.8/tcp/2/p2p/y").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.get("reservation_timeout").as_deref(), Some("30"));
        assert_eq!(reloaded.get("relay_max_reservations").as_deref(), Some("8"));
        assert_eq!(reloaded.relays.len(), 2);
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("relay_port", "not-a-port").is_err());
        assert!(config.set("protocol", "node-1").is_err());
        assert!(config.set("no_such_key", "1").is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"protocol": "/chat-2"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.protocol, "/chat-2");
        assert_eq!(config.relay_server.listen_port, 3001);
    }

    #[test]
    fn test_node_config_relay_override() {
        let mut config = Config::default();
        config.reservation_timeout = 15;

        let node = config.node_config(Some("/ip4/9.9.9.9/tcp/1/p2p/z".to_string()));
        assert_eq!(node.relays, vec!["/ip4/9.9.9.9/tcp/1/p2p/z"]);
        assert_eq!(node.reservation.timeout_secs, Some(15));

        let node = Config::default().node_config(None);
        assert_eq!(node.relays, Config::default().relays);
        assert_eq!(node.reservation.timeout_secs, None);
    }

    #[test]
    fn test_relay_config_flags_win() {
        let mut config = Config::default();
        config.relay_server.max_reservations = Some(4);

        let relay = config.relay_config(Vec::new(), Vec::new(), None, false);
        assert_eq!(relay.listen_addrs, vec!["/ip4/0.0.0.0/tcp/3001/ws"]);
        assert_eq!(relay.max_reservations, Some(4));

        let relay = config.relay_config(
            vec!["/ip4/127.0.0.1/tcp/0".to_string()],
            vec!["/dns4/relay.example/tcp/443/wss".to_string()],
            Some(100),
            true,
        );
        assert_eq!(relay.listen_addrs, vec!["/ip4/127.0.0.1/tcp/0"]);
        assert_eq!(relay.max_reservations, Some(100));
        assert!(relay.advertise);
    }
}
