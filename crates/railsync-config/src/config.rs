//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Socket and transport settings.
    pub network: NetworkConfig,
    /// Session, broadcast cadence and player bookkeeping settings.
    pub multiplayer: MultiplayerConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Dispatcher address clients connect to.
    pub server_address: String,
    /// Dispatcher port.
    pub server_port: u16,
    /// Maximum number of concurrently connected clients (dispatcher only).
    pub max_players: u32,
    /// Largest accepted frame payload in bytes.
    pub max_payload_size: u32,
    /// Disable Nagle's algorithm on every socket.
    pub tcp_nodelay: bool,
    /// Idle seconds before the first TCP keepalive probe. 0 disables keepalive.
    pub keepalive_secs: u64,
}

/// Multiplayer session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MultiplayerConfig {
    /// Local player name.
    pub username: String,
    /// Session code sent with the join request.
    pub session_code: String,
    /// Route identity text. Both ends must hash to the same value.
    pub route: String,
    /// Seconds between position broadcasts.
    pub position_interval_secs: f64,
    /// Seconds between full switch/signal snapshots (dispatcher only).
    pub switch_interval_secs: f64,
    /// Seconds a disconnected player is kept for reconnection.
    pub lost_player_grace_secs: f64,
    /// Unknown-train position updates tolerated before a train request is sent.
    pub missing_train_threshold: u32,
    /// Seconds a stopped client train keeps reporting its position.
    pub client_stop_window_secs: f64,
    /// Squared distance above which a reconnecting player gets its old train back.
    pub reattach_distance_sq: f64,
    /// Let any client throw switches, not only the dispatcher and its aiders.
    pub allow_client_switching: bool,
    /// Capacity of the inbound connection event queue.
    pub inbox_capacity: usize,
    /// Session ticks per second for the headless node.
    pub tick_hz: u32,
    /// Directory scanned for rolling-stock definitions.
    pub rolling_stock_dir: Option<PathBuf>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the console output.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 30000,
            max_players: 32,
            max_payload_size: 1_048_576,
            tcp_nodelay: true,
            keepalive_secs: 60,
        }
    }
}

impl Default for MultiplayerConfig {
    fn default() -> Self {
        Self {
            username: "player".to_string(),
            session_code: String::new(),
            route: String::new(),
            position_interval_secs: 1.0,
            switch_interval_secs: 10.0,
            lost_player_grace_secs: 600.0,
            missing_train_threshold: 10,
            client_stop_window_secs: 5.0,
            reattach_distance_sq: 1_000_000.0,
            allow_client_switching: false,
            inbox_capacity: 1024,
            tick_hz: 20,
            rolling_stock_dir: None,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

/// Platform configuration directory for railsync (`<config dir>/railsync`).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("railsync"))
        .ok_or(ConfigError::NoConfigDir)
}

const CONFIG_FILE: &str = "config.ron";

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = ron::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Read `config.ron` from `config_dir`. A missing file is replaced by the
    /// defaults, which are written out so the user has something to edit.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("wrote default settings to {}", path.display());
            return Ok(config);
        }
        let config = read_config(&path)?;
        log::info!("settings loaded from {}", path.display());
        Ok(config)
    }

    /// Write `config.ron` into `config_dir`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(config_dir).map_err(write_err)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty)?;
        std::fs::write(&path, text).map_err(write_err)
    }

    /// Re-read `config.ron`. `Some` only when the file now differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_config(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("settings changed on disk");
        Ok(Some(fresh))
    }

    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mp = &self.multiplayer;
        let checks = [
            (mp.tick_hz == 0, "multiplayer.tick_hz", "must be at least 1"),
            (mp.position_interval_secs <= 0.0, "multiplayer.position_interval_secs", "must be positive"),
            (mp.switch_interval_secs <= 0.0, "multiplayer.switch_interval_secs", "must be positive"),
            (mp.lost_player_grace_secs < 0.0, "multiplayer.lost_player_grace_secs", "must not be negative"),
            (mp.inbox_capacity == 0, "multiplayer.inbox_capacity", "must be at least 1"),
            (self.network.max_players == 0, "network.max_players", "must be at least 1"),
            (self.network.max_payload_size < 64, "network.max_payload_size", "must be at least 64 bytes"),
        ];
        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, field, reason)) => Err(ConfigError::Invalid { field, reason }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_session_timings() {
        let mp = MultiplayerConfig::default();
        assert_eq!(mp.position_interval_secs, 1.0);
        assert_eq!(mp.lost_player_grace_secs, 600.0);
        assert_eq!(mp.missing_train_threshold, 10);
        assert_eq!(mp.reattach_distance_sq, 1_000_000.0);
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let config: Config = ron::from_str("(network: (server_port: 4000), debug: (log_to_file: true))").unwrap();
        assert_eq!(config.network.server_port, 4000);
        assert_eq!(config.network.server_address, "127.0.0.1");
        assert!(config.debug.log_to_file);
        assert_eq!(config.multiplayer, MultiplayerConfig::default());
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let config: Config = ron::from_str("(multiplayer: (username: \"anna\", turbo: true))").unwrap();
        assert_eq!(config.multiplayer.username, "anna");
    }

    #[test]
    fn test_written_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.multiplayer.username = "signalman".to_string();
        config.multiplayer.rolling_stock_dir = Some(PathBuf::from("stock"));
        config.network.keepalive_secs = 0;
        config.save(dir.path()).unwrap();

        let text = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(text.contains("lost_player_grace_secs: 600.0"));
        assert_eq!(Config::load_or_create(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        assert_eq!(Config::load_or_create(&nested).unwrap(), Config::default());
        assert!(nested.join(CONFIG_FILE).is_file());
    }

    #[test]
    fn test_reload_reports_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut edited = config.clone();
        edited.multiplayer.allow_client_switching = true;
        edited.save(dir.path()).unwrap();
        let fresh = config.reload(dir.path()).unwrap().unwrap();
        assert!(fresh.multiplayer.allow_client_switching);
    }

    #[test]
    fn test_broken_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "(network: (server_port: \"x\"))").unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(&err, ConfigError::Parse { path, .. } if path.ends_with(CONFIG_FILE)));
    }

    #[test]
    fn test_zero_tick_rate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.multiplayer.tick_hz = 0;
        config.save(dir.path()).unwrap();
        let err = Config::load_or_create(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "multiplayer.tick_hz", .. }));
    }
}
