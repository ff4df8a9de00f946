//! Configuration and credential storage

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::auth::{StoredToken, TokenStore};

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Our own participant identifier (from last login)
    pub user_id: Option<String>,
    /// Name shown to the people we call
    pub display_name: Option<String>,
    /// Access token for the bus and REST backend
    pub access_token: Option<StoredToken>,
    /// WebSocket endpoint of the message bus
    pub bus_url: Option<String>,
    /// REST endpoint hosting the `messages` and `profiles` tables
    pub api_url: Option<String>,
    /// Public API key sent alongside the bearer token
    pub api_key: Option<String>,
    /// Offline display names, keyed by user id
    pub contacts: HashMap<String, String>,
    /// Call tuning
    pub call: CallSettings,
}

/// Tunables for call sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Negotiation data older than this is a ghost signal and is dropped.
    pub ghost_window_ms: u64,
    /// Connection quality sampling period.
    pub quality_poll_ms: u64,
    /// Loss ratio above which the connection is flagged as poor.
    pub poor_loss_ratio: f64,
    /// Give up on a call stuck in reconnecting after this long (0 = never).
    pub reconnect_timeout_secs: u64,
    /// STUN servers handed to the peer connection.
    pub ice_servers: Vec<String>,
    /// Capture device that must exist for video calls.
    pub video_device: Option<PathBuf>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ghost_window_ms: 5000,
            quality_poll_ms: 3000,
            poor_loss_ratio: 0.10,
            reconnect_timeout_secs: 30,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            video_device: None,
        }
    }
}

impl CallSettings {
    pub fn quality_poll_interval(&self) -> Duration {
        Duration::from_millis(self.quality_poll_ms.max(1))
    }

    pub fn reconnect_timeout(&self) -> Option<Duration> {
        (self.reconnect_timeout_secs > 0).then(|| Duration::from_secs(self.reconnect_timeout_secs))
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "peercall", "peercall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn bus_url(&self) -> Result<&str> {
        self.bus_url
            .as_deref()
            .context("No bus_url configured. Add it to config.toml.")
    }

    pub fn api_url(&self) -> Result<&str> {
        self.api_url
            .as_deref()
            .context("No api_url configured. Add it to config.toml.")
    }
}

impl TokenStore for Config {
    fn get_access_token(&self) -> Option<StoredToken> {
        self.access_token.clone()
    }

    fn set_access_token(&mut self, token: String, expires_in: Option<u64>) {
        self.access_token = Some(StoredToken::new(token, expires_in));
    }

    fn clear_tokens(&mut self) {
        self.access_token = None;
        self.user_id = None;
    }
}
