//! # Configuration Module
//!
//! Configuration for mpdynamic lives in a single TOML file in the
//! platform-standard config directory:
//! - Linux: `~/.config/mpdynamic/config.toml`
//! - macOS: `~/Library/Application Support/mpdynamic/config.toml`
//! - Windows: `%APPDATA%\mpdynamic\config.toml`
//!
//! Every key is optional. A missing file means "all defaults", which talk to a
//! local MPD on port 6600 and refill once fewer than 10 tracks remain. The
//! Spotify credentials have no default and are usually passed through the
//! environment instead (see [`crate::cli`]).
//!
//! ```toml
//! [mpd]
//! host = "127.0.0.1"
//! port = 6600
//! timeout_secs = 10
//!
//! [spotify]
//! client_id = "..."
//! client_secret = "..."
//!
//! [queue]
//! threshold = 10
//! seed_tracks = 1
//!
//! [retry]
//! retries = 1
//! reconnect_attempts = 5
//! initial_backoff_ms = 500
//! max_backoff_ms = 30000
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::RetryPolicy;
use crate::recommender::MAX_SEEDS;

/// Returns the platform-appropriate config directory for mpdynamic.
///
/// The directory is not created; a missing config file is not an error.
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system config directory. Pass --config explicitly."
        )
    })?;
    Ok(config_dir.join("mpdynamic"))
}

/// Default location of `config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

/// Playback engine (MPD) connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpdSettings {
    pub host: String,
    pub port: u16,
    /// Sent with `password` right after connecting, when set.
    pub password: Option<String>,
    /// Socket read/write timeout; expiry is a transient failure.
    pub timeout_secs: u64,
    /// How often a change-notification wait checks whether it should yield.
    pub idle_poll_ms: u64,
}

impl Default for MpdSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6600,
            password: None,
            timeout_secs: 10,
            idle_poll_ms: 250,
        }
    }
}

impl MpdSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Recommendation service (Spotify Web API) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifySettings {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub auth_url: String,
    pub timeout_secs: u64,
}

impl Default for SpotifySettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base: "https://api.spotify.com/v1".to_string(),
            auth_url: "https://accounts.spotify.com/api/token".to_string(),
            timeout_secs: 15,
        }
    }
}

/// Replenishment behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Refill once `remaining + queued` drops below this.
    pub threshold: usize,
    /// How many seed tracks to send with each recommendation request:
    /// the current song plus up to `seed_tracks - 1` songs before it.
    pub seed_tracks: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            threshold: 10,
            seed_tracks: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mpd: MpdSettings,
    pub spotify: SpotifySettings,
    pub queue: QueueSettings,
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// An explicitly given path must exist; the default one may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path()?, false),
        };

        if !path.exists() {
            if explicit {
                bail!("Config file {} does not exist", path.display());
            }
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse TOML")?;
        config.normalize();
        Ok(config)
    }

    /// Clamp values that have an obvious legal range.
    pub fn normalize(&mut self) {
        self.queue.seed_tracks = self.queue.seed_tracks.clamp(1, MAX_SEEDS);
    }

    /// Checks that apply to every command.
    pub fn validate(&self) -> Result<()> {
        if self.mpd.host.trim().is_empty() {
            bail!("mpd.host must not be empty");
        }
        if self.mpd.port == 0 {
            bail!("mpd.port must be a valid TCP port");
        }
        if self.mpd.timeout_secs == 0 {
            bail!("mpd.timeout_secs must be at least 1");
        }
        if self.mpd.idle_poll_ms == 0 {
            bail!("mpd.idle_poll_ms must be at least 1");
        }
        if self.queue.threshold == 0 {
            bail!("queue.threshold must be at least 1");
        }
        Ok(())
    }

    /// Extra checks for commands that talk to the recommendation service.
    pub fn validate_credentials(&self) -> Result<()> {
        if self.spotify.client_id.trim().is_empty() || self.spotify.client_secret.trim().is_empty() {
            bail!(
                "Spotify credentials missing. Set spotify.client_id / spotify.client_secret \
                 in the config file or SPOTIFY_CLIENT_ID / SPOTIFY_CLIENT_SECRET"
            );
        }
        Ok(())
    }

    /// Effective configuration as TOML with secrets masked.
    pub fn to_masked_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.spotify.client_secret.is_empty() {
            shown.spotify.client_secret = "********".to_string();
        }
        if shown.mpd.password.is_some() {
            shown.mpd.password = Some("********".to_string());
        }
        toml::to_string_pretty(&shown).context("Failed to serialize configuration")
    }
}
