//! # Command-Line Interface Module
//!
//! Defines the command-line interface for mpdynamic using Clap derive macros.
//!
//! ## Commands
//!
//! - `run`: Keep the MPD playlist topped up until interrupted
//! - `suggest`: Show what one replenishment cycle would queue (dry run)
//! - `status`: Show the MPD state and how many tracks remain
//! - `config`: Print the effective configuration
//! - `completion`: Generate shell completions
//!
//! Connection settings and Spotify credentials can come from the config file,
//! the environment or the flags below, in increasing order of precedence.
//!
//! ## Examples
//!
//! ```bash
//! SPOTIFY_CLIENT_ID=... SPOTIFY_CLIENT_SECRET=... mpdynamic run
//! mpdynamic --host music.local --threshold 5 suggest
//! ```

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::Config;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "mpdynamic")]
#[command(about = "mpdynamic: keeps your MPD playlist going with Spotify recommendations from your own library")]
#[command(version)]
pub struct Args {
    #[command(flatten)]
    pub overrides: Overrides,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Settings that override the config file.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct Overrides {
    /// Path to config.toml (default: the platform config directory)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// MPD host
    #[arg(long, global = true, env = "MPD_HOST")]
    pub host: Option<String>,

    /// MPD port
    #[arg(long, global = true, env = "MPD_PORT")]
    pub port: Option<u16>,

    /// Refill once fewer than this many tracks remain
    #[arg(long, global = true)]
    pub threshold: Option<usize>,

    /// Spotify application client id
    #[arg(long, global = true, env = "SPOTIFY_CLIENT_ID", hide_env_values = true)]
    pub spotify_id: Option<String>,

    /// Spotify application client secret
    #[arg(long, global = true, env = "SPOTIFY_CLIENT_SECRET", hide_env_values = true)]
    pub spotify_secret: Option<String>,
}

impl Overrides {
    /// Apply every override that was given.
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.mpd.host = host.clone();
        }
        if let Some(port) = self.port {
            config.mpd.port = port;
        }
        if let Some(threshold) = self.threshold {
            config.queue.threshold = threshold;
        }
        if let Some(id) = &self.spotify_id {
            config.spotify.client_id = id.clone();
        }
        if let Some(secret) = &self.spotify_secret {
            config.spotify.client_secret = secret.clone();
        }
    }
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Keep the playlist topped up until interrupted
    ///
    /// Watches MPD and, whenever fewer than `threshold` tracks remain, asks
    /// Spotify for recommendations based on the current song and appends the
    /// ones found in your library. Stop with Ctrl-C or SIGTERM.
    Run,

    /// Show what one replenishment cycle would queue, without queuing it
    Suggest,

    /// Show the MPD player state and remaining track count
    Status,

    /// Print the effective configuration as TOML (secrets masked)
    Config,

    /// Generate shell completions
    ///
    /// Usage: mpdynamic completion bash > ~/.local/share/bash-completion/completions/mpdynamic
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_overrides_after_subcommand() {
        let args = Args::try_parse_from([
            "mpdynamic",
            "run",
            "--host",
            "music.local",
            "--port",
            "6601",
            "--threshold",
            "4",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Run));

        let mut config = Config::default();
        args.overrides.apply(&mut config);
        assert_eq!(config.mpd.address(), "music.local:6601");
        assert_eq!(config.queue.threshold, 4);
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let overrides = Overrides::default();
        let mut config = Config::default();
        overrides.apply(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_completion_shell_parses() {
        let args = Args::try_parse_from(["mpdynamic", "completion", "power-shell"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Completion {
                shell: Shell::PowerShell
            }
        ));
    }
}
