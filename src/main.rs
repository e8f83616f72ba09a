//! # mpdynamic
//!
//! Keeps an MPD playlist from running dry. When fewer than a configured number
//! of tracks remain, it asks Spotify for tracks similar to the one playing and
//! appends the ones that exist in the local MPD library.
//!
//! ## Usage
//!
//! ```bash
//! # Run until Ctrl-C
//! mpdynamic run
//!
//! # See what would be queued right now
//! mpdynamic suggest
//!
//! # Where are we?
//! mpdynamic status
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info};

use mpdynamic::cli;
use mpdynamic::completion;
use mpdynamic::config::Config;
use mpdynamic::connection::{ConnectionGuard, RetryPolicy};
use mpdynamic::daemon;
use mpdynamic::mpd_client::MpdConnector;
use mpdynamic::pipeline::Pipeline;
use mpdynamic::signal::{self, Shutdown};
use mpdynamic::spotify::SpotifyClient;

/// Open a guard for a one-shot command: no waiting between reconnects.
fn connect_once(config: &Config) -> Result<ConnectionGuard> {
    let connector = MpdConnector::new(config.mpd.clone());
    ConnectionGuard::connect(Box::new(connector), RetryPolicy::immediate(1, 1))
        .with_context(|| format!("Failed to connect to MPD at {}", config.mpd.address()))
}

fn show_status(config: &Config) -> Result<()> {
    let guard = connect_once(config)?;
    let status = guard.run("status", |engine| engine.status())?;
    let current = guard.run("currentsong", |engine| engine.current_song())?;
    guard.shutdown();

    println!("MPD:        {}", config.mpd.address());
    println!("State:      {:?}", status.state);
    match current {
        Some(item) => println!("Playing:    {item}"),
        None => println!("Playing:    -"),
    }
    println!("Remaining:  {}", status.remaining());
    println!("Threshold:  {}", config.queue.threshold);
    if status.remaining() < config.queue.threshold {
        println!("`mpdynamic run` would fetch recommendations now");
    }
    Ok(())
}

fn suggest(config: &Config) -> Result<()> {
    config.validate_credentials()?;
    let guard = connect_once(config)?;
    let service = SpotifyClient::new(config.spotify.clone());
    let mut pipeline = Pipeline::new(Box::new(service), config.queue.seed_tracks);

    let result = pipeline.resolve(&guard);
    guard.shutdown();
    let (report, candidates) = result?;

    println!(
        "{} seed(s), {} recommended, {} in your library",
        report.seeds,
        report.recommended,
        candidates.len()
    );
    for item in candidates {
        println!("  {item}");
    }
    Ok(())
}

/// Initializes logging, parses arguments, loads the configuration and routes
/// the command. `RUST_LOG` controls verbosity (default `info`):
/// - `RUST_LOG=debug mpdynamic run` - every decision the pipeline makes
/// - `RUST_LOG=mpdynamic::mpd_client=trace mpdynamic run` - raw protocol lines
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::Args::parse();

    let mut config = Config::load(args.overrides.config.as_deref())?;
    args.overrides.apply(&mut config);
    config.normalize();
    debug!(
        "MPD at {}, threshold {}, {} seed track(s)",
        config.mpd.address(),
        config.queue.threshold,
        config.queue.seed_tracks
    );

    match args.command {
        cli::Command::Run => {
            config.validate()?;
            signal::install_handlers()?;
            info!("Starting mpdynamic against MPD at {}", config.mpd.address());
            daemon::start(&config, Shutdown::from_signals())?;
        }
        cli::Command::Suggest => {
            config.validate()?;
            suggest(&config)?;
        }
        cli::Command::Status => {
            config.validate()?;
            show_status(&config)?;
        }
        cli::Command::Config => {
            print!("{}", config.to_masked_toml()?);
        }
        cli::Command::Completion { shell } => {
            let mut cmd = cli::Args::command();
            completion::generate_completions(completion::shell_to_completion_shell(&shell), &mut cmd);
        }
    }

    Ok(())
}
