//! Keeps an MPD playlist topped up with Spotify recommendations that exist in
//! the local library.
//!
//! Core modules:
//! - [`daemon`] - Replenishment scheduler (producer driver)
//! - [`pipeline`] - Now playing → recommendations → library items
//! - [`drainer`] - Appends queued candidates to the live playlist
//! - [`queue`] - Candidate queue between the two threads
//! - [`connection`] - Exclusive, self-healing access to the MPD connection
//!
//! ### Supporting Modules
//!
//! - [`playback`] - Playback engine trait and the types crossing it
//! - [`mpd_client`] - MPD protocol client
//! - [`recommender`] / [`spotify`] - Recommendation service trait and client
//! - [`track`] - Conversion of both sides' records into [`track::Track`]
//! - [`library`] - Exact title/artist lookups in the MPD library
//! - [`config`] - TOML configuration
//! - [`signal`] - SIGINT/SIGTERM handling
//! - [`cli`] / [`completion`] - Command-line interface
//! - [`test_utils`] - Scripted fakes for tests and benchmarks
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use mpdynamic::config::Config;
//! use mpdynamic::signal::{self, Shutdown};
//!
//! let mut config = Config::load(None)?;
//! config.spotify.client_id = "...".to_string();
//! config.spotify.client_secret = "...".to_string();
//!
//! signal::install_handlers()?;
//! mpdynamic::daemon::start(&config, Shutdown::from_signals())?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Threads
//!
//! The scheduler and the pipeline share the main thread; the drainer runs on
//! its own. They meet at the candidate queue and at the
//! [`connection::ConnectionGuard`], which lets exactly one MPD command be in
//! flight at a time. The scheduler's change-notification wait hands the
//! connection over as soon as the drainer asks for it.
//!
//! ## Error Handling
//!
//! Playback engine calls return [`playback::EngineError`]; timeouts and
//! dropped connections are retried by the guard, everything else is logged
//! and the affected operation abandoned. Application code uses
//! `anyhow::Result`. After startup, no collaborator error stops the process;
//! only SIGINT/SIGTERM do.

pub mod cli;
pub mod completion;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod drainer;
pub mod library;
pub mod mpd_client;
pub mod pipeline;
pub mod playback;
pub mod queue;
pub mod recommender;
pub mod signal;
pub mod spotify;
pub mod test_utils;
pub mod track;
