//! # Playback Engine Interface
//!
//! Everything the replenisher needs from the playback engine, expressed as the
//! [`PlaybackEngine`] trait plus the value types that cross it. The concrete
//! MPD implementation lives in [`crate::mpd_client`]; tests use the scripted
//! engine in [`crate::test_utils`].
//!
//! ## Failure classes
//!
//! Every call returns [`EngineError`]. Only two variants are *transient*
//! ([`EngineError::is_transient`]): a socket timeout and a dropped connection.
//! Those are recovered by [`crate::connection::ConnectionGuard`] through
//! reconnect-and-retry. Everything else is fatal for the single operation
//! that raised it.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors raised by a playback engine call.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine did not answer within the socket timeout.
    #[error("playback engine timed out")]
    Timeout,

    /// The connection went away underneath us (EOF, reset, broken pipe).
    #[error("connection to playback engine lost: {0}")]
    Disconnected(String),

    /// The engine rejected the command (MPD `ACK`).
    #[error("playback engine rejected `{command}`: {message}")]
    Rejected { command: String, message: String },

    /// A response was missing a field we rely on, or it did not parse.
    #[error("malformed response to `{command}`: {detail}")]
    Malformed { command: String, detail: String },

    /// The guard has been shut down; no further calls are possible.
    #[error("playback connection is closed")]
    Closed,

    /// Any other I/O failure (refused connection, unresolvable host, ...).
    #[error("playback engine I/O error: {0}")]
    Io(io::Error),
}

impl EngineError {
    /// Timeout-class failures that a fresh connection can cure.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Timeout | EngineError::Disconnected(_))
    }

    pub fn malformed(command: &str, detail: impl Into<String>) -> Self {
        EngineError::Malformed {
            command: command.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => EngineError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => EngineError::Disconnected(err.to_string()),
            _ => EngineError::Io(err),
        }
    }
}

/// A concrete track handle inside the playback engine's library.
///
/// `file` is what the engine wants back when the track is appended; the tags
/// are optional because the engine only reports the ones the file carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryItem {
    pub file: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl LibraryItem {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Self::default()
        }
    }

    pub fn with_tags(mut self, title: &str, artist: &str, album: &str) -> Self {
        self.title = Some(title.to_string());
        self.artist = Some(artist.to_string());
        self.album = Some(album.to_string());
        self
    }
}

impl fmt::Display for LibraryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.artist, &self.title) {
            (Some(artist), Some(title)) => write!(f, "{artist} - {title} ({})", self.file),
            _ => f.write_str(&self.file),
        }
    }
}

/// Library tags the engine can be searched by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Title,
    Artist,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Title => "title",
            Tag::Artist => "artist",
        }
    }
}

/// Playback state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    Play,
    Pause,
    #[default]
    Stop,
}

/// Snapshot of the engine's player and playlist position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: PlayState,
    /// Playlist position of the current song, if any.
    pub song: Option<u32>,
    /// Playlist position of the song that plays next, if any.
    pub next_song: Option<u32>,
    pub playlist_length: u32,
}

impl PlayerStatus {
    /// Tracks left in the playlist, counting the one currently playing.
    pub fn remaining(&self) -> usize {
        self.playlist_length.saturating_sub(self.song.unwrap_or(0)) as usize
    }
}

/// Engine subsystems the scheduler can wait on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subsystem {
    Playlist,
    Player,
    Other(String),
}

impl Subsystem {
    pub fn as_str(&self) -> &str {
        match self {
            Subsystem::Playlist => "playlist",
            Subsystem::Player => "player",
            Subsystem::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "playlist" => Subsystem::Playlist,
            "player" => Subsystem::Player,
            other => Subsystem::Other(other.to_string()),
        }
    }
}

/// How a change-notification wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleOutcome {
    /// One or more subsystems changed.
    Changed(Vec<Subsystem>),
    /// The wait was cancelled because someone else needs the connection or
    /// shutdown was requested.
    Interrupted,
}

/// The calls the replenisher makes against the playback engine.
///
/// Implementations are not required to be thread-safe beyond `Send`; all
/// access is serialized by [`crate::connection::ConnectionGuard`].
pub trait PlaybackEngine: Send {
    /// The track currently loaded in the player, if any.
    fn current_song(&mut self) -> Result<Option<LibraryItem>, EngineError>;

    fn status(&mut self) -> Result<PlayerStatus, EngineError>;

    /// Every entry of the live playlist, in playlist order.
    fn playlist_items(&mut self) -> Result<Vec<LibraryItem>, EngineError>;

    /// Exact-match library search; every filter must hold. A multi-valued
    /// tag matches when any of its values does.
    fn find(&mut self, filters: &[(Tag, &str)]) -> Result<Vec<LibraryItem>, EngineError>;

    /// Number of library songs whose `tag` equals `value`.
    fn count(&mut self, tag: Tag, value: &str) -> Result<u64, EngineError>;

    /// Append a library file to the end of the live playlist.
    fn append(&mut self, file: &str) -> Result<(), EngineError>;

    /// Block until one of `subsystems` changes.
    ///
    /// `interrupt` is polled while waiting, possibly from another thread; once
    /// it returns `true` the wait is cancelled and [`IdleOutcome::Interrupted`]
    /// is returned (unless a change raced the cancellation).
    fn wait_for_change(
        &mut self,
        subsystems: &[Subsystem],
        interrupt: &(dyn Fn() -> bool + Sync),
    ) -> Result<IdleOutcome, EngineError>;

    /// Politely end the session.
    fn close(&mut self) -> Result<(), EngineError>;

    /// Tear down the transport.
    fn disconnect(&mut self) -> Result<(), EngineError>;
}

/// Opens fresh engine connections, both at startup and after a transient
/// failure.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn PlaybackEngine>, EngineError>;

    /// Human-readable target, used in log lines.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Timeout.is_transient());
        assert!(EngineError::Disconnected("eof".into()).is_transient());
        assert!(!EngineError::Closed.is_transient());
        assert!(!EngineError::malformed("count", "no songs field").is_transient());
        assert!(!EngineError::Rejected {
            command: "add".into(),
            message: "No such song".into()
        }
        .is_transient());
    }

    #[test]
    fn test_io_error_mapping() {
        let timeout: EngineError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(timeout, EngineError::Timeout));

        let reset: EngineError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(reset, EngineError::Disconnected(_)));

        let refused: EngineError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(matches!(refused, EngineError::Io(_)));
        assert!(!refused.is_transient());
    }

    #[test]
    fn test_remaining_counts_current_song() {
        let status = PlayerStatus {
            state: PlayState::Play,
            song: Some(3),
            next_song: Some(4),
            playlist_length: 15,
        };
        assert_eq!(status.remaining(), 12);
    }

    #[test]
    fn test_remaining_without_current_song() {
        let status = PlayerStatus {
            playlist_length: 7,
            ..PlayerStatus::default()
        };
        assert_eq!(status.remaining(), 7);
    }

    #[test]
    fn test_remaining_never_underflows() {
        let status = PlayerStatus {
            song: Some(9),
            playlist_length: 2,
            ..PlayerStatus::default()
        };
        assert_eq!(status.remaining(), 0);
    }

    #[test]
    fn test_subsystem_names_round_trip() {
        assert_eq!(Subsystem::from_name("playlist"), Subsystem::Playlist);
        assert_eq!(Subsystem::from_name("player"), Subsystem::Player);
        assert_eq!(
            Subsystem::from_name("mixer"),
            Subsystem::Other("mixer".to_string())
        );
        assert_eq!(Subsystem::Other("mixer".into()).as_str(), "mixer");
    }

    #[test]
    fn test_library_item_display() {
        let item = LibraryItem::new("x/song.flac").with_tags("Song", "Artist", "Album");
        assert_eq!(item.to_string(), "Artist - Song (x/song.flac)");
        assert_eq!(LibraryItem::new("bare.mp3").to_string(), "bare.mp3");
    }
}
