//! # Track Adapter
//!
//! The recommendation service and the playback engine each describe a song in
//! their own shape. [`Track`] is the universal form: it keeps only what is
//! needed to move a song from one side to the other (title, artist, album).
//!
//! Conversion is pure and never defaults a missing field; a record without a
//! title, artist or album is reported as a [`TrackConversionError`].

use std::fmt;

use thiserror::Error;

use crate::playback::LibraryItem;
use crate::recommender::RemoteTrack;

/// Where a record came from, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    RecommendationService,
    PlaybackEngine,
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackSource::RecommendationService => f.write_str("recommendation service"),
            TrackSource::PlaybackEngine => f.write_str("playback engine"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{origin} track is missing its {field}")]
pub struct TrackConversionError {
    pub origin: TrackSource,
    pub field: &'static str,
}

/// Internal, normalized song.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Track {
    title: String,
    artist: String,
    album: String,
}

impl Track {
    pub fn new(title: impl Into<String>, artist: impl Into<String>, album: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: album.into(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    pub fn album(&self) -> &str {
        &self.album
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} [{}]", self.artist, self.title, self.album)
    }
}

fn required<'a>(
    value: Option<&'a str>,
    origin: TrackSource,
    field: &'static str,
) -> Result<&'a str, TrackConversionError> {
    value.ok_or(TrackConversionError { origin, field })
}

impl TryFrom<&RemoteTrack> for Track {
    type Error = TrackConversionError;

    /// Only the first credited artist is kept.
    fn try_from(remote: &RemoteTrack) -> Result<Self, Self::Error> {
        let origin = TrackSource::RecommendationService;
        let title = required(remote.name.as_deref(), origin, "title")?;
        let artist = required(
            remote.artists.first().and_then(|a| a.name.as_deref()),
            origin,
            "artist",
        )?;
        let album = required(
            remote.album.as_ref().and_then(|a| a.name.as_deref()),
            origin,
            "album",
        )?;
        Ok(Track::new(title, artist, album))
    }
}

impl TryFrom<&LibraryItem> for Track {
    type Error = TrackConversionError;

    fn try_from(item: &LibraryItem) -> Result<Self, Self::Error> {
        let origin = TrackSource::PlaybackEngine;
        let title = required(item.title.as_deref(), origin, "title")?;
        let artist = required(item.artist.as_deref(), origin, "artist")?;
        let album = required(item.album.as_deref(), origin, "album")?;
        Ok(Track::new(title, artist, album))
    }
}
