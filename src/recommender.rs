//! Recommendation service interface.
//!
//! The pipeline only needs two calls from the service: a track search to turn
//! the now-playing song into a service identifier, and a recommendation call
//! seeded with up to [`MAX_SEEDS`] of those identifiers. [`crate::spotify`]
//! provides the real client.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// The service accepts at most five seed tracks per request.
pub const MAX_SEEDS: usize = 5;

/// A track as the recommendation service describes it.
///
/// All fields are optional on the wire; [`crate::track::Track`]'s conversion
/// decides what is actually required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub artists: Vec<RemoteArtist>,
    #[serde(default)]
    pub album: Option<RemoteAlbum>,
}

impl RemoteTrack {
    /// Name of the first credited artist.
    pub fn primary_artist(&self) -> Option<&str> {
        self.artists.first().and_then(|a| a.name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArtist {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAlbum {
    #[serde(default)]
    pub name: Option<String>,
}

pub trait RecommendationService: Send {
    /// Ranked track hits for a free-text query.
    fn search_tracks(&mut self, query: &str) -> Result<Vec<RemoteTrack>>;

    /// Suggested tracks for 1..=[`MAX_SEEDS`] seed track identifiers.
    fn recommend(&mut self, seed_ids: &[String]) -> Result<Vec<RemoteTrack>>;
}

/// First hit whose primary artist matches `artist` exactly.
pub fn first_artist_match<'a>(hits: &'a [RemoteTrack], artist: &str) -> Option<&'a RemoteTrack> {
    hits.iter().find(|hit| hit.primary_artist() == Some(artist))
}
