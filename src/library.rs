//! Local library matching.
//!
//! Both lookups run through the [`ConnectionGuard`], which also owns retrying;
//! nothing here retries on its own.

use log::{debug, warn};

use crate::connection::ConnectionGuard;
use crate::playback::{EngineError, LibraryItem, Tag};
use crate::track::Track;

/// First library entry with exactly this title that credits exactly this
/// artist. `Ok(None)` is a plain miss, not an error.
///
/// The engine matches both tags, so songs crediting several artists are
/// found by any of them.
pub fn find_local_track(guard: &ConnectionGuard, track: &Track) -> Result<Option<LibraryItem>, EngineError> {
    let operation = format!("find title \"{}\" artist \"{}\"", track.title(), track.artist());
    let matches = guard.run(&operation, |engine| {
        engine.find(&[(Tag::Title, track.title()), (Tag::Artist, track.artist())])
    })?;
    let found = matches.into_iter().next();
    match &found {
        Some(item) => debug!("Matched {track} to {}", item.file),
        None => debug!("No local copy of {track}"),
    }
    Ok(found)
}

/// Whether the library holds at least one song by `artist`.
///
/// Any failure, including a malformed count reply, counts as "not present".
pub fn have_artist(guard: &ConnectionGuard, artist: &str) -> bool {
    let result = guard.run(&format!("count artist \"{artist}\""), |engine| {
        engine.count(Tag::Artist, artist)
    });
    match result {
        Ok(songs) => songs > 0,
        Err(EngineError::Malformed { detail, .. }) => {
            warn!("Unusable count reply for artist '{artist}' ({detail}); treating as absent");
            false
        }
        Err(err) => {
            debug!("Artist lookup for '{artist}' abandoned: {err}");
            false
        }
    }
}
