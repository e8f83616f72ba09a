//! # Recommendation Pipeline
//!
//! One cycle turns "what is playing now" into zero or more library items on
//! the candidate queue:
//!
//! ```text
//! now playing → seed ids → recommend → Track → artist in library? → find → queue
//! ```
//!
//! Every step can come up empty (no seed, no recommendations, nothing in the
//! library), which simply means fewer candidates. Only items that were both
//! recommended and found in the local library are ever queued, and each file
//! is queued at most once per process.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};

use crate::connection::ConnectionGuard;
use crate::library::{find_local_track, have_artist};
use crate::playback::LibraryItem;
use crate::queue::CandidateSender;
use crate::recommender::{first_artist_match, RecommendationService, MAX_SEEDS};
use crate::track::Track;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub seeds: usize,
    pub recommended: usize,
    pub enqueued: usize,
}

pub struct Pipeline {
    service: Box<dyn RecommendationService>,
    seed_tracks: usize,
    /// Files queued during this session.
    seen: HashSet<String>,
}

impl Pipeline {
    pub fn new(service: Box<dyn RecommendationService>, seed_tracks: usize) -> Self {
        Self {
            service,
            seed_tracks: seed_tracks.clamp(1, MAX_SEEDS),
            seen: HashSet::new(),
        }
    }

    /// Run one cycle and push the survivors onto `queue` in service order.
    pub fn run_cycle(&mut self, guard: &ConnectionGuard, queue: &CandidateSender) -> Result<CycleReport> {
        let (mut report, candidates) = self.resolve(guard)?;
        for item in candidates {
            let file = item.file.clone();
            if !queue.push(item) {
                warn!("Candidate queue has no consumer; stopping this cycle");
                break;
            }
            self.seen.insert(file);
            report.enqueued += 1;
        }
        info!(
            "Cycle: {} seed(s), {} recommended, {} queued",
            report.seeds, report.recommended, report.enqueued
        );
        Ok(report)
    }

    /// Everything a cycle would enqueue, without enqueuing it.
    pub fn resolve(&mut self, guard: &ConnectionGuard) -> Result<(CycleReport, Vec<LibraryItem>)> {
        let mut report = CycleReport::default();

        let seeds = self.seed_ids(guard)?;
        report.seeds = seeds.len();
        if seeds.is_empty() {
            debug!("No seed available; nothing to recommend");
            return Ok((report, Vec::new()));
        }

        let recommended = self
            .service
            .recommend(&seeds)
            .context("Recommendation request failed")?;
        report.recommended = recommended.len();

        let mut artist_present: HashMap<String, bool> = HashMap::new();
        let mut candidates: Vec<LibraryItem> = Vec::new();
        for remote in &recommended {
            let track = match Track::try_from(remote) {
                Ok(track) => track,
                Err(err) => {
                    warn!("Dropping recommendation: {err}");
                    continue;
                }
            };

            let present = *artist_present
                .entry(track.artist().to_string())
                .or_insert_with(|| have_artist(guard, track.artist()));
            if !present {
                debug!("Skipping {track}: artist not in library");
                continue;
            }

            match find_local_track(guard, &track) {
                Ok(Some(item)) => {
                    if self.seen.contains(&item.file) || candidates.iter().any(|c| c.file == item.file) {
                        debug!("Already queued {}", item.file);
                        continue;
                    }
                    candidates.push(item);
                }
                Ok(None) => {}
                Err(err) => warn!("Could not look up {track} in the library: {err}"),
            }
        }
        Ok((report, candidates))
    }

    /// Service ids for the now-playing track and, if configured, the tracks
    /// played before it. The now-playing seed comes first.
    fn seed_ids(&mut self, guard: &ConnectionGuard) -> Result<Vec<String>> {
        let Some(current) = guard.run("currentsong", |engine| engine.current_song())? else {
            debug!("Nothing is playing");
            return Ok(Vec::new());
        };
        let track = match Track::try_from(&current) {
            Ok(track) => track,
            Err(err) => {
                warn!("Cannot seed from {current}: {err}");
                return Ok(Vec::new());
            }
        };
        let Some(seed) = self.locate(&track)? else {
            info!("{track} not found on the recommendation service");
            return Ok(Vec::new());
        };

        let mut seeds = vec![seed];
        if self.seed_tracks > 1 {
            for item in self.history(guard)? {
                if seeds.len() >= self.seed_tracks {
                    break;
                }
                let Ok(track) = Track::try_from(&item) else {
                    debug!("History entry {item} lacks tags; not a seed");
                    continue;
                };
                match self.locate(&track) {
                    Ok(Some(id)) if !seeds.contains(&id) => seeds.push(id),
                    Ok(_) => {}
                    Err(err) => warn!("Skipping history seed {track}: {err:#}"),
                }
            }
        }
        Ok(seeds)
    }

    /// Playlist entries before the current one, most recent first.
    fn history(&self, guard: &ConnectionGuard) -> Result<Vec<LibraryItem>> {
        let status = guard.run("status", |engine| engine.status())?;
        let Some(position) = status.song else {
            return Ok(Vec::new());
        };
        let mut items = guard.run("playlistinfo", |engine| engine.playlist_items())?;
        items.truncate(position as usize);
        items.reverse();
        Ok(items)
    }

    /// Service id of the first title hit whose primary artist matches.
    fn locate(&mut self, track: &Track) -> Result<Option<String>> {
        let hits = self
            .service
            .search_tracks(track.title())
            .with_context(|| format!("Search for '{}' failed", track.title()))?;
        Ok(first_artist_match(&hits, track.artist()).and_then(|hit| hit.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RetryPolicy;
    use crate::queue::candidate_queue;
    use crate::recommender::RemoteTrack;
    use crate::test_utils::{library_item, remote_track, FakeConnector, FakeLibrary, FakeRecommender};

    struct Harness {
        library: FakeLibrary,
        service: FakeRecommender,
        guard: ConnectionGuard,
    }

    /// Now playing: Song A by Artist X. The library holds Artist X only.
    fn harness() -> Harness {
        let library = FakeLibrary::new();
        let song_a = library_item("x/a.flac", "Song A", "Artist X", "Album 1");
        library.add_to_library(vec![
            song_a.clone(),
            library_item("x/b.flac", "Song B", "Artist X", "Album 2"),
            library_item("x/d.flac", "Song D", "Artist X", "Album 2"),
        ]);
        library.set_playlist(vec![song_a], Some(0));

        let service = FakeRecommender::new();
        service.set_search_results(
            "Song A",
            vec![
                remote_track("cover-a", "Song A", "Cover Band", "Covers"),
                remote_track("id-a", "Song A", "Artist X", "Album 1"),
            ],
        );

        let guard = ConnectionGuard::connect(
            Box::new(FakeConnector::new(library.clone())),
            RetryPolicy::immediate(1, 1),
        )
        .unwrap();
        Harness {
            library,
            service,
            guard,
        }
    }

    fn files(items: &[LibraryItem]) -> Vec<&str> {
        items.iter().map(|item| item.file.as_str()).collect()
    }

    #[test]
    fn test_only_recommended_tracks_in_library_are_queued() {
        let h = harness();
        h.service.set_recommendations(vec![
            remote_track("id-b", "Song B", "Artist X", "Album 2"),
            remote_track("id-c", "Song C", "Artist Y", "Album 3"),
        ]);
        let (tx, rx) = candidate_queue();
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        let report = pipeline.run_cycle(&h.guard, &tx).unwrap();
        assert_eq!(
            report,
            CycleReport {
                seeds: 1,
                recommended: 2,
                enqueued: 1
            }
        );
        assert_eq!(rx.try_next().unwrap().file, "x/b.flac");
        assert!(rx.try_next().is_none());
        assert_eq!(h.service.recommend_calls(), vec![vec!["id-a".to_string()]]);
        // Artist Y is absent, so it is never searched by title.
        assert_eq!(h.library.calls_named("find"), 1);
    }

    #[test]
    fn test_no_seed_without_exact_artist_hit() {
        let h = harness();
        h.service
            .set_search_results("Song A", vec![remote_track("cover-a", "Song A", "Cover Band", "Covers")]);
        let (tx, rx) = candidate_queue();
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        let report = pipeline.run_cycle(&h.guard, &tx).unwrap();
        assert_eq!(report, CycleReport::default());
        assert!(rx.is_empty());
        assert!(h.service.recommend_calls().is_empty());
    }

    #[test]
    fn test_nothing_playing_means_no_service_calls() {
        let h = harness();
        h.library.set_playlist(Vec::new(), None);
        let (tx, _rx) = candidate_queue();
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        assert_eq!(pipeline.run_cycle(&h.guard, &tx).unwrap().enqueued, 0);
        assert!(h.service.searches().is_empty());
    }

    #[test]
    fn test_incomplete_recommendations_are_dropped() {
        let h = harness();
        let mut no_album = remote_track("id-b", "Song B", "Artist X", "Album 2");
        no_album.album = None;
        h.service.set_recommendations(vec![
            no_album,
            RemoteTrack::default(),
            remote_track("id-d", "Song D", "Artist X", "Album 2"),
        ]);
        let (tx, rx) = candidate_queue();
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        let report = pipeline.run_cycle(&h.guard, &tx).unwrap();
        assert_eq!(report.recommended, 3);
        assert_eq!(report.enqueued, 1);
        assert_eq!(rx.try_next().unwrap().file, "x/d.flac");
    }

    #[test]
    fn test_service_failure_is_an_error_not_a_panic() {
        let h = harness();
        h.service.fail_recommendations(true);
        let (tx, rx) = candidate_queue();
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        assert!(pipeline.run_cycle(&h.guard, &tx).is_err());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_files_are_queued_once_per_session() {
        let h = harness();
        h.service.set_recommendations(vec![
            remote_track("id-b", "Song B", "Artist X", "Album 2"),
            remote_track("id-b2", "Song B", "Artist X", "Album 2 (Remaster)"),
        ]);
        let (tx, rx) = candidate_queue();
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        assert_eq!(pipeline.run_cycle(&h.guard, &tx).unwrap().enqueued, 1);
        assert_eq!(pipeline.run_cycle(&h.guard, &tx).unwrap().enqueued, 0);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_artist_presence_is_checked_once_per_cycle() {
        let h = harness();
        h.service.set_recommendations(vec![
            remote_track("id-b", "Song B", "Artist X", "Album 2"),
            remote_track("id-d", "Song D", "Artist X", "Album 2"),
            remote_track("id-e", "Song E", "Artist Y", "Album 3"),
            remote_track("id-f", "Song F", "Artist Y", "Album 3"),
        ]);
        let (tx, _rx) = candidate_queue();
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        assert_eq!(pipeline.run_cycle(&h.guard, &tx).unwrap().enqueued, 2);
        assert_eq!(h.library.calls_named("count"), 2);
    }

    #[test]
    fn test_history_seeds_follow_the_current_track() {
        let h = harness();
        let song_a = library_item("x/a.flac", "Song A", "Artist X", "Album 1");
        let song_b = library_item("x/b.flac", "Song B", "Artist X", "Album 2");
        let song_d = library_item("x/d.flac", "Song D", "Artist X", "Album 2");
        // Playing D; B was played just before, A before that.
        h.library.set_playlist(vec![song_a, song_b, song_d], Some(2));
        h.service
            .set_search_results("Song D", vec![remote_track("id-d", "Song D", "Artist X", "Album 2")]);
        h.service
            .set_search_results("Song B", vec![remote_track("id-b", "Song B", "Artist X", "Album 2")]);
        h.service.set_recommendations(Vec::new());

        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 3);
        let (report, candidates) = pipeline.resolve(&h.guard).unwrap();
        assert_eq!(report.seeds, 3);
        assert!(candidates.is_empty());
        assert_eq!(
            h.service.recommend_calls(),
            vec![vec!["id-d".to_string(), "id-b".to_string(), "id-a".to_string()]]
        );
    }

    #[test]
    fn test_unresolvable_history_seeds_are_skipped() {
        let h = harness();
        let untagged = LibraryItem::new("untagged.mp3");
        let song_a = library_item("x/a.flac", "Song A", "Artist X", "Album 1");
        h.library.set_playlist(vec![untagged, song_a], Some(1));
        h.service.set_recommendations(Vec::new());

        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 5);
        let (report, _) = pipeline.resolve(&h.guard).unwrap();
        assert_eq!(report.seeds, 1);
    }

    #[test]
    fn test_resolve_does_not_enqueue_or_remember() {
        let h = harness();
        h.service
            .set_recommendations(vec![remote_track("id-b", "Song B", "Artist X", "Album 2")]);
        let mut pipeline = Pipeline::new(Box::new(h.service.clone()), 1);

        let (_, first) = pipeline.resolve(&h.guard).unwrap();
        let (_, second) = pipeline.resolve(&h.guard).unwrap();
        assert_eq!(files(&first), vec!["x/b.flac"]);
        assert_eq!(files(&second), vec!["x/b.flac"]);
        assert!(h.library.appended().is_empty());
    }
}
