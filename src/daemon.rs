//! # Replenishment Daemon
//!
//! The producer side of the system. The scheduler runs on the main thread and
//! keeps the live playlist topped up:
//!
//! 1. `remaining = tracks left in the playlist + candidates still queued`
//! 2. below the threshold: run one pipeline cycle; if it queued nothing,
//!    wait for the playlist or player to change before trying again
//! 3. otherwise: wait for a `playlist` / `player` change
//!
//! The change wait holds the playback connection, so it gives it back as soon
//! as the drainer asks for it (or shutdown is requested) and the cycle starts
//! over. The two halves of `remaining` are read under separate locks; a stale
//! answer only means one fetch too many or one fetch late.
//!
//! ## Shutdown
//!
//! SIGINT/SIGTERM are observed at the top of every cycle. The scheduler then
//! closes the connection through the guard. The drainer thread is not joined;
//! anything it still tries afterwards fails fast on the closed guard.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::connection::ConnectionGuard;
use crate::drainer::Drainer;
use crate::mpd_client::MpdConnector;
use crate::pipeline::{CycleReport, Pipeline};
use crate::playback::{EngineError, IdleOutcome, Subsystem};
use crate::queue::{candidate_queue, CandidateSender};
use crate::signal::Shutdown;
use crate::spotify::SpotifyClient;

const WATCHED: [Subsystem; 2] = [Subsystem::Playlist, Subsystem::Player];

/// What a single scheduler cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Shutdown was requested; the loop should end.
    Shutdown,
    /// Below threshold: a pipeline cycle ran.
    Replenished(CycleReport),
    /// At or above threshold: waited for a change (`None` if the wait failed).
    Idle(Option<IdleOutcome>),
    /// Status could not be read.
    StatusFailed,
}

pub struct ReplenishDaemon {
    guard: Arc<ConnectionGuard>,
    pipeline: Pipeline,
    queue: CandidateSender,
    threshold: usize,
    shutdown: Shutdown,
}

impl ReplenishDaemon {
    pub fn new(
        guard: Arc<ConnectionGuard>,
        pipeline: Pipeline,
        queue: CandidateSender,
        threshold: usize,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            guard,
            pipeline,
            queue,
            threshold,
            shutdown,
        }
    }

    /// Tracks left to play plus candidates not yet appended.
    pub fn remaining(&self) -> Result<usize, EngineError> {
        let status = self.guard.run("status", |engine| engine.status())?;
        Ok(status.remaining() + self.queue.len())
    }

    /// Run cycles until shutdown, then close the playback connection.
    pub fn run(mut self) {
        info!("Replenishing whenever fewer than {} tracks remain", self.threshold);
        while self.cycle() != CycleOutcome::Shutdown {}
        info!("Shutdown requested; closing playback connection");
        self.guard.shutdown();
    }

    pub fn cycle(&mut self) -> CycleOutcome {
        if self.shutdown.is_triggered() {
            return CycleOutcome::Shutdown;
        }

        let remaining = match self.remaining() {
            Ok(remaining) => remaining,
            Err(err) => {
                let delay = self.guard.policy().backoff_with_jitter(0);
                warn!("Could not read player status: {err}; next attempt in {delay:?}");
                thread::sleep(delay);
                return CycleOutcome::StatusFailed;
            }
        };

        if remaining < self.threshold {
            info!(
                "{remaining} track(s) left, below threshold {}; fetching recommendations",
                self.threshold
            );
            let report = match self.pipeline.run_cycle(&self.guard, &self.queue) {
                Ok(report) => report,
                Err(err) => {
                    warn!("Recommendation cycle failed: {err:#}");
                    CycleReport::default()
                }
            };
            if report.enqueued == 0 {
                debug!("Nothing queued; waiting for a change before retrying");
                self.wait_for_change();
            }
            return CycleOutcome::Replenished(report);
        }

        debug!("{remaining} track(s) left; waiting for a change");
        CycleOutcome::Idle(self.wait_for_change())
    }

    fn wait_for_change(&self) -> Option<IdleOutcome> {
        match self.guard.wait_for_change(&WATCHED, &self.shutdown) {
            Ok(IdleOutcome::Interrupted) => {
                // Let whoever interrupted the wait take the connection before
                // the next cycle locks it again.
                while self.guard.has_waiters() && !self.shutdown.is_triggered() {
                    thread::yield_now();
                }
                Some(IdleOutcome::Interrupted)
            }
            Ok(changed) => {
                debug!("Engine reported {changed:?}");
                Some(changed)
            }
            Err(err) => {
                let delay = self.guard.policy().backoff_with_jitter(0);
                warn!("Waiting for changes failed: {err}; next attempt in {delay:?}");
                thread::sleep(delay);
                None
            }
        }
    }
}

/// Wire up the real collaborators and run until interrupted.
///
/// Failing to reach MPD at startup is fatal; everything after that is
/// retried or logged.
pub fn start(config: &Config, shutdown: Shutdown) -> Result<()> {
    config.validate()?;
    config.validate_credentials()?;

    let connector = MpdConnector::new(config.mpd.clone());
    let guard = ConnectionGuard::connect(Box::new(connector), config.retry.clone())
        .with_context(|| format!("Failed to connect to MPD at {}", config.mpd.address()))?;
    let guard = Arc::new(guard);

    let (queue, candidates) = candidate_queue();
    // Detached: abandoned at exit.
    Drainer::new(Arc::clone(&guard), candidates)
        .spawn()
        .context("Failed to start drainer thread")?;

    let service = SpotifyClient::new(config.spotify.clone());
    let pipeline = Pipeline::new(Box::new(service), config.queue.seed_tracks);

    ReplenishDaemon::new(guard, pipeline, queue, config.queue.threshold, shutdown).run();
    info!("mpdynamic stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{LinkState, RetryPolicy};
    use crate::playback::LibraryItem;
    use crate::queue::CandidateReceiver;
    use crate::test_utils::{library_item, remote_track, FakeConnector, FakeLibrary, FakeRecommender, Fault};

    struct Harness {
        library: FakeLibrary,
        service: FakeRecommender,
        guard: Arc<ConnectionGuard>,
        shutdown: Shutdown,
        daemon: ReplenishDaemon,
        candidates: CandidateReceiver,
    }

    /// Song A by Artist X playing; the service recommends Song B (in the
    /// library) and Song C (not).
    fn harness(playlist_len: usize, current: u32, threshold: usize) -> Harness {
        let library = FakeLibrary::new();
        let song_a = library_item("x/a.flac", "Song A", "Artist X", "Album 1");
        library.add_to_library(vec![
            song_a.clone(),
            library_item("x/b.flac", "Song B", "Artist X", "Album 2"),
        ]);
        let mut playlist: Vec<LibraryItem> = (0..playlist_len)
            .map(|n| LibraryItem::new(format!("filler/{n:03}.flac")))
            .collect();
        if let Some(slot) = playlist.get_mut(current as usize) {
            *slot = song_a;
        }
        library.set_playlist(playlist, Some(current));

        let service = FakeRecommender::new();
        service.set_search_results("Song A", vec![remote_track("id-a", "Song A", "Artist X", "Album 1")]);
        service.set_recommendations(vec![
            remote_track("id-b", "Song B", "Artist X", "Album 2"),
            remote_track("id-c", "Song C", "Artist Y", "Album 3"),
        ]);

        let guard = Arc::new(
            ConnectionGuard::connect(
                Box::new(FakeConnector::new(library.clone())),
                RetryPolicy::immediate(1, 1),
            )
            .unwrap(),
        );
        let (queue, candidates) = candidate_queue();
        let shutdown = Shutdown::new();
        let pipeline = Pipeline::new(Box::new(service.clone()), 1);
        let daemon = ReplenishDaemon::new(Arc::clone(&guard), pipeline, queue, threshold, shutdown.clone());
        Harness {
            library,
            service,
            guard,
            shutdown,
            daemon,
            candidates,
        }
    }

    #[test]
    fn test_idles_when_enough_tracks_remain() {
        // 15 entries, playing index 3: 12 left against a threshold of 10.
        let mut h = harness(15, 3, 10);
        h.library.push_idle_event(Subsystem::Player);

        let outcome = h.daemon.cycle();
        assert_eq!(
            outcome,
            CycleOutcome::Idle(Some(IdleOutcome::Changed(vec![Subsystem::Player])))
        );
        assert!(h.service.searches().is_empty());
        assert!(h.service.recommend_calls().is_empty());
        assert_eq!(h.library.calls_named("idle"), 1);
    }

    #[test]
    fn test_queued_candidates_count_towards_remaining() {
        // 8 left in the playlist plus 2 queued reaches the threshold.
        let mut h = harness(10, 2, 10);
        h.daemon.queue.push(LibraryItem::new("q/1.flac"));
        h.daemon.queue.push(LibraryItem::new("q/2.flac"));
        assert_eq!(h.daemon.remaining().unwrap(), 10);

        h.library.push_idle_event(Subsystem::Playlist);
        assert!(matches!(h.daemon.cycle(), CycleOutcome::Idle(_)));
        assert!(h.service.recommend_calls().is_empty());
    }

    #[test]
    fn test_replenishes_below_threshold() {
        let mut h = harness(3, 0, 10);

        match h.daemon.cycle() {
            CycleOutcome::Replenished(report) => assert_eq!(report.enqueued, 1),
            other => panic!("expected a pipeline cycle, got {other:?}"),
        }
        assert_eq!(h.candidates.try_next().unwrap().file, "x/b.flac");
        assert!(h.candidates.try_next().is_none());
        // Something was queued, so no wait happened.
        assert_eq!(h.library.calls_named("idle"), 0);
    }

    #[test]
    fn test_empty_cycle_waits_for_a_change() {
        let mut h = harness(3, 0, 10);
        h.service.set_recommendations(Vec::new());
        h.library.push_idle_event(Subsystem::Player);

        assert_eq!(h.daemon.cycle(), CycleOutcome::Replenished(CycleReport {
            seeds: 1,
            recommended: 0,
            enqueued: 0,
        }));
        assert_eq!(h.library.calls_named("idle"), 1);
    }

    #[test]
    fn test_service_failure_does_not_stop_the_scheduler() {
        let mut h = harness(3, 0, 10);
        h.service.fail_recommendations(true);
        h.library.push_idle_event(Subsystem::Player);

        assert_eq!(h.daemon.cycle(), CycleOutcome::Replenished(CycleReport::default()));
        assert_eq!(h.library.calls_named("idle"), 1);
    }

    #[test]
    fn test_status_failure_is_reported_and_survived() {
        let mut h = harness(15, 3, 10);
        h.library.inject("status", Fault::Rejected);
        assert_eq!(h.daemon.cycle(), CycleOutcome::StatusFailed);

        h.library.push_idle_event(Subsystem::Player);
        assert!(matches!(h.daemon.cycle(), CycleOutcome::Idle(_)));
    }

    #[test]
    fn test_shutdown_stops_run_and_closes_connection() {
        let h = harness(15, 3, 10);
        h.shutdown.trigger();
        h.daemon.run();

        assert_eq!(h.guard.link_state(), LinkState::Closed);
        assert_eq!(h.library.calls_named("close"), 1);
        assert_eq!(h.library.calls_named("disconnect"), 1);
        assert_eq!(h.library.calls_named("status"), 0);
    }

    #[test]
    fn test_shutdown_interrupts_a_waiting_cycle() {
        let mut h = harness(15, 3, 10);
        let trigger = h.shutdown.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(30));
            trigger.trigger();
        });

        assert_eq!(h.daemon.cycle(), CycleOutcome::Idle(Some(IdleOutcome::Interrupted)));
        assert_eq!(h.daemon.cycle(), CycleOutcome::Shutdown);
        stopper.join().unwrap();
    }
}
