//! # Drainer
//!
//! The consumer side of the candidate queue. It sleeps on the queue, takes the
//! oldest item and appends it to the live playlist through the
//! [`ConnectionGuard`], forever.
//!
//! An append that timed out may still have reached the engine. Each attempt
//! notes the playlist length first. After a transient failure the next attempt
//! counts the earlier one as done only if the playlist grew by exactly one
//! entry and now ends with the file. A matching tail that was already there
//! does not count.
//!
//! In the daemon the drainer thread is detached and abandoned at exit; once
//! the guard is closed every append fails fast with [`EngineError::Closed`].

use log::{debug, error, info, warn};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::connection::ConnectionGuard;
use crate::playback::{EngineError, LibraryItem, PlaybackEngine};
use crate::queue::CandidateReceiver;

/// How a single commit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Appended,
    /// An earlier attempt went through before its reply was lost.
    AlreadyPresent,
    /// Fatal failure; the item is gone.
    Dropped,
}

pub struct Drainer {
    guard: Arc<ConnectionGuard>,
    queue: CandidateReceiver,
}

impl Drainer {
    pub fn new(guard: Arc<ConnectionGuard>, queue: CandidateReceiver) -> Self {
        Self { guard, queue }
    }

    /// Start draining on a named background thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("drainer".to_string())
            .spawn(move || self.run())
    }

    /// Drain until every producer handle is gone.
    pub fn run(self) {
        debug!("Drainer waiting for candidates");
        while let Some(item) = self.queue.next() {
            self.commit(&item);
        }
        debug!("Candidate queue closed; drainer exiting");
    }

    /// Append one item, retrying transient failures until it lands or a
    /// fatal error drops it.
    pub fn commit(&self, item: &LibraryItem) -> CommitOutcome {
        let file = item.file.as_str();
        let operation = format!("add \"{file}\"");
        // Playlist length when an append whose reply we never saw went out.
        let mut unconfirmed: Option<u32> = None;
        let mut rounds = 0u32;

        loop {
            let result = self.guard.run(&operation, |engine| {
                let length = engine.status()?.playlist_length;
                if let Some(before) = unconfirmed {
                    if append_landed(engine, file, before, length)? {
                        return Ok(CommitOutcome::AlreadyPresent);
                    }
                    unconfirmed = None;
                }
                match engine.append(file) {
                    Ok(()) => Ok(CommitOutcome::Appended),
                    Err(err) => {
                        if err.is_transient() {
                            unconfirmed = Some(length);
                        }
                        Err(err)
                    }
                }
            });

            match result {
                Ok(CommitOutcome::AlreadyPresent) => {
                    info!("{item} was already appended before the connection dropped");
                    return CommitOutcome::AlreadyPresent;
                }
                Ok(outcome) => {
                    info!("Appended {item}");
                    return outcome;
                }
                Err(EngineError::Closed) => {
                    debug!("Playback connection closed; dropping {item}");
                    return CommitOutcome::Dropped;
                }
                Err(err) if err.is_transient() => {
                    let delay = self.guard.policy().backoff_with_jitter(rounds);
                    rounds = rounds.saturating_add(1);
                    warn!("Append of {file} still failing ({err}); trying again in {delay:?}");
                    thread::sleep(delay);
                }
                Err(err) => {
                    error!("Dropping {item}: {err}");
                    return CommitOutcome::Dropped;
                }
            }
        }
    }
}

/// Whether an append sent while the playlist held `before` entries went
/// through, given that it now holds `length`.
fn append_landed(
    engine: &mut dyn PlaybackEngine,
    file: &str,
    before: u32,
    length: u32,
) -> Result<bool, EngineError> {
    if length != before.saturating_add(1) {
        return Ok(false);
    }
    let items = engine.playlist_items()?;
    Ok(items.last().is_some_and(|last| last.file == file))
}
