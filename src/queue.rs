//! # Candidate Queue
//!
//! The hand-off between the recommendation pipeline (sole producer) and the
//! drainer (sole consumer). Only library-resolved items ever enter it, and they
//! leave in insertion order.
//!
//! The queue is an unbounded `crossbeam-channel`: a push wakes a consumer
//! blocked in [`CandidateReceiver::next`], and the length is readable from the
//! producer side so the scheduler can add it to the playlist's remaining count.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::debug;

use crate::playback::LibraryItem;

/// Create a connected producer/consumer pair.
pub fn candidate_queue() -> (CandidateSender, CandidateReceiver) {
    let (tx, rx) = unbounded();
    (CandidateSender { tx }, CandidateReceiver { rx })
}

/// Producer half, owned by the pipeline. Also used by the scheduler to read
/// the current length.
#[derive(Debug, Clone)]
pub struct CandidateSender {
    tx: Sender<LibraryItem>,
}

impl CandidateSender {
    /// Enqueue a resolved item and wake the consumer.
    ///
    /// Returns `false` if the consumer is gone (the item is dropped).
    pub fn push(&self, item: LibraryItem) -> bool {
        debug!("Queueing {item}");
        self.tx.send(item).is_ok()
    }

    /// Items queued but not yet taken by the consumer.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer half, owned by the drainer.
#[derive(Debug)]
pub struct CandidateReceiver {
    rx: Receiver<LibraryItem>,
}

impl CandidateReceiver {
    /// Block until an item is available. `None` once every producer is gone
    /// and the queue is drained.
    pub fn next(&self) -> Option<LibraryItem> {
        self.rx.recv().ok()
    }

    /// Non-blocking variant of [`Self::next`].
    pub fn try_next(&self) -> Option<LibraryItem> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
