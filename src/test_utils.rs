//! Test utilities and fixtures for mpdynamic tests.
//!
//! [`FakeLibrary`] is an in-memory playback engine: a library, a live
//! playlist, a journal of every call, and a per-command queue of injected
//! faults. [`FakeConnector`] hands out engines that all share one
//! `FakeLibrary`, so a test can reconnect and still see the same state.
//! [`FakeRecommender`] does the same for the recommendation service.
//!
//! # Example
//!
//! ```ignore
//! use mpdynamic::test_utils::{FakeConnector, FakeLibrary, Fault};
//!
//! let library = FakeLibrary::new();
//! library.inject("add", Fault::Timeout);
//! let guard = ConnectionGuard::connect(Box::new(FakeConnector::new(library.clone())), policy)?;
//! ```

use anyhow::{bail, Result};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::playback::{
    Connector, EngineError, IdleOutcome, LibraryItem, PlayState, PlaybackEngine, PlayerStatus,
    Subsystem, Tag,
};
use crate::recommender::{RecommendationService, RemoteAlbum, RemoteArtist, RemoteTrack};

/// Failure to raise on the next call of a given command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Socket timeout before the command takes effect.
    Timeout,
    /// The command takes effect, then the reply times out.
    TimeoutAfterApply,
    /// Connection dropped.
    Disconnect,
    /// The engine answers with an error (ACK).
    Rejected,
    /// The reply lacks the fields the caller needs.
    Malformed,
}

#[derive(Default)]
struct LibraryState {
    library: Vec<LibraryItem>,
    /// Every artist a file credits, when it credits more than one.
    credits: HashMap<String, Vec<String>>,
    playlist: Vec<LibraryItem>,
    current: Option<u32>,
    faults: HashMap<String, VecDeque<Fault>>,
    journal: Vec<String>,
    idle_events: VecDeque<Subsystem>,
    connections: usize,
    refuse: usize,
}

/// Shared, inspectable state behind every [`FakeEngine`].
#[derive(Clone, Default)]
pub struct FakeLibrary {
    inner: Arc<Mutex<LibraryState>>,
}

impl FakeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LibraryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_to_library(&self, items: Vec<LibraryItem>) {
        self.state().library.extend(items);
    }

    /// Credit several artists on a library file. Lookups match any of them;
    /// the item itself reports the last one, as MPD's reply parsing does.
    pub fn credit(&self, file: &str, artists: &[&str]) {
        let mut state = self.state();
        let credits: Vec<String> = artists.iter().map(|artist| artist.to_string()).collect();
        if let Some(item) = state.library.iter_mut().find(|item| item.file == file) {
            item.artist = credits.last().cloned();
        }
        state.credits.insert(file.to_string(), credits);
    }

    /// Replace the live playlist; `current` is the playing position.
    pub fn set_playlist(&self, items: Vec<LibraryItem>, current: Option<u32>) {
        let mut state = self.state();
        state.playlist = items;
        state.current = current;
    }

    pub fn inject(&self, command: &str, fault: Fault) {
        self.state()
            .faults
            .entry(command.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Make the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.state().refuse = count;
    }

    pub fn push_idle_event(&self, subsystem: Subsystem) {
        self.state().idle_events.push_back(subsystem);
    }

    pub fn connections(&self) -> usize {
        self.state().connections
    }

    pub fn playlist(&self) -> Vec<LibraryItem> {
        self.state().playlist.clone()
    }

    /// Files appended to the playlist, in order.
    pub fn appended(&self) -> Vec<String> {
        self.state()
            .journal
            .iter()
            .filter_map(|entry| entry.strip_prefix("applied add "))
            .map(str::to_string)
            .collect()
    }

    pub fn calls_named(&self, command: &str) -> usize {
        self.state()
            .journal
            .iter()
            .filter(|entry| entry.split(' ').next() == Some(command))
            .count()
    }

    fn connect(&self) -> Result<FakeEngine, EngineError> {
        let mut state = self.state();
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(EngineError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)));
        }
        state.connections += 1;
        Ok(FakeEngine {
            library: self.clone(),
        })
    }

    /// Record the call and pop the next fault for it, if any.
    fn enter(&self, command: &str, args: &str) -> Option<Fault> {
        let mut state = self.state();
        let entry = if args.is_empty() {
            command.to_string()
        } else {
            format!("{command} {args}")
        };
        state.journal.push(entry);
        state.faults.get_mut(command).and_then(VecDeque::pop_front)
    }
}

fn raise(command: &str, fault: Fault) -> EngineError {
    match fault {
        Fault::Timeout | Fault::TimeoutAfterApply => EngineError::Timeout,
        Fault::Disconnect => EngineError::Disconnected("connection reset by fake".to_string()),
        Fault::Rejected => EngineError::Rejected {
            command: command.to_string(),
            message: "rejected by fake".to_string(),
        },
        Fault::Malformed => EngineError::malformed(command, "field missing in fake reply"),
    }
}

fn check(command: &str, fault: Option<Fault>) -> Result<(), EngineError> {
    match fault {
        Some(fault) => Err(raise(command, fault)),
        None => Ok(()),
    }
}

impl LibraryState {
    fn matches(&self, item: &LibraryItem, tag: Tag, value: &str) -> bool {
        match tag {
            Tag::Title => item.title.as_deref() == Some(value),
            Tag::Artist => match self.credits.get(&item.file) {
                Some(credits) => credits.iter().any(|artist| artist == value),
                None => item.artist.as_deref() == Some(value),
            },
        }
    }
}

/// One "connection" to a [`FakeLibrary`].
pub struct FakeEngine {
    library: FakeLibrary,
}

impl PlaybackEngine for FakeEngine {
    fn current_song(&mut self) -> Result<Option<LibraryItem>, EngineError> {
        check("currentsong", self.library.enter("currentsong", ""))?;
        let state = self.library.state();
        Ok(state
            .current
            .and_then(|pos| state.playlist.get(pos as usize))
            .cloned())
    }

    fn status(&mut self) -> Result<PlayerStatus, EngineError> {
        check("status", self.library.enter("status", ""))?;
        let state = self.library.state();
        let playlist_length = state.playlist.len() as u32;
        let next_song = state
            .current
            .map(|pos| pos + 1)
            .filter(|next| *next < playlist_length);
        Ok(PlayerStatus {
            state: if state.current.is_some() {
                PlayState::Play
            } else {
                PlayState::Stop
            },
            song: state.current,
            next_song,
            playlist_length,
        })
    }

    fn playlist_items(&mut self) -> Result<Vec<LibraryItem>, EngineError> {
        check("playlistinfo", self.library.enter("playlistinfo", ""))?;
        Ok(self.library.state().playlist.clone())
    }

    fn find(&mut self, filters: &[(Tag, &str)]) -> Result<Vec<LibraryItem>, EngineError> {
        let args: Vec<String> = filters
            .iter()
            .map(|(tag, value)| format!("{} {value}", tag.as_str()))
            .collect();
        check("find", self.library.enter("find", &args.join(" ")))?;
        let state = self.library.state();
        Ok(state
            .library
            .iter()
            .filter(|item| filters.iter().all(|(tag, value)| state.matches(item, *tag, value)))
            .cloned()
            .collect())
    }

    fn count(&mut self, tag: Tag, value: &str) -> Result<u64, EngineError> {
        check("count", self.library.enter("count", &format!("{} {value}", tag.as_str())))?;
        let state = self.library.state();
        Ok(state
            .library
            .iter()
            .filter(|item| state.matches(item, tag, value))
            .count() as u64)
    }

    fn append(&mut self, file: &str) -> Result<(), EngineError> {
        match self.library.enter("add", file) {
            Some(Fault::TimeoutAfterApply) => {
                self.apply_append(file);
                Err(EngineError::Timeout)
            }
            Some(fault) => Err(raise("add", fault)),
            None => {
                self.apply_append(file);
                Ok(())
            }
        }
    }

    fn wait_for_change(
        &mut self,
        subsystems: &[Subsystem],
        interrupt: &(dyn Fn() -> bool + Sync),
    ) -> Result<IdleOutcome, EngineError> {
        let names: Vec<&str> = subsystems.iter().map(Subsystem::as_str).collect();
        check("idle", self.library.enter("idle", &names.join(" ")))?;
        loop {
            if let Some(event) = self.library.state().idle_events.pop_front() {
                return Ok(IdleOutcome::Changed(vec![event]));
            }
            if interrupt() {
                return Ok(IdleOutcome::Interrupted);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn close(&mut self) -> Result<(), EngineError> {
        check("close", self.library.enter("close", ""))
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        check("disconnect", self.library.enter("disconnect", ""))
    }
}

impl FakeEngine {
    fn apply_append(&self, file: &str) {
        let mut state = self.library.state();
        let item = state
            .library
            .iter()
            .find(|item| item.file == file)
            .cloned()
            .unwrap_or_else(|| LibraryItem::new(file));
        state.playlist.push(item);
        state.journal.push(format!("applied add {file}"));
        state.idle_events.push_back(Subsystem::Playlist);
    }
}

/// Connector handing out [`FakeEngine`]s over one [`FakeLibrary`].
pub struct FakeConnector {
    library: FakeLibrary,
}

impl FakeConnector {
    pub fn new(library: FakeLibrary) -> Self {
        Self { library }
    }
}

impl Connector for FakeConnector {
    fn connect(&self) -> Result<Box<dyn PlaybackEngine>, EngineError> {
        Ok(Box::new(self.library.connect()?))
    }

    fn describe(&self) -> String {
        "fake engine".to_string()
    }
}

#[derive(Default)]
struct RecommenderState {
    search_results: HashMap<String, Vec<RemoteTrack>>,
    recommendations: Vec<RemoteTrack>,
    searches: Vec<String>,
    recommend_calls: Vec<Vec<String>>,
    fail_recommend: bool,
}

/// Scripted recommendation service.
#[derive(Clone, Default)]
pub struct FakeRecommender {
    inner: Arc<Mutex<RecommenderState>>,
}

impl FakeRecommender {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RecommenderState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_search_results(&self, query: &str, hits: Vec<RemoteTrack>) {
        self.state().search_results.insert(query.to_string(), hits);
    }

    pub fn set_recommendations(&self, tracks: Vec<RemoteTrack>) {
        self.state().recommendations = tracks;
    }

    pub fn fail_recommendations(&self, fail: bool) {
        self.state().fail_recommend = fail;
    }

    pub fn searches(&self) -> Vec<String> {
        self.state().searches.clone()
    }

    pub fn recommend_calls(&self) -> Vec<Vec<String>> {
        self.state().recommend_calls.clone()
    }
}

impl RecommendationService for FakeRecommender {
    fn search_tracks(&mut self, query: &str) -> Result<Vec<RemoteTrack>> {
        let mut state = self.state();
        state.searches.push(query.to_string());
        Ok(state.search_results.get(query).cloned().unwrap_or_default())
    }

    fn recommend(&mut self, seed_ids: &[String]) -> Result<Vec<RemoteTrack>> {
        let mut state = self.state();
        state.recommend_calls.push(seed_ids.to_vec());
        if state.fail_recommend {
            bail!("recommendation service unavailable");
        }
        Ok(state.recommendations.clone())
    }
}

/// Build a service-side track record.
pub fn remote_track(id: &str, title: &str, artist: &str, album: &str) -> RemoteTrack {
    RemoteTrack {
        id: Some(id.to_string()),
        name: Some(title.to_string()),
        artists: vec![RemoteArtist {
            name: Some(artist.to_string()),
        }],
        album: Some(RemoteAlbum {
            name: Some(album.to_string()),
        }),
    }
}

/// Build a library entry.
pub fn library_item(file: &str, title: &str, artist: &str, album: &str) -> LibraryItem {
    LibraryItem::new(file).with_tags(title, artist, album)
}
