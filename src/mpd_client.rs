//! # MPD Client
//!
//! [`PlaybackEngine`] on top of the `mpd` crate's [`Client`]. One
//! [`MpdConnection`] is one TCP session; [`MpdConnector`] opens new ones for
//! the [`ConnectionGuard`](crate::connection::ConnectionGuard).
//!
//! The crate drives the session: greeting, `password`, `currentsong`,
//! `status`, `playlistinfo`, `find`, `addid` and `idle`. A second handle on
//! the same socket covers what it does not:
//!
//! - `count` has no wrapper, so it is written and its `songs:` reply read
//!   here.
//! - `close` gets no reply from the server.
//! - [`IdleGuard::get`](mpd::idle::IdleGuard::get) blocks until the server
//!   answers, so a watcher thread sends `noidle` once someone else needs the
//!   connection or shutdown is requested.
//!
//! When the server hangs up mid-reply the crate can hand back an empty
//! result instead of an error. Every call therefore also checks whether the
//! peer has closed, and reports that as a dropped connection.

use log::{debug, trace, warn};
use mpd::error::Error as MpdError;
use mpd::idle::{Idle, Subsystem as MpdSubsystem};
use mpd::status::{State, Status};
use mpd::{Client, Query, Song, Term};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::MpdSettings;
use crate::playback::{
    Connector, EngineError, IdleOutcome, LibraryItem, PlayState, PlaybackEngine, PlayerStatus,
    Subsystem, Tag,
};

/// Quote a command argument: wrap in double quotes, escaping `"` and `\`.
pub fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for ch in arg.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Split a `key: value` response line.
pub fn parse_pair(line: &str) -> Option<(&str, &str)> {
    line.split_once(": ")
}

/// Read the `songs` field of a `count` response.
pub fn parse_count(pairs: &[(String, String)]) -> Result<u64, EngineError> {
    let value = pairs
        .iter()
        .find(|(key, _)| key == "songs")
        .map(|(_, value)| value)
        .ok_or_else(|| EngineError::malformed("count", "no 'songs' field"))?;
    value
        .parse()
        .map_err(|_| EngineError::malformed("count", format!("'songs' is not a number: '{value}'")))
}

/// Message part of an `ACK [50@0] {count} unknown tag` line.
fn ack_message(ack: &str) -> String {
    match ack.split_once("} ") {
        Some((_, message)) => message.to_string(),
        None => ack.to_string(),
    }
}

/// Read pairs up to `OK`. `name` is the bare command name for errors.
fn read_response(reader: &mut impl BufRead, name: &str) -> Result<Vec<(String, String)>, EngineError> {
    let mut pairs = Vec::new();
    loop {
        let mut raw = String::new();
        if reader.read_line(&mut raw)? == 0 {
            return Err(EngineError::Disconnected("server closed the connection".to_string()));
        }
        let line = raw.trim_end_matches(['\n', '\r']);
        trace!("< {line}");
        if line == "OK" {
            return Ok(pairs);
        }
        if let Some(ack) = line.strip_prefix("ACK ") {
            return Err(EngineError::Rejected {
                command: name.to_string(),
                message: ack_message(ack),
            });
        }
        match parse_pair(line) {
            Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
            None => return Err(EngineError::malformed(name, format!("unexpected line '{line}'"))),
        }
    }
}

/// Convert a song record from the crate.
///
/// MPD sends one `Artist` line per credited artist. The crate keeps a single
/// one in `artist`; extra tag lines land in `tags`, where the first `Artist`
/// is the first credit.
pub fn song_to_item(song: Song) -> LibraryItem {
    let tag = |key: &str| {
        song.tags
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
    };
    let album = tag("Album");
    let artist = tag("Artist").or_else(|| song.artist.clone());
    LibraryItem {
        file: song.file,
        title: song.title,
        artist,
        album,
    }
}

pub fn player_status(status: &Status) -> PlayerStatus {
    PlayerStatus {
        state: match status.state {
            State::Play => PlayState::Play,
            State::Pause => PlayState::Pause,
            State::Stop => PlayState::Stop,
        },
        song: status.song.as_ref().map(|place| place.pos),
        next_song: status.nextsong.as_ref().map(|place| place.pos),
        playlist_length: status.queue_len,
    }
}

fn engine_error(command: &str, err: MpdError) -> EngineError {
    match err {
        MpdError::Io(err) => err.into(),
        MpdError::Server(server) => EngineError::Rejected {
            command: command.to_string(),
            message: server.detail,
        },
        other => EngineError::malformed(command, other.to_string()),
    }
}

fn open_stream(settings: &MpdSettings) -> Result<TcpStream, EngineError> {
    let timeout = settings.timeout();
    let mut last_err = io::Error::new(
        io::ErrorKind::NotFound,
        format!("'{}' did not resolve to any address", settings.address()),
    );
    for addr in settings.address().to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = err,
        }
    }
    Err(last_err.into())
}

/// One TCP session with MPD.
pub struct MpdConnection {
    client: Client<TcpStream>,
    /// Second handle on the client's socket.
    socket: TcpStream,
    timeout: Duration,
    idle_poll: Duration,
}

impl MpdConnection {
    /// Connect, check the greeting and authenticate if a password is set.
    pub fn connect(settings: &MpdSettings) -> Result<Self, EngineError> {
        let stream = open_stream(settings)?;
        let socket = stream.try_clone()?;
        let mut client = Client::new(stream).map_err(|err| engine_error("connect", err))?;
        debug!("MPD session open to {}", settings.address());

        if let Some(password) = &settings.password {
            client
                .login(password)
                .map_err(|err| engine_error("password", err))?;
        }
        Ok(Self {
            client,
            socket,
            timeout: settings.timeout(),
            idle_poll: settings.idle_poll(),
        })
    }

    /// Whether the server has hung up on us.
    fn peer_closed(&self) -> bool {
        if self.socket.set_nonblocking(true).is_err() {
            return true;
        }
        let mut peeked = [0u8; 1];
        let closed = match self.socket.peek(&mut peeked) {
            Ok(0) => true,
            Ok(_) => false,
            Err(err) => err.kind() != io::ErrorKind::WouldBlock,
        };
        self.socket.set_nonblocking(false).is_err() || closed
    }

    fn finish<T>(&self, command: &str, result: mpd::error::Result<T>) -> Result<T, EngineError> {
        match result {
            Ok(value) if !self.peer_closed() => Ok(value),
            Ok(_) => Err(EngineError::Disconnected(format!(
                "server closed the connection during `{command}`"
            ))),
            Err(MpdError::Io(err)) => Err(err.into()),
            Err(err @ MpdError::Server(_)) => Err(engine_error(command, err)),
            Err(err) if self.peer_closed() => Err(EngineError::Disconnected(format!(
                "server closed the connection during `{command}`: {err}"
            ))),
            Err(err) => Err(engine_error(command, err)),
        }
    }

    fn send_raw(&self, line: &str) -> Result<(), EngineError> {
        trace!("> {line}");
        let mut writer = &self.socket;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl PlaybackEngine for MpdConnection {
    fn current_song(&mut self) -> Result<Option<LibraryItem>, EngineError> {
        let result = self.client.currentsong();
        Ok(self.finish("currentsong", result)?.map(song_to_item))
    }

    fn status(&mut self) -> Result<PlayerStatus, EngineError> {
        let result = self.client.status();
        Ok(player_status(&self.finish("status", result)?))
    }

    fn playlist_items(&mut self) -> Result<Vec<LibraryItem>, EngineError> {
        let result = self.client.queue();
        Ok(self
            .finish("playlistinfo", result)?
            .into_iter()
            .map(song_to_item)
            .collect())
    }

    fn find(&mut self, filters: &[(Tag, &str)]) -> Result<Vec<LibraryItem>, EngineError> {
        let mut query = Query::new();
        for (tag, value) in filters {
            query.and(Term::Tag(tag.as_str().into()), *value);
        }
        let result = self.client.find(&query, None::<(u32, u32)>);
        Ok(self
            .finish("find", result)?
            .into_iter()
            .map(song_to_item)
            .collect())
    }

    fn count(&mut self, tag: Tag, value: &str) -> Result<u64, EngineError> {
        self.send_raw(&format!("count {} {}", tag.as_str(), quote(value)))?;
        let mut reader = BufReader::new(&self.socket);
        let pairs = read_response(&mut reader, "count")?;
        parse_count(&pairs)
    }

    fn append(&mut self, file: &str) -> Result<(), EngineError> {
        let song = Song {
            file: file.to_string(),
            ..Song::default()
        };
        let result = self.client.push(song);
        self.finish("add", result).map(|id| trace!("{file} queued as {id:?}"))
    }

    fn wait_for_change(
        &mut self,
        subsystems: &[Subsystem],
        interrupt: &(dyn Fn() -> bool + Sync),
    ) -> Result<IdleOutcome, EngineError> {
        if interrupt() {
            return Ok(IdleOutcome::Interrupted);
        }
        let wanted: Vec<MpdSubsystem> = subsystems
            .iter()
            .filter_map(|subsystem| subsystem.as_str().parse().ok())
            .collect();

        // Idle waits as long as it takes; the watcher bounds the wait once
        // it has asked for the connection back.
        self.socket.set_read_timeout(None)?;
        let watch = IdleWatch::default();
        let (client, socket) = (&mut self.client, &self.socket);
        let (poll, reply_timeout) = (self.idle_poll, self.timeout);
        let result = thread::scope(|scope| {
            scope.spawn(|| watch.run(socket, interrupt, poll, reply_timeout));
            let result = client.idle(&wanted).and_then(|idle| {
                watch.entered.store(true, Ordering::SeqCst);
                idle.get()
            });
            watch.done.store(true, Ordering::SeqCst);
            result
        });

        let changed = self.finish("idle", result)?;
        self.socket.set_read_timeout(Some(self.timeout))?;
        if changed.is_empty() {
            return Ok(IdleOutcome::Interrupted);
        }
        Ok(IdleOutcome::Changed(
            changed
                .iter()
                .map(|subsystem| Subsystem::from_name(&subsystem.to_string()))
                .collect(),
        ))
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.send_raw("close")
    }

    fn disconnect(&mut self) -> Result<(), EngineError> {
        match self.socket.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Cancels one `idle` from a second thread.
#[derive(Default)]
struct IdleWatch {
    /// The `idle` command is out; `noidle` before it would be ignored.
    entered: AtomicBool,
    done: AtomicBool,
}

impl IdleWatch {
    fn run(
        &self,
        socket: &TcpStream,
        interrupt: &(dyn Fn() -> bool + Sync),
        poll: Duration,
        reply_timeout: Duration,
    ) {
        while !self.done.load(Ordering::SeqCst) {
            if self.entered.load(Ordering::SeqCst) && interrupt() {
                debug!("Cancelling idle");
                let mut writer = socket;
                let sent = writer.write_all(b"noidle\n").and_then(|()| writer.flush());
                if sent.is_ok() && self.wait_done(poll, reply_timeout) {
                    return;
                }
                warn!("MPD did not answer noidle; dropping the connection");
                if let Err(err) = socket.shutdown(Shutdown::Both) {
                    debug!("Shutdown after noidle failed: {err}");
                }
                return;
            }
            thread::sleep(poll);
        }
    }

    fn wait_done(&self, poll: Duration, limit: Duration) -> bool {
        let started = Instant::now();
        while !self.done.load(Ordering::SeqCst) {
            if started.elapsed() >= limit {
                return false;
            }
            thread::sleep(poll);
        }
        true
    }
}

/// Opens [`MpdConnection`]s from the `[mpd]` settings.
#[derive(Debug, Clone)]
pub struct MpdConnector {
    settings: MpdSettings,
}

impl MpdConnector {
    pub fn new(settings: MpdSettings) -> Self {
        Self { settings }
    }
}

impl Connector for MpdConnector {
    fn connect(&self) -> Result<Box<dyn PlaybackEngine>, EngineError> {
        Ok(Box::new(MpdConnection::connect(&self.settings)?))
    }

    fn describe(&self) -> String {
        self.settings.address()
    }
}
