//! # Connection Guard
//!
//! The playback engine speaks a strictly sequential protocol over one socket,
//! so the scheduler thread and the drainer thread must never interleave
//! commands on it. [`ConnectionGuard`] owns that one connection and is the only
//! way to reach it: every engine call goes through [`ConnectionGuard::run`].
//!
//! ## Failure handling
//!
//! - **Transient** ([`EngineError::is_transient`]): the connection is dropped
//!   and marked [`LinkState::Reconnecting`]; it is re-established (with
//!   exponential backoff) and the operation is retried up to
//!   [`RetryPolicy::retries`] more times. If it still fails transiently the
//!   error is returned and the caller's loop tries again on its next pass.
//! - **Fatal**: logged with the operation description and returned. The
//!   operation is not retried.
//!
//! After [`ConnectionGuard::shutdown`] the guard is [`LinkState::Closed`] and
//! every call fails fast with [`EngineError::Closed`]. This is what makes it
//! safe to abandon the drainer thread at exit.

use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::playback::{Connector, EngineError, IdleOutcome, PlaybackEngine, Subsystem};
use crate::signal::Shutdown;

/// Bounded retry and reconnect behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts of one operation after a transient failure.
    pub retries: u32,
    /// Connection attempts per reconnect before giving up for this call.
    pub reconnect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            reconnect_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy with no waiting, for tests and one-shot commands.
    pub fn immediate(retries: u32, reconnect_attempts: u32) -> Self {
        Self {
            retries,
            reconnect_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// [`Self::backoff`] plus up to 10% random jitter.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let spread = base.as_millis() as u64 / 10;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
    Closed,
}

enum ConnectionState {
    Connected(Box<dyn PlaybackEngine>),
    Reconnecting,
    Closed,
}

impl ConnectionState {
    fn link_state(&self) -> LinkState {
        match self {
            ConnectionState::Connected(_) => LinkState::Connected,
            ConnectionState::Reconnecting => LinkState::Reconnecting,
            ConnectionState::Closed => LinkState::Closed,
        }
    }
}

/// Exclusive owner of the single playback-engine connection.
pub struct ConnectionGuard {
    connector: Box<dyn Connector>,
    policy: RetryPolicy,
    state: Mutex<ConnectionState>,
    /// Threads currently blocked waiting for `state`.
    waiters: AtomicUsize,
}

impl ConnectionGuard {
    /// Open the initial connection. Failing here is fatal for the process.
    pub fn connect(connector: Box<dyn Connector>, policy: RetryPolicy) -> Result<Self, EngineError> {
        let engine = connector.connect()?;
        info!("Connected to playback engine at {}", connector.describe());
        Ok(Self {
            connector,
            policy,
            state: Mutex::new(ConnectionState::Connected(engine)),
            waiters: AtomicUsize::new(0),
        })
    }

    pub fn link_state(&self) -> LinkState {
        self.lock().link_state()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether another thread is blocked waiting for the connection.
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) > 0
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        state
    }

    /// Run `op` against the engine with exclusive access and transient retry.
    ///
    /// `operation` describes the call and its arguments for log lines. The
    /// closure may run more than once (once per attempt), each time on the
    /// current connection.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut(&mut dyn PlaybackEngine) -> Result<T, EngineError>,
    {
        let mut state = self.lock();
        let mut retries = 0;
        loop {
            let engine = self.ensure_connected(&mut state)?;
            match op(engine) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    *state = ConnectionState::Reconnecting;
                    if retries >= self.policy.retries {
                        warn!("{operation}: {err}; giving up after {retries} retries");
                        return Err(err);
                    }
                    retries += 1;
                    warn!("{operation}: {err}; reconnecting (retry {retries}/{})", self.policy.retries);
                }
                Err(err) => {
                    error!("{operation} failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    /// Block until the engine reports a change in one of `subsystems`.
    ///
    /// The wait gives the connection back early (returning
    /// [`IdleOutcome::Interrupted`]) as soon as another thread queues up for
    /// the guard or `shutdown` is triggered.
    pub fn wait_for_change(
        &self,
        subsystems: &[Subsystem],
        shutdown: &Shutdown,
    ) -> Result<IdleOutcome, EngineError> {
        let waiters = &self.waiters;
        let interrupt = || waiters.load(Ordering::SeqCst) > 0 || shutdown.is_triggered();
        let names: Vec<&str> = subsystems.iter().map(Subsystem::as_str).collect();
        self.run(&format!("idle {}", names.join(" ")), |engine| {
            engine.wait_for_change(subsystems, &interrupt)
        })
    }

    /// Orderly shutdown: close, then disconnect. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, ConnectionState::Closed) {
            ConnectionState::Connected(mut engine) => {
                if let Err(err) = engine.close() {
                    warn!("close failed during shutdown: {err}");
                }
                if let Err(err) = engine.disconnect() {
                    warn!("disconnect failed during shutdown: {err}");
                }
                info!("Playback connection closed");
            }
            ConnectionState::Reconnecting => debug!("Shutdown while reconnecting; nothing to close"),
            ConnectionState::Closed => debug!("Playback connection already closed"),
        }
    }

    fn ensure_connected<'a>(
        &self,
        state: &'a mut ConnectionState,
    ) -> Result<&'a mut dyn PlaybackEngine, EngineError> {
        if matches!(state, ConnectionState::Reconnecting) {
            *state = ConnectionState::Connected(self.reconnect()?);
        }
        match state {
            ConnectionState::Connected(engine) => Ok(engine.as_mut()),
            ConnectionState::Reconnecting | ConnectionState::Closed => Err(EngineError::Closed),
        }
    }

    fn reconnect(&self) -> Result<Box<dyn PlaybackEngine>, EngineError> {
        let target = self.connector.describe();
        let attempts = self.policy.reconnect_attempts.max(1);
        let mut last_err = EngineError::Disconnected("no reconnect attempted".to_string());

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.policy.backoff_with_jitter(attempt - 1);
                debug!("Waiting {delay:?} before reconnecting to {target}");
                thread::sleep(delay);
            }
            match self.connector.connect() {
                Ok(engine) => {
                    info!("Reconnected to playback engine at {target}");
                    return Ok(engine);
                }
                Err(err) => {
                    warn!("Reconnect {}/{attempts} to {target} failed: {err}", attempt + 1);
                    last_err = err;
                }
            }
        }

        // Whatever stopped us, the caller should treat it as retryable later.
        Err(match last_err {
            err if err.is_transient() => err,
            err => EngineError::Disconnected(err.to_string()),
        })
    }
}
