//! Operator interruption.
//!
//! SIGINT and SIGTERM only flip an atomic flag; the scheduler looks at it at
//! the top of every cycle (and the change-notification wait polls it so it
//! does not sleep through a Ctrl-C).

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to the process-wide interruption flag.
#[cfg(unix)]
pub fn install_handlers() -> Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int);
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        let previous = unsafe { libc::signal(signum, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            bail!("Failed to install handler for signal {signum}");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_handlers() -> Result<()> {
    log::warn!("Signal handling is only supported on unix; stop the process externally");
    Ok(())
}

/// Cancellation handle shared by the scheduler and the connection guard.
///
/// A handle created with [`Shutdown::from_signals`] also observes the process
/// signal flag; [`Shutdown::new`] only reacts to [`Shutdown::trigger`].
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    watch_signals: bool,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signals() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        }
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
            || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}
