//! Process signal handling.
//!
//! Handlers do exactly one thing: flip a flag. Every long-running loop owns
//! a [`SignalControl`] and checks the flags at its quiescent points:
//!
//! - `SIGTERM` — finish the current product, persist state, exit.
//! - `SIGINT`  — immediate exit.
//! - `SIGHUP`  — reread configuration and rebuild rule tables.
//! - `SIGUSR1` — reopen the log destination.
//! - `SIGUSR2` — cycle the verbosity level.
//! - `SIGALRM` — wakes a blocked suspend; no flag.
//! - `SIGPIPE`, `SIGXFSZ` — ignored; write errors surface through `Err`.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use log::LevelFilter;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static DONE: AtomicBool = AtomicBool::new(false);
static HUPPED: AtomicBool = AtomicBool::new(false);
static REOPEN_LOG: AtomicBool = AtomicBool::new(false);
static CYCLE_VERBOSITY: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signum: i32) {
    match signum {
        libc::SIGTERM => DONE.store(true, Ordering::SeqCst),
        libc::SIGINT => {
            // Immediate exit; only async-signal-safe calls allowed here.
            unsafe { libc::_exit(128 + libc::SIGINT) }
        }
        libc::SIGHUP => HUPPED.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => REOPEN_LOG.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => CYCLE_VERBOSITY.store(true, Ordering::SeqCst),
        // SIGALRM exists only to interrupt a blocking wait.
        _ => {}
    }
}

/// Handle to the process-wide signal flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalControl;

impl SignalControl {
    /// Installs the handlers. Call once, early in main.
    pub fn install() -> Result<SignalControl> {
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(), // no SA_RESTART: blocked syscalls must wake
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            for sig in [
                Signal::SIGTERM,
                Signal::SIGINT,
                Signal::SIGHUP,
                Signal::SIGUSR1,
                Signal::SIGUSR2,
                Signal::SIGALRM,
            ] {
                sigaction(sig, &action)?;
            }
            sigaction(Signal::SIGPIPE, &ignore)?;
            sigaction(Signal::SIGXFSZ, &ignore)?;
        }
        Ok(SignalControl)
    }

    /// For tests and embedded use: a control with no handlers installed.
    pub fn unhooked() -> SignalControl {
        SignalControl
    }

    /// True once a drain-and-exit has been requested.
    pub fn is_done(&self) -> bool {
        DONE.load(Ordering::SeqCst)
    }

    /// True when any condition interrupting a blocking wait is raised.
    pub fn interrupted(&self) -> bool {
        self.is_done()
            || HUPPED.load(Ordering::SeqCst)
            || REOPEN_LOG.load(Ordering::SeqCst)
            || CYCLE_VERBOSITY.load(Ordering::SeqCst)
    }

    /// Requests a drain-and-exit from within the process.
    pub fn request_stop(&self) {
        DONE.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending reload request.
    pub fn take_hup(&self) -> bool {
        HUPPED.swap(false, Ordering::SeqCst)
    }

    /// Consumes a pending log-reopen request.
    pub fn take_reopen_log(&self) -> bool {
        REOPEN_LOG.swap(false, Ordering::SeqCst)
    }

    /// Consumes a pending verbosity-cycle request and applies it.
    pub fn take_cycle_verbosity(&self) -> bool {
        if !CYCLE_VERBOSITY.swap(false, Ordering::SeqCst) {
            return false;
        }
        let next = match log::max_level() {
            LevelFilter::Warn => LevelFilter::Info,
            LevelFilter::Info => LevelFilter::Debug,
            _ => LevelFilter::Warn,
        };
        log::set_max_level(next);
        log::warn!("verbosity cycled to {}", next);
        true
    }

    #[cfg(test)]
    pub(crate) fn reset() {
        DONE.store(false, Ordering::SeqCst);
        HUPPED.store(false, Ordering::SeqCst);
        REOPEN_LOG.store(false, Ordering::SeqCst);
        CYCLE_VERBOSITY.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: the flags are process-wide statics and the harness
    // runs tests concurrently.
    #[test]
    fn control_flag_lifecycle() {
        let ctl = SignalControl::unhooked();
        SignalControl::reset();
        assert!(!ctl.is_done());
        assert!(!ctl.interrupted());
        ctl.request_stop();
        assert!(ctl.is_done());
        assert!(ctl.interrupted());
        SignalControl::reset();

        HUPPED.store(true, Ordering::SeqCst);
        assert!(ctl.interrupted());
        assert!(ctl.take_hup());
        assert!(!ctl.take_hup());
        assert!(!ctl.interrupted());
    }
}
