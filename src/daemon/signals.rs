//! Signal flags for the cycle runner: SIGTERM/SIGINT stop, SIGHUP reloads
//! the configuration, SIGUSR1 runs a cycle immediately.
//!
//! Handlers only set atomics; the runner polls them between ticks.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Default)]
pub struct SignalHandler {
    shutdown: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    cycle_now: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Flags wired to OS signals. Registration failures are reported, not fatal.
    #[must_use]
    pub fn install() -> Self {
        let handler = Self::default();
        handler.register();
        handler
    }

    /// Flags with no OS signals attached; for tests and embedding.
    #[must_use]
    pub fn unregistered() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Reads and clears the reload request.
    #[must_use]
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }

    /// Reads and clears the immediate-cycle request.
    #[must_use]
    pub fn take_cycle_request(&self) -> bool {
        self.cycle_now.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Relaxed);
    }

    pub fn request_cycle(&self) {
        self.cycle_now.store(true, Ordering::Relaxed);
    }

    fn register(&self) {
        use signal_hook::consts::{SIGINT, SIGTERM};

        let mut hooks = vec![
            ("SIGTERM", SIGTERM, &self.shutdown),
            ("SIGINT", SIGINT, &self.shutdown),
        ];
        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGHUP, SIGUSR1};
            hooks.push(("SIGHUP", SIGHUP, &self.reload));
            hooks.push(("SIGUSR1", SIGUSR1, &self.cycle_now));
        }
        for (name, signal, flag) in hooks {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(flag)) {
                eprintln!("[DLG-SIGNAL] failed to register {name}: {e}");
            }
        }
    }
}
