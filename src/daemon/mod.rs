//! Daemon subsystem: the periodic cycle runner and its signal flags.

pub mod loop_main;
pub mod signals;

pub use loop_main::{
    CycleSummary, DriftDaemon, InboxOutcome, pending_batches, process_inbox, run_cycle,
};
pub use signals::SignalHandler;
