#![forbid(unsafe_code)]

//! Drift Ledger (dlg): fleet drift detection and incident correlation.
//!
//! Each cycle takes a batch of desired and observed service state plus
//! deploy, container and incident events, then:
//! 1. **Reconciles** desired against observed state into a drift table with at
//!    most one unresolved row per (service, category)
//! 2. **Scores** open drift by severity, blast radius and age into a debt ledger
//! 3. **Unifies** deploy, container and incident events into one timeline and
//!    correlates incidents against it
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use drift_ledger::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use drift_ledger::core::config::Config;
//! use drift_ledger::reconcile::Reconciler;
//! ```

pub mod prelude;

pub mod core;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod incidents;
pub mod ingest;
pub mod logger;
pub mod model;
pub mod reconcile;
pub mod reports;
pub mod scoring;
pub mod store;
pub mod timeline;
pub mod updates;
