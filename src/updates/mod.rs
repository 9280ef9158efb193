//! Version staleness and update risk.

pub mod risk;

pub use risk::{
    UpdatePass, VersionChange, assess, classify, parse_version, risk_tier, track_updates,
};
