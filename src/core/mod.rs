//! Core types: errors, configuration, timestamp helpers.

pub mod config;
pub mod errors;
pub mod time;
