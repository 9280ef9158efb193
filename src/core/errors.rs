//! DLG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DlgError>;

/// Top-level error type for the drift ledger engine.
#[derive(Debug, Error)]
pub enum DlgError {
    #[error("[DLG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DLG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[DLG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DLG-2001] malformed {kind} record #{index}: {details}")]
    MalformedRecord {
        kind: &'static str,
        index: usize,
        details: String,
    },

    #[error("[DLG-2002] malformed snapshot for service {service}: {details}")]
    MalformedSnapshot { service: String, details: String },

    #[error("[DLG-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DLG-2102] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error(
        "[DLG-2201] invariant violation: {open_rows} unresolved drift rows for ({service}, {category})"
    )]
    DuplicateOpenDrift {
        service: String,
        category: String,
        open_rows: usize,
    },

    #[error("[DLG-2301] invalid time range: end {end} is before start {start}")]
    InvalidTimeRange { start: String, end: String },

    #[error("[DLG-2302] unknown incident #{id}")]
    UnknownIncident { id: i64 },

    #[error("[DLG-2303] unknown drift observation #{id}")]
    UnknownDrift { id: i64 },

    #[error("[DLG-2304] invalid query: {details}")]
    InvalidQuery { details: String },

    #[error("[DLG-2305] incident #{id} {details}")]
    IncidentState { id: i64, details: String },

    #[error("[DLG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DLG-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[DLG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DlgError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DLG-1001",
            Self::MissingConfig { .. } => "DLG-1002",
            Self::ConfigParse { .. } => "DLG-1003",
            Self::MalformedRecord { .. } => "DLG-2001",
            Self::MalformedSnapshot { .. } => "DLG-2002",
            Self::Serialization { .. } => "DLG-2101",
            Self::Sql { .. } => "DLG-2102",
            Self::DuplicateOpenDrift { .. } => "DLG-2201",
            Self::InvalidTimeRange { .. } => "DLG-2301",
            Self::UnknownIncident { .. } => "DLG-2302",
            Self::UnknownDrift { .. } => "DLG-2303",
            Self::InvalidQuery { .. } => "DLG-2304",
            Self::IncidentState { .. } => "DLG-2305",
            Self::Io { .. } => "DLG-3002",
            Self::ChannelClosed { .. } => "DLG-3003",
            Self::Runtime { .. } => "DLG-3900",
        }
    }

    /// Whether retrying (at the next scheduled cycle) might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::ChannelClosed { .. } | Self::Sql { .. } | Self::Runtime { .. }
        )
    }

    /// Whether the error is a broken engine invariant that must halt the cycle.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::DuplicateOpenDrift { .. })
    }

    /// Whether the error is a caller-side query rejection.
    #[must_use]
    pub const fn is_query_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidTimeRange { .. }
                | Self::UnknownIncident { .. }
                | Self::UnknownDrift { .. }
                | Self::InvalidQuery { .. }
                | Self::IncidentState { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<rusqlite::Error> for DlgError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for DlgError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DlgError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<DlgError> {
        vec![
            DlgError::InvalidConfig {
                details: String::new(),
            },
            DlgError::MissingConfig {
                path: PathBuf::new(),
            },
            DlgError::ConfigParse {
                context: "",
                details: String::new(),
            },
            DlgError::MalformedRecord {
                kind: "",
                index: 0,
                details: String::new(),
            },
            DlgError::MalformedSnapshot {
                service: String::new(),
                details: String::new(),
            },
            DlgError::Serialization {
                context: "",
                details: String::new(),
            },
            DlgError::Sql {
                context: "",
                details: String::new(),
            },
            DlgError::DuplicateOpenDrift {
                service: String::new(),
                category: String::new(),
                open_rows: 2,
            },
            DlgError::InvalidTimeRange {
                start: String::new(),
                end: String::new(),
            },
            DlgError::UnknownIncident { id: 0 },
            DlgError::UnknownDrift { id: 0 },
            DlgError::InvalidQuery {
                details: String::new(),
            },
            DlgError::IncidentState {
                id: 0,
                details: String::new(),
            },
            DlgError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            DlgError::ChannelClosed { component: "" },
            DlgError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(DlgError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_carries_code_for_every_variant() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain {}: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn invariant_violation_is_never_retryable() {
        let err = DlgError::DuplicateOpenDrift {
            service: "api".to_string(),
            category: "route-orphaned".to_string(),
            open_rows: 2,
        };
        assert!(err.is_invariant_violation());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("(api, route-orphaned)"));
    }

    #[test]
    fn query_rejections_are_classified() {
        assert!(DlgError::UnknownIncident { id: 9 }.is_query_rejection());
        assert!(
            DlgError::InvalidTimeRange {
                start: "b".to_string(),
                end: "a".to_string()
            }
            .is_query_rejection()
        );
        assert!(
            !DlgError::Runtime {
                details: String::new()
            }
            .is_query_rejection()
        );
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            DlgError::Sql {
                context: "",
                details: String::new()
            }
            .is_retryable()
        );
        assert!(DlgError::ChannelClosed { component: "test" }.is_retryable());
        assert!(
            !DlgError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !DlgError::MalformedRecord {
                kind: "deploy_event",
                index: 3,
                details: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = DlgError::io(
            "/tmp/batch.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "DLG-3002");
        assert!(err.to_string().contains("/tmp/batch.json"));
    }

    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: DlgError = sql_err.into();
        assert_eq!(err.code(), "DLG-2102");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: DlgError = json_err.into();
        assert_eq!(err.code(), "DLG-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: DlgError = toml_err.into();
        assert_eq!(err.code(), "DLG-1003");
    }
}
