//! Unified timeline over deploy, container and incident events.

pub mod unify;

pub use unify::{
    DEFAULT_LIMIT, INCIDENT_OPENED, INCIDENT_RESOLVED, Timeline, TimelineQuery, load_timeline,
    project_deploy, project_docker, project_incident, unify,
};
