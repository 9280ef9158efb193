//! Read-only reports over committed data.

pub mod activity;
pub mod fleet;
pub mod hosts;

pub use activity::{
    CrashLoop, DeployDay, crash_loops, deploy_velocity, load_crash_loops, load_deploy_velocity,
};
pub use fleet::{
    OrphanedRoute, ServiceDependencies, TriangulationRow, dependency_map, load_dependency_map,
    load_orphaned_routes, load_triangulation, load_update_backlog, orphaned_routes, triangulate,
    update_backlog,
};
pub use hosts::{
    HealthInputs, HostPressure, PlatformHealth, PressureLevel, host_pressure, load_host_pressure,
    load_platform_health, platform_health,
};
