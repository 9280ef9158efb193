//! Desired-vs-observed reconciliation and drift lifecycle management.

pub mod detect;
pub mod reconciler;

pub use detect::{ServiceAssessment, Verdict, assess_service, blast_radii};
pub use reconciler::{
    RESOLUTION_CLEARED, RESOLUTION_UNDECLARED, ReconcileReport, Reconciler, ServiceFailure,
};
