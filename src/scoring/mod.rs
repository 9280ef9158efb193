//! Debt scoring for open drift.

pub mod debt;

pub use debt::{
    DebtEntry, DebtLedger, SeverityWeights, WeekTrend, age_days, build_ledger, debt_score, rank,
    weekly_trend,
};
