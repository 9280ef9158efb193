//! Activity logging: JSONL file and the `activity_log` table, written from a
//! dedicated thread.

pub mod dual;
pub mod jsonl;
