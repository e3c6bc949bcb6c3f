//! Core data models for the backup pipeline.
//!
//! These records are owned by the pipeline itself; the storage engine only
//! owns bucket existence. All of them serialize as JSON for the status report.

pub mod backup_status;
pub mod bucket;
pub mod replication_job;
