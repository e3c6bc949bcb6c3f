//! Background services: the storage engine, the export pipeline, the
//! scheduler that drives it, and the replication queue and worker.

pub mod clock;
pub mod compress;
pub mod export_service;
pub mod guard;
pub mod job_queue;
pub mod kv_store;
pub mod naming;
pub mod replication;
pub mod scheduler;
pub mod status_registry;
pub mod transfer;

#[cfg(test)]
pub mod testing;
