//! Infrastructure layer: local store, ERP readers, sync pipeline, jobs.
//!
//! - [`store`]: the operational database (in-memory or Postgres)
//! - [`erp`]: read-only access to each company's ERP
//! - [`sync`]: the three-phase cycle (copy, reconcile, interpret)
//! - [`interpreter`]: legacy documents into ledger entries and transfers
//! - [`transfers`]: manual reception and reversal
//! - [`recompute`]: stock balances from the ledger
//! - [`jobs`]: background runner with heartbeats and stuck-job sweep
//! - [`service`]: the inbound façade

pub mod cancel;
pub mod config;
pub mod erp;
pub mod interpreter;
pub mod jobs;
pub mod locks;
pub mod notify;
pub mod recompute;
pub mod service;
pub mod store;
pub mod sync;
pub mod transfers;

pub use config::AppConfig;
pub use service::{ServiceError, WarehouseService};

#[cfg(test)]
mod integration_tests;
