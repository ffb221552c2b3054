//! Per-company sync cycle: copy, reconcile, interpret.
//!
//! 1. **Copy** headers dated at or after the watermark from the ERP into the
//!    legacy mirror, one transaction per header, advancing the watermark
//!    after each batch.
//! 2. **Reconcile** the last `reconciliation_days` days: delete mirrored
//!    headers gone upstream and update divergent statuses, in one
//!    transaction.
//! 3. **Interpret** the window into ledger entries, notes and transfers in
//!    one transaction, then recompute the touched balances.
//!
//! The company lock is held for all three phases.

pub mod controller;
pub mod progress;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kardex_core::DomainError;

use crate::cancel::Interrupted;
use crate::erp::ErpError;
use crate::interpreter::InterpretationReport;
use crate::locks::LockError;
use crate::store::StoreError;

pub use controller::SyncController;
pub use progress::{NoProgress, Phase, ProgressSink};

/// Parameters of one cycle; unset fields fall back to the configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub company_alias: String,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub reconciliation_days: Option<u32>,
}

impl SyncRequest {
    pub fn new(company_alias: impl Into<String>) -> Self {
        Self {
            company_alias: company_alias.into(),
            start_year: None,
            reconciliation_days: None,
        }
    }

    pub fn with_start_year(mut self, year: i32) -> Self {
        self.start_year = Some(year);
        self
    }

    pub fn with_reconciliation_days(mut self, days: u32) -> Self {
        self.reconciliation_days = Some(days);
        self
    }
}

/// Outcome of a finished cycle; published as the `result` of the last update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub company_alias: String,
    pub headers_copied: usize,
    pub details_copied: usize,
    pub watermark: Option<DateTime<Utc>>,
    pub headers_deleted: usize,
    pub statuses_updated: usize,
    pub interpretation: InterpretationReport,
    pub balances_recomputed: usize,
    pub balances_skipped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("erp error: {0}")]
    Erp(ErpError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("a sync for '{0}' is already running")]
    Conflict(String),
    #[error("sync cancelled")]
    Cancelled,
    #[error("sync timed out")]
    TimedOut,
}

impl From<ErpError> for SyncError {
    fn from(value: ErpError) -> Self {
        match value {
            ErpError::Config(message) => SyncError::Config(message),
            other => SyncError::Erp(other),
        }
    }
}

impl From<Interrupted> for SyncError {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::Cancelled => SyncError::Cancelled,
            Interrupted::TimedOut => SyncError::TimedOut,
        }
    }
}

impl From<LockError> for SyncError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Busy(company) => SyncError::Conflict(company.to_string()),
            LockError::Poisoned => SyncError::Store(StoreError::Poisoned),
        }
    }
}
