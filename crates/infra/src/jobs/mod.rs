//! Background jobs: one sync cycle per job, at most one active job per company.
//!
//! - `Job`: kind, status, progress and heartbeat
//! - `JobStore`: persistence for jobs (in-memory)
//! - `JobExecutor`: worker threads plus the stuck-job sweeper

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{
    CancelRegistry, ExecutorStats, JobContext, JobExecutor, JobExecutorConfig, JobExecutorHandle,
    stuck_cleanup,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Job, JobId, JobKind, JobProgress, JobResult, JobStatus};
