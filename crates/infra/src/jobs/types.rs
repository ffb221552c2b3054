//! Core job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Job kind for routing to a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// One full sync cycle of a company.
    SyncCompany {
        company_alias: String,
        #[serde(default)]
        start_year: Option<i32>,
        #[serde(default)]
        reconciliation_days: Option<u32>,
        #[serde(default)]
        requested_by: Option<String>,
    },
}

impl JobKind {
    pub fn sync_company(company_alias: impl Into<String>) -> Self {
        Self::SyncCompany {
            company_alias: company_alias.into().trim().to_string(),
            start_year: None,
            reconciliation_days: None,
            requested_by: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::SyncCompany { .. } => "sync_company",
        }
    }

    /// Company the job works on; at most one active job per company.
    pub fn company_alias(&self) -> &str {
        match self {
            JobKind::SyncCompany { company_alias, .. } => company_alias,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker
    Queued,
    /// Currently being executed
    Running,
    Finished,
    Failed { error: String },
    /// Cancelled by user/system
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed { .. } | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Latest progress published by the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    pub message: String,
}

/// Outcome returned by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Success(Option<serde_json::Value>),
    Failure(String),
    Cancelled,
}

/// Record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: JobProgress,
    /// Current attempt number (starts at 0)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last sign of life while running.
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            status: JobStatus::Queued,
            progress: JobProgress::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            heartbeat_at: None,
            result: None,
            history: Vec::new(),
        }
    }

    pub fn company_alias(&self) -> &str {
        self.kind.company_alias()
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub fn beat(&mut self) {
        let now = Utc::now();
        self.heartbeat_at = Some(now);
        self.updated_at = now;
    }

    pub fn record_progress(&mut self, percent: u8, message: impl Into<String>) {
        self.progress = JobProgress {
            percent: percent.min(100),
            message: message.into(),
        };
        self.beat();
    }

    pub fn mark_finished(&mut self, started_at: DateTime<Utc>, result: Option<serde_json::Value>) {
        self.status = JobStatus::Finished;
        self.result = result;
        self.progress.percent = 100;
        self.close_attempt(started_at, None);
    }

    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>) {
        self.status = JobStatus::Failed {
            error: error.clone(),
        };
        self.close_attempt(started_at, Some(error));
    }

    pub fn mark_cancelled(&mut self, started_at: Option<DateTime<Utc>>) {
        self.status = JobStatus::Cancelled;
        match started_at {
            Some(started_at) => self.close_attempt(started_at, Some("cancelled".into())),
            None => self.updated_at = Utc::now(),
        }
    }

    fn close_attempt(&mut self, started_at: DateTime<Utc>, error: Option<String>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Running with no heartbeat newer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.heartbeat_at
            .or(self.started_at)
            .is_none_or(|beat| (now - beat).to_std().is_ok_and(|elapsed| elapsed > threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_records_attempts() {
        let mut job = Job::new(JobKind::sync_company(" acme "));
        assert_eq!(job.company_alias(), "acme");
        assert_eq!(job.status, JobStatus::Queued);

        job.mark_running();
        let started = job.started_at.unwrap();
        job.record_progress(40, "copying");
        assert_eq!(job.progress.percent, 40);

        job.mark_failed("erp down".into(), started);
        assert!(job.status.is_terminal());
        assert_eq!(job.history.len(), 1);
        assert!(!job.history[0].success);
    }

    #[test]
    fn staleness_uses_heartbeat() {
        let mut job = Job::new(JobKind::sync_company("acme"));
        let now = Utc::now();
        assert!(!job.is_stale(now, Duration::from_secs(60)));

        job.mark_running();
        assert!(!job.is_stale(now, Duration::from_secs(60)));
        job.heartbeat_at = Some(now - chrono::Duration::minutes(11));
        assert!(job.is_stale(now, Duration::from_secs(600)));
    }

    #[test]
    fn kind_serializes_with_type_tag() {
        let kind = JobKind::sync_company("acme");
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "sync_company");
        assert_eq!(json["company_alias"], "acme");
    }
}
