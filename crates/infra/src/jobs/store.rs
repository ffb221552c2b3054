//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;

use super::types::{Job, JobId, JobProgress, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Enqueue a new job. Rejected while the same company has an active job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest queued job, marking it running.
    fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Refresh the heartbeat, optionally with new progress.
    fn heartbeat(&self, job_id: JobId, progress: Option<JobProgress>) -> Result<(), JobStoreError>;

    /// The queued or running job of a company, if any.
    fn active_for(&self, company_alias: &str) -> Result<Option<Job>, JobStoreError>;

    /// Newest first.
    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Remove running jobs whose heartbeat is older than `threshold`.
    fn remove_stale(&self, threshold: Duration) -> Result<Vec<Job>, JobStoreError>;

    /// Cancel a queued job. Running jobs are cancelled through their token.
    fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("a job for '{alias}' is already {state}: {job}")]
    Conflict { alias: String, job: JobId, state: String },
    #[error("job {0} is not queued")]
    NotQueued(JobId),
    #[error("job store lock poisoned")]
    Poisoned,
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn state_name(status: &JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Finished => "finished",
        JobStatus::Failed { .. } => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        if let Some(active) = jobs
            .values()
            .find(|j| j.status.is_active() && j.company_alias() == job.company_alias())
        {
            return Err(JobStoreError::Conflict {
                alias: job.company_alias().to_string(),
                job: active.id,
                state: state_name(&active.status).to_string(),
            });
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;

        // FIFO over queued jobs
        let next = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_running();
            Some(job.clone())
        }))
    }

    fn heartbeat(&self, job_id: JobId, progress: Option<JobProgress>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        match progress {
            Some(progress) => job.record_progress(progress.percent, progress.message),
            None => job.beat(),
        }
        Ok(())
    }

    fn active_for(&self, company_alias: &str) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        Ok(jobs
            .values()
            .filter(|j| j.status.is_active() && j.company_alias() == company_alias.trim())
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        let mut result: Vec<_> = jobs.values().cloned().collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }

    fn remove_stale(&self, threshold: Duration) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        let now = Utc::now();
        let stale: Vec<JobId> = jobs
            .values()
            .filter(|j| j.is_stale(now, threshold))
            .map(|j| j.id)
            .collect();
        Ok(stale.into_iter().filter_map(|id| jobs.remove(&id)).collect())
    }

    fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| JobStoreError::Poisoned)?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Queued {
            return Err(JobStoreError::NotQueued(job_id));
        }
        job.mark_cancelled(None);
        Ok(job.clone())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| JobStoreError::Poisoned)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match &job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Finished => stats.finished += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next()
    }

    fn heartbeat(&self, job_id: JobId, progress: Option<JobProgress>) -> Result<(), JobStoreError> {
        (**self).heartbeat(job_id, progress)
    }

    fn active_for(&self, company_alias: &str) -> Result<Option<Job>, JobStoreError> {
        (**self).active_for(company_alias)
    }

    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(limit)
    }

    fn remove_stale(&self, threshold: Duration) -> Result<Vec<Job>, JobStoreError> {
        (**self).remove_stale(threshold)
    }

    fn cancel(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).cancel(job_id)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();

        let job_id = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn one_active_job_per_company() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();

        let err = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { job, .. } if job == first));
        assert!(store.enqueue(Job::new(JobKind::sync_company("globex"))).is_ok());

        let mut claimed = store.claim_next().unwrap().unwrap();
        let started = claimed.started_at.unwrap();
        claimed.mark_finished(started, None);
        store.update(&claimed).unwrap();
        assert!(store.enqueue(Job::new(JobKind::sync_company("acme"))).is_ok());
    }

    #[test]
    fn stale_running_jobs_are_removed() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();
        let mut job = store.claim_next().unwrap().unwrap();
        store.enqueue(Job::new(JobKind::sync_company("globex"))).unwrap();

        assert!(store.remove_stale(Duration::from_secs(600)).unwrap().is_empty());

        job.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(30));
        store.update(&job).unwrap();
        let removed = store.remove_stale(Duration::from_secs(600)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, id);
        assert!(store.get(id).unwrap().is_none());
        assert_eq!(store.stats().unwrap().queued, 1);
    }

    #[test]
    fn heartbeat_carries_progress() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();
        store.claim_next().unwrap();

        store
            .heartbeat(
                id,
                Some(JobProgress {
                    percent: 52,
                    message: "reconciling".into(),
                }),
            )
            .unwrap();
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.progress.percent, 52);
        assert_eq!(store.active_for("acme").unwrap().map(|j| j.id), Some(id));
    }

    #[test]
    fn only_queued_jobs_cancel_in_store() {
        let store = InMemoryJobStore::new();
        let queued = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();
        assert_eq!(store.cancel(queued).unwrap().status, JobStatus::Cancelled);
        assert!(store.claim_next().unwrap().is_none());

        let running = store.enqueue(Job::new(JobKind::sync_company("acme"))).unwrap();
        store.claim_next().unwrap();
        assert_eq!(store.cancel(running).unwrap_err(), JobStoreError::NotQueued(running));
    }
}
