//! Progress reporting of a sync cycle.
//!
//! | phase            | percent  |
//! |------------------|----------|
//! | copy (phase 1)   | 0 – 50   |
//! | reconcile (2)    | 50 – 55  |
//! | interpret (3)    | 55 – 100 |

use kardex_core::CompanyId;
use kardex_events::{Notification, SyncStatus, SyncUpdate};

use crate::notify::{SharedBus, publish};

/// Receives every progress update of a cycle, e.g. to store it on the job.
pub trait ProgressSink: Send + Sync {
    fn update(&self, update: &SyncUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&SyncUpdate) + Send + Sync,
{
    fn update(&self, update: &SyncUpdate) {
        self(update)
    }
}

/// Sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _update: &SyncUpdate) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Copy,
    Reconcile,
    Interpret,
}

impl Phase {
    pub fn status(self) -> SyncStatus {
        match self {
            Phase::Copy => SyncStatus::RunningPhase1,
            Phase::Reconcile => SyncStatus::RunningPhase2,
            Phase::Interpret => SyncStatus::RunningPhase3,
        }
    }

    fn range(self) -> (u8, u8) {
        match self {
            Phase::Copy => (0, 50),
            Phase::Reconcile => (50, 55),
            Phase::Interpret => (55, 100),
        }
    }

    /// Overall percent after `done` of `total` units of this phase.
    pub fn percent(self, done: usize, total: usize) -> u8 {
        let (start, end) = self.range();
        if total == 0 {
            return start;
        }
        let span = u128::from(end - start);
        let advanced = span * done.min(total) as u128 / total as u128;
        start + advanced as u8
    }
}

/// Fans an update out to the caller's sink and the company topic.
pub(crate) struct Progress<'a> {
    company: CompanyId,
    bus: &'a SharedBus,
    sink: &'a dyn ProgressSink,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(company: CompanyId, bus: &'a SharedBus, sink: &'a dyn ProgressSink) -> Self {
        Self { company, bus, sink }
    }

    pub(crate) fn emit(&self, update: SyncUpdate) {
        self.sink.update(&update);
        publish(self.bus, Notification::sync(self.company, update));
    }

    pub(crate) fn phase(&self, phase: Phase, done: usize, total: usize, message: impl Into<String>) {
        self.emit(SyncUpdate::new(phase.status(), message, phase.percent(done, total)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_map_onto_their_ranges() {
        assert_eq!(Phase::Copy.percent(0, 10), 0);
        assert_eq!(Phase::Copy.percent(5, 10), 25);
        assert_eq!(Phase::Copy.percent(10, 10), 50);
        assert_eq!(Phase::Reconcile.percent(1, 1), 55);
        assert_eq!(Phase::Interpret.percent(0, 0), 55);
        assert_eq!(Phase::Interpret.percent(30, 20), 100);
    }

    #[test]
    fn closures_are_sinks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |u: &SyncUpdate| seen.lock().unwrap().push(u.progress_percent);
        sink.update(&SyncUpdate::new(SyncStatus::Started, "go", 0));
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }
}
