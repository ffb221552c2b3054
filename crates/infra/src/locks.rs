//! Per-company mutual exclusion.
//!
//! A sync cycle holds its company's lock for all three phases; manual transfer
//! writes take the same lock. Different companies never contend here; the
//! store backend may still serialize them (see [`crate::store::memory`]).

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use kardex_core::CompanyId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("company {0} is busy")]
    Busy(CompanyId),
    #[error("company lock table poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<CompanyId>>,
    released: Condvar,
}

/// Lock table shared by the sync pipeline and the transfer service.
#[derive(Debug, Clone, Default)]
pub struct CompanyLocks {
    inner: Arc<LockTable>,
}

impl CompanyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock without waiting.
    pub fn try_lock(&self, company: CompanyId) -> Result<CompanyGuard, LockError> {
        let mut held = self.inner.held.lock().map_err(|_| LockError::Poisoned)?;
        if !held.insert(company) {
            return Err(LockError::Busy(company));
        }
        Ok(CompanyGuard {
            company,
            table: self.inner.clone(),
        })
    }

    /// Wait up to `timeout` for the lock.
    pub fn lock(&self, company: CompanyId, timeout: Duration) -> Result<CompanyGuard, LockError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.inner.held.lock().map_err(|_| LockError::Poisoned)?;
        while held.contains(&company) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LockError::Busy(company));
            }
            let (guard, _) = self
                .inner
                .released
                .wait_timeout(held, remaining)
                .map_err(|_| LockError::Poisoned)?;
            held = guard;
        }
        held.insert(company);
        Ok(CompanyGuard {
            company,
            table: self.inner.clone(),
        })
    }

    pub fn is_locked(&self, company: CompanyId) -> bool {
        self.inner
            .held
            .lock()
            .map(|held| held.contains(&company))
            .unwrap_or(false)
    }
}

/// Releases the company on drop.
#[derive(Debug)]
pub struct CompanyGuard {
    company: CompanyId,
    table: Arc<LockTable>,
}

impl CompanyGuard {
    pub fn company(&self) -> CompanyId {
        self.company
    }
}

impl Drop for CompanyGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.table.held.lock() {
            held.remove(&self.company);
        }
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn one_holder_per_company() {
        let locks = CompanyLocks::new();
        let a = CompanyId::new();
        let b = CompanyId::new();

        let guard = locks.try_lock(a).unwrap();
        assert_eq!(locks.try_lock(a).unwrap_err(), LockError::Busy(a));
        assert!(locks.try_lock(b).is_ok());

        drop(guard);
        assert!(!locks.is_locked(a));
        assert!(locks.try_lock(a).is_ok());
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let locks = CompanyLocks::new();
        let company = CompanyId::new();
        let guard = locks.try_lock(company).unwrap();

        let other = locks.clone();
        let waiter = thread::spawn(move || other.lock(company, Duration::from_secs(5)).map(|g| g.company()));
        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert_eq!(waiter.join().unwrap(), Ok(company));
    }

    #[test]
    fn wait_times_out() {
        let locks = CompanyLocks::new();
        let company = CompanyId::new();
        let _guard = locks.try_lock(company).unwrap();

        assert!(matches!(
            locks.lock(company, Duration::from_millis(10)),
            Err(LockError::Busy(_))
        ));
    }
}
