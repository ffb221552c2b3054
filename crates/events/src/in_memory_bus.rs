//! In-process notification bus.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use kardex_core::CompanyId;

use crate::bus::{BusError, NotificationBus, Subscription};
use crate::company::CompanyScoped;

/// In-memory pub/sub bus with one topic per company.
///
/// - No IO / no async
/// - Best-effort fan-out
/// - Dead subscribers are pruned while publishing
#[derive(Debug)]
pub struct InMemoryNotificationBus<M> {
    topics: Mutex<HashMap<CompanyId, Vec<mpsc::Sender<M>>>>,
}

impl<M> InMemoryNotificationBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers registered for `company_id`.
    pub fn subscriber_count(&self, company_id: CompanyId) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(&company_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl<M> Default for InMemoryNotificationBus<M> {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl<M> NotificationBus<M> for InMemoryNotificationBus<M>
where
    M: CompanyScoped + Clone + Send + 'static,
{
    type Error = BusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut topics = self.topics.lock().map_err(|_| BusError::Poisoned)?;
        let company_id = message.company_id();

        if let Some(subs) = topics.get_mut(&company_id) {
            // Drop any dead subscribers while publishing.
            let before = subs.len();
            subs.retain(|tx| tx.send(message.clone()).is_ok());
            if subs.len() < before {
                tracing::debug!(company = %company_id, dropped = before - subs.len(), "pruned subscribers");
            }
            if subs.is_empty() {
                topics.remove(&company_id);
            }
        }

        Ok(())
    }

    fn subscribe(&self, company_id: CompanyId) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut topics) = self.topics.lock() {
            topics.entry(company_id).or_default().push(tx);
        }

        Subscription::new(rx)
    }
}
