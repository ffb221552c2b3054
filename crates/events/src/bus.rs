//! Publish/subscribe abstraction keyed by company (mechanics only).
//!
//! Every company has its own topic. Subscribers register for one company and
//! receive only that company's messages. Delivery is best effort: the bus never
//! buffers for absent subscribers and silently drops the ones that went away.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use kardex_core::CompanyId;

use crate::company::CompanyScoped;

/// A subscription to one company topic.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe(company_id);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(notification) => forward(notification),
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption. Dropping the
/// subscription unregisters it on the next publish to its topic.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Bus failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// Publish failed due to internal lock poisoning.
    #[error("notification bus lock poisoned")]
    Poisoned,
}

/// Topic-per-company broadcast channel.
///
/// `publish` routes by [`CompanyScoped::company_id`]. Publication failures are
/// surfaced to the caller, which is expected to log and carry on: notifications
/// are advisory and never part of a transaction.
pub trait NotificationBus<M>: Send + Sync
where
    M: CompanyScoped,
{
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self, company_id: CompanyId) -> Subscription<M>;
}

impl<M, B> NotificationBus<M> for Arc<B>
where
    M: CompanyScoped,
    B: NotificationBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self, company_id: CompanyId) -> Subscription<M> {
        (**self).subscribe(company_id)
    }
}
