//! Publishing to the notification bus.

use std::sync::Arc;

use tracing::warn;

use kardex_events::{BusError, InMemoryNotificationBus, Notification, NotificationBus};

pub type SharedBus = Arc<dyn NotificationBus<Notification, Error = BusError>>;

pub fn in_memory_bus() -> SharedBus {
    Arc::new(InMemoryNotificationBus::<Notification>::new())
}

/// Best-effort publish; failures are logged and swallowed.
pub fn publish(bus: &SharedBus, notification: Notification) {
    let company = notification.company_id;
    if let Err(err) = bus.publish(notification) {
        warn!(company = %company, error = ?err, "notification dropped");
    }
}
