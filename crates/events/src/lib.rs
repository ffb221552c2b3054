//! Notification bus: per-company fan-out of sync progress and transfer changes.

pub mod bus;
pub mod company;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{BusError, NotificationBus, Subscription};
pub use company::CompanyScoped;
pub use in_memory_bus::InMemoryNotificationBus;
pub use notification::{Notification, NotificationPayload, SyncStatus, SyncUpdate, TransferChanged};
