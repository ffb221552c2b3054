//! Messages carried on the notification bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kardex_core::{CompanyId, TransferId};

use crate::company::CompanyScoped;

/// Lifecycle of a sync cycle as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Started,
    #[serde(rename = "running_phase_1")]
    RunningPhase1,
    #[serde(rename = "running_phase_2")]
    RunningPhase2,
    #[serde(rename = "running_phase_3")]
    RunningPhase3,
    Finished,
    Failed,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Finished | SyncStatus::Failed)
    }
}

/// Progress record published at phase boundaries and every few headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub status: SyncStatus,
    pub message: String,
    /// Always within `0..=100`.
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl SyncUpdate {
    pub fn new(status: SyncStatus, message: impl Into<String>, progress_percent: u8) -> Self {
        Self {
            status,
            message: message.into(),
            progress_percent: progress_percent.min(100),
            result: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// A transfer changed state (manual reception, reversal or ERP reception).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChanged {
    pub transfer_id: TransferId,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    Sync(SyncUpdate),
    Transfer(TransferChanged),
}

/// Envelope published on a company topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub company_id: CompanyId,
    pub emitted_at: DateTime<Utc>,
    pub payload: NotificationPayload,
}

impl Notification {
    pub fn sync(company_id: CompanyId, update: SyncUpdate) -> Self {
        Self {
            company_id,
            emitted_at: Utc::now(),
            payload: NotificationPayload::Sync(update),
        }
    }

    pub fn transfer(company_id: CompanyId, transfer_id: TransferId, state: impl Into<String>) -> Self {
        Self {
            company_id,
            emitted_at: Utc::now(),
            payload: NotificationPayload::Transfer(TransferChanged {
                transfer_id,
                state: state.into(),
            }),
        }
    }

    /// The sync progress carried by this notification, if any.
    pub fn as_sync(&self) -> Option<&SyncUpdate> {
        match &self.payload {
            NotificationPayload::Sync(update) => Some(update),
            NotificationPayload::Transfer(_) => None,
        }
    }
}

impl CompanyScoped for Notification {
    fn company_id(&self) -> CompanyId {
        self.company_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped() {
        let update = SyncUpdate::new(SyncStatus::RunningPhase3, "interpreting", 250);
        assert_eq!(update.progress_percent, 100);
    }

    #[test]
    fn status_uses_wire_names() {
        let json = serde_json::to_value(SyncStatus::RunningPhase2).unwrap();
        assert_eq!(json, serde_json::json!("running_phase_2"));
    }

    #[test]
    fn sync_payload_serializes_with_kind_tag() {
        let n = Notification::sync(
            CompanyId::new(),
            SyncUpdate::new(SyncStatus::Finished, "done", 100)
                .with_result(serde_json::json!({"headers": 3})),
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["payload"]["kind"], "sync");
        assert_eq!(json["payload"]["result"]["headers"], 3);
    }
}
