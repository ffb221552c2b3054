//! Inter-warehouse shipment lifecycle.
//!
//! ```text
//!               receive(q)
//! IN_TRANSIT ───────────────► RECEIVED | RECEIVED_PARTIAL | RECEIVED_SURPLUS | LOST
//!     ▲                                        │
//!     └──────────────── revert() ──────────────┘
//! ```
//!
//! The state machine is pure: persisting the transfer, materializing the
//! inbound ledger entry and scheduling stock recomputation are the caller's job.

use core::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use kardex_core::{
    CompanyId, DetailKey, DomainError, DomainResult, Entity, HeaderKey, ProductId, TransferId,
    WarehouseId,
};

use crate::ledger::EntryKey;
use crate::quantity::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    InTransit,
    Received,
    ReceivedPartial,
    ReceivedSurplus,
    Lost,
}

impl TransferState {
    pub const ALL: [TransferState; 5] = [
        TransferState::InTransit,
        TransferState::Received,
        TransferState::ReceivedPartial,
        TransferState::ReceivedSurplus,
        TransferState::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::InTransit => "IN_TRANSIT",
            TransferState::Received => "RECEIVED",
            TransferState::ReceivedPartial => "RECEIVED_PARTIAL",
            TransferState::ReceivedSurplus => "RECEIVED_SURPLUS",
            TransferState::Lost => "LOST",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s.trim())
            .ok_or_else(|| DomainError::validation(format!("unknown transfer state: {s}")))
    }

    /// States that put goods on the destination's shelf.
    pub fn has_inbound_entry(&self) -> bool {
        matches!(
            self,
            TransferState::Received | TransferState::ReceivedPartial | TransferState::ReceivedSurplus
        )
    }

    /// Outcome of receiving `received` out of `sent`.
    pub fn classify(sent: Decimal, received: Decimal) -> Self {
        if received <= Decimal::ZERO {
            TransferState::Lost
        } else if received == sent {
            TransferState::Received
        } else if received < sent {
            TransferState::ReceivedPartial
        } else {
            TransferState::ReceivedSurplus
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer {id} cannot be received from state {state}")]
    NotInTransit { id: TransferId, state: TransferState },
    #[error("transfer {id} is already in transit")]
    AlreadyInTransit { id: TransferId },
}

impl From<TransferError> for DomainError {
    fn from(value: TransferError) -> Self {
        DomainError::precondition(value.to_string())
    }
}

/// What a successful `receive` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionOutcome {
    pub state: TransferState,
    pub quantity_received: Decimal,
    pub quantity_diff: Decimal,
}

impl ReceptionOutcome {
    pub fn needs_inbound_entry(&self) -> bool {
        self.state.has_inbound_entry()
    }
}

/// One shipment, identified by the dispatch line that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub company_id: CompanyId,
    pub dispatch_key: DetailKey,
    pub origin_id: WarehouseId,
    pub destination_id: WarehouseId,
    pub product_id: ProductId,
    pub quantity_sent: Decimal,
    pub quantity_received: Option<Decimal>,
    pub quantity_diff: Option<Decimal>,
    pub state: TransferState,
    pub dispatch_date: DateTime<Utc>,
    pub reception_date: Option<DateTime<Utc>>,
    pub ingress_header: Option<HeaderKey>,
    pub ingress_detail: Option<DetailKey>,
    pub notes: Option<String>,
}

impl Transfer {
    pub fn dispatched(
        company_id: CompanyId,
        dispatch_key: DetailKey,
        origin_id: WarehouseId,
        destination_id: WarehouseId,
        product_id: ProductId,
        quantity_sent: Decimal,
        dispatch_date: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity_sent < Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "quantity sent must not be negative: {quantity_sent}"
            )));
        }
        Ok(Self {
            id: TransferId::new(),
            company_id,
            dispatch_key,
            origin_id,
            destination_id,
            product_id,
            quantity_sent: normalize(quantity_sent),
            quantity_received: None,
            quantity_diff: None,
            state: TransferState::InTransit,
            dispatch_date,
            reception_date: None,
            ingress_header: None,
            ingress_detail: None,
            notes: None,
        })
    }

    pub fn is_in_transit(&self) -> bool {
        self.state == TransferState::InTransit
    }

    pub fn dispatch_header(&self) -> &HeaderKey {
        self.dispatch_key.header()
    }

    /// `IN_TRANSIT` → one of the received states.
    pub fn receive(
        &mut self,
        received: Decimal,
        at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<ReceptionOutcome, TransferError> {
        if !self.is_in_transit() {
            return Err(TransferError::NotInTransit {
                id: self.id,
                state: self.state,
            });
        }

        let received = normalize(received);
        let diff = received - self.quantity_sent;
        self.state = TransferState::classify(self.quantity_sent, received);
        self.quantity_received = Some(received);
        self.quantity_diff = Some(diff);
        self.reception_date = Some(at);
        self.notes = notes;

        Ok(ReceptionOutcome {
            state: self.state,
            quantity_received: received,
            quantity_diff: diff,
        })
    }

    /// Any received state → `IN_TRANSIT`, clearing the reception.
    ///
    /// Returns the key of the inbound entry the reception had created, which
    /// the caller must delete.
    pub fn revert(&mut self, at: DateTime<Utc>) -> Result<EntryKey, TransferError> {
        if self.is_in_transit() {
            return Err(TransferError::AlreadyInTransit { id: self.id });
        }

        let entry = self.inbound_entry_key();
        self.state = TransferState::InTransit;
        self.quantity_received = None;
        self.quantity_diff = None;
        self.reception_date = None;
        self.notes = Some(format!("Reception reverted at {}", at.to_rfc3339()));
        Ok(entry)
    }

    /// Apply a re-read of the dispatch line. A received transfer keeps its
    /// received quantity and re-derives its outcome from the new quantity sent.
    ///
    /// Returns whether anything changed.
    pub fn update_dispatch(
        &mut self,
        destination_id: WarehouseId,
        quantity_sent: Decimal,
        dispatch_date: DateTime<Utc>,
    ) -> bool {
        let quantity_sent = normalize(quantity_sent.max(Decimal::ZERO));
        let changed = self.destination_id != destination_id
            || self.quantity_sent != quantity_sent
            || self.dispatch_date != dispatch_date;

        self.destination_id = destination_id;
        self.quantity_sent = quantity_sent;
        self.dispatch_date = dispatch_date;

        if let Some(received) = self.quantity_received {
            self.quantity_diff = Some(received - quantity_sent);
            self.state = TransferState::classify(quantity_sent, received);
        }
        changed
    }

    /// Apply a re-read of the reception line to an already received transfer.
    ///
    /// Returns whether anything changed. In-transit transfers are untouched.
    pub fn update_reception(&mut self, received: Decimal) -> bool {
        if self.is_in_transit() {
            return false;
        }
        let received = normalize(received);
        if self.quantity_received == Some(received) {
            return false;
        }
        self.state = TransferState::classify(self.quantity_sent, received);
        self.quantity_received = Some(received);
        self.quantity_diff = Some(received - self.quantity_sent);
        true
    }

    /// Record the ERP reception line matched to this transfer.
    pub fn link_ingress(&mut self, detail: DetailKey) {
        self.ingress_header = Some(detail.header().clone());
        self.ingress_detail = Some(detail);
    }

    /// Forget the ERP reception line, e.g. after that document was voided.
    pub fn unlink_ingress(&mut self) {
        self.ingress_header = None;
        self.ingress_detail = None;
    }

    /// Key of the inbound ledger entry a reception materializes.
    pub fn inbound_entry_key(&self) -> EntryKey {
        match &self.ingress_detail {
            Some(detail) => EntryKey::Erp(detail.clone()),
            None => EntryKey::Transfer(self.id),
        }
    }

    /// `(warehouse, product)` pairs whose balances depend on this transfer.
    pub fn affected_pairs(&self) -> [(WarehouseId, ProductId); 2] {
        [
            (self.origin_id, self.product_id),
            (self.destination_id, self.product_id),
        ]
    }
}

impl Entity for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn transfer(sent: i64) -> Transfer {
        Transfer::dispatched(
            CompanyId::new(),
            DetailKey::new("AL", "GS", "000200", 1).unwrap(),
            WarehouseId::new(),
            WarehouseId::new(),
            ProductId::new(),
            Decimal::from(sent),
            Utc.with_ymd_and_hms(2025, 9, 1, 9, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 2, 15, 0, 0).unwrap()
    }

    #[test]
    fn outcomes_follow_received_quantity() {
        let cases = [
            (80, TransferState::Received),
            (75, TransferState::ReceivedPartial),
            (90, TransferState::ReceivedSurplus),
            (0, TransferState::Lost),
            (-3, TransferState::Lost),
        ];
        for (received, expected) in cases {
            let mut t = transfer(80);
            let outcome = t.receive(Decimal::from(received), at(), None).unwrap();
            assert_eq!(outcome.state, expected, "received {received}");
            assert_eq!(t.state, expected);
        }
    }

    #[test]
    fn partial_reception_records_diff() {
        let mut t = transfer(80);
        let outcome = t
            .receive(Decimal::from(75), at(), Some("box damaged".into()))
            .unwrap();
        assert_eq!(outcome.quantity_diff, Decimal::from(-5));
        assert_eq!(t.quantity_received, Some(Decimal::from(75)));
        assert_eq!(t.reception_date, Some(at()));
        assert_eq!(t.notes.as_deref(), Some("box damaged"));
        assert!(outcome.needs_inbound_entry());
    }

    #[test]
    fn lost_needs_no_inbound_entry() {
        let mut t = transfer(80);
        let outcome = t.receive(Decimal::ZERO, at(), None).unwrap();
        assert!(!outcome.needs_inbound_entry());
    }

    #[test]
    fn receive_twice_is_rejected() {
        let mut t = transfer(80);
        t.receive(Decimal::from(80), at(), None).unwrap();
        let err = t.receive(Decimal::from(80), at(), None).unwrap_err();
        assert!(matches!(
            err,
            TransferError::NotInTransit {
                state: TransferState::Received,
                ..
            }
        ));
    }

    #[test]
    fn revert_from_in_transit_is_rejected() {
        let mut t = transfer(80);
        assert!(matches!(
            t.revert(at()),
            Err(TransferError::AlreadyInTransit { .. })
        ));
    }

    #[test]
    fn revert_returns_the_entry_to_delete() {
        let mut t = transfer(80);
        t.receive(Decimal::from(75), at(), None).unwrap();
        assert_eq!(t.revert(at()).unwrap(), EntryKey::Transfer(t.id));

        let ingress = DetailKey::new("AA", "NI", "000777", 1).unwrap();
        t.link_ingress(ingress.clone());
        t.receive(Decimal::from(80), at(), None).unwrap();
        assert_eq!(t.revert(at()).unwrap(), EntryKey::Erp(ingress));
        assert!(t.is_in_transit());
        assert!(t.quantity_received.is_none());
        assert!(t.quantity_diff.is_none());
        assert!(t.reception_date.is_none());
        assert!(t.notes.as_deref().unwrap().starts_with("Reception reverted at"));
    }

    #[test]
    fn dispatch_update_reclassifies_received_transfer() {
        let mut t = transfer(80);
        t.receive(Decimal::from(75), at(), None).unwrap();
        let destination = t.destination_id;
        let date = t.dispatch_date;

        assert!(t.update_dispatch(destination, Decimal::from(75), date));
        assert_eq!(t.state, TransferState::Received);
        assert_eq!(t.quantity_diff, Some(Decimal::ZERO));
        assert!(!t.update_dispatch(destination, Decimal::from(75), date));
    }

    #[test]
    fn reception_update_only_touches_received_transfers() {
        let mut t = transfer(80);
        assert!(!t.update_reception(Decimal::from(70)));
        assert!(t.is_in_transit());

        t.receive(Decimal::from(80), at(), None).unwrap();
        assert!(!t.update_reception(Decimal::from(80)));
        assert!(t.update_reception(Decimal::from(70)));
        assert_eq!(t.state, TransferState::ReceivedPartial);
        assert_eq!(t.quantity_diff, Some(Decimal::from(-10)));
    }

    #[test]
    fn negative_dispatch_is_rejected() {
        let result = Transfer::dispatched(
            CompanyId::new(),
            DetailKey::new("AL", "GS", "1", 1).unwrap(),
            WarehouseId::new(),
            WarehouseId::new(),
            ProductId::new(),
            Decimal::from(-1),
            at(),
        );
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn states_round_trip_through_strings() {
        for state in TransferState::ALL {
            assert_eq!(TransferState::parse(state.as_str()).unwrap(), state);
        }
        assert!(TransferState::parse("SHIPPED").is_err());
    }

    proptest! {
        #[test]
        fn received_equals_sent_plus_diff(sent in 0i64..1_000_000, received in -1_000i64..1_000_000, scale in 0u32..=6) {
            let mut t = transfer(0);
            t.quantity_sent = Decimal::new(sent, scale);
            let received = Decimal::new(received, scale);
            t.receive(received, at(), None).unwrap();
            prop_assert_eq!(
                t.quantity_received.unwrap(),
                t.quantity_sent + t.quantity_diff.unwrap()
            );
        }

        #[test]
        fn receive_then_revert_restores_in_transit(sent in 1i64..10_000, received in 0i64..20_000) {
            let mut t = transfer(sent);
            let before = t.clone();
            t.receive(Decimal::from(received), at(), None).unwrap();
            t.revert(at()).unwrap();
            prop_assert_eq!(t.state, TransferState::InTransit);
            prop_assert_eq!(t.quantity_sent, before.quantity_sent);
            prop_assert!(t.quantity_received.is_none());
        }
    }
}
