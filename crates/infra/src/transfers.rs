//! Manual transfer operations: reception and reversal.
//!
//! Both run under the company lock in one transaction, then recompute the
//! origin and destination balances and publish the new state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument};

use kardex_core::{CompanyId, TransferId};
use kardex_events::Notification;
use kardex_inventory::quantity::normalize;
use kardex_inventory::rules::TRANSFER_SUBTYPE;
use kardex_inventory::{
    DocumentRules, LedgerEntry, LegacyDetail, LegacyHeader, Transfer, TransferError, Warehouse, promote,
    truncate_gloss,
};

use crate::locks::{CompanyLocks, LockError};
use crate::notify::{SharedBus, publish};
use crate::recompute::{RecomputeOutbox, StockRecomputer};
use crate::store::{SharedStore, StoreError, StoreResult, StoreTx};

/// How long a manual operation waits for a running sync to release the company.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TransferOpError {
    #[error("transfer {0} not found")]
    NotFound(TransferId),
    #[error(transparent)]
    State(#[from] TransferError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where the fields of an inbound entry come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceptionSource {
    /// The linked ERP reception line is mirrored locally.
    Found {
        header: Box<LegacyHeader>,
        detail: Box<LegacyDetail>,
    },
    /// No ERP counterpart yet; fields are made up from the transfer.
    Synthesized,
}

impl ReceptionSource {
    pub fn resolve(tx: &mut dyn StoreTx, transfer: &Transfer) -> StoreResult<Self> {
        let Some(key) = &transfer.ingress_detail else {
            return Ok(ReceptionSource::Synthesized);
        };
        let header = tx.legacy_header(transfer.company_id, key.header())?;
        let detail = tx.legacy_detail(transfer.company_id, key)?;
        Ok(match (header, detail) {
            (Some(header), Some(detail)) => ReceptionSource::Found {
                header: Box::new(header),
                detail: Box::new(detail),
            },
            _ => ReceptionSource::Synthesized,
        })
    }
}

/// Inbound entry materializing the reception of `transfer` at its destination.
pub fn inbound_entry(
    transfer: &Transfer,
    source: &ReceptionSource,
    origin: Option<&Warehouse>,
    received: Decimal,
    received_at: DateTime<Utc>,
) -> LedgerEntry {
    let origin_code = origin.map(|w| w.code.to_string());
    let mut entry = LedgerEntry {
        company_id: transfer.company_id,
        key: transfer.inbound_entry_key(),
        warehouse_id: transfer.destination_id,
        product_id: transfer.product_id,
        doc_type: "NI".into(),
        doc_number: format!("TR-{}", transfer.id),
        item: 1,
        document_date: received_at,
        movement_date: received_at,
        is_inbound: true,
        quantity: normalize(received),
        unit_cost: Decimal::ZERO,
        line_value: Decimal::ZERO,
        batch: None,
        series: None,
        unit: None,
        erp_status: "F".into(),
        movement_subtype: Some(TRANSFER_SUBTYPE.into()),
        header_gloss: Some(format!(
            "Transfer received from {}",
            origin_code.as_deref().unwrap_or("unknown warehouse")
        )),
        line_gloss: None,
        reference_document: Some(transfer.dispatch_header().to_string()),
        reference_warehouse: origin_code,
        purchase_order: None,
        counterpart_id: None,
        counterpart_name: None,
        supplier_id: None,
        supplier_name: None,
        is_import: false,
        import_id: None,
        transfer_reason: None,
        delivery_address: None,
        reporting_warehouse_id: None,
    };

    if let ReceptionSource::Found { header, detail } = source {
        entry.doc_type = header.key.doc_type().to_string();
        entry.doc_number = header.key.doc_number().to_string();
        entry.item = detail.key.item_number();
        entry.document_date = promote(header.document_date, header.time_of_day.as_deref()).at;
        entry.movement_date = header.updated_at.unwrap_or(entry.document_date);
        entry.unit_cost = normalize(detail.unit_price);
        entry.line_value = normalize(detail.line_value);
        entry.batch = detail.batch.clone();
        entry.series = detail.series.clone();
        entry.unit = detail.unit.clone();
        entry.erp_status = header.status.trim().to_string();
        entry.header_gloss = truncate_gloss(header.gloss.as_deref()).or(entry.header_gloss);
        entry.line_gloss = detail.gloss.clone();
        entry.counterpart_id = header.counterpart_code.clone();
        entry.counterpart_name = header.counterpart_name.clone();
        entry.transfer_reason = header.transfer_reason.clone();
    }
    entry
}

#[derive(Clone)]
pub struct TransferService {
    store: SharedStore,
    recomputer: StockRecomputer,
    locks: CompanyLocks,
    bus: SharedBus,
    lock_wait: Duration,
}

impl TransferService {
    pub fn new(store: SharedStore, rules: Arc<DocumentRules>, locks: CompanyLocks, bus: SharedBus) -> Self {
        Self {
            recomputer: StockRecomputer::new(store.clone(), rules),
            store,
            locks,
            bus,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// `IN_TRANSIT` → received state, materializing the inbound entry.
    #[instrument(skip(self, notes), fields(company = %company, transfer_id = %id), err)]
    pub fn receive(
        &self,
        company: CompanyId,
        id: TransferId,
        received: Decimal,
        notes: Option<String>,
    ) -> Result<Transfer, TransferOpError> {
        let _guard = self.locks.lock(company, self.lock_wait)?;
        let now = Utc::now();

        let mut tx = self.store.begin()?;
        let mut transfer = tx.transfer(company, id)?.ok_or(TransferOpError::NotFound(id))?;
        let outcome = transfer.receive(received, now, notes)?;
        if outcome.needs_inbound_entry() {
            let source = ReceptionSource::resolve(&mut *tx, &transfer)?;
            let origin = tx.warehouse(company, transfer.origin_id)?;
            let entry = inbound_entry(&transfer, &source, origin.as_ref(), outcome.quantity_received, now);
            tx.upsert_entry(&entry)?;
        }
        tx.save_transfer(&transfer)?;
        tx.commit()?;

        info!(state = %transfer.state, received = %outcome.quantity_received, diff = %outcome.quantity_diff, "transfer received");
        self.after_commit(&transfer)?;
        Ok(transfer)
    }

    /// Any received state → `IN_TRANSIT`, deleting the inbound entry.
    #[instrument(skip(self), fields(company = %company, transfer_id = %id), err)]
    pub fn revert(&self, company: CompanyId, id: TransferId) -> Result<Transfer, TransferOpError> {
        let _guard = self.locks.lock(company, self.lock_wait)?;

        let mut tx = self.store.begin()?;
        let mut transfer = tx.transfer(company, id)?.ok_or(TransferOpError::NotFound(id))?;
        let inbound = transfer.revert(Utc::now())?;
        tx.delete_entry(company, &inbound)?;
        tx.save_transfer(&transfer)?;
        tx.commit()?;

        info!(entry = %inbound, "transfer reception reverted");
        self.after_commit(&transfer)?;
        Ok(transfer)
    }

    fn after_commit(&self, transfer: &Transfer) -> StoreResult<()> {
        let outbox: RecomputeOutbox = transfer.affected_pairs().into_iter().collect();
        self.recomputer.drain(transfer.company_id, outbox)?;
        publish(
            &self.bus,
            Notification::transfer(transfer.company_id, transfer.id, transfer.state.as_str()),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kardex_core::{DetailKey, HeaderKey, ProductCode, ProductId, WarehouseCode, WarehouseId};
    use kardex_events::{NotificationBus, NotificationPayload};
    use kardex_inventory::{Company, EntryKey, Product, TransferState};

    use crate::notify::in_memory_bus;
    use crate::store::{InMemoryWarehouseStore, WarehouseStore};

    struct Fixture {
        store: Arc<InMemoryWarehouseStore>,
        service: TransferService,
        bus: SharedBus,
        locks: CompanyLocks,
        company: CompanyId,
        al: WarehouseId,
        aa: WarehouseId,
        product: ProductId,
        transfer: TransferId,
    }

    fn fixture(sent: i64) -> Fixture {
        let store = InMemoryWarehouseStore::arc();
        let company = Company::new("acme", "Acme");
        let al = Warehouse::new(company.id, WarehouseCode::new("AL").unwrap(), "Main");
        let aa = Warehouse::new(company.id, WarehouseCode::new("AA").unwrap(), "Annex");
        let product = Product::new(company.id, ProductCode::new("P-3").unwrap(), "Widget");
        let transfer = Transfer::dispatched(
            company.id,
            DetailKey::new("AL", "GS", "000200", 1).unwrap(),
            al.id,
            aa.id,
            product.id,
            Decimal::from(sent),
            Utc.with_ymd_and_hms(2025, 9, 1, 9, 0, 0).unwrap(),
        )
        .unwrap();
        let mut tx = store.begin().unwrap();
        tx.upsert_company(&company).unwrap();
        tx.upsert_warehouse(&al).unwrap();
        tx.upsert_warehouse(&aa).unwrap();
        tx.upsert_product(&product).unwrap();
        tx.save_transfer(&transfer).unwrap();
        tx.commit().unwrap();

        let bus = in_memory_bus();
        let locks = CompanyLocks::new();
        let service = TransferService::new(
            store.clone(),
            Arc::new(DocumentRules::default()),
            locks.clone(),
            bus.clone(),
        )
        .with_lock_wait(Duration::from_millis(10));
        Fixture {
            store,
            service,
            bus,
            locks,
            company: company.id,
            al: al.id,
            aa: aa.id,
            product: product.id,
            transfer: transfer.id,
        }
    }

    #[test]
    fn partial_reception_creates_synthetic_entry() {
        let f = fixture(80);
        let events = f.bus.subscribe(f.company);

        let transfer = f.service.receive(f.company, f.transfer, Decimal::from(75), None).unwrap();
        assert_eq!(transfer.state, TransferState::ReceivedPartial);
        assert_eq!(transfer.quantity_diff, Some(Decimal::from(-5)));

        let mut tx = f.store.begin().unwrap();
        let entry = tx.entry(f.company, &EntryKey::Transfer(f.transfer)).unwrap().unwrap();
        assert_eq!(entry.warehouse_id, f.aa);
        assert_eq!(entry.quantity, Decimal::from(75));
        assert_eq!(entry.header_gloss.as_deref(), Some("Transfer received from AL"));
        assert_eq!(entry.reference_document.as_deref(), Some("AL-GS-000200"));
        let aa = tx.balance(f.company, f.aa, f.product).unwrap().unwrap();
        assert_eq!(aa.current, Decimal::from(75));
        let al = tx.balance(f.company, f.al, f.product).unwrap().unwrap();
        assert_eq!(al.in_transit, Decimal::ZERO);
        drop(tx);

        let published = events.drain();
        assert!(matches!(
            &published[..],
            [n] if matches!(&n.payload, NotificationPayload::Transfer(t) if t.state == "RECEIVED_PARTIAL")
        ));
    }

    #[test]
    fn revert_removes_entry_and_restores_in_transit() {
        let f = fixture(80);
        f.service.receive(f.company, f.transfer, Decimal::from(75), None).unwrap();

        let transfer = f.service.revert(f.company, f.transfer).unwrap();
        assert_eq!(transfer.state, TransferState::InTransit);

        let mut tx = f.store.begin().unwrap();
        assert!(tx.entry(f.company, &EntryKey::Transfer(f.transfer)).unwrap().is_none());
        let al = tx.balance(f.company, f.al, f.product).unwrap().unwrap();
        assert_eq!(al.in_transit, Decimal::from(80));
        let aa = tx.balance(f.company, f.aa, f.product).unwrap().unwrap();
        assert_eq!(aa.current, Decimal::ZERO);
    }

    #[test]
    fn lost_reception_has_no_entry() {
        let f = fixture(10);
        let transfer = f.service.receive(f.company, f.transfer, Decimal::ZERO, None).unwrap();
        assert_eq!(transfer.state, TransferState::Lost);

        let mut tx = f.store.begin().unwrap();
        assert!(tx.entry(f.company, &EntryKey::Transfer(f.transfer)).unwrap().is_none());
    }

    #[test]
    fn precondition_and_lookup_failures() {
        let f = fixture(10);
        assert!(matches!(
            f.service.revert(f.company, f.transfer),
            Err(TransferOpError::State(TransferError::AlreadyInTransit { .. }))
        ));
        assert!(matches!(
            f.service.receive(f.company, TransferId::new(), Decimal::ONE, None),
            Err(TransferOpError::NotFound(_))
        ));
    }

    #[test]
    fn busy_company_is_rejected() {
        let f = fixture(10);
        let _sync = f.locks.try_lock(f.company).unwrap();
        assert!(matches!(
            f.service.receive(f.company, f.transfer, Decimal::ONE, None),
            Err(TransferOpError::Lock(LockError::Busy(_)))
        ));
    }

    #[test]
    fn linked_reception_uses_erp_fields() {
        let f = fixture(5);
        let key = HeaderKey::new("AA", "NI", "000777").unwrap();
        let mut header = LegacyHeader::new(key.clone(), Utc.with_ymd_and_hms(2025, 9, 3, 0, 0, 0).unwrap(), "F");
        header.time_of_day = Some("08:30:00".into());
        header.updated_at = Some(Utc.with_ymd_and_hms(2025, 9, 4, 10, 0, 0).unwrap());
        let detail = LegacyDetail::new(key.item(1), "P-3", Decimal::from(5));
        let mut tx = f.store.begin().unwrap();
        tx.upsert_legacy_header(f.company, &header).unwrap();
        tx.replace_legacy_details(f.company, &key, std::slice::from_ref(&detail)).unwrap();
        let mut transfer = tx.transfer(f.company, f.transfer).unwrap().unwrap();
        transfer.link_ingress(detail.key.clone());
        tx.save_transfer(&transfer).unwrap();
        tx.commit().unwrap();

        f.service.receive(f.company, f.transfer, Decimal::from(5), None).unwrap();

        let mut tx = f.store.begin().unwrap();
        let entry = tx.entry(f.company, &EntryKey::Erp(detail.key.clone())).unwrap().unwrap();
        assert_eq!(entry.doc_number, "000777");
        assert_eq!(entry.document_date, Utc.with_ymd_and_hms(2025, 9, 3, 8, 30, 0).unwrap());
        assert_eq!(entry.movement_date, Utc.with_ymd_and_hms(2025, 9, 4, 10, 0, 0).unwrap());
    }

    #[test]
    fn erp_reception_without_update_stamp_moves_on_its_document_date() {
        let f = fixture(5);
        let mut tx = f.store.begin().unwrap();
        let transfer = tx.transfer(f.company, f.transfer).unwrap().unwrap();
        drop(tx);

        let key = HeaderKey::new("AA", "NI", "000778").unwrap();
        let mut header = LegacyHeader::new(key.clone(), Utc.with_ymd_and_hms(2025, 9, 3, 0, 0, 0).unwrap(), "F");
        header.time_of_day = Some("14:15:00".into());
        let source = ReceptionSource::Found {
            detail: Box::new(LegacyDetail::new(key.item(1), "P-3", Decimal::from(5))),
            header: Box::new(header),
        };
        let received_at = Utc.with_ymd_and_hms(2025, 9, 20, 0, 0, 0).unwrap();

        let entry = inbound_entry(&transfer, &source, None, Decimal::from(5), received_at);
        let document = Utc.with_ymd_and_hms(2025, 9, 3, 14, 15, 0).unwrap();
        assert_eq!(entry.document_date, document);
        assert_eq!(entry.movement_date, document);

        let synthetic = inbound_entry(&transfer, &ReceptionSource::Synthesized, None, Decimal::from(5), received_at);
        assert_eq!(synthetic.movement_date, received_at);
    }
}
