//! Legacy mirror rows → ledger entries, text notes and transfers.
//!
//! The interpreter works header by header inside a transaction owned by the
//! caller. Every write is an upsert keyed by the ERP composite key, so running
//! it twice over the same headers leaves the same ledger behind.
//!
//! Header handling, in order:
//!
//! 1. excluded classes are ignored (neither emitted nor voided)
//! 2. void headers lose every entry, note and open dispatch
//! 3. headers on an unknown warehouse are skipped
//! 4. lines become entries or notes; unknown products are skipped
//! 5. transfer-class lines hand off to the transfer state machine
//! 6. entries of the header that were not re-emitted are deleted

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use kardex_core::{CompanyId, DetailKey, HeaderKey, ProductCode, ProductId, WarehouseCode, WarehouseId};
use kardex_inventory::quantity::normalize;
use kardex_inventory::{
    Direction, DocumentRules, EntryKey, HeaderRef, LedgerEntry, LegacyDetail, LegacyHeader, LineKind,
    SkippedLine, TextNote, TimeSource, Transfer, TransferState, Warehouse, classify_line, promote,
    truncate_gloss,
};

use crate::recompute::RecomputeOutbox;
use crate::store::{StoreResult, StoreTx};

/// Counters of one interpretation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterpretationReport {
    pub headers: usize,
    pub voided: usize,
    pub excluded: usize,
    pub skipped_headers: usize,
    pub entries: usize,
    pub notes: usize,
    pub skipped_lines: usize,
    pub transfers_dispatched: usize,
    pub transfers_received: usize,
    pub fallback_timestamps: usize,
}

/// Transfer whose state changed during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferChange {
    pub transfer: Transfer,
    pub previous: Option<TransferState>,
}

/// What a run leaves for the caller to do after commit.
#[derive(Debug, Default)]
pub struct Interpretation {
    pub report: InterpretationReport,
    pub outbox: RecomputeOutbox,
    pub transfer_changes: Vec<TransferChange>,
}

pub struct Interpreter<'r> {
    company: CompanyId,
    rules: &'r DocumentRules,
    match_window: Duration,
    warehouses: HashMap<WarehouseCode, Warehouse>,
    products: HashMap<ProductCode, ProductId>,
    done: Interpretation,
}

impl<'r> Interpreter<'r> {
    /// Preload the company catalog.
    pub fn load(
        tx: &mut dyn StoreTx,
        company: CompanyId,
        rules: &'r DocumentRules,
        match_window: Duration,
    ) -> StoreResult<Self> {
        let warehouses = tx
            .warehouses(company)?
            .into_iter()
            .map(|w| (w.code.clone(), w))
            .collect();
        let products = tx
            .products(company)?
            .into_iter()
            .map(|p| (p.code, p.id))
            .collect();
        Ok(Self {
            company,
            rules,
            match_window,
            warehouses,
            products,
            done: Interpretation::default(),
        })
    }

    pub fn report(&self) -> &InterpretationReport {
        &self.done.report
    }

    pub fn finish(self) -> Interpretation {
        self.done
    }

    fn warehouse(&self, code: &str) -> Option<&Warehouse> {
        let code = WarehouseCode::new(code).ok()?;
        self.warehouses.get(&code)
    }

    /// Interpret one header.
    pub fn interpret(&mut self, tx: &mut dyn StoreTx, header: &LegacyHeader) -> StoreResult<()> {
        self.done.report.headers += 1;

        if self.rules.is_excluded(header) {
            debug!(header = %header.key, "excluded document class");
            self.done.report.excluded += 1;
            return Ok(());
        }

        if self.rules.is_void(header) {
            return self.void_header(tx, &header.key);
        }

        let Some(warehouse) = self.warehouse(header.key.warehouse().as_str()).cloned() else {
            warn!(header = %header.key, warehouse = %header.key.warehouse(), "unknown warehouse, header skipped");
            self.done.report.skipped_headers += 1;
            return Ok(());
        };

        let details = tx.legacy_details(self.company, &header.key)?;
        let promoted = promote(header.document_date, header.time_of_day.as_deref());
        match promoted.source {
            TimeSource::TimeOfDay => {}
            TimeSource::Missing => self.done.report.fallback_timestamps += 1,
            TimeSource::Malformed => {
                warn!(
                    header = %header.key,
                    time_of_day = header.time_of_day.as_deref().unwrap_or_default(),
                    "malformed time of day, using midnight"
                );
                self.done.report.fallback_timestamps += 1;
            }
        }
        let document_date = promoted.at;
        let direction = self.rules.direction(header);
        let is_transfer = self.rules.is_transfer(header);

        let previous = tx.entries_by_header(self.company, &HeaderRef::Erp(header.key.clone()))?;
        for entry in &previous {
            self.done.outbox.add(entry.warehouse_id, entry.product_id);
        }

        tx.delete_notes_by_header(self.company, &header.key)?;

        let mut emitted: BTreeSet<EntryKey> = BTreeSet::new();
        let mut dispatched: BTreeSet<DetailKey> = BTreeSet::new();
        for detail in &details {
            let kind = classify_line(detail, |code| self.products.get(code).copied());
            let product = match kind {
                Ok(LineKind::Product(product)) => product,
                Ok(LineKind::Text { description, body }) => {
                    tx.upsert_note(&TextNote {
                        company_id: self.company,
                        key: detail.key.clone(),
                        document_date,
                        description,
                        body,
                    })?;
                    self.done.report.notes += 1;
                    continue;
                }
                Err(SkippedLine::UnknownProduct(code)) => {
                    warn!(detail = %detail.key, product = %code, "unknown product, line skipped");
                    self.done.report.skipped_lines += 1;
                    continue;
                }
            };

            let quantity = self.line_quantity(detail);
            let entry = self.erp_entry(header, detail, &warehouse, product, direction, quantity, document_date);
            tx.upsert_entry(&entry)?;
            self.done.outbox.add(entry.warehouse_id, entry.product_id);
            emitted.insert(entry.key.clone());
            self.done.report.entries += 1;

            if is_transfer {
                match direction {
                    Direction::Outbound => {
                        dispatched.insert(detail.key.clone());
                        self.dispatch(tx, header, detail, &warehouse, product, quantity, document_date)?;
                    }
                    Direction::Inbound => {
                        self.reception(tx, header, detail, &warehouse, product, quantity, document_date)?;
                    }
                }
            }
        }

        for stale in previous.iter().filter(|e| !emitted.contains(&e.key)) {
            tx.delete_entry(self.company, &stale.key)?;
            debug!(entry = %stale.key, "stale entry removed");
        }

        for transfer in tx.transfers_by_dispatch_header(self.company, &header.key)? {
            if !dispatched.contains(&transfer.dispatch_key) && transfer.is_in_transit() {
                tx.delete_transfer(self.company, transfer.id)?;
                self.done.outbox.extend(transfer.affected_pairs());
                info!(transfer_id = %transfer.id, dispatch = %transfer.dispatch_key, "dispatch line gone, transfer removed");
            }
        }

        Ok(())
    }

    /// Remove everything a void header had produced. Voiding twice is a no-op.
    ///
    /// Also used for headers that disappeared upstream.
    pub fn void_header(&mut self, tx: &mut dyn StoreTx, key: &HeaderKey) -> StoreResult<()> {
        self.done.report.voided += 1;

        let pairs = tx.delete_entries_by_header(self.company, &HeaderRef::Erp(key.clone()))?;
        let notes = tx.delete_notes_by_header(self.company, key)?;
        if !pairs.is_empty() || notes > 0 {
            info!(header = %key, entries = pairs.len(), notes, "void header removed from ledger");
        }
        self.done.outbox.extend(pairs);

        for transfer in tx.transfers_by_dispatch_header(self.company, key)? {
            if transfer.is_in_transit() {
                tx.delete_transfer(self.company, transfer.id)?;
                self.done.outbox.extend(transfer.affected_pairs());
                info!(transfer_id = %transfer.id, "open transfer of void dispatch removed");
            } else {
                warn!(
                    transfer_id = %transfer.id,
                    state = %transfer.state,
                    "dispatch voided after reception, transfer kept"
                );
            }
        }

        for mut transfer in tx.transfers_by_ingress_header(self.company, key)? {
            let previous = transfer.state;
            if !transfer.is_in_transit() {
                let inbound = transfer.revert(Utc::now())?;
                tx.delete_entry(self.company, &inbound)?;
            }
            transfer.unlink_ingress();
            tx.save_transfer(&transfer)?;
            self.done.outbox.extend(transfer.affected_pairs());
            info!(transfer_id = %transfer.id, "reception voided, transfer back in transit");
            if previous != transfer.state {
                self.done.transfer_changes.push(TransferChange {
                    transfer,
                    previous: Some(previous),
                });
            }
        }
        Ok(())
    }

    fn line_quantity(&self, detail: &LegacyDetail) -> Decimal {
        if detail.quantity < Decimal::ZERO {
            warn!(detail = %detail.key, quantity = %detail.quantity, "negative quantity, using its absolute value");
        }
        normalize(detail.quantity.abs())
    }

    #[allow(clippy::too_many_arguments)]
    fn erp_entry(
        &self,
        header: &LegacyHeader,
        detail: &LegacyDetail,
        warehouse: &Warehouse,
        product: ProductId,
        direction: Direction,
        quantity: Decimal,
        document_date: DateTime<Utc>,
    ) -> LedgerEntry {
        let reporting_warehouse_id = self
            .rules
            .reporting_warehouse(header)
            .and_then(|code| self.warehouse(code))
            .map(|w| w.id);

        LedgerEntry {
            company_id: self.company,
            key: EntryKey::Erp(detail.key.clone()),
            warehouse_id: warehouse.id,
            product_id: product,
            doc_type: header.key.doc_type().to_string(),
            doc_number: header.key.doc_number().to_string(),
            item: detail.key.item_number(),
            document_date,
            movement_date: header.updated_at.unwrap_or(document_date),
            is_inbound: direction.is_inbound(),
            quantity,
            unit_cost: normalize(detail.unit_price),
            line_value: normalize(detail.line_value),
            batch: detail.batch.clone(),
            series: detail.series.clone(),
            unit: detail.unit.clone(),
            erp_status: header.status.trim().to_string(),
            movement_subtype: header.movement_subtype.as_deref().map(|s| s.trim().to_string()),
            header_gloss: truncate_gloss(header.gloss.as_deref()),
            line_gloss: detail.gloss.clone(),
            reference_document: header.reference_number.clone(),
            reference_warehouse: header.reference_warehouse.clone(),
            purchase_order: header.purchase_order.clone(),
            counterpart_id: header.counterpart_code.clone(),
            counterpart_name: header.counterpart_name.clone(),
            supplier_id: header.supplier_code.clone(),
            supplier_name: header.supplier_name.clone(),
            is_import: header.is_import,
            import_id: header.import_number.clone(),
            transfer_reason: header.transfer_reason.clone(),
            delivery_address: header.delivery_address.clone(),
            reporting_warehouse_id,
        }
    }

    /// Destination of a dispatch: the referenced warehouse, else the series
    /// of the reference number.
    fn destination(&self, header: &LegacyHeader) -> Option<WarehouseId> {
        let by_reference = header
            .reference_warehouse
            .as_deref()
            .and_then(|code| self.warehouse(code));
        let by_series = || {
            header
                .reference_number
                .as_deref()
                .and_then(|n| self.rules.series_warehouse(n))
                .and_then(|code| self.warehouse(code))
        };
        by_reference.or_else(by_series).map(|w| w.id)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        tx: &mut dyn StoreTx,
        header: &LegacyHeader,
        detail: &LegacyDetail,
        origin: &Warehouse,
        product: ProductId,
        quantity: Decimal,
        dispatch_date: DateTime<Utc>,
    ) -> StoreResult<()> {
        let Some(destination) = self.destination(header) else {
            warn!(detail = %detail.key, "dispatch destination unknown, transfer skipped");
            return Ok(());
        };

        match tx.transfer_by_dispatch(self.company, &detail.key)? {
            Some(mut transfer) => {
                let previous = transfer.state;
                let old_pairs = transfer.affected_pairs();
                if transfer.update_dispatch(destination, quantity, dispatch_date) {
                    tx.save_transfer(&transfer)?;
                    self.done.outbox.extend(old_pairs);
                    self.done.outbox.extend(transfer.affected_pairs());
                    debug!(transfer_id = %transfer.id, "transfer dispatch updated");
                    if previous != transfer.state {
                        self.done.transfer_changes.push(TransferChange {
                            transfer,
                            previous: Some(previous),
                        });
                    }
                }
            }
            None => {
                let transfer = Transfer::dispatched(
                    self.company,
                    detail.key.clone(),
                    origin.id,
                    destination,
                    product,
                    quantity,
                    dispatch_date,
                )?;
                tx.save_transfer(&transfer)?;
                self.done.outbox.extend(transfer.affected_pairs());
                self.done.report.transfers_dispatched += 1;
                info!(transfer_id = %transfer.id, dispatch = %detail.key, quantity = %quantity, "transfer dispatched");
                self.done.transfer_changes.push(TransferChange {
                    transfer,
                    previous: None,
                });
            }
        }
        Ok(())
    }

    /// Transfer a reception line belongs to: already linked, referenced
    /// dispatch, then the oldest unlinked in-transit match.
    fn locate_transfer(
        &self,
        tx: &mut dyn StoreTx,
        header: &LegacyHeader,
        detail: &LegacyDetail,
        destination: WarehouseId,
        product: ProductId,
        quantity: Decimal,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Option<Transfer>> {
        if let Some(linked) = tx.transfer_by_ingress(self.company, &detail.key)? {
            return Ok(Some(linked));
        }
        if let Some(dispatch) = header.referenced_detail(detail.key.item_number())
            && let Some(referenced) = tx.transfer_by_dispatch(self.company, &dispatch)?
        {
            return Ok(Some(referenced));
        }
        let candidates = tx.transfer_candidates(
            self.company,
            product,
            destination,
            quantity,
            received_at - self.match_window,
            received_at,
        )?;
        Ok(candidates.into_iter().next())
    }

    #[allow(clippy::too_many_arguments)]
    fn reception(
        &mut self,
        tx: &mut dyn StoreTx,
        header: &LegacyHeader,
        detail: &LegacyDetail,
        destination: &Warehouse,
        product: ProductId,
        quantity: Decimal,
        received_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let located = self.locate_transfer(tx, header, detail, destination.id, product, quantity, received_at)?;
        let (mut transfer, created) = match located {
            Some(transfer) => (transfer, false),
            None => match self.referenced_transfer(header, detail, destination, product, quantity, received_at)? {
                Some(transfer) => (transfer, true),
                None => {
                    debug!(detail = %detail.key, "no transfer matches reception");
                    return Ok(());
                }
            },
        };

        if let Some(linked) = &transfer.ingress_detail
            && linked != &detail.key
        {
            warn!(
                transfer_id = %transfer.id,
                linked = %linked,
                detail = %detail.key,
                "transfer already linked to another reception"
            );
            return Ok(());
        }

        let previous = (!created).then_some(transfer.state);
        let was_linked = transfer.ingress_detail.is_some();
        if !was_linked {
            if !transfer.is_in_transit() {
                // received by hand before the ERP reception arrived
                tx.delete_entry(self.company, &EntryKey::Transfer(transfer.id))?;
            }
            transfer.link_ingress(detail.key.clone());
        }

        let changed = if transfer.is_in_transit() {
            transfer.receive(quantity, received_at, None)?;
            self.done.report.transfers_received += 1;
            info!(transfer_id = %transfer.id, detail = %detail.key, state = %transfer.state, "transfer received from ERP");
            true
        } else {
            transfer.update_reception(quantity) || !was_linked
        };

        if changed {
            tx.save_transfer(&transfer)?;
            self.done.outbox.extend(transfer.affected_pairs());
            if previous != Some(transfer.state) {
                self.done.transfer_changes.push(TransferChange {
                    transfer,
                    previous,
                });
            }
        }
        Ok(())
    }

    /// A reception naming a dispatch the ledger never saw: record the
    /// transfer for that dispatch key so the shipment is traceable.
    fn referenced_transfer(
        &self,
        header: &LegacyHeader,
        detail: &LegacyDetail,
        destination: &Warehouse,
        product: ProductId,
        quantity: Decimal,
        received_at: DateTime<Utc>,
    ) -> StoreResult<Option<Transfer>> {
        let Some(dispatch) = header.referenced_detail(detail.key.item_number()) else {
            return Ok(None);
        };
        let Some(origin) = self.warehouse(dispatch.header().warehouse().as_str()) else {
            warn!(detail = %detail.key, dispatch = %dispatch, "referenced dispatch warehouse unknown");
            return Ok(None);
        };
        let transfer = Transfer::dispatched(
            self.company,
            dispatch,
            origin.id,
            destination.id,
            product,
            quantity,
            received_at,
        )?;
        Ok(Some(transfer))
    }
}
