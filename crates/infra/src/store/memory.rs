//! In-memory warehouse store for tests/dev.
//!
//! A transaction holds the store lock for its whole life and works on a copy
//! of the state; `commit` swaps the copy in, dropping discards it.
//!
//! Every transaction and read is therefore serialized across all companies:
//! while one company's phase 3 runs, other companies' syncs and all queries
//! wait, even though their [`CompanyLocks`](crate::locks::CompanyLocks) do not
//! contend. Each `begin` copies the whole state, so a phase 1 with one
//! transaction per header costs O(n²) in the mirror size. Fine for tests and
//! small fixtures; use the Postgres store for real volumes.
//!
//! Never hold two transactions on one thread: the second `begin` deadlocks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use kardex_core::{
    CompanyId, DetailKey, HeaderKey, ProductCode, ProductId, TransferId, WarehouseCode, WarehouseId,
};
use kardex_inventory::{
    Company, EntryKey, HeaderRef, HeaderStatus, LedgerEntry, LedgerLine, LegacyDetail, LegacyHeader,
    Product, StockBalance, TextNote, Transfer, TransferState, Warehouse,
};

use super::{
    MovementFilter, Page, Pagination, StockFilter, StockKey, StoreError, StoreResult, StoreTx,
    SyncControl, TransferFilter, WarehouseStore,
};

#[derive(Debug, Clone, Default)]
struct State {
    companies: BTreeMap<CompanyId, Company>,
    warehouses: BTreeMap<WarehouseId, Warehouse>,
    products: BTreeMap<ProductId, Product>,
    sync: BTreeMap<CompanyId, SyncControl>,
    headers: BTreeMap<(CompanyId, HeaderKey), LegacyHeader>,
    details: BTreeMap<(CompanyId, DetailKey), LegacyDetail>,
    entries: BTreeMap<(CompanyId, EntryKey), LedgerEntry>,
    notes: BTreeMap<(CompanyId, DetailKey), TextNote>,
    transfers: BTreeMap<TransferId, Transfer>,
    balances: BTreeMap<(CompanyId, WarehouseId, ProductId), StockBalance>,
}

impl State {
    fn company_entries(&self, company: CompanyId) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .iter()
            .filter(move |((c, _), _)| *c == company)
            .map(|(_, e)| e)
    }

    fn company_transfers(&self, company: CompanyId) -> impl Iterator<Item = &Transfer> {
        self.transfers.values().filter(move |t| t.company_id == company)
    }
}

/// In-memory implementation of [`WarehouseStore`].
#[derive(Debug, Default)]
pub struct InMemoryWarehouseStore {
    state: Mutex<State>,
}

impl InMemoryWarehouseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl WarehouseStore for InMemoryWarehouseStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        let guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx { guard, working }))
    }
}

struct InMemoryTx<'a> {
    guard: MutexGuard<'a, State>,
    working: State,
}

fn pair_of(entry: &LedgerEntry) -> StockKey {
    (entry.warehouse_id, entry.product_id)
}

impl StoreTx for InMemoryTx<'_> {
    fn company(&mut self, id: CompanyId) -> StoreResult<Option<Company>> {
        Ok(self.working.companies.get(&id).cloned())
    }

    fn company_by_alias(&mut self, alias: &str) -> StoreResult<Option<Company>> {
        let alias = alias.trim();
        Ok(self
            .working
            .companies
            .values()
            .find(|c| c.alias == alias)
            .cloned())
    }

    fn upsert_company(&mut self, company: &Company) -> StoreResult<()> {
        if self
            .working
            .companies
            .values()
            .any(|c| c.alias == company.alias && c.id != company.id)
        {
            return Err(StoreError::Conflict(format!(
                "company alias {} already taken",
                company.alias
            )));
        }
        self.working.companies.insert(company.id, company.clone());
        Ok(())
    }

    fn upsert_warehouse(&mut self, warehouse: &Warehouse) -> StoreResult<()> {
        if self.working.warehouses.values().any(|w| {
            w.company_id == warehouse.company_id && w.code == warehouse.code && w.id != warehouse.id
        }) {
            return Err(StoreError::Conflict(format!(
                "warehouse code {} already taken",
                warehouse.code
            )));
        }
        self.working.warehouses.insert(warehouse.id, warehouse.clone());
        Ok(())
    }

    fn warehouse(&mut self, company: CompanyId, id: WarehouseId) -> StoreResult<Option<Warehouse>> {
        Ok(self
            .working
            .warehouses
            .get(&id)
            .filter(|w| w.company_id == company)
            .cloned())
    }

    fn warehouse_by_code(
        &mut self,
        company: CompanyId,
        code: &WarehouseCode,
    ) -> StoreResult<Option<Warehouse>> {
        Ok(self
            .working
            .warehouses
            .values()
            .find(|w| w.company_id == company && &w.code == code)
            .cloned())
    }

    fn warehouses(&mut self, company: CompanyId) -> StoreResult<Vec<Warehouse>> {
        let mut all: Vec<_> = self
            .working
            .warehouses
            .values()
            .filter(|w| w.company_id == company)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(all)
    }

    fn upsert_product(&mut self, product: &Product) -> StoreResult<()> {
        if self.working.products.values().any(|p| {
            p.company_id == product.company_id && p.code == product.code && p.id != product.id
        }) {
            return Err(StoreError::Conflict(format!(
                "product code {} already taken",
                product.code
            )));
        }
        self.working.products.insert(product.id, product.clone());
        Ok(())
    }

    fn product(&mut self, company: CompanyId, id: ProductId) -> StoreResult<Option<Product>> {
        Ok(self
            .working
            .products
            .get(&id)
            .filter(|p| p.company_id == company)
            .cloned())
    }

    fn product_by_code(
        &mut self,
        company: CompanyId,
        code: &ProductCode,
    ) -> StoreResult<Option<Product>> {
        Ok(self
            .working
            .products
            .values()
            .find(|p| p.company_id == company && &p.code == code)
            .cloned())
    }

    fn products(&mut self, company: CompanyId) -> StoreResult<Vec<Product>> {
        let mut all: Vec<_> = self
            .working
            .products
            .values()
            .filter(|p| p.company_id == company)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(all)
    }

    fn sync_control(&mut self, company: CompanyId) -> StoreResult<SyncControl> {
        Ok(self
            .working
            .sync
            .get(&company)
            .cloned()
            .unwrap_or_else(|| SyncControl::new(company)))
    }

    fn save_sync_control(&mut self, control: &SyncControl) -> StoreResult<()> {
        self.working.sync.insert(control.company_id, control.clone());
        Ok(())
    }

    fn upsert_legacy_header(&mut self, company: CompanyId, header: &LegacyHeader) -> StoreResult<()> {
        self.working
            .headers
            .insert((company, header.key.clone()), header.clone());
        Ok(())
    }

    fn replace_legacy_details(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
        details: &[LegacyDetail],
    ) -> StoreResult<()> {
        if let Some(stray) = details.iter().find(|d| d.key.header() != header) {
            return Err(StoreError::InvalidData(format!(
                "detail {} does not belong to header {header}",
                stray.key
            )));
        }
        self.working
            .details
            .retain(|(c, k), _| !(*c == company && k.header() == header));
        for detail in details {
            self.working
                .details
                .insert((company, detail.key.clone()), detail.clone());
        }
        Ok(())
    }

    fn delete_legacy_header(&mut self, company: CompanyId, key: &HeaderKey) -> StoreResult<bool> {
        let existed = self.working.headers.remove(&(company, key.clone())).is_some();
        self.working
            .details
            .retain(|(c, k), _| !(*c == company && k.header() == key));
        Ok(existed)
    }

    fn set_legacy_status(
        &mut self,
        company: CompanyId,
        key: &HeaderKey,
        status: &str,
    ) -> StoreResult<bool> {
        match self.working.headers.get_mut(&(company, key.clone())) {
            Some(header) => {
                header.status = status.trim().to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn legacy_header(
        &mut self,
        company: CompanyId,
        key: &HeaderKey,
    ) -> StoreResult<Option<LegacyHeader>> {
        Ok(self.working.headers.get(&(company, key.clone())).cloned())
    }

    fn legacy_headers(
        &mut self,
        company: CompanyId,
        keys: &[HeaderKey],
    ) -> StoreResult<Vec<LegacyHeader>> {
        Ok(keys
            .iter()
            .filter_map(|k| self.working.headers.get(&(company, k.clone())).cloned())
            .collect())
    }

    fn legacy_details(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<LegacyDetail>> {
        let mut details: Vec<_> = self
            .working
            .details
            .iter()
            .filter(|((c, k), _)| *c == company && k.header() == header)
            .map(|(_, d)| d.clone())
            .collect();
        details.sort_by_key(|d| d.key.item_number());
        Ok(details)
    }

    fn legacy_detail(
        &mut self,
        company: CompanyId,
        key: &DetailKey,
    ) -> StoreResult<Option<LegacyDetail>> {
        Ok(self.working.details.get(&(company, key.clone())).cloned())
    }

    fn legacy_headers_between(
        &mut self,
        company: CompanyId,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<LegacyHeader>> {
        let mut headers: Vec<_> = self
            .working
            .headers
            .iter()
            .filter(|((c, _), h)| {
                *c == company && h.document_date >= from && to.is_none_or(|to| h.document_date <= to)
            })
            .map(|(_, h)| h.clone())
            .collect();
        headers.sort_by(|a, b| {
            a.document_date
                .cmp(&b.document_date)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(headers)
    }

    fn legacy_statuses_since(
        &mut self,
        company: CompanyId,
        since: DateTime<Utc>,
        doc_types: &[String],
    ) -> StoreResult<Vec<HeaderStatus>> {
        Ok(self
            .working
            .headers
            .iter()
            .filter(|((c, k), h)| {
                *c == company
                    && h.document_date >= since
                    && doc_types.iter().any(|d| d == k.doc_type().as_str())
            })
            .map(|(_, h)| h.status_row())
            .collect())
    }

    fn legacy_details_by_product(
        &mut self,
        company: CompanyId,
        product_code: &str,
    ) -> StoreResult<Vec<LegacyDetail>> {
        let code = product_code.trim();
        Ok(self
            .working
            .details
            .iter()
            .filter(|((c, _), d)| *c == company && d.product_code.as_deref().map(str::trim) == Some(code))
            .map(|(_, d)| d.clone())
            .collect())
    }

    fn upsert_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        if entry.quantity < Decimal::ZERO {
            return Err(StoreError::InvalidData(format!(
                "negative quantity on ledger entry {}",
                entry.key
            )));
        }
        self.working
            .entries
            .insert((entry.company_id, entry.key.clone()), entry.clone());
        Ok(())
    }

    fn entry(&mut self, company: CompanyId, key: &EntryKey) -> StoreResult<Option<LedgerEntry>> {
        Ok(self.working.entries.get(&(company, key.clone())).cloned())
    }

    fn delete_entry(
        &mut self,
        company: CompanyId,
        key: &EntryKey,
    ) -> StoreResult<Option<LedgerEntry>> {
        Ok(self.working.entries.remove(&(company, key.clone())))
    }

    fn entries_by_header(
        &mut self,
        company: CompanyId,
        header: &HeaderRef,
    ) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self
            .working
            .company_entries(company)
            .filter(|e| &e.header() == header)
            .cloned()
            .collect())
    }

    fn delete_entries_by_header(
        &mut self,
        company: CompanyId,
        header: &HeaderRef,
    ) -> StoreResult<Vec<StockKey>> {
        let mut pairs = BTreeSet::new();
        self.working.entries.retain(|(c, _), e| {
            let doomed = *c == company && &e.header() == header;
            if doomed {
                pairs.insert(pair_of(e));
            }
            !doomed
        });
        Ok(pairs.into_iter().collect())
    }

    fn ledger_lines(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Vec<LedgerLine>> {
        Ok(self
            .working
            .company_entries(company)
            .filter(|e| e.warehouse_id == warehouse && e.product_id == product)
            .map(LedgerEntry::line)
            .collect())
    }

    fn entries_until(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let mut entries: Vec<_> = self
            .working
            .company_entries(company)
            .filter(|e| e.warehouse_id == warehouse && e.product_id == product && e.document_date <= to)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            a.document_date
                .cmp(&b.document_date)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    fn list_entries(
        &mut self,
        company: CompanyId,
        filter: &MovementFilter,
        page: Pagination,
    ) -> StoreResult<Page<LedgerEntry>> {
        let mut entries: Vec<_> = self
            .working
            .company_entries(company)
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.document_date
                .cmp(&a.document_date)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(page.slice(entries))
    }

    fn upsert_note(&mut self, note: &TextNote) -> StoreResult<()> {
        self.working
            .notes
            .insert((note.company_id, note.key.clone()), note.clone());
        Ok(())
    }

    fn delete_notes_by_header(&mut self, company: CompanyId, header: &HeaderKey) -> StoreResult<usize> {
        let before = self.working.notes.len();
        self.working
            .notes
            .retain(|(c, k), _| !(*c == company && k.header() == header));
        Ok(before - self.working.notes.len())
    }

    fn notes_for_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<TextNote>> {
        Ok(self
            .working
            .notes
            .iter()
            .filter(|((c, k), _)| *c == company && k.header() == header)
            .map(|(_, n)| n.clone())
            .collect())
    }

    fn transfer(&mut self, company: CompanyId, id: TransferId) -> StoreResult<Option<Transfer>> {
        Ok(self
            .working
            .transfers
            .get(&id)
            .filter(|t| t.company_id == company)
            .cloned())
    }

    fn transfer_by_dispatch(
        &mut self,
        company: CompanyId,
        dispatch: &DetailKey,
    ) -> StoreResult<Option<Transfer>> {
        Ok(self
            .working
            .company_transfers(company)
            .find(|t| &t.dispatch_key == dispatch)
            .cloned())
    }

    fn transfer_by_ingress(
        &mut self,
        company: CompanyId,
        ingress: &DetailKey,
    ) -> StoreResult<Option<Transfer>> {
        Ok(self
            .working
            .company_transfers(company)
            .find(|t| t.ingress_detail.as_ref() == Some(ingress))
            .cloned())
    }

    fn transfers_by_dispatch_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<Transfer>> {
        Ok(self
            .working
            .company_transfers(company)
            .filter(|t| t.dispatch_header() == header)
            .cloned()
            .collect())
    }

    fn transfers_by_ingress_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<Transfer>> {
        Ok(self
            .working
            .company_transfers(company)
            .filter(|t| t.ingress_header.as_ref() == Some(header))
            .cloned()
            .collect())
    }

    fn transfer_candidates(
        &mut self,
        company: CompanyId,
        product: ProductId,
        destination: WarehouseId,
        quantity: Decimal,
        dispatched_from: DateTime<Utc>,
        dispatched_to: DateTime<Utc>,
    ) -> StoreResult<Vec<Transfer>> {
        let mut candidates: Vec<_> = self
            .working
            .company_transfers(company)
            .filter(|t| {
                t.state == TransferState::InTransit
                    && t.ingress_detail.is_none()
                    && t.product_id == product
                    && t.destination_id == destination
                    && t.quantity_sent == quantity
                    && t.dispatch_date >= dispatched_from
                    && t.dispatch_date <= dispatched_to
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.dispatch_date
                .cmp(&b.dispatch_date)
                .then_with(|| a.dispatch_key.cmp(&b.dispatch_key))
        });
        Ok(candidates)
    }

    fn save_transfer(&mut self, transfer: &Transfer) -> StoreResult<()> {
        if self.working.transfers.values().any(|t| {
            t.company_id == transfer.company_id
                && t.dispatch_key == transfer.dispatch_key
                && t.id != transfer.id
        }) {
            return Err(StoreError::Conflict(format!(
                "transfer for dispatch {} already exists",
                transfer.dispatch_key
            )));
        }
        self.working.transfers.insert(transfer.id, transfer.clone());
        Ok(())
    }

    fn delete_transfer(&mut self, company: CompanyId, id: TransferId) -> StoreResult<bool> {
        match self.working.transfers.get(&id) {
            Some(t) if t.company_id == company => {
                self.working.transfers.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn in_transit_from(
        &mut self,
        company: CompanyId,
        origin: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Decimal> {
        Ok(kardex_inventory::in_transit_from(
            self.working.company_transfers(company),
            origin,
            product,
        ))
    }

    fn in_transit_towards(
        &mut self,
        company: CompanyId,
        destination: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Decimal> {
        Ok(self
            .working
            .company_transfers(company)
            .filter(|t| t.is_in_transit() && t.destination_id == destination && t.product_id == product)
            .map(|t| t.quantity_sent)
            .sum())
    }

    fn list_transfers(
        &mut self,
        company: CompanyId,
        filter: &TransferFilter,
        page: Pagination,
    ) -> StoreResult<Page<Transfer>> {
        let mut transfers: Vec<_> = self
            .working
            .company_transfers(company)
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| {
            b.dispatch_date
                .cmp(&a.dispatch_date)
                .then_with(|| a.dispatch_key.cmp(&b.dispatch_key))
        });
        Ok(page.slice(transfers))
    }

    fn upsert_balance(&mut self, balance: &StockBalance) -> StoreResult<()> {
        self.working.balances.insert(
            (balance.company_id, balance.warehouse_id, balance.product_id),
            balance.clone(),
        );
        Ok(())
    }

    fn balance(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Option<StockBalance>> {
        Ok(self.working.balances.get(&(company, warehouse, product)).cloned())
    }

    fn list_balances(
        &mut self,
        company: CompanyId,
        filter: &StockFilter,
        page: Pagination,
    ) -> StoreResult<Page<StockBalance>> {
        let balances: Vec<_> = self
            .working
            .balances
            .iter()
            .filter(|((c, _, _), b)| *c == company && filter.matches(b))
            .map(|(_, b)| b.clone())
            .collect();
        Ok(page.slice(balances))
    }

    fn stock_keys(&mut self, company: CompanyId) -> StoreResult<Vec<StockKey>> {
        let mut keys: BTreeSet<StockKey> = self.working.company_entries(company).map(pair_of).collect();
        for t in self.working.company_transfers(company) {
            keys.extend(t.affected_pairs());
        }
        keys.extend(
            self.working
                .balances
                .keys()
                .filter(|(c, _, _)| *c == company)
                .map(|(_, w, p)| (*w, *p)),
        );
        Ok(keys.into_iter().collect())
    }

    fn purge_company(&mut self, company: CompanyId) -> StoreResult<()> {
        let state = &mut self.working;
        state.sync.remove(&company);
        state.headers.retain(|(c, _), _| *c != company);
        state.details.retain(|(c, _), _| *c != company);
        state.entries.retain(|(c, _), _| *c != company);
        state.notes.retain(|(c, _), _| *c != company);
        state.transfers.retain(|_, t| t.company_id != company);
        state.balances.retain(|(c, _, _), _| *c != company);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let InMemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn seeded() -> (InMemoryWarehouseStore, Company) {
        let store = InMemoryWarehouseStore::new();
        let company = Company::new("acme", "Acme SA");
        let mut tx = store.begin().unwrap();
        tx.upsert_company(&company).unwrap();
        tx.commit().unwrap();
        (store, company)
    }

    fn header(number: &str, day: u32) -> LegacyHeader {
        LegacyHeader::new(
            HeaderKey::new("AL", "NI", number).unwrap(),
            Utc.with_ymd_and_hms(2025, 9, day, 0, 0, 0).unwrap(),
            "F",
        )
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (store, company) = seeded();
        {
            let mut tx = store.begin().unwrap();
            tx.upsert_legacy_header(company.id, &header("1", 1)).unwrap();
        }
        let mut tx = store.begin().unwrap();
        assert!(tx.legacy_header(company.id, &header("1", 1).key).unwrap().is_none());
    }

    #[test]
    fn committed_transaction_is_visible() {
        let (store, company) = seeded();
        let mut tx = store.begin().unwrap();
        tx.upsert_legacy_header(company.id, &header("1", 1)).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert!(tx.legacy_header(company.id, &header("1", 1).key).unwrap().is_some());
        assert_eq!(tx.company_by_alias(" acme ").unwrap(), Some(company));
    }

    #[test]
    fn replace_details_swaps_the_whole_set() {
        let (store, company) = seeded();
        let h = header("1", 1);
        let mut tx = store.begin().unwrap();
        tx.upsert_legacy_header(company.id, &h).unwrap();
        tx.replace_legacy_details(
            company.id,
            &h.key,
            &[
                LegacyDetail::new(h.key.item(2), "P-2", Decimal::ONE),
                LegacyDetail::new(h.key.item(1), "P-1", Decimal::ONE),
            ],
        )
        .unwrap();
        tx.replace_legacy_details(company.id, &h.key, &[LegacyDetail::new(h.key.item(3), "P-3", Decimal::ONE)])
            .unwrap();

        let details = tx.legacy_details(company.id, &h.key).unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].key.item_number(), 3);

        let foreign = LegacyDetail::new(header("2", 1).key.item(1), "P-1", Decimal::ONE);
        assert!(tx.replace_legacy_details(company.id, &h.key, &[foreign]).is_err());
    }

    #[test]
    fn headers_between_are_ordered_by_date() {
        let (store, company) = seeded();
        let mut tx = store.begin().unwrap();
        for (number, day) in [("3", 9), ("1", 2), ("2", 5)] {
            tx.upsert_legacy_header(company.id, &header(number, day)).unwrap();
        }
        let from = Utc.with_ymd_and_hms(2025, 9, 3, 0, 0, 0).unwrap();
        let found = tx.legacy_headers_between(company.id, from, None).unwrap();
        let numbers: Vec<_> = found.iter().map(|h| h.key.doc_number().to_string()).collect();
        assert_eq!(numbers, vec!["2", "3"]);
    }

    #[test]
    fn alias_and_codes_are_unique() {
        let (store, company) = seeded();
        let mut tx = store.begin().unwrap();
        assert!(matches!(
            tx.upsert_company(&Company::new("acme", "Other")),
            Err(StoreError::Conflict(_))
        ));

        let code = WarehouseCode::new("AL").unwrap();
        tx.upsert_warehouse(&Warehouse::new(company.id, code.clone(), "Main")).unwrap();
        assert!(tx.upsert_warehouse(&Warehouse::new(company.id, code, "Dup")).is_err());
    }

    #[test]
    fn transactions_of_different_companies_are_serialized() {
        use std::time::{Duration, Instant};

        let (store, _acme) = seeded();
        let store = Arc::new(store);
        let other = Company::new("globex", "Globex");

        let tx = store.begin().unwrap();
        let (ready, waiting) = std::sync::mpsc::channel();
        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                ready.send(()).unwrap();
                let mut tx = store.begin().unwrap();
                tx.upsert_company(&other).unwrap();
                tx.commit().unwrap();
                started.elapsed()
            })
        };
        waiting.recv().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(tx);

        assert!(waiter.join().unwrap() >= Duration::from_millis(40));
        let mut tx = store.begin().unwrap();
        assert!(tx.company_by_alias("globex").unwrap().is_some());
    }
}
