//! Local operational store: catalog, legacy mirror, ledger, transfers, balances.
//!
//! ## Transactions
//!
//! Every operation runs inside a [`StoreTx`] obtained from
//! [`WarehouseStore::begin`]. Changes become visible to other transactions
//! only after [`StoreTx::commit`]; dropping a transaction rolls it back.
//!
//! The pipeline relies on three transaction shapes:
//! - one transaction per mirrored header (header upsert + detail replacement)
//! - one transaction for a whole reconciliation (deletes + status updates)
//! - one outer transaction for a whole interpretation window
//!
//! ## Company scoping
//!
//! Every read takes the company id. Nothing crosses a company boundary.

pub mod memory;
pub mod postgres;
pub mod query;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use kardex_core::{
    CompanyId, DetailKey, HeaderKey, ProductCode, ProductId, TransferId, WarehouseCode, WarehouseId,
};
use kardex_inventory::{
    Company, EntryKey, HeaderRef, HeaderStatus, LedgerEntry, LedgerLine, LegacyDetail, LegacyHeader,
    Product, StockBalance, TextNote, Transfer, Warehouse,
};

pub use memory::InMemoryWarehouseStore;
pub use postgres::PostgresWarehouseStore;
pub use query::{MovementFilter, Page, Pagination, StockFilter, TransferFilter};

/// `(warehouse, product)` pair of one company.
pub type StockKey = (WarehouseId, ProductId);

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<kardex_core::DomainError> for StoreError {
    fn from(value: kardex_core::DomainError) -> Self {
        StoreError::InvalidData(value.to_string())
    }
}

impl From<kardex_inventory::TransferError> for StoreError {
    fn from(value: kardex_inventory::TransferError) -> Self {
        StoreError::InvalidData(value.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-company sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncControl {
    pub company_id: CompanyId,
    /// Document date of the last header copied by phase 1.
    pub watermark: Option<DateTime<Utc>>,
    pub last_full_reconciliation: Option<DateTime<Utc>>,
}

impl SyncControl {
    pub fn new(company_id: CompanyId) -> Self {
        Self {
            company_id,
            watermark: None,
            last_full_reconciliation: None,
        }
    }

    /// Move the watermark forward; it never moves back.
    pub fn advance(&mut self, to: DateTime<Utc>) -> bool {
        if self.watermark.is_some_and(|w| w >= to) {
            return false;
        }
        self.watermark = Some(to);
        true
    }
}

/// Entry point of the store.
pub trait WarehouseStore: Send + Sync {
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>>;
}

impl<S> WarehouseStore for Arc<S>
where
    S: WarehouseStore + ?Sized,
{
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        (**self).begin()
    }
}

pub type SharedStore = Arc<dyn WarehouseStore>;

/// One open transaction.
pub trait StoreTx {
    // --- catalog -------------------------------------------------------

    fn company(&mut self, id: CompanyId) -> StoreResult<Option<Company>>;

    fn company_by_alias(&mut self, alias: &str) -> StoreResult<Option<Company>>;

    fn upsert_company(&mut self, company: &Company) -> StoreResult<()>;

    fn upsert_warehouse(&mut self, warehouse: &Warehouse) -> StoreResult<()>;

    fn warehouse(&mut self, company: CompanyId, id: WarehouseId) -> StoreResult<Option<Warehouse>>;

    fn warehouse_by_code(
        &mut self,
        company: CompanyId,
        code: &WarehouseCode,
    ) -> StoreResult<Option<Warehouse>>;

    fn warehouses(&mut self, company: CompanyId) -> StoreResult<Vec<Warehouse>>;

    fn upsert_product(&mut self, product: &Product) -> StoreResult<()>;

    fn product(&mut self, company: CompanyId, id: ProductId) -> StoreResult<Option<Product>>;

    fn product_by_code(
        &mut self,
        company: CompanyId,
        code: &ProductCode,
    ) -> StoreResult<Option<Product>>;

    fn products(&mut self, company: CompanyId) -> StoreResult<Vec<Product>>;

    // --- sync control --------------------------------------------------

    /// Stored control row, or a fresh one.
    fn sync_control(&mut self, company: CompanyId) -> StoreResult<SyncControl>;

    fn save_sync_control(&mut self, control: &SyncControl) -> StoreResult<()>;

    // --- legacy mirror -------------------------------------------------

    fn upsert_legacy_header(&mut self, company: CompanyId, header: &LegacyHeader) -> StoreResult<()>;

    /// Replace every detail of `header` with `details`.
    fn replace_legacy_details(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
        details: &[LegacyDetail],
    ) -> StoreResult<()>;

    /// Delete a header and its details. Returns whether it existed.
    fn delete_legacy_header(&mut self, company: CompanyId, key: &HeaderKey) -> StoreResult<bool>;

    fn set_legacy_status(
        &mut self,
        company: CompanyId,
        key: &HeaderKey,
        status: &str,
    ) -> StoreResult<bool>;

    fn legacy_header(&mut self, company: CompanyId, key: &HeaderKey)
    -> StoreResult<Option<LegacyHeader>>;

    /// Bulk lookup by composite key; missing keys are skipped.
    fn legacy_headers(
        &mut self,
        company: CompanyId,
        keys: &[HeaderKey],
    ) -> StoreResult<Vec<LegacyHeader>>;

    /// Details of one header ordered by item.
    fn legacy_details(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<LegacyDetail>>;

    fn legacy_detail(
        &mut self,
        company: CompanyId,
        key: &DetailKey,
    ) -> StoreResult<Option<LegacyDetail>>;

    /// Headers with `from <= document_date` (and `<= to` when given),
    /// ascending by document date then key.
    fn legacy_headers_between(
        &mut self,
        company: CompanyId,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<LegacyHeader>>;

    /// `(key, status)` of local headers dated `>= since` whose doc type is in `doc_types`.
    fn legacy_statuses_since(
        &mut self,
        company: CompanyId,
        since: DateTime<Utc>,
        doc_types: &[String],
    ) -> StoreResult<Vec<HeaderStatus>>;

    /// Every mirrored line carrying `product_code`.
    fn legacy_details_by_product(
        &mut self,
        company: CompanyId,
        product_code: &str,
    ) -> StoreResult<Vec<LegacyDetail>>;

    // --- ledger --------------------------------------------------------

    fn upsert_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()>;

    fn entry(&mut self, company: CompanyId, key: &EntryKey) -> StoreResult<Option<LedgerEntry>>;

    /// Delete one entry, returning it when it existed.
    fn delete_entry(&mut self, company: CompanyId, key: &EntryKey)
    -> StoreResult<Option<LedgerEntry>>;

    fn entries_by_header(
        &mut self,
        company: CompanyId,
        header: &HeaderRef,
    ) -> StoreResult<Vec<LedgerEntry>>;

    /// Delete every entry of a header, returning the pairs they touched.
    fn delete_entries_by_header(
        &mut self,
        company: CompanyId,
        header: &HeaderRef,
    ) -> StoreResult<Vec<StockKey>>;

    fn ledger_lines(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Vec<LedgerLine>>;

    /// Entries of one pair dated `<= to`, ascending by date then key.
    fn entries_until(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>>;

    /// Newest first.
    fn list_entries(
        &mut self,
        company: CompanyId,
        filter: &MovementFilter,
        page: Pagination,
    ) -> StoreResult<Page<LedgerEntry>>;

    // --- text notes ----------------------------------------------------

    fn upsert_note(&mut self, note: &TextNote) -> StoreResult<()>;

    fn delete_notes_by_header(&mut self, company: CompanyId, header: &HeaderKey) -> StoreResult<usize>;

    fn notes_for_header(&mut self, company: CompanyId, header: &HeaderKey)
    -> StoreResult<Vec<TextNote>>;

    // --- transfers -----------------------------------------------------

    fn transfer(&mut self, company: CompanyId, id: TransferId) -> StoreResult<Option<Transfer>>;

    fn transfer_by_dispatch(
        &mut self,
        company: CompanyId,
        dispatch: &DetailKey,
    ) -> StoreResult<Option<Transfer>>;

    fn transfer_by_ingress(
        &mut self,
        company: CompanyId,
        ingress: &DetailKey,
    ) -> StoreResult<Option<Transfer>>;

    fn transfers_by_dispatch_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<Transfer>>;

    fn transfers_by_ingress_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<Transfer>>;

    /// Unlinked in-transit transfers that could match a reception, ordered by
    /// dispatch date then dispatch key.
    fn transfer_candidates(
        &mut self,
        company: CompanyId,
        product: ProductId,
        destination: WarehouseId,
        quantity: Decimal,
        dispatched_from: DateTime<Utc>,
        dispatched_to: DateTime<Utc>,
    ) -> StoreResult<Vec<Transfer>>;

    /// Insert or update by id. The dispatch key is unique per company.
    fn save_transfer(&mut self, transfer: &Transfer) -> StoreResult<()>;

    fn delete_transfer(&mut self, company: CompanyId, id: TransferId) -> StoreResult<bool>;

    /// Σ quantity sent of in-transit transfers leaving `origin`.
    fn in_transit_from(
        &mut self,
        company: CompanyId,
        origin: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Decimal>;

    /// Σ quantity sent of in-transit transfers heading to `destination`.
    fn in_transit_towards(
        &mut self,
        company: CompanyId,
        destination: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Decimal>;

    /// Newest dispatch first.
    fn list_transfers(
        &mut self,
        company: CompanyId,
        filter: &TransferFilter,
        page: Pagination,
    ) -> StoreResult<Page<Transfer>>;

    // --- stock ---------------------------------------------------------

    fn upsert_balance(&mut self, balance: &StockBalance) -> StoreResult<()>;

    fn balance(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Option<StockBalance>>;

    fn list_balances(
        &mut self,
        company: CompanyId,
        filter: &StockFilter,
        page: Pagination,
    ) -> StoreResult<Page<StockBalance>>;

    /// Every pair present in the ledger, in transfers or in balances.
    fn stock_keys(&mut self, company: CompanyId) -> StoreResult<Vec<StockKey>>;

    // --- maintenance ---------------------------------------------------

    /// Remove sync control, mirror, ledger, notes, transfers and balances of
    /// one company. The catalog is kept.
    fn purge_company(&mut self, company: CompanyId) -> StoreResult<()>;

    fn commit(self: Box<Self>) -> StoreResult<()>;
}
