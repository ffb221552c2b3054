//! Filters and pagination for the read side of the warehouse store.
//!
//! All listings are company-scoped and paginated by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kardex_core::{ProductId, WarehouseId};
use kardex_inventory::{LedgerEntry, StockBalance, Transfer, TransferState};

/// Pagination parameters for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    /// Cut one page out of an already filtered and ordered list.
    pub fn slice<T>(&self, items: Vec<T>) -> Page<T> {
        let total = items.len() as u64;
        let page: Vec<T> = items
            .into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect();
        Page::new(page, total, *self)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Rows matching the filter across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);
        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }
}

/// Filter for ledger entry listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub warehouse_id: Option<WarehouseId>,
    pub product_id: Option<ProductId>,
    /// Inclusive lower bound on the document date.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the document date.
    pub to: Option<DateTime<Utc>>,
    pub doc_type: Option<String>,
    pub is_inbound: Option<bool>,
    pub erp_status: Option<String>,
    pub counterpart_id: Option<String>,
}

impl MovementFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.warehouse_id.is_none_or(|w| entry.warehouse_id == w)
            && self.product_id.is_none_or(|p| entry.product_id == p)
            && self.from.is_none_or(|from| entry.document_date >= from)
            && self.to.is_none_or(|to| entry.document_date <= to)
            && self.doc_type.as_deref().is_none_or(|d| entry.doc_type == d)
            && self.is_inbound.is_none_or(|i| entry.is_inbound == i)
            && self.erp_status.as_deref().is_none_or(|s| entry.erp_status == s)
            && self
                .counterpart_id
                .as_deref()
                .is_none_or(|c| entry.counterpart_id.as_deref() == Some(c))
    }
}

/// Filter for stock balance listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockFilter {
    pub warehouse_id: Option<WarehouseId>,
    pub product_id: Option<ProductId>,
    /// Only balances with a strictly positive current quantity.
    #[serde(default)]
    pub only_positive: bool,
}

impl StockFilter {
    pub fn matches(&self, balance: &StockBalance) -> bool {
        self.warehouse_id.is_none_or(|w| balance.warehouse_id == w)
            && self.product_id.is_none_or(|p| balance.product_id == p)
            && (!self.only_positive || balance.current > rust_decimal::Decimal::ZERO)
    }
}

/// Filter for transfer listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFilter {
    pub state: Option<TransferState>,
    pub origin_id: Option<WarehouseId>,
    pub destination_id: Option<WarehouseId>,
    pub product_id: Option<ProductId>,
    /// Inclusive bounds on the dispatch date.
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TransferFilter {
    pub fn matches(&self, transfer: &Transfer) -> bool {
        self.state.is_none_or(|s| transfer.state == s)
            && self.origin_id.is_none_or(|w| transfer.origin_id == w)
            && self.destination_id.is_none_or(|w| transfer.destination_id == w)
            && self.product_id.is_none_or(|p| transfer.product_id == p)
            && self.from.is_none_or(|from| transfer.dispatch_date >= from)
            && self.to.is_none_or(|to| transfer.dispatch_date <= to)
    }
}
