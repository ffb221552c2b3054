//! Interpreted stock movements.

use core::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use kardex_core::{
    CompanyId, DetailKey, DomainError, DomainResult, HeaderKey, ProductId, TransferId, ValueObject,
    WarehouseId,
};

const LOCAL_PREFIX: &str = "WEB-TR-";
const LOCAL_INBOUND_SUFFIX: &str = "-IN";

/// Business key of a ledger entry, unique per company.
///
/// Entries derived from ERP lines reuse the line key. Receptions recorded
/// locally before the ERP counterpart exists use `WEB-TR-<transfer>-IN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntryKey {
    Erp(DetailKey),
    Transfer(TransferId),
}

impl EntryKey {
    pub fn parse(s: &str) -> DomainResult<Self> {
        let s = s.trim();
        if let Some(id) = s
            .strip_prefix(LOCAL_PREFIX)
            .and_then(|rest| rest.strip_suffix(LOCAL_INBOUND_SUFFIX))
            .and_then(|id| id.parse::<TransferId>().ok())
        {
            return Ok(EntryKey::Transfer(id));
        }
        Ok(EntryKey::Erp(DetailKey::parse(s)?))
    }

    /// Key shared by every entry of the same document.
    pub fn header(&self) -> HeaderRef {
        match self {
            EntryKey::Erp(detail) => HeaderRef::Erp(detail.header().clone()),
            EntryKey::Transfer(id) => HeaderRef::Transfer(*id),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EntryKey::Transfer(_))
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKey::Erp(detail) => fmt::Display::fmt(detail, f),
            EntryKey::Transfer(id) => write!(f, "{LOCAL_PREFIX}{id}{LOCAL_INBOUND_SUFFIX}"),
        }
    }
}

impl From<DetailKey> for EntryKey {
    fn from(value: DetailKey) -> Self {
        EntryKey::Erp(value)
    }
}

impl TryFrom<String> for EntryKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntryKey> for String {
    fn from(value: EntryKey) -> Self {
        value.to_string()
    }
}

impl ValueObject for EntryKey {}

/// Header-level key (`erp-cab-key`): what a void removes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HeaderRef {
    Erp(HeaderKey),
    Transfer(TransferId),
}

impl HeaderRef {
    pub fn parse(s: &str) -> DomainResult<Self> {
        let s = s.trim();
        if let Some(id) = s
            .strip_prefix(LOCAL_PREFIX)
            .and_then(|id| id.parse::<TransferId>().ok())
        {
            return Ok(HeaderRef::Transfer(id));
        }
        Ok(HeaderRef::Erp(HeaderKey::parse(s)?))
    }
}

impl fmt::Display for HeaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderRef::Erp(key) => fmt::Display::fmt(key, f),
            HeaderRef::Transfer(id) => write!(f, "{LOCAL_PREFIX}{id}"),
        }
    }
}

impl From<HeaderKey> for HeaderRef {
    fn from(value: HeaderKey) -> Self {
        HeaderRef::Erp(value)
    }
}

impl TryFrom<String> for HeaderRef {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HeaderRef> for String {
    fn from(value: HeaderRef) -> Self {
        value.to_string()
    }
}

impl ValueObject for HeaderRef {}

/// One interpreted movement line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub company_id: CompanyId,
    pub key: EntryKey,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub doc_type: String,
    pub doc_number: String,
    pub item: u32,
    /// Document date with the time of day promoted into it.
    pub document_date: DateTime<Utc>,
    pub movement_date: DateTime<Utc>,
    pub is_inbound: bool,
    /// Never negative; direction lives in `is_inbound`.
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub line_value: Decimal,
    pub batch: Option<String>,
    pub series: Option<String>,
    pub unit: Option<String>,
    pub erp_status: String,
    pub movement_subtype: Option<String>,
    pub header_gloss: Option<String>,
    pub line_gloss: Option<String>,
    pub reference_document: Option<String>,
    pub reference_warehouse: Option<String>,
    pub purchase_order: Option<String>,
    pub counterpart_id: Option<String>,
    pub counterpart_name: Option<String>,
    pub supplier_id: Option<String>,
    pub supplier_name: Option<String>,
    pub is_import: bool,
    pub import_id: Option<String>,
    pub transfer_reason: Option<String>,
    pub delivery_address: Option<String>,
    pub reporting_warehouse_id: Option<WarehouseId>,
}

impl LedgerEntry {
    /// Header gloss is stored truncated to this many characters.
    pub const GLOSS_LIMIT: usize = 500;

    pub fn header(&self) -> HeaderRef {
        self.key.header()
    }

    /// Signed contribution to stock.
    pub fn signed_quantity(&self) -> Decimal {
        if self.is_inbound {
            self.quantity
        } else {
            -self.quantity
        }
    }

    pub fn line(&self) -> LedgerLine {
        LedgerLine {
            company_id: self.company_id,
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
            is_inbound: self.is_inbound,
            quantity: self.quantity,
            erp_status: self.erp_status.clone(),
            document_date: self.document_date,
        }
    }
}

/// Truncate a gloss on a character boundary.
pub fn truncate_gloss(gloss: Option<&str>) -> Option<String> {
    gloss
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(|g| g.chars().take(LedgerEntry::GLOSS_LIMIT).collect())
}

/// Narrow projection read by the stock recomputer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLine {
    pub company_id: CompanyId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub is_inbound: bool,
    pub quantity: Decimal,
    pub erp_status: String,
    pub document_date: DateTime<Utc>,
}

/// A free-text document line, keyed like a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextNote {
    pub company_id: CompanyId,
    pub key: DetailKey,
    pub document_date: DateTime<Utc>,
    pub description: Option<String>,
    pub body: Option<String>,
}

impl TextNote {
    pub fn header(&self) -> &HeaderKey {
        self.key.header()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_keys_render_and_parse() {
        let id = TransferId::new();
        let key = EntryKey::Transfer(id);
        assert_eq!(key.to_string(), format!("WEB-TR-{id}-IN"));
        assert_eq!(EntryKey::parse(&key.to_string()).unwrap(), key);
        assert_eq!(key.header().to_string(), format!("WEB-TR-{id}"));
        assert_eq!(HeaderRef::parse(&key.header().to_string()).unwrap(), key.header());
    }

    #[test]
    fn erp_keys_parse_as_details() {
        let key = EntryKey::parse("AL-NI-000123-1").unwrap();
        assert_eq!(key, EntryKey::Erp(DetailKey::new("AL", "NI", "000123", 1).unwrap()));
        assert_eq!(key.header().to_string(), "AL-NI-000123");
        assert!(!key.is_local());
    }

    #[test]
    fn gloss_is_truncated_on_char_boundary() {
        let long = "ñ".repeat(600);
        let truncated = truncate_gloss(Some(&long)).unwrap();
        assert_eq!(truncated.chars().count(), LedgerEntry::GLOSS_LIMIT);
        assert_eq!(truncate_gloss(Some("   ")), None);
    }
}
