//! Shadow rows of ERP warehouse documents (the legacy mirror).
//!
//! These are 1:1 copies of what the ERP holds: no interpretation happens here.
//! Optional text fields are `None` when the ERP column is null or blank.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use kardex_core::{DetailKey, HeaderKey, ValueObject};

/// One ERP document header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyHeader {
    pub key: HeaderKey,
    /// Document date as stored by the ERP (usually midnight).
    pub document_date: DateTime<Utc>,
    /// `HH:MM:SS` string kept apart from the date.
    pub time_of_day: Option<String>,
    /// `I` inbound / `S` outbound.
    pub direction_flag: Option<String>,
    pub movement_subtype: Option<String>,
    pub status: String,
    pub reference_type: Option<String>,
    pub reference_number: Option<String>,
    pub reference_warehouse: Option<String>,
    pub counterpart_code: Option<String>,
    pub counterpart_name: Option<String>,
    pub supplier_code: Option<String>,
    pub supplier_name: Option<String>,
    pub gloss: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub user: Option<String>,
    pub is_import: bool,
    pub import_number: Option<String>,
    pub transfer_reason: Option<String>,
    /// Possibly several purchase orders in one string.
    pub purchase_order: Option<String>,
    pub delivery_address: Option<String>,
}

impl LegacyHeader {
    /// A header with only its identity, date and status filled in.
    pub fn new(key: HeaderKey, document_date: DateTime<Utc>, status: impl Into<String>) -> Self {
        Self {
            key,
            document_date,
            time_of_day: None,
            direction_flag: None,
            movement_subtype: None,
            status: status.into(),
            reference_type: None,
            reference_number: None,
            reference_warehouse: None,
            counterpart_code: None,
            counterpart_name: None,
            supplier_code: None,
            supplier_name: None,
            gloss: None,
            updated_at: None,
            user: None,
            is_import: false,
            import_number: None,
            transfer_reason: None,
            purchase_order: None,
            delivery_address: None,
        }
    }

    /// Key of the dispatch line this document references, when the reference
    /// fields name one (`{ref_warehouse}-{ref_type}-{ref_number}-{item}`).
    pub fn referenced_detail(&self, item: u32) -> Option<DetailKey> {
        let warehouse = self.reference_warehouse.as_deref()?;
        let doc_type = self.reference_type.as_deref()?;
        let number = self.reference_number.as_deref()?;
        DetailKey::new(warehouse, doc_type, number, item).ok()
    }

    /// Reconciliation projection of this header.
    pub fn status_row(&self) -> HeaderStatus {
        HeaderStatus {
            key: self.key.clone(),
            status: self.status.clone(),
        }
    }
}

/// One ERP document line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyDetail {
    pub key: DetailKey,
    /// Product code, the `TEXTO` sentinel, or nothing.
    pub product_code: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub line_value: Decimal,
    pub batch: Option<String>,
    pub series: Option<String>,
    pub unit: Option<String>,
    pub line_date: Option<DateTime<Utc>>,
    pub gloss: Option<String>,
    pub description: Option<String>,
    pub text: Option<String>,
}

impl LegacyDetail {
    pub fn new(key: DetailKey, product_code: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            key,
            product_code: Some(product_code.into()),
            quantity,
            unit_price: Decimal::ZERO,
            line_value: Decimal::ZERO,
            batch: None,
            series: None,
            unit: None,
            line_date: None,
            gloss: None,
            description: None,
            text: None,
        }
    }
}

/// Lightweight `(key, status)` projection used by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeaderStatus {
    pub key: HeaderKey,
    pub status: String,
}

impl ValueObject for HeaderStatus {}
