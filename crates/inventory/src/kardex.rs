//! Stock card ("kardex") of one warehouse over a date range.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use kardex_core::{HeaderKey, ProductId};

use crate::catalog::Product;
use crate::ledger::{EntryKey, HeaderRef, LedgerEntry};
use crate::rules::{DocumentRules, FREIGHT_DOC_TYPE, TRANSFER_SUBTYPE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KardexRow {
    pub key: EntryKey,
    pub date: DateTime<Utc>,
    /// `{doc_type}-{doc_number}`.
    pub document: String,
    pub reference: Option<String>,
    pub inbound: Decimal,
    pub outbound: Decimal,
    pub balance: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KardexProductCard {
    pub product_id: ProductId,
    pub product_code: String,
    pub product_name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub opening_balance: Decimal,
    pub closing_balance: Decimal,
    /// Quantity still travelling *towards* the warehouse. Informative only.
    pub in_transit_inbound: Decimal,
    pub rows: Vec<KardexRow>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn join(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .filter_map(|p| non_blank(*p))
        .collect::<Vec<_>>()
        .join(" - ")
}

/// Human description of a movement.
///
/// `note` is the text-line content of the same document, if any; it outranks
/// the line gloss, which outranks the header gloss, where a note is shown.
pub fn describe_movement(entry: &LedgerEntry, note: Option<&str>) -> String {
    let subtype = entry.movement_subtype.as_deref().map(str::trim).unwrap_or_default();

    if subtype == TRANSFER_SUBTYPE {
        return non_blank(entry.header_gloss.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "Transfer between warehouses - {}",
                    entry.reference_warehouse.as_deref().unwrap_or_default().trim()
                )
            });
    }

    if entry.doc_type == FREIGHT_DOC_TYPE || subtype == FREIGHT_DOC_TYPE {
        let note = non_blank(note)
            .or_else(|| non_blank(entry.line_gloss.as_deref()))
            .or_else(|| non_blank(entry.header_gloss.as_deref()));
        let text = join(&[entry.counterpart_name.as_deref(), note]);
        return if text.is_empty() {
            "Freight entry".to_string()
        } else {
            text
        };
    }

    let entity = if entry.is_inbound {
        entry.supplier_name.as_deref()
    } else {
        entry.counterpart_name.as_deref()
    };
    let text = join(&[entity, entry.header_gloss.as_deref()]);
    if text.is_empty() {
        "No detail recorded".to_string()
    } else {
        text
    }
}

/// Build the card for one product.
///
/// `entries` are the product's ledger entries in the warehouse up to `to`
/// (earlier ones feed the opening balance). `notes` maps a document to the
/// text of its note lines.
pub fn build_card(
    product: &Product,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    entries: &[LedgerEntry],
    notes: &BTreeMap<HeaderKey, String>,
    in_transit_inbound: Decimal,
    rules: &DocumentRules,
) -> KardexProductCard {
    let active = entries
        .iter()
        .filter(|e| e.product_id == product.id && rules.is_active(&e.erp_status));

    let mut opening_balance = Decimal::ZERO;
    let mut in_range: Vec<&LedgerEntry> = Vec::new();
    for entry in active {
        if entry.document_date < from {
            opening_balance += entry.signed_quantity();
        } else if entry.document_date <= to {
            in_range.push(entry);
        }
    }
    in_range.sort_by(|a, b| a.document_date.cmp(&b.document_date).then_with(|| a.key.cmp(&b.key)));

    let mut balance = opening_balance;
    let rows = in_range
        .into_iter()
        .map(|entry| {
            balance += entry.signed_quantity();
            let note = match entry.header() {
                HeaderRef::Erp(key) => notes.get(&key).map(String::as_str),
                HeaderRef::Transfer(_) => None,
            };
            KardexRow {
                key: entry.key.clone(),
                date: entry.document_date,
                document: format!("{}-{}", entry.doc_type, entry.doc_number),
                reference: entry.reference_document.clone(),
                inbound: if entry.is_inbound { entry.quantity } else { Decimal::ZERO },
                outbound: if entry.is_inbound { Decimal::ZERO } else { entry.quantity },
                balance,
                description: describe_movement(entry, note),
            }
        })
        .collect();

    KardexProductCard {
        product_id: product.id,
        product_code: product.code.to_string(),
        product_name: product.name.clone(),
        from,
        to,
        opening_balance,
        closing_balance: balance,
        in_transit_inbound,
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kardex_core::{CompanyId, DetailKey, ProductCode, WarehouseId};

    fn product() -> Product {
        Product::new(CompanyId::new(), ProductCode::new("P-1").unwrap(), "Widget")
    }

    fn entry(product: &Product, number: &str, day: u32, inbound: bool, qty: i64, status: &str) -> LedgerEntry {
        let doc_type = if inbound { "NI" } else { "GS" };
        LedgerEntry {
            company_id: product.company_id,
            key: EntryKey::Erp(DetailKey::new("AL", doc_type, number, 1).unwrap()),
            warehouse_id: WarehouseId::new(),
            product_id: product.id,
            doc_type: doc_type.into(),
            doc_number: number.into(),
            item: 1,
            document_date: Utc.with_ymd_and_hms(2025, 9, day, 10, 0, 0).unwrap(),
            movement_date: Utc.with_ymd_and_hms(2025, 9, day, 10, 0, 0).unwrap(),
            is_inbound: inbound,
            quantity: Decimal::from(qty),
            unit_cost: Decimal::ZERO,
            line_value: Decimal::ZERO,
            batch: None,
            series: None,
            unit: None,
            erp_status: status.into(),
            movement_subtype: None,
            header_gloss: None,
            line_gloss: None,
            reference_document: None,
            reference_warehouse: None,
            purchase_order: None,
            counterpart_id: None,
            counterpart_name: Some("ACME".into()),
            supplier_id: None,
            supplier_name: Some("Supplier SA".into()),
            is_import: false,
            import_id: None,
            transfer_reason: None,
            delivery_address: None,
            reporting_warehouse_id: None,
        }
    }

    #[test]
    fn opening_balance_and_running_balance() {
        let p = product();
        let entries = vec![
            entry(&p, "1", 1, true, 100, "F"),
            entry(&p, "2", 2, false, 30, "V"),
            entry(&p, "3", 10, true, 50, "F"),
            entry(&p, "4", 11, false, 20, "P"),
            entry(&p, "5", 12, false, 999, "A"),
        ];
        let from = Utc.with_ymd_and_hms(2025, 9, 5, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 9, 30, 23, 59, 59).unwrap();

        let card = build_card(&p, from, to, &entries, &BTreeMap::new(), Decimal::from(8), &DocumentRules::default());

        assert_eq!(card.opening_balance, Decimal::from(70));
        assert_eq!(card.rows.len(), 2);
        assert_eq!(card.rows[0].balance, Decimal::from(120));
        assert_eq!(card.rows[1].balance, Decimal::from(100));
        assert_eq!(card.closing_balance, Decimal::from(100));
        assert_eq!(card.in_transit_inbound, Decimal::from(8));
        assert_eq!(card.rows[0].document, "NI-3");
    }

    #[test]
    fn transfer_description_falls_back_to_reference_warehouse() {
        let p = product();
        let mut e = entry(&p, "1", 1, false, 1, "F");
        e.movement_subtype = Some("TD".into());
        e.reference_warehouse = Some("AA".into());
        assert_eq!(describe_movement(&e, None), "Transfer between warehouses - AA");

        e.header_gloss = Some("Weekly replenishment".into());
        assert_eq!(describe_movement(&e, None), "Weekly replenishment");
    }

    #[test]
    fn freight_prefers_note_over_glosses() {
        let p = product();
        let mut e = entry(&p, "1", 1, true, 1, "F");
        e.doc_type = "FT".into();
        e.line_gloss = Some("line".into());
        assert_eq!(describe_movement(&e, Some("note")), "ACME - note");
        assert_eq!(describe_movement(&e, None), "ACME - line");
    }

    #[test]
    fn normal_movement_uses_supplier_or_customer() {
        let p = product();
        let mut inbound = entry(&p, "1", 1, true, 1, "F");
        inbound.header_gloss = Some("PO 55".into());
        assert_eq!(describe_movement(&inbound, None), "Supplier SA - PO 55");

        let mut outbound = entry(&p, "2", 1, false, 1, "F");
        outbound.counterpart_name = None;
        assert_eq!(describe_movement(&outbound, None), "No detail recorded");
    }
}
