//! Stock balances derived from ledger lines and open transfers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use kardex_core::{CompanyId, DomainError, DomainResult, ProductId, WarehouseId};

use crate::ledger::LedgerLine;
use crate::quantity::normalize;
use crate::rules::DocumentRules;
use crate::transfer::Transfer;

/// Materialized balance of one `(company, warehouse, product)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBalance {
    pub company_id: CompanyId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub current: Decimal,
    pub in_transit: Decimal,
    pub last_movement_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Computed figures, before they are stamped and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockFigures {
    pub current: Decimal,
    pub in_transit: Decimal,
    pub last_movement_date: Option<DateTime<Utc>>,
}

impl StockFigures {
    /// Balance of one triple from its ledger lines and the quantity still in
    /// transit out of the warehouse.
    ///
    /// Lines that belong to another triple or carry a negative quantity are an
    /// invariant violation: nothing is computed for the triple.
    pub fn compute(
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        lines: &[LedgerLine],
        in_transit: Decimal,
        rules: &DocumentRules,
    ) -> DomainResult<Self> {
        let mut current = Decimal::ZERO;
        let mut last_movement_date: Option<DateTime<Utc>> = None;

        for line in lines {
            if line.company_id != company_id
                || line.warehouse_id != warehouse_id
                || line.product_id != product_id
            {
                return Err(DomainError::invariant(format!(
                    "ledger line for ({}, {}) read while computing ({warehouse_id}, {product_id})",
                    line.warehouse_id, line.product_id
                )));
            }
            if line.quantity < Decimal::ZERO {
                return Err(DomainError::invariant(format!(
                    "negative ledger quantity {} for ({warehouse_id}, {product_id})",
                    line.quantity
                )));
            }
            if !rules.is_active(&line.erp_status) {
                continue;
            }

            if line.is_inbound {
                current += line.quantity;
            } else {
                current -= line.quantity;
            }
            last_movement_date = last_movement_date.max(Some(line.document_date));
        }

        Ok(Self {
            current: normalize(current),
            in_transit: normalize(in_transit),
            last_movement_date,
        })
    }

    pub fn into_balance(
        self,
        company_id: CompanyId,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        updated_at: DateTime<Utc>,
    ) -> StockBalance {
        StockBalance {
            company_id,
            warehouse_id,
            product_id,
            current: self.current,
            in_transit: self.in_transit,
            last_movement_date: self.last_movement_date,
            updated_at,
        }
    }
}

/// Σ quantity sent of in-transit transfers leaving `warehouse_id` with `product_id`.
pub fn in_transit_from<'a, I>(transfers: I, warehouse_id: WarehouseId, product_id: ProductId) -> Decimal
where
    I: IntoIterator<Item = &'a Transfer>,
{
    transfers
        .into_iter()
        .filter(|t| t.is_in_transit() && t.origin_id == warehouse_id && t.product_id == product_id)
        .map(|t| t.quantity_sent)
        .sum()
}
