//! Postgres-backed warehouse store.
//!
//! The store API is synchronous; every call drives the async `sqlx` driver on
//! a runtime owned by the store. Callers must not already be inside a tokio
//! runtime (the job runner and the CLI run on plain OS threads).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key / check violation) | `23503` / `23514` | `InvalidData` |
//! | Database (other) | Any other | `Storage` |
//! | Io / Tls / PoolTimedOut / PoolClosed | N/A | `Connection` |
//! | ColumnDecode / Decode / ColumnNotFound | N/A | `InvalidData` |
//! | Other | N/A | `Storage` |
//!
//! Schema: `migrations/0001_kardex.sql`, applied by [`PostgresWarehouseStore::migrate`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::instrument;
use uuid::Uuid;

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

const MIGRATIONS: &str = include_str!("../../migrations/0001_kardex.sql");

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

const HEADER_COLUMNS: &[&str] = &[
    "company_id",
    "warehouse_code",
    "doc_type",
    "doc_number",
    "document_date",
    "time_of_day",
    "direction_flag",
    "movement_subtype",
    "status",
    "reference_type",
    "reference_number",
    "reference_warehouse",
    "counterpart_code",
    "counterpart_name",
    "supplier_code",
    "supplier_name",
    "gloss",
    "updated_at",
    "erp_user",
    "is_import",
    "import_number",
    "transfer_reason",
    "purchase_order",
    "delivery_address",
];

const DETAIL_COLUMNS: &[&str] = &[
    "company_id",
    "warehouse_code",
    "doc_type",
    "doc_number",
    "item",
    "product_code",
    "quantity",
    "unit_price",
    "line_value",
    "batch",
    "series",
    "unit",
    "line_date",
    "gloss",
    "description",
    "body",
];

const ENTRY_COLUMNS: &[&str] = &[
    "company_id",
    "entry_key",
    "header_key",
    "warehouse_id",
    "product_id",
    "doc_type",
    "doc_number",
    "item",
    "document_date",
    "movement_date",
    "is_inbound",
    "quantity",
    "unit_cost",
    "line_value",
    "batch",
    "series",
    "unit",
    "erp_status",
    "movement_subtype",
    "header_gloss",
    "line_gloss",
    "reference_document",
    "reference_warehouse",
    "purchase_order",
    "counterpart_id",
    "counterpart_name",
    "supplier_id",
    "supplier_name",
    "is_import",
    "import_id",
    "transfer_reason",
    "delivery_address",
    "reporting_warehouse_id",
];

const TRANSFER_COLUMNS: &[&str] = &[
    "id",
    "company_id",
    "dispatch_key",
    "dispatch_header",
    "origin_id",
    "destination_id",
    "product_id",
    "quantity_sent",
    "quantity_received",
    "quantity_diff",
    "state",
    "dispatch_date",
    "reception_date",
    "ingress_header",
    "ingress_detail",
    "notes",
];

const BALANCE_COLUMNS: &[&str] = &[
    "company_id",
    "warehouse_id",
    "product_id",
    "current_qty",
    "in_transit",
    "last_movement_date",
    "updated_at",
];

/// `INSERT .. ON CONFLICT (..) DO UPDATE` over every non-key column.
fn upsert_sql(table: &str, columns: &[&str], conflict: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
        columns.join(", "),
        placeholders.join(", "),
        conflict.join(", "),
        updates.join(", ")
    )
}

fn select_sql(table: &str, columns: &[&str], rest: &str) -> String {
    format!("SELECT {} FROM {table} {rest}", columns.join(", "))
}

/// Postgres implementation of [`WarehouseStore`].
#[derive(Debug, Clone)]
pub struct PostgresWarehouseStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresWarehouseStore {
    pub fn new(pool: PgPool, runtime: Arc<Runtime>) -> Self {
        Self { pool, runtime }
    }

    /// Connect a pool on `runtime`.
    pub fn connect(runtime: Arc<Runtime>, url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, runtime))
    }

    /// Apply the schema. Idempotent.
    #[instrument(skip(self), err)]
    pub fn migrate(&self) -> StoreResult<()> {
        self.runtime
            .block_on(sqlx::raw_sql(MIGRATIONS).execute(&self.pool))
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }
}

impl WarehouseStore for PostgresWarehouseStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        let tx = self
            .runtime
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgTx {
            rt: &self.runtime,
            tx,
        }))
    }
}

struct PgTx<'a> {
    rt: &'a Runtime,
    tx: Transaction<'static, Postgres>,
}

impl PgTx<'_> {
    fn fetch_optional(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<Option<PgRow>> {
        let conn = &mut *self.tx;
        self.rt
            .block_on(query.fetch_optional(conn))
            .map_err(|e| map_sqlx_error(operation, e))
    }

    fn fetch_all(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<Vec<PgRow>> {
        let conn = &mut *self.tx;
        self.rt
            .block_on(query.fetch_all(conn))
            .map_err(|e| map_sqlx_error(operation, e))
    }

    fn fetch_one(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<PgRow> {
        let conn = &mut *self.tx;
        self.rt
            .block_on(query.fetch_one(conn))
            .map_err(|e| map_sqlx_error(operation, e))
    }

    fn execute(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<u64> {
        let conn = &mut *self.tx;
        self.rt
            .block_on(query.execute(conn))
            .map(|done| done.rows_affected())
            .map_err(|e| map_sqlx_error(operation, e))
    }

    fn sum(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<Decimal> {
        let row = self.fetch_one(operation, query)?;
        let total: Option<Decimal> = get(&row, "total")?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }

    fn count(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<u64> {
        let row = self.fetch_one(operation, query)?;
        let total: i64 = get(&row, "total")?;
        Ok(total.max(0) as u64)
    }

    fn entries_where(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<Vec<LedgerEntry>> {
        self.fetch_all(operation, query)?
            .iter()
            .map(entry_from_row)
            .collect()
    }

    fn transfers_where(&mut self, operation: &str, query: PgQuery<'_>) -> StoreResult<Vec<Transfer>> {
        self.fetch_all(operation, query)?
            .iter()
            .map(transfer_from_row)
            .collect()
    }
}

impl StoreTx for PgTx<'_> {
    fn company(&mut self, id: CompanyId) -> StoreResult<Option<Company>> {
        let row = self.fetch_optional(
            "company",
            sqlx::query("SELECT id, alias, name FROM companies WHERE id = $1").bind(Uuid::from(id)),
        )?;
        row.as_ref().map(company_from_row).transpose()
    }

    fn company_by_alias(&mut self, alias: &str) -> StoreResult<Option<Company>> {
        let row = self.fetch_optional(
            "company_by_alias",
            sqlx::query("SELECT id, alias, name FROM companies WHERE alias = $1").bind(alias.trim().to_string()),
        )?;
        row.as_ref().map(company_from_row).transpose()
    }

    fn upsert_company(&mut self, company: &Company) -> StoreResult<()> {
        self.execute(
            "upsert_company",
            sqlx::query(
                "INSERT INTO companies (id, alias, name) VALUES ($1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET alias = EXCLUDED.alias, name = EXCLUDED.name",
            )
            .bind(Uuid::from(company.id))
            .bind(company.alias.clone())
            .bind(company.name.clone()),
        )?;
        Ok(())
    }

    fn upsert_warehouse(&mut self, warehouse: &Warehouse) -> StoreResult<()> {
        self.execute(
            "upsert_warehouse",
            sqlx::query(
                "INSERT INTO warehouses (id, company_id, code, description) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO UPDATE SET code = EXCLUDED.code, description = EXCLUDED.description",
            )
            .bind(Uuid::from(warehouse.id))
            .bind(Uuid::from(warehouse.company_id))
            .bind(warehouse.code.to_string())
            .bind(warehouse.description.clone()),
        )?;
        Ok(())
    }

    fn warehouse(&mut self, company: CompanyId, id: WarehouseId) -> StoreResult<Option<Warehouse>> {
        let row = self.fetch_optional(
            "warehouse",
            sqlx::query("SELECT id, company_id, code, description FROM warehouses WHERE company_id = $1 AND id = $2")
                .bind(Uuid::from(company))
                .bind(Uuid::from(id)),
        )?;
        row.as_ref().map(warehouse_from_row).transpose()
    }

    fn warehouse_by_code(
        &mut self,
        company: CompanyId,
        code: &WarehouseCode,
    ) -> StoreResult<Option<Warehouse>> {
        let row = self.fetch_optional(
            "warehouse_by_code",
            sqlx::query("SELECT id, company_id, code, description FROM warehouses WHERE company_id = $1 AND code = $2")
                .bind(Uuid::from(company))
                .bind(code.to_string()),
        )?;
        row.as_ref().map(warehouse_from_row).transpose()
    }

    fn warehouses(&mut self, company: CompanyId) -> StoreResult<Vec<Warehouse>> {
        self.fetch_all(
            "warehouses",
            sqlx::query("SELECT id, company_id, code, description FROM warehouses WHERE company_id = $1 ORDER BY code")
                .bind(Uuid::from(company)),
        )?
        .iter()
        .map(warehouse_from_row)
        .collect()
    }

    fn upsert_product(&mut self, product: &Product) -> StoreResult<()> {
        self.execute(
            "upsert_product",
            sqlx::query(
                "INSERT INTO products (id, company_id, code, name) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO UPDATE SET code = EXCLUDED.code, name = EXCLUDED.name",
            )
            .bind(Uuid::from(product.id))
            .bind(Uuid::from(product.company_id))
            .bind(product.code.to_string())
            .bind(product.name.clone()),
        )?;
        Ok(())
    }

    fn product(&mut self, company: CompanyId, id: ProductId) -> StoreResult<Option<Product>> {
        let row = self.fetch_optional(
            "product",
            sqlx::query("SELECT id, company_id, code, name FROM products WHERE company_id = $1 AND id = $2")
                .bind(Uuid::from(company))
                .bind(Uuid::from(id)),
        )?;
        row.as_ref().map(product_from_row).transpose()
    }

    fn product_by_code(
        &mut self,
        company: CompanyId,
        code: &ProductCode,
    ) -> StoreResult<Option<Product>> {
        let row = self.fetch_optional(
            "product_by_code",
            sqlx::query("SELECT id, company_id, code, name FROM products WHERE company_id = $1 AND code = $2")
                .bind(Uuid::from(company))
                .bind(code.to_string()),
        )?;
        row.as_ref().map(product_from_row).transpose()
    }

    fn products(&mut self, company: CompanyId) -> StoreResult<Vec<Product>> {
        self.fetch_all(
            "products",
            sqlx::query("SELECT id, company_id, code, name FROM products WHERE company_id = $1 ORDER BY code")
                .bind(Uuid::from(company)),
        )?
        .iter()
        .map(product_from_row)
        .collect()
    }

    fn sync_control(&mut self, company: CompanyId) -> StoreResult<SyncControl> {
        let row = self.fetch_optional(
            "sync_control",
            sqlx::query("SELECT watermark, last_full_reconciliation FROM sync_control WHERE company_id = $1")
                .bind(Uuid::from(company)),
        )?;
        match row {
            Some(row) => Ok(SyncControl {
                company_id: company,
                watermark: get(&row, "watermark")?,
                last_full_reconciliation: get(&row, "last_full_reconciliation")?,
            }),
            None => Ok(SyncControl::new(company)),
        }
    }

    #[instrument(skip(self), fields(company = %control.company_id), err)]
    fn save_sync_control(&mut self, control: &SyncControl) -> StoreResult<()> {
        self.execute(
            "save_sync_control",
            sqlx::query(
                "INSERT INTO sync_control (company_id, watermark, last_full_reconciliation) VALUES ($1, $2, $3) \
                 ON CONFLICT (company_id) DO UPDATE SET watermark = EXCLUDED.watermark, \
                 last_full_reconciliation = EXCLUDED.last_full_reconciliation",
            )
            .bind(Uuid::from(control.company_id))
            .bind(control.watermark)
            .bind(control.last_full_reconciliation),
        )?;
        Ok(())
    }

    fn upsert_legacy_header(&mut self, company: CompanyId, header: &LegacyHeader) -> StoreResult<()> {
        let sql = upsert_sql(
            "legacy_headers",
            HEADER_COLUMNS,
            &["company_id", "warehouse_code", "doc_type", "doc_number"],
        );
        let h = header;
        self.execute(
            "upsert_legacy_header",
            sqlx::query(&sql)
                .bind(Uuid::from(company))
                .bind(h.key.warehouse().to_string())
                .bind(h.key.doc_type().to_string())
                .bind(h.key.doc_number().to_string())
                .bind(h.document_date)
                .bind(h.time_of_day.clone())
                .bind(h.direction_flag.clone())
                .bind(h.movement_subtype.clone())
                .bind(h.status.clone())
                .bind(h.reference_type.clone())
                .bind(h.reference_number.clone())
                .bind(h.reference_warehouse.clone())
                .bind(h.counterpart_code.clone())
                .bind(h.counterpart_name.clone())
                .bind(h.supplier_code.clone())
                .bind(h.supplier_name.clone())
                .bind(h.gloss.clone())
                .bind(h.updated_at)
                .bind(h.user.clone())
                .bind(h.is_import)
                .bind(h.import_number.clone())
                .bind(h.transfer_reason.clone())
                .bind(h.purchase_order.clone())
                .bind(h.delivery_address.clone()),
        )?;
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
        self.execute(
            "delete_legacy_details",
            header_scoped(
                "DELETE FROM legacy_details WHERE company_id = $1 AND warehouse_code = $2 AND doc_type = $3 AND doc_number = $4",
                company,
                header,
            ),
        )?;

        let sql = format!(
            "INSERT INTO legacy_details ({}) VALUES ({})",
            DETAIL_COLUMNS.join(", "),
            (1..=DETAIL_COLUMNS.len())
                .map(|i| format!("${i}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        for d in details {
            self.execute(
                "insert_legacy_detail",
                sqlx::query(&sql)
                    .bind(Uuid::from(company))
                    .bind(header.warehouse().to_string())
                    .bind(header.doc_type().to_string())
                    .bind(header.doc_number().to_string())
                    .bind(d.key.item_number() as i32)
                    .bind(d.product_code.clone())
                    .bind(d.quantity)
                    .bind(d.unit_price)
                    .bind(d.line_value)
                    .bind(d.batch.clone())
                    .bind(d.series.clone())
                    .bind(d.unit.clone())
                    .bind(d.line_date)
                    .bind(d.gloss.clone())
                    .bind(d.description.clone())
                    .bind(d.text.clone()),
            )?;
        }
        Ok(())
    }

    fn delete_legacy_header(&mut self, company: CompanyId, key: &HeaderKey) -> StoreResult<bool> {
        let affected = self.execute(
            "delete_legacy_header",
            header_scoped(
                "DELETE FROM legacy_headers WHERE company_id = $1 AND warehouse_code = $2 AND doc_type = $3 AND doc_number = $4",
                company,
                key,
            ),
        )?;
        Ok(affected > 0)
    }

    fn set_legacy_status(
        &mut self,
        company: CompanyId,
        key: &HeaderKey,
        status: &str,
    ) -> StoreResult<bool> {
        let affected = self.execute(
            "set_legacy_status",
            header_scoped(
                "UPDATE legacy_headers SET status = $5 WHERE company_id = $1 AND warehouse_code = $2 AND doc_type = $3 AND doc_number = $4",
                company,
                key,
            )
            .bind(status.trim().to_string()),
        )?;
        Ok(affected > 0)
    }

    fn legacy_header(
        &mut self,
        company: CompanyId,
        key: &HeaderKey,
    ) -> StoreResult<Option<LegacyHeader>> {
        let sql = select_sql(
            "legacy_headers",
            HEADER_COLUMNS,
            "WHERE company_id = $1 AND warehouse_code = $2 AND doc_type = $3 AND doc_number = $4",
        );
        let row = self.fetch_optional("legacy_header", header_scoped(&sql, company, key))?;
        row.as_ref().map(header_from_row).transpose()
    }

    fn legacy_headers(
        &mut self,
        company: CompanyId,
        keys: &[HeaderKey],
    ) -> StoreResult<Vec<LegacyHeader>> {
        let mut headers = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(header) = self.legacy_header(company, key)? {
                headers.push(header);
            }
        }
        Ok(headers)
    }

    fn legacy_details(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<LegacyDetail>> {
        let sql = select_sql(
            "legacy_details",
            DETAIL_COLUMNS,
            "WHERE company_id = $1 AND warehouse_code = $2 AND doc_type = $3 AND doc_number = $4 ORDER BY item",
        );
        self.fetch_all("legacy_details", header_scoped(&sql, company, header))?
            .iter()
            .map(detail_from_row)
            .collect()
    }

    fn legacy_detail(
        &mut self,
        company: CompanyId,
        key: &DetailKey,
    ) -> StoreResult<Option<LegacyDetail>> {
        let sql = select_sql(
            "legacy_details",
            DETAIL_COLUMNS,
            "WHERE company_id = $1 AND warehouse_code = $2 AND doc_type = $3 AND doc_number = $4 AND item = $5",
        );
        let row = self.fetch_optional(
            "legacy_detail",
            header_scoped(&sql, company, key.header()).bind(key.item_number() as i32),
        )?;
        row.as_ref().map(detail_from_row).transpose()
    }

    fn legacy_headers_between(
        &mut self,
        company: CompanyId,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<LegacyHeader>> {
        let sql = select_sql(
            "legacy_headers",
            HEADER_COLUMNS,
            "WHERE company_id = $1 AND document_date >= $2 \
             AND ($3::timestamptz IS NULL OR document_date <= $3) \
             ORDER BY document_date, warehouse_code COLLATE \"C\", doc_type COLLATE \"C\", doc_number COLLATE \"C\"",
        );
        self.fetch_all(
            "legacy_headers_between",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(from).bind(to),
        )?
        .iter()
        .map(header_from_row)
        .collect()
    }

    fn legacy_statuses_since(
        &mut self,
        company: CompanyId,
        since: DateTime<Utc>,
        doc_types: &[String],
    ) -> StoreResult<Vec<HeaderStatus>> {
        let rows = self.fetch_all(
            "legacy_statuses_since",
            sqlx::query(
                "SELECT warehouse_code, doc_type, doc_number, status FROM legacy_headers \
                 WHERE company_id = $1 AND document_date >= $2 AND doc_type = ANY($3)",
            )
            .bind(Uuid::from(company))
            .bind(since)
            .bind(doc_types.to_vec()),
        )?;
        rows.iter()
            .map(|row| {
                Ok(HeaderStatus {
                    key: header_key_from_row(row)?,
                    status: get(row, "status")?,
                })
            })
            .collect()
    }

    fn legacy_details_by_product(
        &mut self,
        company: CompanyId,
        product_code: &str,
    ) -> StoreResult<Vec<LegacyDetail>> {
        let sql = select_sql(
            "legacy_details",
            DETAIL_COLUMNS,
            "WHERE company_id = $1 AND product_code = $2 ORDER BY warehouse_code, doc_type, doc_number, item",
        );
        self.fetch_all(
            "legacy_details_by_product",
            sqlx::query(&sql)
                .bind(Uuid::from(company))
                .bind(product_code.trim().to_string()),
        )?
        .iter()
        .map(detail_from_row)
        .collect()
    }

    #[instrument(skip(self, entry), fields(company = %entry.company_id, entry = %entry.key), err)]
    fn upsert_entry(&mut self, entry: &LedgerEntry) -> StoreResult<()> {
        let sql = upsert_sql("ledger_entries", ENTRY_COLUMNS, &["company_id", "entry_key"]);
        let e = entry;
        self.execute(
            "upsert_entry",
            sqlx::query(&sql)
                .bind(Uuid::from(e.company_id))
                .bind(e.key.to_string())
                .bind(e.header().to_string())
                .bind(Uuid::from(e.warehouse_id))
                .bind(Uuid::from(e.product_id))
                .bind(e.doc_type.clone())
                .bind(e.doc_number.clone())
                .bind(e.item as i32)
                .bind(e.document_date)
                .bind(e.movement_date)
                .bind(e.is_inbound)
                .bind(e.quantity)
                .bind(e.unit_cost)
                .bind(e.line_value)
                .bind(e.batch.clone())
                .bind(e.series.clone())
                .bind(e.unit.clone())
                .bind(e.erp_status.clone())
                .bind(e.movement_subtype.clone())
                .bind(e.header_gloss.clone())
                .bind(e.line_gloss.clone())
                .bind(e.reference_document.clone())
                .bind(e.reference_warehouse.clone())
                .bind(e.purchase_order.clone())
                .bind(e.counterpart_id.clone())
                .bind(e.counterpart_name.clone())
                .bind(e.supplier_id.clone())
                .bind(e.supplier_name.clone())
                .bind(e.is_import)
                .bind(e.import_id.clone())
                .bind(e.transfer_reason.clone())
                .bind(e.delivery_address.clone())
                .bind(e.reporting_warehouse_id.map(Uuid::from)),
        )?;
        Ok(())
    }

    fn entry(&mut self, company: CompanyId, key: &EntryKey) -> StoreResult<Option<LedgerEntry>> {
        let sql = select_sql("ledger_entries", ENTRY_COLUMNS, "WHERE company_id = $1 AND entry_key = $2");
        let row = self.fetch_optional(
            "entry",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(key.to_string()),
        )?;
        row.as_ref().map(entry_from_row).transpose()
    }

    fn delete_entry(
        &mut self,
        company: CompanyId,
        key: &EntryKey,
    ) -> StoreResult<Option<LedgerEntry>> {
        let sql = format!(
            "DELETE FROM ledger_entries WHERE company_id = $1 AND entry_key = $2 RETURNING {}",
            ENTRY_COLUMNS.join(", ")
        );
        let row = self.fetch_optional(
            "delete_entry",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(key.to_string()),
        )?;
        row.as_ref().map(entry_from_row).transpose()
    }

    fn entries_by_header(
        &mut self,
        company: CompanyId,
        header: &HeaderRef,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let sql = select_sql(
            "ledger_entries",
            ENTRY_COLUMNS,
            "WHERE company_id = $1 AND header_key = $2 ORDER BY entry_key",
        );
        self.entries_where(
            "entries_by_header",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(header.to_string()),
        )
    }

    #[instrument(skip(self), fields(company = %company, header = %header), err)]
    fn delete_entries_by_header(
        &mut self,
        company: CompanyId,
        header: &HeaderRef,
    ) -> StoreResult<Vec<StockKey>> {
        let rows = self.fetch_all(
            "delete_entries_by_header",
            sqlx::query(
                "DELETE FROM ledger_entries WHERE company_id = $1 AND header_key = $2 \
                 RETURNING warehouse_id, product_id",
            )
            .bind(Uuid::from(company))
            .bind(header.to_string()),
        )?;
        let mut pairs = BTreeSet::new();
        for row in &rows {
            pairs.insert(pair_from_row(row)?);
        }
        Ok(pairs.into_iter().collect())
    }

    fn ledger_lines(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Vec<LedgerLine>> {
        let rows = self.fetch_all(
            "ledger_lines",
            sqlx::query(
                "SELECT company_id, warehouse_id, product_id, is_inbound, quantity, erp_status, document_date \
                 FROM ledger_entries WHERE company_id = $1 AND warehouse_id = $2 AND product_id = $3",
            )
            .bind(Uuid::from(company))
            .bind(Uuid::from(warehouse))
            .bind(Uuid::from(product)),
        )?;
        rows.iter()
            .map(|row| {
                Ok(LedgerLine {
                    company_id: CompanyId::from_uuid(get(row, "company_id")?),
                    warehouse_id: WarehouseId::from_uuid(get(row, "warehouse_id")?),
                    product_id: ProductId::from_uuid(get(row, "product_id")?),
                    is_inbound: get(row, "is_inbound")?,
                    quantity: get(row, "quantity")?,
                    erp_status: get(row, "erp_status")?,
                    document_date: get(row, "document_date")?,
                })
            })
            .collect()
    }

    fn entries_until(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let sql = select_sql(
            "ledger_entries",
            ENTRY_COLUMNS,
            "WHERE company_id = $1 AND warehouse_id = $2 AND product_id = $3 AND document_date <= $4 \
             ORDER BY document_date, entry_key",
        );
        self.entries_where(
            "entries_until",
            sqlx::query(&sql)
                .bind(Uuid::from(company))
                .bind(Uuid::from(warehouse))
                .bind(Uuid::from(product))
                .bind(to),
        )
    }

    fn list_entries(
        &mut self,
        company: CompanyId,
        filter: &MovementFilter,
        page: Pagination,
    ) -> StoreResult<Page<LedgerEntry>> {
        let count_sql = format!("SELECT COUNT(*) AS total FROM ledger_entries {MOVEMENT_WHERE}");
        let total = self.count(
            "count_entries",
            bind_movement_filter(sqlx::query(&count_sql), company, filter),
        )?;

        let sql = select_sql(
            "ledger_entries",
            ENTRY_COLUMNS,
            &format!("{MOVEMENT_WHERE} ORDER BY document_date DESC, entry_key ASC LIMIT $10 OFFSET $11"),
        );
        let items = self.entries_where(
            "list_entries",
            bind_movement_filter(sqlx::query(&sql), company, filter)
                .bind(i64::from(page.limit))
                .bind(i64::from(page.offset)),
        )?;
        Ok(Page::new(items, total, page))
    }

    fn upsert_note(&mut self, note: &TextNote) -> StoreResult<()> {
        self.execute(
            "upsert_note",
            sqlx::query(
                "INSERT INTO text_notes (company_id, detail_key, header_key, document_date, description, body) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (company_id, detail_key) DO UPDATE SET header_key = EXCLUDED.header_key, \
                 document_date = EXCLUDED.document_date, description = EXCLUDED.description, body = EXCLUDED.body",
            )
            .bind(Uuid::from(note.company_id))
            .bind(note.key.to_string())
            .bind(note.header().to_string())
            .bind(note.document_date)
            .bind(note.description.clone())
            .bind(note.body.clone()),
        )?;
        Ok(())
    }

    fn delete_notes_by_header(&mut self, company: CompanyId, header: &HeaderKey) -> StoreResult<usize> {
        let affected = self.execute(
            "delete_notes_by_header",
            sqlx::query("DELETE FROM text_notes WHERE company_id = $1 AND header_key = $2")
                .bind(Uuid::from(company))
                .bind(header.to_string()),
        )?;
        Ok(affected as usize)
    }

    fn notes_for_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<TextNote>> {
        let rows = self.fetch_all(
            "notes_for_header",
            sqlx::query(
                "SELECT company_id, detail_key, document_date, description, body FROM text_notes \
                 WHERE company_id = $1 AND header_key = $2 ORDER BY detail_key",
            )
            .bind(Uuid::from(company))
            .bind(header.to_string()),
        )?;
        rows.iter()
            .map(|row| {
                let key: String = get(row, "detail_key")?;
                Ok(TextNote {
                    company_id: CompanyId::from_uuid(get(row, "company_id")?),
                    key: DetailKey::parse(&key)?,
                    document_date: get(row, "document_date")?,
                    description: get(row, "description")?,
                    body: get(row, "body")?,
                })
            })
            .collect()
    }

    fn transfer(&mut self, company: CompanyId, id: TransferId) -> StoreResult<Option<Transfer>> {
        let sql = select_sql("transfers", TRANSFER_COLUMNS, "WHERE company_id = $1 AND id = $2");
        let row = self.fetch_optional(
            "transfer",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(Uuid::from(id)),
        )?;
        row.as_ref().map(transfer_from_row).transpose()
    }

    fn transfer_by_dispatch(
        &mut self,
        company: CompanyId,
        dispatch: &DetailKey,
    ) -> StoreResult<Option<Transfer>> {
        let sql = select_sql("transfers", TRANSFER_COLUMNS, "WHERE company_id = $1 AND dispatch_key = $2");
        let row = self.fetch_optional(
            "transfer_by_dispatch",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(dispatch.to_string()),
        )?;
        row.as_ref().map(transfer_from_row).transpose()
    }

    fn transfer_by_ingress(
        &mut self,
        company: CompanyId,
        ingress: &DetailKey,
    ) -> StoreResult<Option<Transfer>> {
        let sql = select_sql(
            "transfers",
            TRANSFER_COLUMNS,
            "WHERE company_id = $1 AND ingress_detail = $2 ORDER BY dispatch_date LIMIT 1",
        );
        let row = self.fetch_optional(
            "transfer_by_ingress",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(ingress.to_string()),
        )?;
        row.as_ref().map(transfer_from_row).transpose()
    }

    fn transfers_by_dispatch_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<Transfer>> {
        let sql = select_sql(
            "transfers",
            TRANSFER_COLUMNS,
            "WHERE company_id = $1 AND dispatch_header = $2 ORDER BY dispatch_key",
        );
        self.transfers_where(
            "transfers_by_dispatch_header",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(header.to_string()),
        )
    }

    fn transfers_by_ingress_header(
        &mut self,
        company: CompanyId,
        header: &HeaderKey,
    ) -> StoreResult<Vec<Transfer>> {
        let sql = select_sql(
            "transfers",
            TRANSFER_COLUMNS,
            "WHERE company_id = $1 AND ingress_header = $2 ORDER BY dispatch_key",
        );
        self.transfers_where(
            "transfers_by_ingress_header",
            sqlx::query(&sql).bind(Uuid::from(company)).bind(header.to_string()),
        )
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
        let sql = select_sql(
            "transfers",
            TRANSFER_COLUMNS,
            "WHERE company_id = $1 AND state = $2 AND ingress_detail IS NULL \
             AND product_id = $3 AND destination_id = $4 AND quantity_sent = $5 \
             AND dispatch_date >= $6 AND dispatch_date <= $7 \
             ORDER BY dispatch_date, dispatch_key",
        );
        self.transfers_where(
            "transfer_candidates",
            sqlx::query(&sql)
                .bind(Uuid::from(company))
                .bind(TransferState::InTransit.as_str())
                .bind(Uuid::from(product))
                .bind(Uuid::from(destination))
                .bind(quantity)
                .bind(dispatched_from)
                .bind(dispatched_to),
        )
    }

    #[instrument(skip(self, transfer), fields(company = %transfer.company_id, transfer_id = %transfer.id), err)]
    fn save_transfer(&mut self, transfer: &Transfer) -> StoreResult<()> {
        let sql = upsert_sql("transfers", TRANSFER_COLUMNS, &["id"]);
        let t = transfer;
        self.execute(
            "save_transfer",
            sqlx::query(&sql)
                .bind(Uuid::from(t.id))
                .bind(Uuid::from(t.company_id))
                .bind(t.dispatch_key.to_string())
                .bind(t.dispatch_header().to_string())
                .bind(Uuid::from(t.origin_id))
                .bind(Uuid::from(t.destination_id))
                .bind(Uuid::from(t.product_id))
                .bind(t.quantity_sent)
                .bind(t.quantity_received)
                .bind(t.quantity_diff)
                .bind(t.state.as_str())
                .bind(t.dispatch_date)
                .bind(t.reception_date)
                .bind(t.ingress_header.as_ref().map(ToString::to_string))
                .bind(t.ingress_detail.as_ref().map(ToString::to_string))
                .bind(t.notes.clone()),
        )?;
        Ok(())
    }

    fn delete_transfer(&mut self, company: CompanyId, id: TransferId) -> StoreResult<bool> {
        let affected = self.execute(
            "delete_transfer",
            sqlx::query("DELETE FROM transfers WHERE company_id = $1 AND id = $2")
                .bind(Uuid::from(company))
                .bind(Uuid::from(id)),
        )?;
        Ok(affected > 0)
    }

    fn in_transit_from(
        &mut self,
        company: CompanyId,
        origin: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Decimal> {
        self.sum(
            "in_transit_from",
            sqlx::query(
                "SELECT SUM(quantity_sent) AS total FROM transfers \
                 WHERE company_id = $1 AND origin_id = $2 AND product_id = $3 AND state = $4",
            )
            .bind(Uuid::from(company))
            .bind(Uuid::from(origin))
            .bind(Uuid::from(product))
            .bind(TransferState::InTransit.as_str()),
        )
    }

    fn in_transit_towards(
        &mut self,
        company: CompanyId,
        destination: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Decimal> {
        self.sum(
            "in_transit_towards",
            sqlx::query(
                "SELECT SUM(quantity_sent) AS total FROM transfers \
                 WHERE company_id = $1 AND destination_id = $2 AND product_id = $3 AND state = $4",
            )
            .bind(Uuid::from(company))
            .bind(Uuid::from(destination))
            .bind(Uuid::from(product))
            .bind(TransferState::InTransit.as_str()),
        )
    }

    fn list_transfers(
        &mut self,
        company: CompanyId,
        filter: &TransferFilter,
        page: Pagination,
    ) -> StoreResult<Page<Transfer>> {
        let count_sql = format!("SELECT COUNT(*) AS total FROM transfers {TRANSFER_WHERE}");
        let total = self.count(
            "count_transfers",
            bind_transfer_filter(sqlx::query(&count_sql), company, filter),
        )?;

        let sql = select_sql(
            "transfers",
            TRANSFER_COLUMNS,
            &format!("{TRANSFER_WHERE} ORDER BY dispatch_date DESC, dispatch_key ASC LIMIT $8 OFFSET $9"),
        );
        let items = self.transfers_where(
            "list_transfers",
            bind_transfer_filter(sqlx::query(&sql), company, filter)
                .bind(i64::from(page.limit))
                .bind(i64::from(page.offset)),
        )?;
        Ok(Page::new(items, total, page))
    }

    fn upsert_balance(&mut self, balance: &StockBalance) -> StoreResult<()> {
        let sql = upsert_sql(
            "stock_balances",
            BALANCE_COLUMNS,
            &["company_id", "warehouse_id", "product_id"],
        );
        self.execute(
            "upsert_balance",
            sqlx::query(&sql)
                .bind(Uuid::from(balance.company_id))
                .bind(Uuid::from(balance.warehouse_id))
                .bind(Uuid::from(balance.product_id))
                .bind(balance.current)
                .bind(balance.in_transit)
                .bind(balance.last_movement_date)
                .bind(balance.updated_at),
        )?;
        Ok(())
    }

    fn balance(
        &mut self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Option<StockBalance>> {
        let sql = select_sql(
            "stock_balances",
            BALANCE_COLUMNS,
            "WHERE company_id = $1 AND warehouse_id = $2 AND product_id = $3",
        );
        let row = self.fetch_optional(
            "balance",
            sqlx::query(&sql)
                .bind(Uuid::from(company))
                .bind(Uuid::from(warehouse))
                .bind(Uuid::from(product)),
        )?;
        row.as_ref().map(balance_from_row).transpose()
    }

    fn list_balances(
        &mut self,
        company: CompanyId,
        filter: &StockFilter,
        page: Pagination,
    ) -> StoreResult<Page<StockBalance>> {
        let count_sql = format!("SELECT COUNT(*) AS total FROM stock_balances {STOCK_WHERE}");
        let total = self.count(
            "count_balances",
            bind_stock_filter(sqlx::query(&count_sql), company, filter),
        )?;

        let sql = select_sql(
            "stock_balances",
            BALANCE_COLUMNS,
            &format!("{STOCK_WHERE} ORDER BY warehouse_id, product_id LIMIT $5 OFFSET $6"),
        );
        let rows = self.fetch_all(
            "list_balances",
            bind_stock_filter(sqlx::query(&sql), company, filter)
                .bind(i64::from(page.limit))
                .bind(i64::from(page.offset)),
        )?;
        let items = rows.iter().map(balance_from_row).collect::<StoreResult<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    fn stock_keys(&mut self, company: CompanyId) -> StoreResult<Vec<StockKey>> {
        let rows = self.fetch_all(
            "stock_keys",
            sqlx::query(
                "SELECT warehouse_id, product_id FROM ledger_entries WHERE company_id = $1 \
                 UNION SELECT origin_id, product_id FROM transfers WHERE company_id = $1 \
                 UNION SELECT destination_id, product_id FROM transfers WHERE company_id = $1 \
                 UNION SELECT warehouse_id, product_id FROM stock_balances WHERE company_id = $1 \
                 ORDER BY 1, 2",
            )
            .bind(Uuid::from(company)),
        )?;
        rows.iter().map(pair_from_row).collect()
    }

    #[instrument(skip(self), fields(company = %company), err)]
    fn purge_company(&mut self, company: CompanyId) -> StoreResult<()> {
        for table in [
            "stock_balances",
            "transfers",
            "text_notes",
            "ledger_entries",
            "legacy_details",
            "legacy_headers",
            "sync_control",
        ] {
            let sql = format!("DELETE FROM {table} WHERE company_id = $1");
            self.execute("purge_company", sqlx::query(&sql).bind(Uuid::from(company)))?;
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let PgTx { rt, tx } = *self;
        rt.block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

fn header_scoped<'q>(sql: &'q str, company: CompanyId, key: &HeaderKey) -> PgQuery<'q> {
    sqlx::query(sql)
        .bind(Uuid::from(company))
        .bind(key.warehouse().to_string())
        .bind(key.doc_type().to_string())
        .bind(key.doc_number().to_string())
}

const MOVEMENT_WHERE: &str = "WHERE company_id = $1 \
    AND ($2::uuid IS NULL OR warehouse_id = $2) \
    AND ($3::uuid IS NULL OR product_id = $3) \
    AND ($4::timestamptz IS NULL OR document_date >= $4) \
    AND ($5::timestamptz IS NULL OR document_date <= $5) \
    AND ($6::text IS NULL OR doc_type = $6) \
    AND ($7::bool IS NULL OR is_inbound = $7) \
    AND ($8::text IS NULL OR erp_status = $8) \
    AND ($9::text IS NULL OR counterpart_id = $9)";

fn bind_movement_filter<'q>(query: PgQuery<'q>, company: CompanyId, filter: &MovementFilter) -> PgQuery<'q> {
    query
        .bind(Uuid::from(company))
        .bind(filter.warehouse_id.map(Uuid::from))
        .bind(filter.product_id.map(Uuid::from))
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.doc_type.clone())
        .bind(filter.is_inbound)
        .bind(filter.erp_status.clone())
        .bind(filter.counterpart_id.clone())
}

const TRANSFER_WHERE: &str = "WHERE company_id = $1 \
    AND ($2::text IS NULL OR state = $2) \
    AND ($3::uuid IS NULL OR origin_id = $3) \
    AND ($4::uuid IS NULL OR destination_id = $4) \
    AND ($5::uuid IS NULL OR product_id = $5) \
    AND ($6::timestamptz IS NULL OR dispatch_date >= $6) \
    AND ($7::timestamptz IS NULL OR dispatch_date <= $7)";

fn bind_transfer_filter<'q>(query: PgQuery<'q>, company: CompanyId, filter: &TransferFilter) -> PgQuery<'q> {
    query
        .bind(Uuid::from(company))
        .bind(filter.state.map(|s| s.as_str().to_string()))
        .bind(filter.origin_id.map(Uuid::from))
        .bind(filter.destination_id.map(Uuid::from))
        .bind(filter.product_id.map(Uuid::from))
        .bind(filter.from)
        .bind(filter.to)
}

const STOCK_WHERE: &str = "WHERE company_id = $1 \
    AND ($2::uuid IS NULL OR warehouse_id = $2) \
    AND ($3::uuid IS NULL OR product_id = $3) \
    AND (NOT $4 OR current_qty > 0)";

fn bind_stock_filter<'q>(query: PgQuery<'q>, company: CompanyId, filter: &StockFilter) -> PgQuery<'q> {
    query
        .bind(Uuid::from(company))
        .bind(filter.warehouse_id.map(Uuid::from))
        .bind(filter.product_id.map(Uuid::from))
        .bind(filter.only_positive)
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::InvalidData(format!("failed to read {column}: {e}")))
}

fn company_from_row(row: &PgRow) -> StoreResult<Company> {
    Ok(Company {
        id: CompanyId::from_uuid(get(row, "id")?),
        alias: get(row, "alias")?,
        name: get(row, "name")?,
    })
}

fn warehouse_from_row(row: &PgRow) -> StoreResult<Warehouse> {
    let code: String = get(row, "code")?;
    Ok(Warehouse {
        id: WarehouseId::from_uuid(get(row, "id")?),
        company_id: CompanyId::from_uuid(get(row, "company_id")?),
        code: WarehouseCode::new(&code)?,
        description: get(row, "description")?,
    })
}

fn product_from_row(row: &PgRow) -> StoreResult<Product> {
    let code: String = get(row, "code")?;
    Ok(Product {
        id: ProductId::from_uuid(get(row, "id")?),
        company_id: CompanyId::from_uuid(get(row, "company_id")?),
        code: ProductCode::new(&code)?,
        name: get(row, "name")?,
    })
}

fn header_key_from_row(row: &PgRow) -> StoreResult<HeaderKey> {
    let warehouse: String = get(row, "warehouse_code")?;
    let doc_type: String = get(row, "doc_type")?;
    let doc_number: String = get(row, "doc_number")?;
    Ok(HeaderKey::new(&warehouse, &doc_type, &doc_number)?)
}

fn header_from_row(row: &PgRow) -> StoreResult<LegacyHeader> {
    Ok(LegacyHeader {
        key: header_key_from_row(row)?,
        document_date: get(row, "document_date")?,
        time_of_day: get(row, "time_of_day")?,
        direction_flag: get(row, "direction_flag")?,
        movement_subtype: get(row, "movement_subtype")?,
        status: get(row, "status")?,
        reference_type: get(row, "reference_type")?,
        reference_number: get(row, "reference_number")?,
        reference_warehouse: get(row, "reference_warehouse")?,
        counterpart_code: get(row, "counterpart_code")?,
        counterpart_name: get(row, "counterpart_name")?,
        supplier_code: get(row, "supplier_code")?,
        supplier_name: get(row, "supplier_name")?,
        gloss: get(row, "gloss")?,
        updated_at: get(row, "updated_at")?,
        user: get(row, "erp_user")?,
        is_import: get(row, "is_import")?,
        import_number: get(row, "import_number")?,
        transfer_reason: get(row, "transfer_reason")?,
        purchase_order: get(row, "purchase_order")?,
        delivery_address: get(row, "delivery_address")?,
    })
}

fn detail_from_row(row: &PgRow) -> StoreResult<LegacyDetail> {
    let item: i32 = get(row, "item")?;
    let item = u32::try_from(item)
        .map_err(|_| StoreError::InvalidData(format!("negative detail item {item}")))?;
    Ok(LegacyDetail {
        key: header_key_from_row(row)?.item(item),
        product_code: get(row, "product_code")?,
        quantity: get(row, "quantity")?,
        unit_price: get(row, "unit_price")?,
        line_value: get(row, "line_value")?,
        batch: get(row, "batch")?,
        series: get(row, "series")?,
        unit: get(row, "unit")?,
        line_date: get(row, "line_date")?,
        gloss: get(row, "gloss")?,
        description: get(row, "description")?,
        text: get(row, "body")?,
    })
}

fn entry_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    let key: String = get(row, "entry_key")?;
    let item: i32 = get(row, "item")?;
    let reporting: Option<Uuid> = get(row, "reporting_warehouse_id")?;
    Ok(LedgerEntry {
        company_id: CompanyId::from_uuid(get(row, "company_id")?),
        key: EntryKey::parse(&key)?,
        warehouse_id: WarehouseId::from_uuid(get(row, "warehouse_id")?),
        product_id: ProductId::from_uuid(get(row, "product_id")?),
        doc_type: get(row, "doc_type")?,
        doc_number: get(row, "doc_number")?,
        item: item.max(0) as u32,
        document_date: get(row, "document_date")?,
        movement_date: get(row, "movement_date")?,
        is_inbound: get(row, "is_inbound")?,
        quantity: get(row, "quantity")?,
        unit_cost: get(row, "unit_cost")?,
        line_value: get(row, "line_value")?,
        batch: get(row, "batch")?,
        series: get(row, "series")?,
        unit: get(row, "unit")?,
        erp_status: get(row, "erp_status")?,
        movement_subtype: get(row, "movement_subtype")?,
        header_gloss: get(row, "header_gloss")?,
        line_gloss: get(row, "line_gloss")?,
        reference_document: get(row, "reference_document")?,
        reference_warehouse: get(row, "reference_warehouse")?,
        purchase_order: get(row, "purchase_order")?,
        counterpart_id: get(row, "counterpart_id")?,
        counterpart_name: get(row, "counterpart_name")?,
        supplier_id: get(row, "supplier_id")?,
        supplier_name: get(row, "supplier_name")?,
        is_import: get(row, "is_import")?,
        import_id: get(row, "import_id")?,
        transfer_reason: get(row, "transfer_reason")?,
        delivery_address: get(row, "delivery_address")?,
        reporting_warehouse_id: reporting.map(WarehouseId::from_uuid),
    })
}

fn transfer_from_row(row: &PgRow) -> StoreResult<Transfer> {
    let dispatch_key: String = get(row, "dispatch_key")?;
    let state: String = get(row, "state")?;
    let ingress_header: Option<String> = get(row, "ingress_header")?;
    let ingress_detail: Option<String> = get(row, "ingress_detail")?;
    Ok(Transfer {
        id: TransferId::from_uuid(get(row, "id")?),
        company_id: CompanyId::from_uuid(get(row, "company_id")?),
        dispatch_key: DetailKey::parse(&dispatch_key)?,
        origin_id: WarehouseId::from_uuid(get(row, "origin_id")?),
        destination_id: WarehouseId::from_uuid(get(row, "destination_id")?),
        product_id: ProductId::from_uuid(get(row, "product_id")?),
        quantity_sent: get(row, "quantity_sent")?,
        quantity_received: get(row, "quantity_received")?,
        quantity_diff: get(row, "quantity_diff")?,
        state: TransferState::parse(&state)?,
        dispatch_date: get(row, "dispatch_date")?,
        reception_date: get(row, "reception_date")?,
        ingress_header: ingress_header.as_deref().map(HeaderKey::parse).transpose()?,
        ingress_detail: ingress_detail.as_deref().map(DetailKey::parse).transpose()?,
        notes: get(row, "notes")?,
    })
}

fn balance_from_row(row: &PgRow) -> StoreResult<StockBalance> {
    Ok(StockBalance {
        company_id: CompanyId::from_uuid(get(row, "company_id")?),
        warehouse_id: WarehouseId::from_uuid(get(row, "warehouse_id")?),
        product_id: ProductId::from_uuid(get(row, "product_id")?),
        current: get(row, "current_qty")?,
        in_transit: get(row, "in_transit")?,
        last_movement_date: get(row, "last_movement_date")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn pair_from_row(row: &PgRow) -> StoreResult<StockKey> {
    Ok((
        WarehouseId::from_uuid(get(row, "warehouse_id")?),
        ProductId::from_uuid(get(row, "product_id")?),
    ))
}

/// Map SQLx errors to store errors.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") => StoreError::InvalidData(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => {
            StoreError::Connection(format!("connection error in {}: {}", operation, err))
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("unexpected row not found in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::InvalidData(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
