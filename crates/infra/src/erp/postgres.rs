//! ERP reader over `movalmcab` / `movalmdet` on a Postgres connection.
//!
//! The ERP tables are typically exposed through a foreign-data schema, so the
//! reader tolerates column-name casing, nullable columns and CHAR padding on
//! key fields. Every read is bounded by a timeout that counts as transient.
//!
//! Header columns: `caalma, catd, canumdoc, cafecdoc, cahora, catipmov,
//! cacodmov, casitgui, carftdoc, carfndoc, carfalma, cacodcli, canomcli,
//! cacodpro, canompro, caglosa, cafecact, causuari, caimportacion, canroimp,
//! motivo_gs, canumord, cadirenv`.
//!
//! Detail columns: `dealma, detd, denumdoc, deitem, decodigo, decantid,
//! depreuni, devaltot, delote, deserie, deunidad, defecdoc, deglosa, dedescri,
//! detexto`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, Row};
use tokio::runtime::Runtime;
use tracing::{instrument, warn};

use kardex_core::HeaderKey;
use kardex_inventory::{HeaderStatus, LegacyDetail, LegacyHeader};

use super::{ErpError, ErpReader, ErpResult, HeaderCursor};
use crate::config::ErpConnectionConfig;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

const KEY_ORDER: &str =
    r#"cafecdoc, TRIM(caalma) COLLATE "C", TRIM(catd) COLLATE "C", TRIM(canumdoc) COLLATE "C""#;

#[derive(Debug, Clone)]
pub struct PgErpReader {
    pool: PgPool,
    runtime: Arc<Runtime>,
    schema: String,
    read_timeout: Duration,
}

impl PgErpReader {
    pub fn new(pool: PgPool, runtime: Arc<Runtime>, schema: &str, read_timeout: Duration) -> ErpResult<Self> {
        if !IDENTIFIER.is_match(schema) {
            return Err(ErpError::Config(format!("invalid erp schema name '{schema}'")));
        }
        Ok(Self {
            pool,
            runtime,
            schema: schema.to_string(),
            read_timeout,
        })
    }

    /// Build a lazily connecting pool; nothing is dialed until the first read.
    pub fn connect(runtime: Arc<Runtime>, config: &ErpConnectionConfig, read_timeout: Duration) -> ErpResult<Self> {
        let pool = {
            let _guard = runtime.enter();
            PgPoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .acquire_timeout(read_timeout)
                .connect_lazy(config.url.expose_secret())
                .map_err(|e| map_erp_error("connect", e))?
        };
        Self::new(pool, runtime, &config.schema, read_timeout)
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    fn run<T, F>(&self, operation: &str, fut: F) -> ErpResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let timeout = self.read_timeout;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, fut).await })
            .map_err(|_| ErpError::Timeout(timeout))?
            .map_err(|e| map_erp_error(operation, e))
    }
}

impl ErpReader for PgErpReader {
    #[instrument(skip(self, doc_types), err)]
    fn count_headers(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) AS total FROM {} WHERE cafecdoc >= $1 AND TRIM(catd) = ANY($2)",
            self.table("movalmcab")
        );
        let row = self.run(
            "count_headers",
            sqlx::query(&sql)
                .bind(since.naive_utc())
                .bind(doc_types.to_vec())
                .fetch_one(&self.pool),
        )?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| ErpError::Decode(e.to_string()))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self, doc_types, after), err)]
    fn fetch_headers(
        &self,
        since: DateTime<Utc>,
        doc_types: &[String],
        after: Option<&HeaderCursor>,
        limit: usize,
    ) -> ErpResult<Vec<LegacyHeader>> {
        let sql = format!(
            r#"SELECT * FROM {table}
               WHERE cafecdoc >= $1 AND TRIM(catd) = ANY($2)
                 AND ($3::timestamp IS NULL
                      OR cafecdoc > $3
                      OR (cafecdoc = $3 AND (TRIM(caalma) COLLATE "C", TRIM(catd) COLLATE "C", TRIM(canumdoc) COLLATE "C") > ($4, $5, $6)))
               ORDER BY {KEY_ORDER}
               LIMIT $7"#,
            table = self.table("movalmcab")
        );
        let rows = self.run(
            "fetch_headers",
            sqlx::query(&sql)
                .bind(since.naive_utc())
                .bind(doc_types.to_vec())
                .bind(after.map(|c| c.document_date.naive_utc()))
                .bind(after.map(|c| c.key.warehouse().to_string()))
                .bind(after.map(|c| c.key.doc_type().to_string()))
                .bind(after.map(|c| c.key.doc_number().to_string()))
                .bind(limit as i64)
                .fetch_all(&self.pool),
        )?;

        let mut headers = Vec::with_capacity(rows.len());
        for row in &rows {
            match header_from_row(&ErpRow(row)) {
                Ok(Some(header)) => headers.push(header),
                Ok(None) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(headers)
    }

    #[instrument(skip(self), fields(header = %header), err)]
    fn stream_details(&self, header: &HeaderKey) -> ErpResult<Vec<LegacyDetail>> {
        let sql = format!(
            "SELECT * FROM {} WHERE TRIM(dealma) = $1 AND TRIM(detd) = $2 AND TRIM(denumdoc) = $3 ORDER BY deitem",
            self.table("movalmdet")
        );
        let rows = self.run(
            "stream_details",
            sqlx::query(&sql)
                .bind(header.warehouse().to_string())
                .bind(header.doc_type().to_string())
                .bind(header.doc_number().to_string())
                .fetch_all(&self.pool),
        )?;
        rows.iter()
            .filter_map(|row| detail_from_row(&ErpRow(row)).transpose())
            .collect()
    }

    #[instrument(skip(self, headers), fields(headers = headers.len()), err)]
    fn details_for(&self, headers: &[HeaderKey]) -> ErpResult<BTreeMap<HeaderKey, Vec<LegacyDetail>>> {
        let mut out: BTreeMap<HeaderKey, Vec<LegacyDetail>> =
            headers.iter().map(|k| (k.clone(), Vec::new())).collect();
        if headers.is_empty() {
            return Ok(out);
        }

        let sql = format!(
            "SELECT * FROM {} WHERE (TRIM(dealma), TRIM(detd), TRIM(denumdoc)) IN \
             (SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[])) \
             ORDER BY dealma, detd, denumdoc, deitem",
            self.table("movalmdet")
        );
        let rows = self.run(
            "details_for",
            sqlx::query(&sql)
                .bind(headers.iter().map(|k| k.warehouse().to_string()).collect::<Vec<_>>())
                .bind(headers.iter().map(|k| k.doc_type().to_string()).collect::<Vec<_>>())
                .bind(headers.iter().map(|k| k.doc_number().to_string()).collect::<Vec<_>>())
                .fetch_all(&self.pool),
        )?;

        for row in &rows {
            if let Some(detail) = detail_from_row(&ErpRow(row))? {
                if let Some(lines) = out.get_mut(detail.key.header()) {
                    lines.push(detail);
                }
            }
        }
        for lines in out.values_mut() {
            lines.sort_by_key(|d| d.key.item_number());
        }
        Ok(out)
    }

    #[instrument(skip(self, doc_types), err)]
    fn list_header_keys(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<Vec<HeaderStatus>> {
        let sql = format!(
            "SELECT caalma, catd, canumdoc, casitgui FROM {} WHERE cafecdoc >= $1 AND TRIM(catd) = ANY($2)",
            self.table("movalmcab")
        );
        let rows = self.run(
            "list_header_keys",
            sqlx::query(&sql)
                .bind(since.naive_utc())
                .bind(doc_types.to_vec())
                .fetch_all(&self.pool),
        )?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let row = ErpRow(row);
            if let Some(key) = header_key(&row, "caalma", "catd", "canumdoc")? {
                keys.push(HeaderStatus {
                    key,
                    status: row.text("casitgui")?.unwrap_or_default(),
                });
            }
        }
        Ok(keys)
    }
}

/// Case-insensitive, type-tolerant column access.
struct ErpRow<'r>(&'r PgRow);

impl ErpRow<'_> {
    fn index(&self, name: &str) -> Option<usize> {
        self.0
            .columns()
            .iter()
            .position(|c| c.name().eq_ignore_ascii_case(name))
    }

    fn try_decode<'a, T>(&'a self, idx: usize) -> Option<Option<T>>
    where
        T: sqlx::Decode<'a, Postgres> + sqlx::Type<Postgres>,
    {
        self.0.try_get::<Option<T>, _>(idx).ok()
    }

    /// Text with trailing padding removed; blank is `None`.
    fn text(&self, name: &str) -> ErpResult<Option<String>> {
        let Some(idx) = self.index(name) else {
            return Ok(None);
        };
        let value: Option<String> = self
            .try_decode(idx)
            .ok_or_else(|| ErpError::Decode(format!("column {name} is not text")))?;
        Ok(value
            .map(|v| v.trim_end().to_string())
            .filter(|v| !v.trim().is_empty()))
    }

    fn decimal(&self, name: &str) -> ErpResult<Decimal> {
        let Some(idx) = self.index(name) else {
            return Ok(Decimal::ZERO);
        };
        if let Some(value) = self.try_decode::<Decimal>(idx) {
            return Ok(value.unwrap_or(Decimal::ZERO));
        }
        if let Some(value) = self.try_decode::<f64>(idx) {
            return Ok(value.and_then(Decimal::from_f64).unwrap_or(Decimal::ZERO));
        }
        if let Some(value) = self.try_decode::<i64>(idx) {
            return Ok(value.map(Decimal::from).unwrap_or(Decimal::ZERO));
        }
        Err(ErpError::Decode(format!("column {name} is not numeric")))
    }

    fn integer(&self, name: &str) -> ErpResult<Option<i64>> {
        let Some(idx) = self.index(name) else {
            return Ok(None);
        };
        if let Some(value) = self.try_decode::<i32>(idx) {
            return Ok(value.map(i64::from));
        }
        if let Some(value) = self.try_decode::<i64>(idx) {
            return Ok(value);
        }
        if let Some(value) = self.try_decode::<i16>(idx) {
            return Ok(value.map(i64::from));
        }
        if let Some(value) = self.try_decode::<Decimal>(idx) {
            return Ok(value.and_then(|d| i64::try_from(d.trunc()).ok()));
        }
        Err(ErpError::Decode(format!("column {name} is not an integer")))
    }

    fn flag(&self, name: &str) -> ErpResult<bool> {
        let Some(idx) = self.index(name) else {
            return Ok(false);
        };
        if let Some(value) = self.try_decode::<bool>(idx) {
            return Ok(value.unwrap_or(false));
        }
        Ok(self.integer(name)?.is_some_and(|v| v != 0))
    }

    /// Timestamps are stored without zone in the ERP and read as UTC.
    fn timestamp(&self, name: &str) -> ErpResult<Option<DateTime<Utc>>> {
        let Some(idx) = self.index(name) else {
            return Ok(None);
        };
        if let Some(value) = self.try_decode::<DateTime<Utc>>(idx) {
            return Ok(value);
        }
        if let Some(value) = self.try_decode::<NaiveDateTime>(idx) {
            return Ok(value.map(|v| v.and_utc()));
        }
        if let Some(value) = self.try_decode::<NaiveDate>(idx) {
            return Ok(value.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|v| v.and_utc()));
        }
        Err(ErpError::Decode(format!("column {name} is not a timestamp")))
    }
}

/// Key of a row, or `None` (logged) when a component is blank.
fn header_key(row: &ErpRow<'_>, wh: &str, dt: &str, num: &str) -> ErpResult<Option<HeaderKey>> {
    let warehouse = row.text(wh)?.unwrap_or_default();
    let doc_type = row.text(dt)?.unwrap_or_default();
    let number = row.text(num)?.unwrap_or_default();
    match HeaderKey::new(&warehouse, &doc_type, &number) {
        Ok(key) => Ok(Some(key)),
        Err(err) => {
            warn!(warehouse, doc_type, number, error = %err, "skipping erp row with malformed key");
            Ok(None)
        }
    }
}

fn header_from_row(row: &ErpRow<'_>) -> ErpResult<Option<LegacyHeader>> {
    let Some(key) = header_key(row, "caalma", "catd", "canumdoc")? else {
        return Ok(None);
    };
    let Some(document_date) = row.timestamp("cafecdoc")? else {
        warn!(header = %key, "skipping erp header without document date");
        return Ok(None);
    };
    let status = row.text("casitgui")?.map(|s| s.trim().to_string()).unwrap_or_default();

    let mut header = LegacyHeader::new(key, document_date, status);
    header.time_of_day = row.text("cahora")?;
    header.direction_flag = row.text("catipmov")?;
    header.movement_subtype = row.text("cacodmov")?;
    header.reference_type = row.text("carftdoc")?;
    header.reference_number = row.text("carfndoc")?;
    header.reference_warehouse = row.text("carfalma")?;
    header.counterpart_code = row.text("cacodcli")?;
    header.counterpart_name = row.text("canomcli")?;
    header.supplier_code = row.text("cacodpro")?;
    header.supplier_name = row.text("canompro")?;
    header.gloss = row.text("caglosa")?;
    header.updated_at = row.timestamp("cafecact")?;
    header.user = row.text("causuari")?;
    header.is_import = row.flag("caimportacion")?;
    header.import_number = row.text("canroimp")?;
    header.transfer_reason = row.text("motivo_gs")?;
    header.purchase_order = row.text("canumord")?;
    header.delivery_address = row.text("cadirenv")?;
    Ok(Some(header))
}

fn detail_from_row(row: &ErpRow<'_>) -> ErpResult<Option<LegacyDetail>> {
    let Some(key) = header_key(row, "dealma", "detd", "denumdoc")? else {
        return Ok(None);
    };
    let Some(item) = row.integer("deitem")?.and_then(|i| u32::try_from(i).ok()) else {
        warn!(header = %key, "skipping erp detail without item number");
        return Ok(None);
    };

    Ok(Some(LegacyDetail {
        key: key.item(item),
        product_code: row.text("decodigo")?.map(|c| c.trim().to_string()),
        quantity: row.decimal("decantid")?,
        unit_price: row.decimal("depreuni")?,
        line_value: row.decimal("devaltot")?,
        batch: row.text("delote")?,
        series: row.text("deserie")?,
        unit: row.text("deunidad")?,
        line_date: row.timestamp("defecdoc")?,
        gloss: row.text("deglosa")?,
        description: row.text("dedescri")?,
        text: row.text("detexto")?,
    }))
}

/// Map SQLx errors to ERP errors.
fn map_erp_error(operation: &str, err: sqlx::Error) -> ErpError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            ErpError::Connection(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                // connection exceptions, admin shutdown, query cancelled
                Some(code) if code.starts_with("08") || code == "57P01" || code == "57014" => {
                    ErpError::Connection(msg)
                }
                _ => ErpError::Query(msg),
            }
        }
        sqlx::Error::Configuration(_) => ErpError::Config(format!("{operation}: {err}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            ErpError::Decode(format!("{operation}: {err}"))
        }
        _ => ErpError::Query(format!("{operation}: {err}")),
    }
}
