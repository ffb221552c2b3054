//! In-memory ERP.
//!
//! Holds headers and details the way the remote tables would, plus a queue of
//! scripted failures consumed by the next reads.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};

use kardex_core::{DetailKey, HeaderKey};
use kardex_inventory::{HeaderStatus, LegacyDetail, LegacyHeader};

use super::{ErpError, ErpReader, ErpResult, HeaderCursor};

#[derive(Debug, Default)]
struct ErpTables {
    headers: BTreeMap<HeaderKey, LegacyHeader>,
    details: BTreeMap<DetailKey, LegacyDetail>,
}

/// Scripted ERP.
#[derive(Debug, Default)]
pub struct InMemoryErpReader {
    tables: RwLock<ErpTables>,
    failures: Mutex<VecDeque<ErpError>>,
    reads: AtomicU64,
}

impl InMemoryErpReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header together with all of its details.
    pub fn insert(&self, header: LegacyHeader, details: Vec<LegacyDetail>) {
        if let Ok(mut tables) = self.tables.write() {
            let key = header.key.clone();
            tables.details.retain(|k, _| k.header() != &key);
            for detail in details {
                tables.details.insert(detail.key.clone(), detail);
            }
            tables.headers.insert(key, header);
        }
    }

    pub fn set_status(&self, key: &HeaderKey, status: &str) {
        if let Ok(mut tables) = self.tables.write()
            && let Some(header) = tables.headers.get_mut(key)
        {
            header.status = status.to_string();
        }
    }

    /// Hard-delete a header upstream.
    pub fn remove(&self, key: &HeaderKey) {
        if let Ok(mut tables) = self.tables.write() {
            tables.headers.remove(key);
            tables.details.retain(|k, _| k.header() != key);
        }
    }

    /// Make the next `times` reads fail with `error`.
    pub fn fail_next(&self, times: usize, error: ErpError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(std::iter::repeat_n(error, times));
        }
    }

    /// Reads attempted so far, including failed ones.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn read<T>(&self, f: impl FnOnce(&ErpTables) -> T) -> ErpResult<T> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .failures
            .lock()
            .map_err(|_| ErpError::Connection("failure queue poisoned".into()))?
            .pop_front()
        {
            return Err(err);
        }
        let tables = self
            .tables
            .read()
            .map_err(|_| ErpError::Connection("erp tables poisoned".into()))?;
        Ok(f(&tables))
    }
}

fn in_window(header: &LegacyHeader, since: DateTime<Utc>, doc_types: &[String]) -> bool {
    header.document_date >= since && doc_types.iter().any(|d| d == header.key.doc_type().as_str())
}

impl ErpReader for InMemoryErpReader {
    fn count_headers(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<u64> {
        self.read(|t| {
            t.headers
                .values()
                .filter(|h| in_window(h, since, doc_types))
                .count() as u64
        })
    }

    fn fetch_headers(
        &self,
        since: DateTime<Utc>,
        doc_types: &[String],
        after: Option<&HeaderCursor>,
        limit: usize,
    ) -> ErpResult<Vec<LegacyHeader>> {
        self.read(|t| {
            let mut headers: Vec<LegacyHeader> = t
                .headers
                .values()
                .filter(|h| in_window(h, since, doc_types))
                .filter(|h| after.is_none_or(|c| c.precedes(h)))
                .cloned()
                .collect();
            headers.sort_by(|a, b| (a.document_date, &a.key).cmp(&(b.document_date, &b.key)));
            headers.truncate(limit);
            headers
        })
    }

    fn stream_details(&self, header: &HeaderKey) -> ErpResult<Vec<LegacyDetail>> {
        self.read(|t| {
            t.details
                .values()
                .filter(|d| d.key.header() == header)
                .cloned()
                .collect()
        })
    }

    fn list_header_keys(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<Vec<HeaderStatus>> {
        self.read(|t| {
            t.headers
                .values()
                .filter(|h| in_window(h, since, doc_types))
                .map(LegacyHeader::status_row)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    #[test]
    fn details_follow_their_header() {
        let erp = InMemoryErpReader::new();
        let key = HeaderKey::new("AL", "NI", "000001").unwrap();
        let date = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        erp.insert(
            LegacyHeader::new(key.clone(), date, "F"),
            vec![
                LegacyDetail::new(key.item(2), "P2", Decimal::ONE),
                LegacyDetail::new(key.item(1), "P1", Decimal::ONE),
            ],
        );

        let details = erp.stream_details(&key).unwrap();
        assert_eq!(details.iter().map(|d| d.key.item_number()).collect::<Vec<_>>(), vec![1, 2]);

        erp.remove(&key);
        assert!(erp.stream_details(&key).unwrap().is_empty());
        assert_eq!(erp.count_headers(date, &["NI".to_string()]).unwrap(), 0);
    }
}
