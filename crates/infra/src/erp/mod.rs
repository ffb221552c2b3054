//! Read-only access to the ERP warehouse tables of each company.
//!
//! ## Components
//!
//! - [`ErpReader`]: cursor over remote headers and details
//! - [`InMemoryErpReader`]: scripted ERP for tests and development
//! - [`PgErpReader`]: `MOVALMCAB` / `MOVALMDET` over a Postgres connection
//! - [`RetryingErpReader`]: retries transient failures with backoff
//! - [`ErpRegistry`]: readers by company alias
//!
//! Headers are always yielded in ascending `(document_date, key)` order, which
//! is also the keyset used to page through them.

pub mod memory;
pub mod postgres;
pub mod registry;
pub mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use kardex_core::HeaderKey;
use kardex_inventory::{HeaderStatus, LegacyDetail, LegacyHeader};

pub use memory::InMemoryErpReader;
pub use postgres::PgErpReader;
pub use registry::ErpRegistry;
pub use retry::{BackoffStrategy, RetryPolicy, RetryingErpReader};

/// ERP read failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErpError {
    #[error("erp read timed out after {0:?}")]
    Timeout(Duration),
    #[error("erp connection error: {0}")]
    Connection(String),
    #[error("erp decode error: {0}")]
    Decode(String),
    #[error("erp configuration error: {0}")]
    Config(String),
    #[error("erp query error: {0}")]
    Query(String),
}

impl ErpError {
    /// Whether retrying the same read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErpError::Timeout(_) | ErpError::Connection(_))
    }
}

pub type ErpResult<T> = Result<T, ErpError>;

/// Position after the last header of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCursor {
    pub document_date: DateTime<Utc>,
    pub key: HeaderKey,
}

impl HeaderCursor {
    pub fn after(header: &LegacyHeader) -> Self {
        Self {
            document_date: header.document_date,
            key: header.key.clone(),
        }
    }

    /// Whether `header` sorts strictly after this cursor.
    pub fn precedes(&self, header: &LegacyHeader) -> bool {
        (header.document_date, &header.key) > (self.document_date, &self.key)
    }
}

/// Read-only view of one company's ERP.
pub trait ErpReader: Send + Sync {
    /// Number of headers `stream_headers` would yield.
    fn count_headers(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<u64>;

    /// One page of headers with `document_date >= since` and a relevant
    /// document type, strictly after `after`, ascending by `(date, key)`.
    fn fetch_headers(
        &self,
        since: DateTime<Utc>,
        doc_types: &[String],
        after: Option<&HeaderCursor>,
        limit: usize,
    ) -> ErpResult<Vec<LegacyHeader>>;

    /// Details of one header ordered by item.
    fn stream_details(&self, header: &HeaderKey) -> ErpResult<Vec<LegacyDetail>>;

    /// Details of a batch of headers.
    fn details_for(&self, headers: &[HeaderKey]) -> ErpResult<BTreeMap<HeaderKey, Vec<LegacyDetail>>> {
        let mut out = BTreeMap::new();
        for key in headers {
            out.insert(key.clone(), self.stream_details(key)?);
        }
        Ok(out)
    }

    /// Identity and status of every header in the window.
    fn list_header_keys(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<Vec<HeaderStatus>>;
}

impl<R> ErpReader for Arc<R>
where
    R: ErpReader + ?Sized,
{
    fn count_headers(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<u64> {
        (**self).count_headers(since, doc_types)
    }

    fn fetch_headers(
        &self,
        since: DateTime<Utc>,
        doc_types: &[String],
        after: Option<&HeaderCursor>,
        limit: usize,
    ) -> ErpResult<Vec<LegacyHeader>> {
        (**self).fetch_headers(since, doc_types, after, limit)
    }

    fn stream_details(&self, header: &HeaderKey) -> ErpResult<Vec<LegacyDetail>> {
        (**self).stream_details(header)
    }

    fn details_for(&self, headers: &[HeaderKey]) -> ErpResult<BTreeMap<HeaderKey, Vec<LegacyDetail>>> {
        (**self).details_for(headers)
    }

    fn list_header_keys(&self, since: DateTime<Utc>, doc_types: &[String]) -> ErpResult<Vec<HeaderStatus>> {
        (**self).list_header_keys(since, doc_types)
    }
}

/// Stream headers in batches of `batch_size`.
///
/// The stream is finite and re-openable: calling this again with the same
/// arguments starts over from `since`.
pub fn stream_headers<'a>(
    reader: &'a dyn ErpReader,
    since: DateTime<Utc>,
    doc_types: &[String],
    batch_size: usize,
) -> HeaderBatches<'a> {
    HeaderBatches {
        reader,
        since,
        doc_types: doc_types.to_vec(),
        batch_size: batch_size.max(1),
        cursor: None,
        done: false,
    }
}

/// Iterator returned by [`stream_headers`]. Stops after the first error.
pub struct HeaderBatches<'a> {
    reader: &'a dyn ErpReader,
    since: DateTime<Utc>,
    doc_types: Vec<String>,
    batch_size: usize,
    cursor: Option<HeaderCursor>,
    done: bool,
}

impl Iterator for HeaderBatches<'_> {
    type Item = ErpResult<Vec<LegacyHeader>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.fetch_headers(
            self.since,
            &self.doc_types,
            self.cursor.as_ref(),
            self.batch_size,
        ) {
            Ok(batch) => {
                if batch.len() < self.batch_size {
                    self.done = true;
                }
                match batch.last() {
                    Some(last) => {
                        self.cursor = Some(HeaderCursor::after(last));
                        Some(Ok(batch))
                    }
                    None => {
                        self.done = true;
                        None
                    }
                }
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn header(n: u32, day: u32) -> LegacyHeader {
        LegacyHeader::new(
            HeaderKey::new("AL", "NI", &format!("{n:06}")).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap(),
            "F",
        )
    }

    #[test]
    fn batches_cover_every_header_once_in_order() {
        let erp = InMemoryErpReader::new();
        for n in 0..7 {
            erp.insert(header(n, 1 + n % 3), Vec::new());
        }
        let doc_types = vec!["NI".to_string()];
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let batches: Vec<Vec<LegacyHeader>> = stream_headers(&erp, since, &doc_types, 3)
            .collect::<ErpResult<_>>()
            .unwrap();

        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let flat: Vec<_> = batches.into_iter().flatten().collect();
        assert!(flat.windows(2).all(|w| (w[0].document_date, &w[0].key) < (w[1].document_date, &w[1].key)));
    }

    #[test]
    fn since_filters_older_headers() {
        let erp = InMemoryErpReader::new();
        erp.insert(header(1, 1), Vec::new());
        erp.insert(header(2, 5), Vec::new());
        let since = Utc.with_ymd_and_hms(2025, 3, 5, 0, 0, 0).unwrap() - ChronoDuration::seconds(1);

        let all: Vec<_> = stream_headers(&erp, since, &["NI".to_string()], 10)
            .flat_map(|b| b.unwrap())
            .collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key.doc_number(), "000002");
    }

    #[test]
    fn stream_stops_after_error() {
        let erp = InMemoryErpReader::new();
        erp.insert(header(1, 1), Vec::new());
        erp.fail_next(1, ErpError::Connection("reset".into()));
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let mut stream = stream_headers(&erp, since, &["NI".to_string()], 10);
        assert!(matches!(stream.next(), Some(Err(ErpError::Connection(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn transient_classification() {
        assert!(ErpError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ErpError::Connection("x".into()).is_transient());
        assert!(!ErpError::Decode("x".into()).is_transient());
        assert!(!ErpError::Config("x".into()).is_transient());
    }
}
