//! Warehouse inventory domain.
//!
//! This crate contains the business rules for interpreting ERP warehouse
//! documents, implemented purely as deterministic domain logic (no IO, no
//! storage, no clocks read behind the caller's back):
//!
//! - [`legacy`]: shadow rows of ERP headers and details
//! - [`rules`]: document classes, exclusions, direction and active statuses
//! - [`ledger`]: interpreted movements and text notes
//! - [`transfer`]: the inter-warehouse shipment state machine
//! - [`stock`]: balance computation from ledger lines
//! - [`kardex`]: stock-card report over a date range

pub mod catalog;
pub mod kardex;
pub mod ledger;
pub mod legacy;
pub mod line;
pub mod quantity;
pub mod rules;
pub mod stock;
pub mod timestamp;
pub mod transfer;

pub use catalog::{Company, Product, Warehouse};
pub use kardex::{KardexProductCard, KardexRow, build_card, describe_movement};
pub use ledger::{EntryKey, HeaderRef, LedgerEntry, LedgerLine, TextNote, truncate_gloss};
pub use legacy::{HeaderStatus, LegacyDetail, LegacyHeader};
pub use line::{LineKind, SkippedLine, classify_line};
pub use rules::{Direction, DocumentRules, ExclusionRule};
pub use stock::{StockBalance, StockFigures, in_transit_from};
pub use timestamp::{PromotedTimestamp, TimeSource, promote};
pub use transfer::{ReceptionOutcome, Transfer, TransferError, TransferState};
