//! Stock recomputation.
//!
//! Balances are never adjusted incrementally: every recompute rebuilds one
//! `(company, warehouse, product)` triple from the ledger and open transfers,
//! so running it twice changes nothing. Writers collect the touched pairs in a
//! [`RecomputeOutbox`] and drain it after their transaction committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use kardex_core::{CompanyId, ProductId, WarehouseId};
use kardex_inventory::{DocumentRules, StockBalance, StockFigures};

use crate::store::{SharedStore, StockKey, StoreResult};

/// Pairs to recompute once the current transaction is committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecomputeOutbox {
    pairs: BTreeSet<StockKey>,
}

impl RecomputeOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, warehouse: WarehouseId, product: ProductId) {
        self.pairs.insert((warehouse, product));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn contains(&self, warehouse: WarehouseId, product: ProductId) -> bool {
        self.pairs.contains(&(warehouse, product))
    }

    pub fn into_pairs(self) -> BTreeSet<StockKey> {
        self.pairs
    }
}

impl Extend<StockKey> for RecomputeOutbox {
    fn extend<T: IntoIterator<Item = StockKey>>(&mut self, iter: T) {
        self.pairs.extend(iter);
    }
}

impl FromIterator<StockKey> for RecomputeOutbox {
    fn from_iter<T: IntoIterator<Item = StockKey>>(iter: T) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// Outcome of one triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recomputed {
    Updated(StockBalance),
    /// Invariant violation; the stored balance was left untouched.
    Skipped(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecomputeReport {
    pub recomputed: usize,
    pub skipped: Vec<(StockKey, String)>,
}

impl RecomputeReport {
    fn record(&mut self, pair: StockKey, outcome: Recomputed) {
        match outcome {
            Recomputed::Updated(_) => self.recomputed += 1,
            Recomputed::Skipped(reason) => self.skipped.push((pair, reason)),
        }
    }
}

#[derive(Clone)]
pub struct StockRecomputer {
    store: SharedStore,
    rules: Arc<DocumentRules>,
}

impl StockRecomputer {
    pub fn new(store: SharedStore, rules: Arc<DocumentRules>) -> Self {
        Self { store, rules }
    }

    /// Rebuild one triple in its own transaction.
    #[instrument(skip(self), fields(company = %company, warehouse = %warehouse, product = %product), err)]
    pub fn recompute(
        &self,
        company: CompanyId,
        warehouse: WarehouseId,
        product: ProductId,
    ) -> StoreResult<Recomputed> {
        let mut tx = self.store.begin()?;

        if tx.warehouse(company, warehouse)?.is_none() || tx.product(company, product)?.is_none() {
            let reason = "warehouse or product does not belong to the company".to_string();
            warn!(%reason, "skipping stock recompute");
            return Ok(Recomputed::Skipped(reason));
        }

        let lines = tx.ledger_lines(company, warehouse, product)?;
        let in_transit = tx.in_transit_from(company, warehouse, product)?;
        let figures = match StockFigures::compute(company, warehouse, product, &lines, in_transit, &self.rules) {
            Ok(figures) => figures,
            Err(err) => {
                warn!(error = %err, "skipping stock recompute");
                return Ok(Recomputed::Skipped(err.to_string()));
            }
        };

        let balance = figures.into_balance(company, warehouse, product, Utc::now());
        tx.upsert_balance(&balance)?;
        tx.commit()?;
        debug!(current = %balance.current, in_transit = %balance.in_transit, "stock recomputed");
        Ok(Recomputed::Updated(balance))
    }

    /// Rebuild every pair; a failing pair does not stop the others.
    pub fn recompute_all<I>(&self, company: CompanyId, pairs: I) -> StoreResult<RecomputeReport>
    where
        I: IntoIterator<Item = StockKey>,
    {
        self.recompute_all_with(company, pairs.into_iter().collect(), usize::MAX, |_, _| {})
    }

    /// As [`recompute_all`](Self::recompute_all), calling `tick(done, total)` every `every` pairs.
    pub fn recompute_all_with<F>(
        &self,
        company: CompanyId,
        pairs: Vec<StockKey>,
        every: usize,
        mut tick: F,
    ) -> StoreResult<RecomputeReport>
    where
        F: FnMut(usize, usize),
    {
        let total = pairs.len();
        let every = every.max(1);
        let mut report = RecomputeReport::default();
        for (n, (warehouse, product)) in pairs.into_iter().enumerate() {
            let outcome = self.recompute(company, warehouse, product)?;
            report.record((warehouse, product), outcome);
            if (n + 1) % every == 0 {
                tick(n + 1, total);
            }
        }
        Ok(report)
    }

    pub fn drain(&self, company: CompanyId, outbox: RecomputeOutbox) -> StoreResult<RecomputeReport> {
        self.recompute_all(company, outbox.into_pairs())
    }

    pub fn drain_with<F>(
        &self,
        company: CompanyId,
        outbox: RecomputeOutbox,
        every: usize,
        tick: F,
    ) -> StoreResult<RecomputeReport>
    where
        F: FnMut(usize, usize),
    {
        self.recompute_all_with(company, outbox.into_pairs().into_iter().collect(), every, tick)
    }

    /// Rebuild every triple present in the ledger, transfers or balances.
    #[instrument(skip(self), fields(company = %company), err)]
    pub fn recompute_company(&self, company: CompanyId) -> StoreResult<RecomputeReport> {
        let keys = {
            let mut tx = self.store.begin()?;
            tx.stock_keys(company)?
        };
        self.recompute_all(company, keys)
    }
}
