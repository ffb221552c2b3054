//! Inbound operations of the warehouse core.
//!
//! `WarehouseService` is what an HTTP layer (or the CLI) talks to: it starts
//! sync jobs, reports their status, serves the read projections and runs the
//! manual transfer operations. Every operation is scoped to one company,
//! resolved from its alias.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use kardex_core::{HeaderKey, ProductId, TransferId, WarehouseId};
use kardex_inventory::{
    Company, DocumentRules, HeaderRef, KardexProductCard, LedgerEntry, StockBalance, TextNote, Transfer,
    build_card,
};

use crate::cancel::CancelToken;
use crate::config::SyncSettings;
use crate::erp::ErpRegistry;
use crate::jobs::{
    CancelRegistry, Job, JobContext, JobExecutor, JobId, JobKind, JobResult, JobStatus, JobStore,
    JobStoreError,
};
use crate::locks::{CompanyLocks, LockError};
use crate::notify::SharedBus;
use crate::recompute::{RecomputeReport, StockRecomputer};
use crate::store::{
    MovementFilter, Page, Pagination, SharedStore, StockFilter, StoreError, StoreTx, TransferFilter,
};
use crate::sync::{ProgressSink, SyncController, SyncError, SyncReport, SyncRequest};
use crate::transfers::{TransferOpError, TransferService};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sync failed: {0}")]
    Sync(SyncError),
    #[error("job store error: {0}")]
    Jobs(JobStoreError),
}

impl From<JobStoreError> for ServiceError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::NotFound(id) => ServiceError::NotFound(format!("job {id}")),
            err @ JobStoreError::Conflict { .. } => ServiceError::Conflict(err.to_string()),
            err @ JobStoreError::NotQueued(_) => ServiceError::Precondition(err.to_string()),
            other => ServiceError::Jobs(other),
        }
    }
}

impl From<TransferOpError> for ServiceError {
    fn from(value: TransferOpError) -> Self {
        match value {
            TransferOpError::NotFound(id) => ServiceError::NotFound(format!("transfer {id}")),
            TransferOpError::State(err) => ServiceError::Precondition(err.to_string()),
            TransferOpError::Lock(err) => err.into(),
            TransferOpError::Store(err) => ServiceError::Store(err),
        }
    }
}

impl From<LockError> for ServiceError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Busy(company) => ServiceError::Conflict(format!("company {company} is busy")),
            LockError::Poisoned => ServiceError::Store(StoreError::Poisoned),
        }
    }
}

impl From<SyncError> for ServiceError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Config(message) => ServiceError::Config(message),
            SyncError::Conflict(alias) => {
                ServiceError::Conflict(format!("a sync for '{alias}' is already running"))
            }
            SyncError::Store(err) => ServiceError::Store(err),
            other => ServiceError::Sync(other),
        }
    }
}

impl From<kardex_core::DomainError> for ServiceError {
    fn from(value: kardex_core::DomainError) -> Self {
        ServiceError::Invalid(value.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Start-sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSync {
    pub company_alias: String,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub reconciliation_days: Option<u32>,
    /// Identity of the caller, matched by [`WarehouseService::check_status`].
    #[serde(default)]
    pub requested_by: Option<String>,
}

impl StartSync {
    pub fn new(company_alias: impl Into<String>) -> Self {
        Self {
            company_alias: company_alias.into(),
            start_year: None,
            reconciliation_days: None,
            requested_by: None,
        }
    }

    pub fn requested_by(mut self, caller: impl Into<String>) -> Self {
        self.requested_by = Some(caller.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStarted {
    pub job_id: JobId,
}

/// Answer to a status check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub is_syncing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
}

/// Stock card request; an empty product list means every product of the company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KardexRequest {
    pub warehouse_id: WarehouseId,
    #[serde(default)]
    pub product_ids: Vec<ProductId>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

fn sync_request(kind: &JobKind) -> SyncRequest {
    let JobKind::SyncCompany {
        company_alias,
        start_year,
        reconciliation_days,
        ..
    } = kind;
    SyncRequest {
        company_alias: company_alias.clone(),
        start_year: *start_year,
        reconciliation_days: *reconciliation_days,
    }
}

fn requested_by(job: &Job) -> Option<&str> {
    let JobKind::SyncCompany { requested_by, .. } = &job.kind;
    requested_by.as_deref()
}

/// Text of the note lines of one document, in item order.
fn note_text(notes: &[TextNote]) -> Option<String> {
    let text = notes
        .iter()
        .flat_map(|n| [n.description.as_deref(), n.body.as_deref()])
        .flatten()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!text.is_empty()).then_some(text)
}

#[derive(Clone)]
pub struct WarehouseService {
    store: SharedStore,
    jobs: Arc<dyn JobStore>,
    controller: SyncController,
    transfers: TransferService,
    recomputer: StockRecomputer,
    locks: CompanyLocks,
    rules: Arc<DocumentRules>,
    cancels: CancelRegistry,
}

impl WarehouseService {
    pub fn new(
        store: SharedStore,
        erp: Arc<ErpRegistry>,
        jobs: Arc<dyn JobStore>,
        bus: SharedBus,
        rules: Arc<DocumentRules>,
        settings: SyncSettings,
    ) -> Self {
        let locks = CompanyLocks::new();
        let lock_wait = settings.manual_lock_wait();
        Self {
            controller: SyncController::new(
                store.clone(),
                erp,
                locks.clone(),
                bus.clone(),
                rules.clone(),
                settings,
            ),
            transfers: TransferService::new(store.clone(), rules.clone(), locks.clone(), bus).with_lock_wait(lock_wait),
            recomputer: StockRecomputer::new(store.clone(), rules.clone()),
            store,
            jobs,
            locks,
            rules,
            cancels: CancelRegistry::default(),
        }
    }

    /// Route running-job cancellation through an executor's tokens.
    pub fn with_cancels(mut self, cancels: CancelRegistry) -> Self {
        self.cancels = cancels;
        self
    }

    /// Company locks shared by syncs and manual transfer writes.
    pub fn locks(&self) -> &CompanyLocks {
        &self.locks
    }

    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    /// Install the `sync_company` handler on `executor`.
    pub fn register_handlers(&self, executor: &mut JobExecutor) {
        let controller = self.controller.clone();
        executor.register_handler("sync_company", move |job, ctx| run_sync_job(&controller, job, ctx));
    }

    fn company(&self, tx: &mut dyn StoreTx, alias: &str) -> ServiceResult<Company> {
        tx.company_by_alias(alias.trim())?
            .ok_or_else(|| ServiceError::NotFound(format!("company '{}'", alias.trim())))
    }

    // --- sync jobs -------------------------------------------------------

    /// Queue a sync cycle. Rejected while one is queued or running for the company.
    #[instrument(skip(self, request), fields(company = %request.company_alias), err)]
    pub fn start_sync(&self, request: StartSync) -> ServiceResult<SyncStarted> {
        let alias = request.company_alias.trim().to_string();
        if alias.is_empty() {
            return Err(ServiceError::Invalid("company alias is empty".into()));
        }
        let kind = JobKind::SyncCompany {
            company_alias: alias,
            start_year: request.start_year,
            reconciliation_days: request.reconciliation_days,
            requested_by: request.requested_by,
        };
        let job_id = self.jobs.enqueue(Job::new(kind))?;
        info!(job_id = %job_id, "sync queued");
        Ok(SyncStarted { job_id })
    }

    /// Active sync started by `caller`, running jobs before queued ones.
    pub fn check_status(&self, caller: &str) -> ServiceResult<SyncStatusView> {
        let active = self
            .jobs
            .list(usize::MAX)?
            .into_iter()
            .filter(|job| job.status.is_active() && requested_by(job) == Some(caller))
            .min_by_key(|job| (job.status != JobStatus::Running, job.created_at));

        Ok(match active {
            Some(job) => SyncStatusView {
                is_syncing: true,
                job_id: Some(job.id),
                message: Some(if job.progress.message.is_empty() {
                    "Sync in progress".to_string()
                } else {
                    job.progress.message
                }),
                progress_percent: Some(job.progress.percent),
            },
            None => SyncStatusView::default(),
        })
    }

    pub fn job(&self, id: JobId) -> ServiceResult<Job> {
        self.jobs
            .get(id)?
            .ok_or_else(|| ServiceError::NotFound(format!("job {id}")))
    }

    /// Cancel a queued job, or signal a running one.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub fn cancel_job(&self, id: JobId) -> ServiceResult<Job> {
        let job = self.job(id)?;
        match job.status {
            JobStatus::Queued => Ok(self.jobs.cancel(id)?),
            JobStatus::Running if self.cancels.cancel(id) => {
                info!("cancellation requested");
                Ok(job)
            }
            JobStatus::Running => Err(ServiceError::Precondition(format!(
                "job {id} is not running in this process"
            ))),
            _ => Err(ServiceError::Precondition(format!("job {id} already ended"))),
        }
    }

    /// Run one cycle on the calling thread, outside the job queue.
    pub fn sync_now(
        &self,
        request: &SyncRequest,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> ServiceResult<SyncReport> {
        Ok(self.controller.run(request, cancel, progress)?)
    }

    // --- read projections ------------------------------------------------

    pub fn list_movements(
        &self,
        alias: &str,
        filter: &MovementFilter,
        page: Pagination,
    ) -> ServiceResult<Page<LedgerEntry>> {
        let mut tx = self.store.begin()?;
        let company = self.company(&mut *tx, alias)?;
        Ok(tx.list_entries(company.id, filter, page)?)
    }

    pub fn list_stock(
        &self,
        alias: &str,
        filter: &StockFilter,
        page: Pagination,
    ) -> ServiceResult<Page<StockBalance>> {
        let mut tx = self.store.begin()?;
        let company = self.company(&mut *tx, alias)?;
        Ok(tx.list_balances(company.id, filter, page)?)
    }

    pub fn list_transfers(
        &self,
        alias: &str,
        filter: &TransferFilter,
        page: Pagination,
    ) -> ServiceResult<Page<Transfer>> {
        let mut tx = self.store.begin()?;
        let company = self.company(&mut *tx, alias)?;
        Ok(tx.list_transfers(company.id, filter, page)?)
    }

    /// Text notes of one document, e.g. `AL-NI-000124`.
    pub fn list_notes(&self, alias: &str, header: &str) -> ServiceResult<Vec<TextNote>> {
        let header = HeaderKey::parse(header)?;
        let mut tx = self.store.begin()?;
        let company = self.company(&mut *tx, alias)?;
        Ok(tx.notes_for_header(company.id, &header)?)
    }

    /// Stock card of one warehouse, one card per product.
    #[instrument(skip(self, request), fields(company = %alias, warehouse = %request.warehouse_id), err)]
    pub fn kardex(&self, alias: &str, request: &KardexRequest) -> ServiceResult<Vec<KardexProductCard>> {
        if request.from > request.to {
            return Err(ServiceError::Invalid("kardex range ends before it starts".into()));
        }
        let mut tx = self.store.begin()?;
        let company = self.company(&mut *tx, alias)?;
        tx.warehouse(company.id, request.warehouse_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("warehouse {}", request.warehouse_id)))?;

        let products = if request.product_ids.is_empty() {
            tx.products(company.id)?
        } else {
            let mut products = Vec::with_capacity(request.product_ids.len());
            for id in &request.product_ids {
                let product = tx
                    .product(company.id, *id)?
                    .ok_or_else(|| ServiceError::NotFound(format!("product {id}")))?;
                products.push(product);
            }
            products
        };
        let explicit = !request.product_ids.is_empty();

        let mut notes: BTreeMap<HeaderKey, String> = BTreeMap::new();
        let mut cards = Vec::with_capacity(products.len());
        for product in products {
            let entries = tx.entries_until(company.id, request.warehouse_id, product.id, request.to)?;
            let in_transit = tx.in_transit_towards(company.id, request.warehouse_id, product.id)?;
            if !explicit && entries.is_empty() && in_transit == Decimal::ZERO {
                continue;
            }
            for entry in entries.iter().filter(|e| e.document_date >= request.from) {
                if let HeaderRef::Erp(key) = entry.header()
                    && !notes.contains_key(&key)
                    && let Some(text) = note_text(&tx.notes_for_header(company.id, &key)?)
                {
                    notes.insert(key, text);
                }
            }
            cards.push(build_card(
                &product,
                request.from,
                request.to,
                &entries,
                &notes,
                in_transit,
                &self.rules,
            ));
        }
        Ok(cards)
    }

    // --- manual transfer operations -------------------------------------

    pub fn receive_transfer(
        &self,
        alias: &str,
        id: TransferId,
        received: Decimal,
        notes: Option<String>,
    ) -> ServiceResult<Transfer> {
        let company = self.company(&mut *self.store.begin()?, alias)?;
        Ok(self.transfers.receive(company.id, id, received, notes)?)
    }

    pub fn revert_reception(&self, alias: &str, id: TransferId) -> ServiceResult<Transfer> {
        let company = self.company(&mut *self.store.begin()?, alias)?;
        Ok(self.transfers.revert(company.id, id)?)
    }

    // --- maintenance -----------------------------------------------------

    /// Drop watermark, mirror, ledger, notes, transfers and balances of one company.
    #[instrument(skip(self), fields(company = %alias), err)]
    pub fn reset_company(&self, alias: &str) -> ServiceResult<()> {
        let company = self.company(&mut *self.store.begin()?, alias)?;
        if let Some(job) = self.jobs.active_for(&company.alias)? {
            return Err(ServiceError::Conflict(format!(
                "job {} is active for '{}'",
                job.id, company.alias
            )));
        }
        let _guard = self.locks.try_lock(company.id)?;
        let mut tx = self.store.begin()?;
        tx.purge_company(company.id)?;
        tx.commit()?;
        warn!(company = %company.alias, "company data reset");
        Ok(())
    }

    /// Rebuild every balance of one company.
    pub fn recompute_company(&self, alias: &str) -> ServiceResult<RecomputeReport> {
        let company = self.company(&mut *self.store.begin()?, alias)?;
        let _guard = self.locks.try_lock(company.id)?;
        Ok(self.recomputer.recompute_company(company.id)?)
    }
}

/// Body of a `sync_company` job.
fn run_sync_job(controller: &SyncController, job: &Job, ctx: &JobContext) -> JobResult {
    let request = sync_request(&job.kind);
    let sink = |update: &kardex_events::SyncUpdate| ctx.progress(update.progress_percent, update.message.clone());

    match controller.run(&request, ctx.cancel_token(), &sink) {
        Ok(report) => JobResult::Success(serde_json::to_value(&report).ok()),
        Err(SyncError::Cancelled) => JobResult::Cancelled,
        Err(err) => JobResult::Failure(err.to_string()),
    }
}
