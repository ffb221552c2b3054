//! The sync controller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use tracing::{debug, info, instrument, warn};

use kardex_core::{CompanyId, HeaderKey};
use kardex_events::{Notification, SyncStatus, SyncUpdate};
use kardex_inventory::rules::is_void_status;
use kardex_inventory::{Company, DocumentRules, LegacyHeader};

use crate::cancel::CancelToken;
use crate::config::SyncSettings;
use crate::erp::{ErpReader, ErpRegistry, stream_headers};
use crate::interpreter::Interpreter;
use crate::locks::{CompanyLocks, LockError};
use crate::notify::{SharedBus, publish};
use crate::recompute::StockRecomputer;
use crate::store::{SharedStore, SyncControl};

use super::progress::{Phase, Progress, ProgressSink};
use super::{SyncError, SyncReport, SyncRequest};

/// Midnight UTC of the same day.
fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Keys deleted upstream and keys whose status turned void, found by phase 2.
#[derive(Debug, Default)]
struct Reconciled {
    deleted: BTreeSet<HeaderKey>,
    voided: BTreeSet<HeaderKey>,
}

#[derive(Clone)]
pub struct SyncController {
    store: SharedStore,
    erp: Arc<ErpRegistry>,
    locks: CompanyLocks,
    bus: SharedBus,
    rules: Arc<DocumentRules>,
    settings: SyncSettings,
    recomputer: StockRecomputer,
}

impl SyncController {
    pub fn new(
        store: SharedStore,
        erp: Arc<ErpRegistry>,
        locks: CompanyLocks,
        bus: SharedBus,
        rules: Arc<DocumentRules>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            recomputer: StockRecomputer::new(store.clone(), rules.clone()),
            store,
            erp,
            locks,
            bus,
            rules,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn company(&self, alias: &str) -> Result<Company, SyncError> {
        let mut tx = self.store.begin()?;
        tx.company_by_alias(alias.trim())?
            .ok_or_else(|| SyncError::Config(format!("unknown company '{alias}'")))
    }

    /// Run one full cycle for `request.company_alias`.
    ///
    /// Publishes `started`, the phase updates and `finished` or `failed` on
    /// the company topic.
    #[instrument(skip_all, fields(company = %request.company_alias), err)]
    pub fn run(
        &self,
        request: &SyncRequest,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let company = self.company(&request.company_alias)?;
        let reader = self.erp.get(&company.alias)?;
        let _guard = self.locks.try_lock(company.id).map_err(|err| match err {
            LockError::Busy(_) => SyncError::Conflict(company.alias.clone()),
            other => other.into(),
        })?;

        let progress = Progress::new(company.id, &self.bus, sink);
        progress.emit(SyncUpdate::new(
            SyncStatus::Started,
            format!("Sync of {} started", company.alias),
            0,
        ));

        match self.cycle(&company, reader.as_ref(), request, cancel, &progress) {
            Ok(report) => {
                info!(
                    headers_copied = report.headers_copied,
                    entries = report.interpretation.entries,
                    balances = report.balances_recomputed,
                    "sync finished"
                );
                let mut done = SyncUpdate::new(SyncStatus::Finished, "Sync finished", 100);
                if let Ok(result) = serde_json::to_value(&report) {
                    done = done.with_result(result);
                }
                progress.emit(done);
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "sync failed");
                progress.emit(SyncUpdate::new(SyncStatus::Failed, err.to_string(), 100));
                Err(err)
            }
        }
    }

    fn cycle(
        &self,
        company: &Company,
        reader: &dyn ErpReader,
        request: &SyncRequest,
        cancel: &CancelToken,
        progress: &Progress<'_>,
    ) -> Result<SyncReport, SyncError> {
        let start_year = request.start_year.unwrap_or(self.settings.start_year);
        let days = request
            .reconciliation_days
            .unwrap_or(self.settings.reconciliation_days);
        let baseline = Utc
            .with_ymd_and_hms(start_year, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| SyncError::Config(format!("invalid start year {start_year}")))?;

        let mut report = SyncReport {
            company_alias: company.alias.clone(),
            ..SyncReport::default()
        };

        let since = {
            let mut tx = self.store.begin()?;
            let control = tx.sync_control(company.id)?;
            start_of_day(control.watermark.unwrap_or(baseline))
        };
        let now = Utc::now();
        let reconcile_from = now - Duration::days(i64::from(days));

        self.copy(company.id, reader, since, cancel, progress, &mut report)?;

        cancel.check()?;
        let reconciled = self.reconcile(company.id, reader, reconcile_from, progress, &mut report)?;

        cancel.check()?;
        let window_start = since.min(reconcile_from);
        self.interpret(company.id, window_start, &reconciled, cancel, progress, &mut report)?;

        Ok(report)
    }

    /// Phase 1.
    fn copy(
        &self,
        company: CompanyId,
        reader: &dyn ErpReader,
        since: DateTime<Utc>,
        cancel: &CancelToken,
        progress: &Progress<'_>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let doc_types = self.rules.doc_types();
        let total = usize::try_from(reader.count_headers(since, &doc_types)?).unwrap_or(usize::MAX);
        info!(company = %company, since = %since, total, "copying erp headers");
        progress.phase(Phase::Copy, 0, total, format!("Copying {total} documents"));

        for batch in stream_headers(reader, since, &doc_types, self.settings.batch_size) {
            cancel.check()?;
            let batch = batch?;
            let keys: Vec<HeaderKey> = batch.iter().map(|h| h.key.clone()).collect();
            let mut details = reader.details_for(&keys)?;

            let mut last: Option<DateTime<Utc>> = None;
            for header in &batch {
                let lines = details.remove(&header.key).unwrap_or_default();
                let mut tx = self.store.begin()?;
                tx.upsert_legacy_header(company, header)?;
                tx.replace_legacy_details(company, &header.key, &lines)?;
                tx.commit()?;
                report.headers_copied += 1;
                report.details_copied += lines.len();
                last = Some(last.map_or(header.document_date, |l| l.max(header.document_date)));
            }

            if let Some(last) = last {
                let mut tx = self.store.begin()?;
                let mut control = tx.sync_control(company)?;
                if control.advance(last) {
                    tx.save_sync_control(&control)?;
                    tx.commit()?;
                }
                report.watermark = control.watermark;
            }
            debug!(company = %company, copied = report.headers_copied, "batch copied");
            progress.phase(
                Phase::Copy,
                report.headers_copied,
                total,
                format!("Copied {} of {total} documents", report.headers_copied),
            );
        }
        Ok(())
    }

    /// Phase 2.
    fn reconcile(
        &self,
        company: CompanyId,
        reader: &dyn ErpReader,
        from: DateTime<Utc>,
        progress: &Progress<'_>,
        report: &mut SyncReport,
    ) -> Result<Reconciled, SyncError> {
        progress.phase(Phase::Reconcile, 0, 1, "Reconciling recent documents");
        let doc_types = self.rules.doc_types();
        let upstream: BTreeMap<HeaderKey, String> = reader
            .list_header_keys(from, &doc_types)?
            .into_iter()
            .map(|row| (row.key, row.status))
            .collect();

        let mut reconciled = Reconciled::default();
        let mut tx = self.store.begin()?;
        for local in tx.legacy_statuses_since(company, from, &doc_types)? {
            match upstream.get(&local.key) {
                None => {
                    tx.delete_legacy_header(company, &local.key)?;
                    reconciled.deleted.insert(local.key);
                    report.headers_deleted += 1;
                }
                Some(status) if status.trim() != local.status.trim() => {
                    tx.set_legacy_status(company, &local.key, status.trim())?;
                    if is_void_status(status) {
                        reconciled.voided.insert(local.key);
                    }
                    report.statuses_updated += 1;
                }
                Some(_) => {}
            }
        }
        let mut control: SyncControl = tx.sync_control(company)?;
        control.last_full_reconciliation = Some(Utc::now());
        tx.save_sync_control(&control)?;
        tx.commit()?;

        info!(
            company = %company,
            deleted = report.headers_deleted,
            updated = report.statuses_updated,
            "reconciliation committed"
        );
        progress.phase(Phase::Reconcile, 1, 1, "Reconciliation finished");
        Ok(reconciled)
    }

    /// Phase 3.
    fn interpret(
        &self,
        company: CompanyId,
        window_start: DateTime<Utc>,
        reconciled: &Reconciled,
        cancel: &CancelToken,
        progress: &Progress<'_>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let mut tx = self.store.begin()?;
        let mut interpreter = Interpreter::load(&mut *tx, company, &self.rules, self.settings.match_window())?;

        let mut headers = tx.legacy_headers_between(company, window_start, None)?;
        let in_window: BTreeSet<HeaderKey> = headers.iter().map(|h| h.key.clone()).collect();
        let stragglers: Vec<HeaderKey> = reconciled
            .voided
            .iter()
            .filter(|k| !in_window.contains(*k))
            .cloned()
            .collect();
        headers.extend(tx.legacy_headers(company, &stragglers)?);
        sort_for_interpretation(&mut headers, &self.rules);

        let total = headers.len() + reconciled.deleted.len();
        info!(company = %company, from = %window_start, total, "interpreting window");
        progress.phase(Phase::Interpret, 0, total, format!("Interpreting {total} documents"));

        let mut done = 0;
        for key in &reconciled.deleted {
            cancel.check()?;
            interpreter.void_header(&mut *tx, key)?;
            done += 1;
        }
        let every = self.settings.batch_size.max(1);
        for header in &headers {
            cancel.check()?;
            interpreter.interpret(&mut *tx, header)?;
            done += 1;
            if done % every == 0 {
                progress.phase(Phase::Interpret, done, total, format!("Interpreted {done} of {total} documents"));
            }
        }
        tx.commit()?;

        let interpretation = interpreter.finish();
        let pairs = interpretation.outbox.len();
        let recomputed = self.recomputer.drain_with(company, interpretation.outbox, every, |n, of| {
            progress.phase(Phase::Interpret, done, total, format!("Recomputed {n} of {of} balances"));
        })?;
        debug!(company = %company, pairs, "balances recomputed");
        for change in &interpretation.transfer_changes {
            publish(
                &self.bus,
                Notification::transfer(company, change.transfer.id, change.transfer.state.as_str()),
            );
        }

        report.interpretation = interpretation.report;
        report.balances_recomputed = recomputed.recomputed;
        report.balances_skipped = recomputed.skipped.len();
        progress.phase(Phase::Interpret, total, total, "Interpretation finished");
        Ok(())
    }
}

/// Date order; on the same instant dispatches go before receptions.
fn sort_for_interpretation(headers: &mut [LegacyHeader], rules: &DocumentRules) {
    headers.sort_by(|a, b| {
        a.document_date
            .cmp(&b.document_date)
            .then_with(|| rules.direction(a).is_inbound().cmp(&rules.direction(b).is_inbound()))
            .then_with(|| a.key.cmp(&b.key))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_of_day_truncates() {
        let at = Utc.with_ymd_and_hms(2025, 9, 1, 17, 45, 3).unwrap();
        assert_eq!(start_of_day(at), Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn dispatch_sorts_before_reception_of_same_day() {
        let rules = DocumentRules::default();
        let day = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();
        let reception = LegacyHeader::new(HeaderKey::new("AA", "NI", "000001").unwrap(), day, "F");
        let dispatch = LegacyHeader::new(HeaderKey::new("AL", "GS", "000002").unwrap(), day, "F");
        let earlier = LegacyHeader::new(
            HeaderKey::new("AL", "NI", "000003").unwrap(),
            day - Duration::days(1),
            "F",
        );

        let mut headers = vec![reception, dispatch, earlier];
        sort_for_interpretation(&mut headers, &rules);
        let order: Vec<String> = headers.iter().map(|h| h.key.to_string()).collect();
        assert_eq!(order, ["AL-NI-000003", "AL-GS-000002", "AA-NI-000001"]);
    }
}
