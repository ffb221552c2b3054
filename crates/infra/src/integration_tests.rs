//! Integration tests for the full sync pipeline.
//!
//! ERP → legacy mirror → reconciliation → ledger/transfers → stock balances,
//! driven through `WarehouseService` against the in-memory store and ERP.
//!
//! Verifies:
//! - The documented scenarios (inbound, void, text lines, transfers)
//! - Idempotence of voids and of whole cycles
//! - Job queueing, conflicts, cancellation and stuck cleanup

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use kardex_core::{CompanyId, DetailKey, HeaderKey, ProductCode, ProductId, WarehouseCode, WarehouseId};
    use kardex_events::{NotificationBus, SyncStatus};
    use kardex_inventory::{
        Company, EntryKey, HeaderRef, LedgerEntry, LegacyDetail, LegacyHeader, Product, StockBalance, Transfer,
        TransferState, Warehouse,
    };

    use crate::cancel::CancelToken;
    use crate::config::SyncSettings;
    use crate::erp::{ErpError, ErpRegistry, InMemoryErpReader};
    use crate::jobs::{InMemoryJobStore, JobExecutor, JobStatus, JobStore, stuck_cleanup};
    use crate::notify::{SharedBus, in_memory_bus};
    use crate::service::{KardexRequest, ServiceError, StartSync, WarehouseService};
    use crate::store::{InMemoryWarehouseStore, Pagination, SyncControl, TransferFilter, WarehouseStore};
    use crate::sync::{NoProgress, SyncError, SyncReport, SyncRequest};

    struct Harness {
        store: Arc<InMemoryWarehouseStore>,
        erp: Arc<InMemoryErpReader>,
        jobs: Arc<InMemoryJobStore>,
        bus: SharedBus,
        service: WarehouseService,
        company: CompanyId,
        al: WarehouseId,
        aa: WarehouseId,
    }

    fn harness() -> Harness {
        harness_with(SyncSettings::default())
    }

    fn harness_with(settings: SyncSettings) -> Harness {
        let store = InMemoryWarehouseStore::arc();
        let company = Company::new("acme", "Acme");
        let al = Warehouse::new(company.id, WarehouseCode::new("AL").unwrap(), "Main");
        let aa = Warehouse::new(company.id, WarehouseCode::new("AA").unwrap(), "Annex");
        {
            let mut tx = store.begin().unwrap();
            tx.upsert_company(&company).unwrap();
            tx.upsert_warehouse(&al).unwrap();
            tx.upsert_warehouse(&aa).unwrap();
            for code in ["P-1", "P-2", "P-3"] {
                let product = Product::new(company.id, ProductCode::new(code).unwrap(), code);
                tx.upsert_product(&product).unwrap();
            }
            tx.commit().unwrap();
        }

        let erp = Arc::new(InMemoryErpReader::new());
        let registry = ErpRegistry::new();
        registry.register_shared("acme", erp.clone());
        let jobs = InMemoryJobStore::arc();
        let bus = in_memory_bus();
        let service = WarehouseService::new(
            store.clone(),
            Arc::new(registry),
            jobs.clone(),
            bus.clone(),
            Arc::new(kardex_inventory::DocumentRules::default()),
            settings,
        );

        Harness {
            store,
            erp,
            jobs,
            bus,
            service,
            company: company.id,
            al: al.id,
            aa: aa.id,
        }
    }

    impl Harness {
        fn sync(&self) -> SyncReport {
            self.service
                .sync_now(&SyncRequest::new("acme"), &CancelToken::new(), &NoProgress)
                .unwrap()
        }

        fn product(&self, code: &str) -> ProductId {
            let mut tx = self.store.begin().unwrap();
            tx.product_by_code(self.company, &ProductCode::new(code).unwrap())
                .unwrap()
                .unwrap()
                .id
        }

        fn balance(&self, warehouse: WarehouseId, code: &str) -> StockBalance {
            let product = self.product(code);
            let mut tx = self.store.begin().unwrap();
            tx.balance(self.company, warehouse, product).unwrap().unwrap()
        }

        fn entry(&self, key: &DetailKey) -> Option<LedgerEntry> {
            let mut tx = self.store.begin().unwrap();
            tx.entry(self.company, &EntryKey::Erp(key.clone())).unwrap()
        }

        fn entries_of(&self, header: &HeaderKey) -> Vec<LedgerEntry> {
            let mut tx = self.store.begin().unwrap();
            tx.entries_by_header(self.company, &HeaderRef::Erp(header.clone()))
                .unwrap()
        }

        fn transfer_by_dispatch(&self, key: &DetailKey) -> Transfer {
            let mut tx = self.store.begin().unwrap();
            tx.transfer_by_dispatch(self.company, key).unwrap().unwrap()
        }

        fn control(&self) -> SyncControl {
            let mut tx = self.store.begin().unwrap();
            tx.sync_control(self.company).unwrap()
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    /// Midnight `days` days ago.
    fn days_ago(days: i64) -> DateTime<Utc> {
        (Utc::now() - Duration::days(days))
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc()
    }

    fn inbound(number: &str, date: DateTime<Utc>, code: &str, qty: i64) -> (LegacyHeader, Vec<LegacyDetail>) {
        let mut header = LegacyHeader::new(HeaderKey::new("AL", "NI", number).unwrap(), date, "F");
        header.time_of_day = Some("10:00:00".into());
        let detail = LegacyDetail::new(header.key.item(1), code, Decimal::from(qty));
        (header, vec![detail])
    }

    fn outbound(number: &str, date: DateTime<Utc>, code: &str, qty: i64) -> (LegacyHeader, Vec<LegacyDetail>) {
        let header = LegacyHeader::new(HeaderKey::new("AL", "GS", number).unwrap(), date, "F");
        let detail = LegacyDetail::new(header.key.item(1), code, Decimal::from(qty));
        (header, vec![detail])
    }

    fn dispatch(number: &str, date: DateTime<Utc>, code: &str, qty: i64) -> (LegacyHeader, Vec<LegacyDetail>) {
        let (mut header, details) = outbound(number, date, code, qty);
        header.movement_subtype = Some("TD".into());
        header.direction_flag = Some("S".into());
        header.reference_warehouse = Some("AA".into());
        (header, details)
    }

    fn reception(
        number: &str,
        date: DateTime<Utc>,
        code: &str,
        qty: i64,
        dispatch: &str,
    ) -> (LegacyHeader, Vec<LegacyDetail>) {
        let mut header = LegacyHeader::new(HeaderKey::new("AA", "NI", number).unwrap(), date, "F");
        header.movement_subtype = Some("TD".into());
        header.direction_flag = Some("I".into());
        header.reference_warehouse = Some("AL".into());
        header.reference_type = Some("GS".into());
        header.reference_number = Some(dispatch.into());
        let detail = LegacyDetail::new(header.key.item(1), code, Decimal::from(qty));
        (header, vec![detail])
    }

    fn publish(h: &Harness, (header, details): &(LegacyHeader, Vec<LegacyDetail>)) {
        h.erp.insert(header.clone(), details.clone());
    }

    // --- scenarios ---------------------------------------------------------

    #[test]
    fn simple_inbound_raises_stock() {
        let h = harness();
        let doc = inbound("000123", at(2025, 9, 1), "P-1", 500);
        publish(&h, &doc);

        let report = h.sync();
        assert_eq!(report.headers_copied, 1);
        assert_eq!(report.interpretation.entries, 1);

        let entry = h.entry(&doc.0.key.item(1)).unwrap();
        assert!(entry.is_inbound);
        assert_eq!(entry.quantity, Decimal::from(500));
        assert_eq!(entry.document_date, Utc.with_ymd_and_hms(2025, 9, 1, 10, 0, 0).unwrap());
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::from(500));
    }

    #[test]
    fn void_after_post_removes_entries_and_stock() {
        let h = harness();
        let doc = inbound("000123", at(2025, 9, 1), "P-1", 500);
        publish(&h, &doc);
        h.sync();

        h.erp.set_status(&doc.0.key, "A");
        let report = h.sync();
        assert_eq!(report.interpretation.voided, 1);
        assert!(h.entries_of(&doc.0.key).is_empty());
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::ZERO);

        // voiding again is a no-op
        let again = h.sync();
        assert_eq!(again.balances_recomputed, 0);
        assert!(h.entries_of(&doc.0.key).is_empty());
    }

    #[test]
    fn text_line_becomes_note() {
        let h = harness();
        let (header, mut details) = inbound("000124", at(2025, 9, 2), "P-2", 100);
        let mut text = LegacyDetail::new(header.key.item(2), "TEXTO", Decimal::ZERO);
        text.description = Some("Handle with care".into());
        details.push(text);
        publish(&h, &(header.clone(), details));

        h.sync();

        assert_eq!(h.entries_of(&header.key).len(), 1);
        assert!(h.entry(&header.key.item(2)).is_none());
        let notes = h.service.list_notes("acme", "AL-NI-000124").unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].key.to_string(), "AL-NI-000124-2");
        assert_eq!(notes[0].description.as_deref(), Some("Handle with care"));
    }

    #[test]
    fn complete_transfer_moves_stock() {
        let h = harness();
        let gs = dispatch("000200", at(2025, 9, 3), "P-3", 80);
        publish(&h, &gs);
        h.sync();

        let origin = h.balance(h.al, "P-3");
        assert_eq!(origin.current, Decimal::from(-80));
        assert_eq!(origin.in_transit, Decimal::from(80));
        let transfer = h.transfer_by_dispatch(&gs.0.key.item(1));
        assert_eq!(transfer.state, TransferState::InTransit);

        let ni = reception("000777", at(2025, 9, 4), "P-3", 80, "000200");
        publish(&h, &ni);
        h.sync();

        let transfer = h.transfer_by_dispatch(&gs.0.key.item(1));
        assert_eq!(transfer.state, TransferState::Received);
        let origin = h.balance(h.al, "P-3");
        assert_eq!(origin.current, Decimal::from(-80));
        assert_eq!(origin.in_transit, Decimal::ZERO);
        assert_eq!(h.balance(h.aa, "P-3").current, Decimal::from(80));
    }

    fn dispatched(h: &Harness) -> Transfer {
        let gs = dispatch("000200", at(2025, 9, 3), "P-3", 80);
        publish(h, &gs);
        h.sync();
        h.transfer_by_dispatch(&gs.0.key.item(1))
    }

    #[test]
    fn partial_reception_then_revert() {
        let h = harness();
        let transfer = dispatched(&h);

        let received = h
            .service
            .receive_transfer("acme", transfer.id, Decimal::from(75), Some("box damaged".into()))
            .unwrap();
        assert_eq!(received.state, TransferState::ReceivedPartial);
        assert_eq!(received.quantity_diff, Some(Decimal::from(-5)));
        assert_eq!(h.balance(h.al, "P-3").current, Decimal::from(-80));
        assert_eq!(h.balance(h.al, "P-3").in_transit, Decimal::ZERO);
        assert_eq!(h.balance(h.aa, "P-3").current, Decimal::from(75));
        {
            let mut tx = h.store.begin().unwrap();
            let entry = tx
                .entry(h.company, &received.inbound_entry_key())
                .unwrap()
                .unwrap();
            assert!(entry.is_inbound);
            assert_eq!(entry.quantity, Decimal::from(75));
            assert_eq!(entry.warehouse_id, h.aa);
        }

        let reverted = h.service.revert_reception("acme", transfer.id).unwrap();
        assert_eq!(reverted.state, TransferState::InTransit);
        assert_eq!(h.balance(h.aa, "P-3").current, Decimal::ZERO);
        assert_eq!(h.balance(h.al, "P-3").in_transit, Decimal::from(80));
        let mut tx = h.store.begin().unwrap();
        assert!(tx.entry(h.company, &received.inbound_entry_key()).unwrap().is_none());
    }

    #[test]
    fn manual_reception_waits_for_a_running_sync() {
        let h = harness_with(SyncSettings {
            manual_lock_wait_ms: 5_000,
            ..SyncSettings::default()
        });
        let transfer = dispatched(&h);

        let sync = h.service.locks().try_lock(h.company).unwrap();
        let release = std::thread::spawn(move || {
            std::thread::sleep(StdDuration::from_millis(50));
            drop(sync);
        });
        let received = h
            .service
            .receive_transfer("acme", transfer.id, Decimal::from(80), None)
            .unwrap();
        release.join().unwrap();
        assert_eq!(received.state, TransferState::Received);
    }

    #[test]
    fn manual_reception_gives_up_after_the_configured_wait() {
        let h = harness_with(SyncSettings {
            manual_lock_wait_ms: 10,
            ..SyncSettings::default()
        });
        let transfer = dispatched(&h);

        let _sync = h.service.locks().try_lock(h.company).unwrap();
        let err = h
            .service
            .receive_transfer("acme", transfer.id, Decimal::from(80), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn manual_operations_check_preconditions() {
        let h = harness();
        let transfer = dispatched(&h);

        let err = h.service.revert_reception("acme", transfer.id).unwrap_err();
        assert!(matches!(err, ServiceError::Precondition(_)));

        h.service
            .receive_transfer("acme", transfer.id, Decimal::from(80), None)
            .unwrap();
        let err = h
            .service
            .receive_transfer("acme", transfer.id, Decimal::from(80), None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Precondition(_)));

        let err = h
            .service
            .receive_transfer("acme", kardex_core::TransferId::new(), Decimal::ONE, None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    // --- idempotence -------------------------------------------------------

    fn ledger(h: &Harness) -> Vec<(String, Decimal, String)> {
        let mut tx = h.store.begin().unwrap();
        let page = tx
            .list_entries(h.company, &Default::default(), Pagination::new(Some(1000), None))
            .unwrap();
        let mut rows: Vec<_> = page
            .items
            .into_iter()
            .map(|e| (e.key.to_string(), e.quantity, e.erp_status))
            .collect();
        rows.sort();
        rows
    }

    #[test]
    fn rerunning_a_cycle_yields_the_same_ledger() {
        let h = harness();
        publish(&h, &inbound("000001", at(2025, 9, 1), "P-1", 10));
        publish(&h, &outbound("000002", at(2025, 9, 2), "P-1", 4));
        publish(&h, &dispatch("000003", at(2025, 9, 2), "P-2", 6));
        h.sync();
        let first = ledger(&h);
        let balance = h.balance(h.al, "P-1");

        h.sync();
        assert_eq!(ledger(&h), first);
        assert_eq!(h.balance(h.al, "P-1").current, balance.current);
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::from(6));
    }

    #[test]
    fn in_transit_matches_open_transfers() {
        let h = harness();
        publish(&h, &dispatch("000010", at(2025, 9, 1), "P-1", 5));
        publish(&h, &dispatch("000011", at(2025, 9, 2), "P-1", 7));
        publish(&h, &reception("000900", at(2025, 9, 3), "P-1", 5, "000010"));
        h.sync();

        let open = h
            .service
            .list_transfers(
                "acme",
                &TransferFilter {
                    state: Some(TransferState::InTransit),
                    ..TransferFilter::default()
                },
                Pagination::default(),
            )
            .unwrap();
        let sent: Decimal = open
            .items
            .iter()
            .filter(|t| t.origin_id == h.al)
            .map(|t| t.quantity_sent)
            .sum();
        assert_eq!(open.total, 1);
        assert_eq!(h.balance(h.al, "P-1").in_transit, sent);
        assert_eq!(sent, Decimal::from(7));
    }

    // --- reconciliation ----------------------------------------------------

    #[test]
    fn headers_deleted_upstream_are_voided() {
        let h = harness();
        let doc = inbound("000500", days_ago(3), "P-1", 20);
        publish(&h, &doc);
        h.sync();
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::from(20));

        h.erp.remove(&doc.0.key);
        let report = h.sync();
        assert_eq!(report.headers_deleted, 1);
        assert!(h.entries_of(&doc.0.key).is_empty());
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::ZERO);
        assert!(h.control().last_full_reconciliation.is_some());
    }

    #[test]
    fn status_changes_behind_the_watermark_are_reconciled() {
        let h = harness();
        let older = inbound("000501", days_ago(5), "P-1", 20);
        let newer = inbound("000502", days_ago(1), "P-1", 3);
        publish(&h, &older);
        publish(&h, &newer);
        h.sync();
        assert_eq!(h.control().watermark, Some(days_ago(1)));

        h.erp.set_status(&older.0.key, "A");
        let report = h.sync();
        assert_eq!(report.statuses_updated, 1);
        assert!(h.entries_of(&older.0.key).is_empty());
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::from(3));
    }

    #[test]
    fn watermark_only_moves_forward() {
        let h = harness();
        publish(&h, &inbound("000001", at(2025, 9, 5), "P-1", 1));
        h.sync();
        publish(&h, &inbound("000002", at(2025, 9, 1), "P-1", 1));
        h.sync();
        assert_eq!(h.control().watermark, Some(at(2025, 9, 5)));
    }

    #[test]
    fn failed_copy_keeps_committed_state() {
        let h = harness();
        publish(&h, &inbound("000001", at(2025, 9, 1), "P-1", 1));
        h.erp.fail_next(1, ErpError::Connection("reset by peer".into()));

        let err = h
            .service
            .sync_now(&SyncRequest::new("acme"), &CancelToken::new(), &NoProgress)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Sync(SyncError::Erp(_))));
        assert_eq!(h.control().watermark, None);

        h.sync();
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::ONE);
    }

    // --- notifications and read side ---------------------------------------

    #[test]
    fn progress_is_published_on_the_company_topic() {
        let h = harness();
        let subscription = h.bus.subscribe(h.company);
        publish(&h, &inbound("000001", at(2025, 9, 1), "P-1", 1));
        h.sync();

        let statuses: Vec<SyncStatus> = subscription
            .drain()
            .iter()
            .filter_map(|n| n.as_sync().map(|u| u.status))
            .collect();
        assert_eq!(statuses.first(), Some(&SyncStatus::Started));
        assert_eq!(statuses.last(), Some(&SyncStatus::Finished));
        assert!(statuses.contains(&SyncStatus::RunningPhase1));
        assert!(statuses.contains(&SyncStatus::RunningPhase2));
        assert!(statuses.contains(&SyncStatus::RunningPhase3));
    }

    #[test]
    fn kardex_card_carries_opening_and_running_balance() {
        let h = harness();
        publish(&h, &inbound("000001", at(2025, 8, 20), "P-1", 10));
        publish(&h, &inbound("000002", at(2025, 9, 2), "P-1", 5));
        publish(&h, &outbound("000003", at(2025, 9, 3), "P-1", 3));
        h.sync();

        let cards = h
            .service
            .kardex(
                "acme",
                &KardexRequest {
                    warehouse_id: h.al,
                    product_ids: vec![h.product("P-1")],
                    from: at(2025, 9, 1),
                    to: at(2025, 9, 30),
                },
            )
            .unwrap();
        assert_eq!(cards.len(), 1);
        let card = &cards[0];
        assert_eq!(card.opening_balance, Decimal::from(10));
        assert_eq!(card.rows.len(), 2);
        assert_eq!(card.rows[0].balance, Decimal::from(15));
        assert_eq!(card.closing_balance, Decimal::from(12));
    }

    #[test]
    fn reset_company_drops_synced_data() {
        let h = harness();
        let doc = inbound("000001", at(2025, 9, 1), "P-1", 1);
        publish(&h, &doc);
        h.sync();

        h.service.reset_company("acme").unwrap();
        assert!(h.entries_of(&doc.0.key).is_empty());
        assert_eq!(h.control().watermark, None);
        let stock = h
            .service
            .list_stock("acme", &Default::default(), Pagination::default())
            .unwrap();
        assert_eq!(stock.total, 0);
    }

    // --- jobs --------------------------------------------------------------

    #[test]
    fn sync_job_runs_through_the_executor() {
        let h = harness();
        publish(&h, &inbound("000001", at(2025, 9, 1), "P-1", 4));
        let started = h
            .service
            .start_sync(StartSync::new("acme").requested_by("alice"))
            .unwrap();

        let status = h.service.check_status("alice").unwrap();
        assert!(status.is_syncing);
        assert_eq!(status.job_id, Some(started.job_id));
        assert!(!h.service.check_status("bob").unwrap().is_syncing);

        let err = h.service.start_sync(StartSync::new("acme")).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        let mut executor = JobExecutor::new(h.jobs.clone());
        h.service.register_handlers(&mut executor);
        executor.run_next(StdDuration::from_secs(60)).unwrap().unwrap();

        let job = h.service.job(started.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.progress.percent, 100);
        let result = job.result.unwrap();
        assert_eq!(result["headers_copied"], 1);
        assert!(!h.service.check_status("alice").unwrap().is_syncing);
        assert_eq!(h.balance(h.al, "P-1").current, Decimal::from(4));
    }

    #[test]
    fn unknown_company_fails_the_job() {
        let h = harness();
        let started = h.service.start_sync(StartSync::new("globex")).unwrap();

        let mut executor = JobExecutor::new(h.jobs.clone());
        h.service.register_handlers(&mut executor);
        executor.run_next(StdDuration::from_secs(60)).unwrap();

        let job = h.service.job(started.job_id).unwrap();
        assert!(matches!(job.status, JobStatus::Failed { ref error } if error.contains("globex")));
    }

    #[test]
    fn queued_job_can_be_cancelled() {
        let h = harness();
        let started = h.service.start_sync(StartSync::new("acme")).unwrap();

        let job = h.service.cancel_job(started.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(h.service.start_sync(StartSync::new("acme")).is_ok());
    }

    #[test]
    fn cancelled_cycle_leaves_watermark_untouched() {
        let h = harness();
        publish(&h, &inbound("000001", at(2025, 9, 1), "P-1", 1));
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = h
            .service
            .sync_now(&SyncRequest::new("acme"), &cancel, &NoProgress)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Sync(SyncError::Cancelled)));
        assert_eq!(h.control().watermark, None);
    }

    #[test]
    fn stuck_jobs_are_swept() {
        let h = harness();
        let started = h.service.start_sync(StartSync::new("acme")).unwrap();
        let mut job = h.jobs.claim_next().unwrap().unwrap();
        job.heartbeat_at = Some(Utc::now() - Duration::minutes(30));
        h.jobs.update(&job).unwrap();

        let removed = stuck_cleanup(h.jobs.as_ref(), StdDuration::from_secs(600)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, started.job_id);
        assert!(h.service.start_sync(StartSync::new("acme")).is_ok());
    }

    // --- properties --------------------------------------------------------

    #[derive(Debug, Clone)]
    struct Doc {
        inbound: bool,
        qty: u16,
        status: &'static str,
        day: u32,
    }

    fn doc_strategy() -> impl Strategy<Value = Doc> {
        (
            any::<bool>(),
            1u16..500,
            prop::sample::select(vec!["F", "V", "P", "A", "B"]),
            1u32..28,
        )
            .prop_map(|(inbound, qty, status, day)| Doc {
                inbound,
                qty,
                status,
                day,
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn stock_equals_active_ledger_sum(docs in prop::collection::vec(doc_strategy(), 1..12)) {
            let h = harness();
            let mut expected = Decimal::ZERO;
            for (n, doc) in docs.iter().enumerate() {
                let number = format!("{:06}", n + 1);
                let date = at(2025, 9, doc.day);
                let (mut header, details) = if doc.inbound {
                    inbound(&number, date, "P-1", i64::from(doc.qty))
                } else {
                    outbound(&number, date, "P-1", i64::from(doc.qty))
                };
                header.status = doc.status.to_string();
                h.erp.insert(header, details);
                if ["F", "V", "P"].contains(&doc.status) {
                    let qty = Decimal::from(doc.qty);
                    expected += if doc.inbound { qty } else { -qty };
                }
            }

            h.sync();
            let current = {
                let product = h.product("P-1");
                let mut tx = h.store.begin().unwrap();
                tx.balance(h.company, h.al, product).unwrap().map(|b| b.current)
            };
            prop_assert_eq!(current.unwrap_or(Decimal::ZERO), expected);
        }

        #[test]
        fn received_transfers_conserve_quantity(sent in 1u16..1000, received in 0u16..1200) {
            let h = harness();
            let transfer = dispatched_quantity(&h, i64::from(sent));

            let done = h
                .service
                .receive_transfer("acme", transfer.id, Decimal::from(received), None)
                .unwrap();
            let diff = done.quantity_diff.unwrap();
            prop_assert_eq!(done.quantity_received.unwrap(), done.quantity_sent + diff);
            prop_assert!(done.state != TransferState::InTransit);
        }
    }

    fn dispatched_quantity(h: &Harness, qty: i64) -> Transfer {
        let gs = dispatch("000300", at(2025, 9, 3), "P-3", qty);
        publish(h, &gs);
        h.sync();
        h.transfer_by_dispatch(&gs.0.key.item(1))
    }
}
