//! Background sync engine for the offline invoice queue.
//!
//! Pushes due `PENDING_SYNC` records with `POST /api/orders/sync` and
//! `PENDING_UPDATE` records with `PUT /api/orders/sync/{id}`, then pulls
//! recent server orders back into the queue. One cycle runs at a time; an
//! overlapping call returns a skipped report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ServerClient, SyncedOrder};
use crate::db;
use crate::error::PosResult;
use crate::models::InvoicePayload;
use crate::offline::{OfflineInvoice, OfflineQueue, SyncStatus};

/// How many recent server orders each cycle replicates locally.
const PULL_LIMIT: usize = 100;

/// Connectivity is probed at least this often so a reconnect is noticed
/// before the next full interval.
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub skipped: bool,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub pulled: usize,
}

/// Clears the in-flight flag when a cycle ends, including on early return.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    queue: OfflineQueue,
    client: ServerClient,
    syncing: AtomicBool,
    online: AtomicBool,
    trigger: Notify,
    last_sync: Mutex<Option<String>>,
}

impl SyncEngine {
    pub fn new(queue: OfflineQueue, client: ServerClient) -> Self {
        Self {
            queue,
            client,
            syncing: AtomicBool::new(false),
            online: AtomicBool::new(false),
            trigger: Notify::new(),
            last_sync: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Wake the loop for an immediate cycle. Never blocks.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Local-first save followed by a fire-and-forget sync request.
    pub fn save_and_trigger(
        &self,
        payload: &InvoicePayload,
        ticket_number: Option<i64>,
    ) -> PosResult<OfflineInvoice> {
        let invoice = self.queue.save_locally(payload, ticket_number)?;
        self.trigger();
        Ok(invoice)
    }

    /// Banner data: queue depth, dead letters, and connectivity.
    pub fn status(&self) -> PosResult<Value> {
        let last_sync = self.last_sync.lock().ok().and_then(|g| g.clone());
        Ok(json!({
            "pendingCount": self.queue.pending_count()?,
            "errorCount": self.queue.error_count()?,
            "isSyncing": self.is_syncing(),
            "lastSync": last_sync,
            "online": self.online.load(Ordering::Acquire),
            "serverUrl": self.client.base_url(),
        }))
    }

    /// Check server reachability and remember it for `status`.
    pub async fn probe(&self) -> bool {
        let online = self.client.is_online().await;
        self.online.store(online, Ordering::Release);
        online
    }

    /// One push/pull cycle.
    pub async fn run_once(&self) -> PosResult<SyncReport> {
        let Some(_in_flight) = InFlight::acquire(&self.syncing) else {
            debug!("Sync already in progress; skipping");
            return Ok(SyncReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = SyncReport::default();
        let due = self.queue.due(Utc::now())?;
        if !due.is_empty() {
            info!(count = due.len(), "Syncing pending invoices");
        }

        for invoice in &due {
            report.attempted += 1;
            match self.push(invoice).await {
                Ok(synced) => {
                    match self
                        .queue
                        .record_sync_success(invoice, &synced.server_id, synced.ticket_number)
                    {
                        Ok(_) => {
                            report.synced += 1;
                            info!(
                                invoice_id = %invoice.id,
                                server_id = %synced.server_id,
                                ticket_number = ?synced.ticket_number,
                                deduplicated = synced.deduplicated,
                                "Invoice synced"
                            );
                        }
                        Err(e) => warn!(invoice_id = %invoice.id, "Failed to record sync: {e}"),
                    }
                }
                Err(e) if e.is_permanent() => {
                    report.dead_lettered += 1;
                    if let Err(db_err) = self.queue.mark_dead(&invoice.id, &e.to_string()) {
                        warn!(invoice_id = %invoice.id, "Failed to dead-letter invoice: {db_err}");
                    }
                }
                Err(e) => {
                    warn!(invoice_id = %invoice.id, error = %e, "Invoice sync failed");
                    match self.queue.mark_failed(&invoice.id, &e.to_string()) {
                        Ok(SyncStatus::Error) => report.dead_lettered += 1,
                        Ok(_) => report.failed += 1,
                        Err(db_err) => {
                            report.failed += 1;
                            warn!(invoice_id = %invoice.id, "Failed to record sync failure: {db_err}");
                        }
                    }
                }
            }
        }

        match self.client.fetch_recent(PULL_LIMIT).await {
            Ok(orders) => match self.queue.upsert_from_server(&orders) {
                Ok(n) => report.pulled = n,
                Err(e) => warn!("Failed to replicate server orders: {e}"),
            },
            Err(e) => debug!("Skipping server pull: {e}"),
        }

        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(db::now_iso());
        }
        Ok(report)
    }

    async fn push(&self, invoice: &OfflineInvoice) -> Result<SyncedOrder, ApiError> {
        let payload = invoice.to_payload();
        if invoice.status != SyncStatus::PendingUpdate {
            return self.client.post_invoice(&payload).await;
        }
        match self.client.put_invoice(&invoice.id, &payload).await {
            Err(e) if e.is_not_found() => {
                info!(
                    invoice_id = %invoice.id,
                    "Server has no order for update; creating it instead"
                );
                self.client.post_invoice(&payload).await
            }
            other => other,
        }
    }

    /// Run cycles on `interval`, on explicit triggers, and when the server
    /// comes back after being unreachable. Stops when `cancel` fires.
    pub fn spawn_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let probe_every = interval.min(MAX_PROBE_INTERVAL).max(Duration::from_millis(100));

        tokio::spawn(async move {
            info!("Sync loop started (interval: {}s)", interval.as_secs());
            let mut previous_online: Option<bool> = None;
            let mut last_run: Option<Instant> = None;

            loop {
                let triggered = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Sync loop stopped");
                        break;
                    }
                    _ = tokio::time::sleep(probe_every) => false,
                    _ = self.trigger.notified() => true,
                };

                let online = self.probe().await;

                if !online {
                    if previous_online != Some(false) {
                        info!("Network offline; deferring remote sync and keeping queue pending");
                    }
                    previous_online = Some(false);
                    continue;
                }

                let reconnected = previous_online == Some(false);
                if reconnected {
                    info!("Network restored; resuming queued sync");
                }
                previous_online = Some(true);

                let interval_due = last_run.map_or(true, |t| t.elapsed() >= interval);
                if !(triggered || reconnected || interval_due) {
                    continue;
                }

                last_run = Some(Instant::now());
                match self.run_once().await {
                    Ok(report) if report.attempted > 0 || report.pulled > 0 => {
                        info!(
                            synced = report.synced,
                            failed = report.failed,
                            dead_lettered = report.dead_lettered,
                            pulled = report.pulled,
                            "Sync cycle complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Sync cycle failed: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientInput, ItemInput};

    fn payload() -> InvoicePayload {
        InvoicePayload {
            client: ClientInput {
                cedula: "1".into(),
                name: "Ana".into(),
                ..Default::default()
            },
            items: vec![ItemInput {
                description: "Saco".into(),
                quantity: 1,
                price: 1_000.0,
                notes: None,
            }],
            ..Default::default()
        }
    }

    /// Engine pointed at a port nothing listens on.
    fn offline_engine() -> SyncEngine {
        let queue = OfflineQueue::in_memory(2).unwrap();
        let client = ServerClient::new("http://127.0.0.1:9").unwrap();
        SyncEngine::new(queue, client)
    }

    #[test]
    fn test_in_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = InFlight::acquire(&flag);
        assert!(first.is_some());
        assert!(InFlight::acquire(&flag).is_none());
        drop(first);
        assert!(InFlight::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let engine = offline_engine();
        engine.syncing.store(true, Ordering::Release);
        let report = engine.run_once().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_schedules_retry() {
        let engine = offline_engine();
        let inv = engine.save_and_trigger(&payload(), Some(1)).unwrap();

        let report = engine.run_once().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        assert!(!engine.is_syncing());

        let stored = engine.queue().get(&inv.id).unwrap();
        assert_eq!(stored.status, SyncStatus::PendingSync);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.last_error.is_some());

        // Backoff not elapsed: the next cycle does not retry it.
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.attempted, 0);

        let status = engine.status().unwrap();
        assert_eq!(status["pendingCount"], 1);
        assert_eq!(status["errorCount"], 0);
        assert!(status["lastSync"].is_string());
    }

    async fn start_server(listener: tokio::net::TcpListener) -> CancellationToken {
        let db = Arc::new(db::open_in_memory(db::Schema::Server).unwrap());
        let state = crate::server::AppState::new(db, crate::config::Config::default());
        let cancel = CancellationToken::new();
        tokio::spawn(crate::server::serve(state, listener, cancel.clone()));
        cancel
    }

    async fn wait_for_status(queue: &OfflineQueue, id: &str, want: SyncStatus) -> bool {
        for _ in 0..50 {
            if queue.get(id).unwrap().status == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_loop_syncs_after_server_comes_back() {
        // Reserve a port, then free it so the first probes are refused.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let queue = OfflineQueue::in_memory(5).unwrap();
        let client = ServerClient::new(&format!("http://{addr}")).unwrap();
        let engine = Arc::new(SyncEngine::new(queue.clone(), client));
        let inv = queue.save_locally(&payload(), None).unwrap();

        let cancel = CancellationToken::new();
        let handle = engine.clone().spawn_loop(Duration::from_millis(200), cancel.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(queue.get(&inv.id).unwrap().status, SyncStatus::PendingSync);
        assert_eq!(engine.status().unwrap()["online"], false);

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let server = start_server(listener).await;

        assert!(wait_for_status(&queue, &inv.id, SyncStatus::Synced).await);
        assert_eq!(engine.status().unwrap()["online"], true);

        cancel.cancel();
        handle.await.unwrap();
        server.cancel();
    }

    #[tokio::test]
    async fn test_save_and_trigger_runs_before_interval() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = start_server(listener).await;

        let queue = OfflineQueue::in_memory(5).unwrap();
        let engine = Arc::new(SyncEngine::new(queue.clone(), ServerClient::new(&url).unwrap()));
        let cancel = CancellationToken::new();
        // Probes run every 10s at most; the wait below is shorter, so only
        // the trigger can start a cycle.
        let handle = engine.clone().spawn_loop(Duration::from_secs(3600), cancel.clone());

        let inv = engine.save_and_trigger(&payload(), None).unwrap();
        assert!(wait_for_status(&queue, &inv.id, SyncStatus::Synced).await);

        cancel.cancel();
        handle.await.unwrap();
        server.cancel();
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let engine = Arc::new(offline_engine());
        let cancel = CancellationToken::new();
        let handle = engine.clone().spawn_loop(Duration::from_millis(50), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("loop should stop")
            .unwrap();
    }
}
