//! Offline queue against a live server on a loopback port.

use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use lavaseco_pos::api::ServerClient;
use lavaseco_pos::config::Config;
use lavaseco_pos::db::{self, DbState, Schema};
use lavaseco_pos::models::{ClientInput, InvoicePayload, ItemInput, PaymentInput};
use lavaseco_pos::offline::{InvoiceChanges, LocalSearch, OfflineQueue, SyncStatus};
use lavaseco_pos::orders::{self, SearchParams};
use lavaseco_pos::server::{self, AppState};
use lavaseco_pos::sync::SyncEngine;

struct LiveServer {
    url: String,
    db: Arc<DbState>,
    cancel: CancellationToken,
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_server() -> LiveServer {
    let db = Arc::new(db::open_in_memory(Schema::Server).unwrap());
    let state = AppState::new(db.clone(), Config::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let cancel = CancellationToken::new();
    tokio::spawn(server::serve(state, listener, cancel.clone()));
    LiveServer { url, db, cancel }
}

fn payload(abono: f64) -> InvoicePayload {
    InvoicePayload {
        client: ClientInput {
            cedula: "52111222".into(),
            name: "Marta Gómez".into(),
            phone: "3105556677".into(),
            ..Default::default()
        },
        items: vec![
            ItemInput {
                description: "Vestido".into(),
                quantity: 1,
                price: 18_000.0,
                notes: Some("Mancha en el ruedo".into()),
            },
            ItemInput {
                description: "Camisa".into(),
                quantity: 3,
                price: 5_000.0,
                notes: None,
            },
        ],
        payment: PaymentInput {
            amount: abono,
            method: Some("Efectivo".into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn server_order_count(db: &DbState) -> i64 {
    let conn = db.lock().unwrap();
    conn.query_row("SELECT COUNT(*) FROM orders", [], |r| r.get(0))
        .unwrap()
}

#[tokio::test]
async fn test_queued_invoice_syncs_once() {
    let live = start_server().await;
    let queue = OfflineQueue::in_memory(5).unwrap();
    let engine = SyncEngine::new(queue, ServerClient::new(&live.url).unwrap());

    assert!(engine.probe().await);
    let local = engine.save_and_trigger(&payload(10_000.0), Some(900)).unwrap();

    let report = engine.run_once().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.synced, 1);

    let stored = engine.queue().get(&local.id).unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    assert!(stored.server_id.is_some());
    // The server's folio replaces the provisional one.
    assert_eq!(stored.ticket_number, Some(1));
    assert_eq!(server_order_count(&live.db), 1);

    // A second cycle has nothing to push.
    let report = engine.run_once().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(server_order_count(&live.db), 1);

    let order = orders::get_order(&live.db, stored.server_id.as_deref().unwrap()).unwrap();
    assert_eq!(order["order"]["clientRequestId"], local.id.as_str());
    assert_eq!(order["order"]["totalValue"], 33_000.0);
    assert_eq!(order["order"]["paymentStatus"], "ABONO");
}

#[tokio::test]
async fn test_lost_response_retry_is_deduplicated() {
    let live = start_server().await;
    let client = ServerClient::new(&live.url).unwrap();
    let mut body = payload(0.0);
    body.client_request_id = Some("terminal-2-0001".into());

    let first = client.post_invoice(&body).await.unwrap();
    let second = client.post_invoice(&body).await.unwrap();
    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.server_id, second.server_id);
    assert_eq!(server_order_count(&live.db), 1);
}

#[tokio::test]
async fn test_update_for_missing_server_order_falls_back_to_create() {
    let live = start_server().await;
    let queue = OfflineQueue::in_memory(5).unwrap();
    let engine = SyncEngine::new(queue.clone(), ServerClient::new(&live.url).unwrap());

    let local = queue.save_locally(&payload(0.0), None).unwrap();
    // Synced against a server whose data has since been lost.
    queue.mark_synced(&local.id, "gone-on-server", Some(7)).unwrap();
    let edited = queue
        .mark_update(
            &local.id,
            &InvoiceChanges {
                order_status: Some("EN_PROCESO".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(edited.status, SyncStatus::PendingUpdate);

    let report = engine.run_once().await.unwrap();
    assert_eq!(report.synced, 1);

    let stored = queue.get(&local.id).unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    assert_ne!(stored.server_id.as_deref(), Some("gone-on-server"));
    assert_eq!(server_order_count(&live.db), 1);
}

#[tokio::test]
async fn test_update_of_synced_invoice_reaches_server() {
    let live = start_server().await;
    let queue = OfflineQueue::in_memory(5).unwrap();
    let engine = SyncEngine::new(queue.clone(), ServerClient::new(&live.url).unwrap());

    let local = queue.save_locally(&payload(0.0), None).unwrap();
    engine.run_once().await.unwrap();

    queue
        .mark_update(
            &local.id,
            &InvoiceChanges {
                payment: Some(PaymentInput {
                    amount: 33_000.0,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .unwrap();
    let report = engine.run_once().await.unwrap();
    assert_eq!(report.synced, 1);

    let stored = queue.get(&local.id).unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    let order = orders::get_order(&live.db, stored.server_id.as_deref().unwrap()).unwrap();
    assert_eq!(order["order"]["paymentStatus"], "CANCELADO");
    assert_eq!(server_order_count(&live.db), 1);
}

#[tokio::test]
async fn test_unreachable_server_dead_letters_then_retry_recovers() {
    let live = start_server().await;
    let queue = OfflineQueue::in_memory(1).unwrap();
    // Nothing listens on the discard port.
    let offline = SyncEngine::new(queue.clone(), ServerClient::new("http://127.0.0.1:9").unwrap());

    let local = queue.save_locally(&payload(0.0), None).unwrap();
    assert!(!offline.probe().await);
    let report = offline.run_once().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    let stored = queue.get(&local.id).unwrap();
    assert_eq!(stored.status, SyncStatus::Error);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.is_some());
    assert_eq!(queue.error_count().unwrap(), 1);
    assert_eq!(queue.pending_count().unwrap(), 0);

    assert_eq!(queue.retry_failed().unwrap(), 1);
    let online = SyncEngine::new(queue.clone(), ServerClient::new(&live.url).unwrap());
    let report = online.run_once().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(queue.get(&local.id).unwrap().status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_pull_replicates_orders_created_elsewhere() {
    let live = start_server().await;
    let created = orders::create_invoice(&live.db, &payload(5_000.0)).unwrap();
    let server_id = created["order"]["id"].as_str().unwrap().to_string();

    let queue = OfflineQueue::in_memory(5).unwrap();
    let engine = SyncEngine::new(queue.clone(), ServerClient::new(&live.url).unwrap());
    let report = engine.run_once().await.unwrap();
    assert_eq!(report.pulled, 1);

    let replica = queue.get(&server_id).unwrap();
    assert_eq!(replica.status, SyncStatus::Synced);
    assert_eq!(replica.server_id.as_deref(), Some(server_id.as_str()));

    let status: Value = engine.status().unwrap();
    assert_eq!(status["pendingCount"], 0);
}

#[tokio::test]
async fn test_offline_intake_day_survives_sync() {
    let live = start_server().await;
    let queue = OfflineQueue::in_memory(5).unwrap();
    let engine = SyncEngine::new(queue.clone(), ServerClient::new(&live.url).unwrap());

    let local = queue.save_locally(&payload(10_000.0), None).unwrap();
    let taken_at = local.created_at - 3 * 86_400_000;
    {
        let conn = queue.db().lock().unwrap();
        conn.execute(
            "UPDATE offline_invoices SET created_at = ?1 WHERE id = ?2",
            rusqlite::params![taken_at, local.id],
        )
        .unwrap();
    }

    let report = engine.run_once().await.unwrap();
    assert_eq!(report.synced, 1);

    let stored = queue.get(&local.id).unwrap();
    assert_eq!(stored.status, SyncStatus::Synced);
    assert_eq!(stored.created_at, taken_at);

    let taken_at_utc: DateTime<Utc> = DateTime::from_timestamp_millis(taken_at).unwrap();
    let order = orders::get_order(&live.db, stored.server_id.as_deref().unwrap()).unwrap();
    assert_eq!(order["order"]["createdAt"], db::to_iso(taken_at_utc).as_str());

    let day = taken_at_utc.with_timezone(&Local).format("%d/%m/%Y").to_string();
    let local_hits = queue
        .search_local(&LocalSearch {
            query: Some(day.clone()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(local_hits["total"], 1);

    let server_hits = orders::search_orders(
        &live.db,
        &SearchParams {
            query: Some(day),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(server_hits["total"], 1);
}
