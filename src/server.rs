//! HTTP surface: one axum handler per business action.
//!
//! Handlers validate the body, call into the domain modules, and return
//! JSON. Every failure, including malformed bodies and query strings, comes
//! back as the `PosError` envelope `{"success": false, "code", "error"}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, DbState, Schema};
use crate::email::{CodePurpose, Mailer};
use crate::error::{PosError, PosResult};
use crate::logistics::{self, CountsQuery, DailyCountInput};
use crate::models::InvoicePayload;
use crate::orders::{self, LogisticsAction, SearchParams};
use crate::payments::{self, ExpenseInput, PaymentRequest};
use crate::sandbox::Sandbox;
use crate::{admin, auth, brain, clients, diagnostics, search, shifts};

// ---------------------------------------------------------------------------
// State and extractors
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub config: Arc<Config>,
    pub mailer: Mailer,
    pub sandbox: Sandbox,
}

impl AppState {
    pub fn new(db: Arc<DbState>, config: Config) -> Self {
        let mailer = Mailer::new(config.resend_api_key.clone(), &config.email_from);
        let sandbox = Sandbox::new(
            config.sandbox_api_key.clone(),
            config.sandbox_api_url.as_deref(),
        );
        Self {
            db,
            config: Arc::new(config),
            mailer,
            sandbox,
        }
    }

    /// Open the server database named in `config` and seed the brain graph.
    pub fn open(config: Config) -> PosResult<Self> {
        let db = Arc::new(db::init(&config.db_path, Schema::Server)?);
        brain::seed(&db)?;
        Ok(Self::new(db, config))
    }

    /// Include the code in the response only when it could not be emailed
    /// and debug codes are enabled.
    fn debug_code(&self, code: &str, sent: bool) -> Option<String> {
        (self.config.debug_codes && !sent).then(|| code.to_string())
    }
}

impl From<JsonRejection> for PosError {
    fn from(rejection: JsonRejection) -> Self {
        PosError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for PosError {
    fn from(rejection: QueryRejection) -> Self {
        PosError::Validation(rejection.body_text())
    }
}

#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(PosError))]
struct ApiJson<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(PosError))]
struct ApiQuery<T>(T);

type ApiResult = PosResult<Json<Value>>;

/// Run blocking work (bcrypt) off the async workers.
async fn blocking<T, F>(f: F) -> PosResult<T>
where
    F: FnOnce() -> PosResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(PosError::internal)?
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/orders", get(list_orders).post(create_order))
        .route("/api/orders/search", get(search_orders))
        .route("/api/orders/pending", get(pending_orders))
        .route("/api/orders/next-id", get(next_id))
        .route("/api/orders/sync", post(sync_create))
        .route("/api/orders/sync/{key}", put(sync_update))
        .route("/api/orders/{id}", get(get_order))
        .route("/api/orders/{id}/payments", post(register_payment))
        .route("/api/orders/{id}/logistics", post(logistics_action))
        .route("/api/orders/{id}/deliver", post(deliver_order))
        .route("/api/clients/{cedula}", get(find_client))
        .route("/api/shifts/open", post(open_shift))
        .route("/api/shifts/close", post(close_shift))
        .route("/api/shifts/active/{user_id}", get(active_shift))
        .route("/api/cash/summary", get(cash_summary))
        .route("/api/cash/expenses", post(create_expense))
        .route("/api/cash/expenses/{id}", delete(remove_expense))
        .route(
            "/api/logistics/daily-counts",
            get(daily_counts).post(save_daily_count),
        )
        .route("/api/auth/login", post(login))
        .route("/api/auth/verify", post(verify))
        .route("/api/auth/resend", post(resend))
        .route("/api/auth/forgot-password", post(forgot_password))
        .route("/api/auth/reset-password", post(reset_password))
        .route(
            "/api/admin/whitelist",
            get(list_admins).post(add_admin).delete(remove_admin),
        )
        .route("/api/debug/reset-sequence", post(reset_sequence))
        .route("/api/chat", post(chat))
        .route("/api/brain/nodes", get(list_nodes).post(upsert_node))
        .route("/api/brain/relations", get(list_relations).post(add_relation))
        .route("/api/brain/query", get(brain_query))
        .route("/api/brain/gaps", get(brain_gaps))
        .route("/api/brain/execute", post(brain_execute))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!("POS server listening on {:?}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("POS server stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> ApiResult {
    diagnostics::health_report(&state.db).map(Json).map_err(|e| {
        warn!("Health check failed: {e}");
        PosError::Unavailable("Base de datos no disponible".into())
    })
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

async fn list_orders(State(state): State<AppState>) -> ApiResult {
    orders::list_recent(&state.db).map(Json)
}

async fn create_order(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<InvoicePayload>,
) -> ApiResult {
    orders::create_invoice(&state.db, &payload).map(Json)
}

async fn search_orders(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult {
    orders::search_orders(&state.db, &params).map(Json)
}

async fn pending_orders(State(state): State<AppState>) -> ApiResult {
    orders::pending_invoices(&state.db).map(Json)
}

async fn next_id(State(state): State<AppState>) -> ApiResult {
    orders::next_folio(&state.db).map(Json)
}

async fn get_order(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    orders::get_order(&state.db, &id).map(Json)
}

/// Idempotent create used by the offline queue.
async fn sync_create(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<InvoicePayload>,
) -> ApiResult {
    let has_key = payload
        .client_request_id
        .as_deref()
        .is_some_and(|k| !k.trim().is_empty());
    if !has_key {
        return Err(PosError::Validation("clientRequestId es obligatorio".into()));
    }
    orders::create_invoice(&state.db, &payload).map(Json)
}

async fn sync_update(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ApiJson(payload): ApiJson<InvoicePayload>,
) -> ApiResult {
    orders::update_invoice(&state.db, &key, &payload).map(Json)
}

async fn register_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<PaymentRequest>,
) -> ApiResult {
    payments::register_payment(&state.db, &id, &req).map(Json)
}

#[derive(Deserialize)]
struct LogisticsBody {
    action: LogisticsAction,
}

async fn logistics_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<LogisticsBody>,
) -> ApiResult {
    orders::update_logistics_status(&state.db, &id, body.action).map(Json)
}

async fn deliver_order(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    orders::deliver_order(&state.db, &id).map(Json)
}

async fn find_client(State(state): State<AppState>, Path(cedula): Path<String>) -> ApiResult {
    let client = clients::find_by_cedula(&state.db, &cedula)?;
    Ok(Json(json!({ "success": true, "client": client })))
}

// ---------------------------------------------------------------------------
// Shifts and cash
// ---------------------------------------------------------------------------

async fn open_shift(State(state): State<AppState>, ApiJson(body): ApiJson<Value>) -> ApiResult {
    shifts::open_shift(&state.db, &body).map(Json)
}

async fn close_shift(State(state): State<AppState>, ApiJson(body): ApiJson<Value>) -> ApiResult {
    shifts::close_shift(&state.db, &body).map(Json)
}

async fn active_shift(State(state): State<AppState>, Path(user_id): Path<String>) -> ApiResult {
    shifts::get_active(&state.db, &user_id).map(Json)
}

#[derive(Deserialize)]
struct DayQuery {
    #[serde(default)]
    date: Option<String>,
}

async fn cash_summary(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<DayQuery>,
) -> ApiResult {
    let day = match search::filter_value(&q.date) {
        Some(raw) => search::parse_day(raw)
            .ok_or_else(|| PosError::Validation(format!("Fecha inválida: {raw}")))?,
        None => search::today_local(),
    };
    payments::daily_cash_summary(&state.db, day).map(Json)
}

async fn create_expense(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<ExpenseInput>,
) -> ApiResult {
    payments::register_expense(&state.db, &input).map(Json)
}

async fn remove_expense(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    payments::delete_expense(&state.db, &id).map(Json)
}

async fn daily_counts(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<CountsQuery>,
) -> ApiResult {
    logistics::query_counts(&state.db, &q).map(Json)
}

async fn save_daily_count(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<DailyCountInput>,
) -> ApiResult {
    logistics::upsert_daily_count(&state.db, &input).map(Json)
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Credentials {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct EmailCode {
    #[serde(default)]
    email: String,
    #[serde(default)]
    code: String,
}

#[derive(Deserialize)]
struct EmailOnly {
    #[serde(default)]
    email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    code: String,
    #[serde(default, alias = "password")]
    new_password: String,
}

async fn login(State(state): State<AppState>, ApiJson(body): ApiJson<Credentials>) -> ApiResult {
    let email = auth::normalize_email(&body.email)?;
    let db = state.db.clone();
    let login_email = email.clone();
    let outcome = blocking(move || auth::login(&db, &login_email, &body.password)).await?;

    match outcome {
        auth::LoginOutcome::Success { user } => Ok(Json(json!({
            "status": "SUCCESS",
            "success": true,
            "message": "Bienvenido de nuevo.",
            "user": user,
        }))),
        auth::LoginOutcome::VerifyNeeded { code, created } => {
            let sent = state
                .mailer
                .send_code(&email, &code, CodePurpose::Verification)
                .await;
            let message = match (created, sent) {
                (_, true) => "Código enviado a tu correo.",
                (true, false) => "Cuenta creada. No se pudo enviar el código por correo.",
                (false, false) => "Cuenta no verificada. No se pudo enviar el código.",
            };
            Ok(Json(json!({
                "status": "VERIFY_NEEDED",
                "success": true,
                "message": message,
                "emailSent": sent,
                "code": state.debug_code(&code, sent),
            })))
        }
    }
}

async fn verify(State(state): State<AppState>, ApiJson(body): ApiJson<EmailCode>) -> ApiResult {
    auth::verify(&state.db, &body.email, &body.code).map(Json)
}

async fn resend(State(state): State<AppState>, ApiJson(body): ApiJson<EmailOnly>) -> ApiResult {
    let email = auth::normalize_email(&body.email)?;
    let outcome = auth::resend(&state.db, &email)?;
    let sent = state
        .mailer
        .send_code(&email, &outcome.code, CodePurpose::Verification)
        .await;
    Ok(Json(json!({
        "success": true,
        "message": if sent { "Código reenviado." } else { "No se pudo enviar el código." },
        "emailSent": sent,
        "attemptsLeft": outcome.attempts_left,
        "code": state.debug_code(&outcome.code, sent),
    })))
}

/// Same answer whether or not the email exists.
async fn forgot_password(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<EmailOnly>,
) -> ApiResult {
    let email = auth::normalize_email(&body.email)?;
    let mut debug_code = None;
    if let Some(code) = auth::forgot_password(&state.db, &email)? {
        let sent = state
            .mailer
            .send_code(&email, &code, CodePurpose::PasswordReset)
            .await;
        debug_code = state.debug_code(&code, sent);
    }
    Ok(Json(json!({
        "success": true,
        "message": "Si el correo existe, recibirás un código para restablecer tu contraseña.",
        "code": debug_code,
    })))
}

async fn reset_password(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ResetBody>,
) -> ApiResult {
    let db = state.db.clone();
    blocking(move || auth::reset_password(&db, &body.email, &body.code, &body.new_password))
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Contraseña actualizada.",
    })))
}

// ---------------------------------------------------------------------------
// Admin whitelist and maintenance
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminBody {
    #[serde(default)]
    email: String,
    #[serde(default)]
    added_by: Option<String>,
}

async fn list_admins(State(state): State<AppState>) -> ApiResult {
    admin::list_admins(&state.db).map(Json)
}

async fn add_admin(State(state): State<AppState>, ApiJson(body): ApiJson<AdminBody>) -> ApiResult {
    admin::add_admin(&state.db, &body.email, body.added_by.as_deref()).map(Json)
}

async fn remove_admin(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<AdminBody>,
) -> ApiResult {
    admin::remove_admin(&state.db, &body.email, &state.config.super_admins).map(Json)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetSequenceBody {
    #[serde(alias = "target")]
    target_number: i64,
}

async fn reset_sequence(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ResetSequenceBody>,
) -> ApiResult {
    orders::reset_sequence(&state.db, body.target_number).map(Json)
}

// ---------------------------------------------------------------------------
// Assistant
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatBody {
    #[serde(default)]
    message: String,
}

async fn chat(State(state): State<AppState>, ApiJson(body): ApiJson<ChatBody>) -> ApiResult {
    if state.config.openai_api_key.is_none() {
        return Err(PosError::Unavailable(
            "El asistente de IA no está disponible".into(),
        ));
    }
    let guess = brain::classify_intent(&body.message);
    Ok(Json(json!({
        "message": "Chat AI está en configuración",
        "status": "pending",
        "intent": guess,
    })))
}

#[derive(Deserialize)]
struct NodeFilter {
    #[serde(default, rename = "type")]
    node_type: Option<String>,
}

async fn list_nodes(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<NodeFilter>,
) -> ApiResult {
    brain::list_nodes(&state.db, q.node_type.as_deref()).map(Json)
}

async fn upsert_node(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<brain::NodeInput>,
) -> ApiResult {
    brain::upsert_node(&state.db, &input).map(Json)
}

async fn list_relations(State(state): State<AppState>) -> ApiResult {
    brain::list_relations(&state.db).map(Json)
}

async fn add_relation(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<brain::RelationInput>,
) -> ApiResult {
    brain::add_relation(&state.db, &input).map(Json)
}

#[derive(Deserialize)]
struct PatternQuery {
    #[serde(default, alias = "pattern")]
    q: String,
}

async fn brain_query(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<PatternQuery>,
) -> ApiResult {
    brain::query(&state.db, &q.q).map(Json)
}

async fn brain_gaps(State(state): State<AppState>) -> ApiResult {
    brain::analyze_gaps(&state.db).map(Json)
}

#[derive(Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    code: String,
}

async fn brain_execute(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ExecuteBody>,
) -> ApiResult {
    let output = state.sandbox.execute_python(&body.code).await?;
    Ok(Json(json!({ "success": true, "output": output })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;

    fn test_server_with(config: Config) -> TestServer {
        let db = Arc::new(db::open_in_memory(Schema::Server).expect("in-memory db"));
        let state = AppState {
            db,
            config: Arc::new(config),
            mailer: Mailer::disabled(),
            sandbox: Sandbox::new(None, None),
        };
        TestServer::try_new(router(state)).expect("test server")
    }

    fn test_server() -> TestServer {
        test_server_with(Config {
            debug_codes: true,
            super_admins: vec!["jefe@lavaseco.co".into()],
            ..Config::default()
        })
    }

    fn invoice(request_id: Option<&str>, abono: f64) -> Value {
        json!({
            "clientRequestId": request_id,
            "client": { "cedula": "1020", "name": "Ana Pérez", "phone": "3001234567" },
            "items": [
                { "type": "Saco", "quantity": 1, "price": 12000 },
                { "type": "Pantalón", "quantity": 2, "price": 4000 }
            ],
            "payment": { "amount": abono, "method": "Nequi" }
        })
    }

    #[tokio::test]
    async fn test_health() {
        let server = test_server();
        let response = server.get("/api/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "connected");
    }

    #[tokio::test]
    async fn test_create_get_and_search_order() {
        let server = test_server();
        let response = server.post("/api/orders").json(&invoice(None, 5000.0)).await;
        response.assert_status_ok();
        let body: Value = response.json();
        let order = &body["order"];
        assert_eq!(order["ticketNumber"], 1);
        assert_eq!(order["totalValue"], 20000.0);
        assert_eq!(order["paymentStatus"], "ABONO");
        let id = order["id"].as_str().unwrap().to_string();

        let response = server.get(&format!("/api/orders/{id}")).await;
        response.assert_status_ok();
        let fetched: Value = response.json();
        assert_eq!(fetched["order"]["client"]["cedula"], "1020");

        let response = server.get("/api/orders/search?q=ana").await;
        response.assert_status_ok();
        let found: Value = response.json();
        assert_eq!(found["total"], 1);

        let response = server.get("/api/orders/next-id").await;
        let next: Value = response.json();
        assert_eq!(next["nextId"], 2);

        let response = server.get("/api/clients/1020").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found_envelope() {
        let server = test_server();
        let response = server.get("/api/orders/nope").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_malformed_body_is_validation_error() {
        let server = test_server();
        let response = server
            .post("/api/orders")
            .json(&json!({ "items": "not a list" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_sync_create_is_idempotent() {
        let server = test_server();
        let first: Value = server
            .post("/api/orders/sync")
            .json(&invoice(Some("local-1"), 0.0))
            .await
            .json();
        let second: Value = server
            .post("/api/orders/sync")
            .json(&invoice(Some("local-1"), 0.0))
            .await
            .json();
        assert_eq!(first["order"]["id"], second["order"]["id"]);
        assert_eq!(second["deduplicated"], true);

        let missing_key = server.post("/api/orders/sync").json(&invoice(None, 0.0)).await;
        assert_eq!(missing_key.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_update_missing_is_api_not_found() {
        let server = test_server();
        let response = server
            .put("/api/orders/sync/unknown-local")
            .json(&invoice(Some("unknown-local"), 0.0))
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_payment_settles_order() {
        let server = test_server();
        let created: Value = server.post("/api/orders").json(&invoice(None, 5000.0)).await.json();
        let id = created["order"]["id"].as_str().unwrap().to_string();

        let response = server
            .post(&format!("/api/orders/{id}/payments"))
            .json(&json!({ "amount": 15000, "method": "Efectivo" }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["order"]["paymentStatus"], "CANCELADO");

        let response = server
            .post(&format!("/api/orders/{id}/logistics"))
            .json(&json!({ "action": "missing" }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["order"]["status"], "PROBLEMA");
        assert_eq!(body["order"]["location"], "RECEPCION");

        let response = server.post(&format!("/api/orders/{id}/deliver")).await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["order"]["status"], "delivered");
    }

    #[tokio::test]
    async fn test_shift_open_and_active() {
        let server = test_server();
        let response = server
            .post("/api/shifts/open")
            .json(&json!({ "userId": "u1", "baseAmount": 50000 }))
            .await;
        response.assert_status_ok();
        let opened: Value = response.json();
        assert_eq!(opened["status"], "SUCCESS");

        let active: Value = server.get("/api/shifts/active/u1").await.json();
        assert_eq!(active["shift"]["id"], opened["shiftId"]);

        let summary = server.get("/api/cash/summary").await;
        summary.assert_status_ok();
        let bad_day = server.get("/api/cash/summary?date=not-a-day").await;
        assert_eq!(bad_day.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_login_verify_flow_with_debug_codes() {
        let server = test_server();
        let response = server
            .post("/api/auth/login")
            .json(&json!({ "email": "Ana@Lavaseco.co", "password": "secreto1" }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "VERIFY_NEEDED");
        assert_eq!(body["emailSent"], false);
        let code = body["code"].as_str().unwrap().to_string();

        let response = server
            .post("/api/auth/verify")
            .json(&json!({ "email": "ana@lavaseco.co", "code": code }))
            .await;
        response.assert_status_ok();

        let body: Value = server
            .post("/api/auth/login")
            .json(&json!({ "email": "ana@lavaseco.co", "password": "secreto1" }))
            .await
            .json();
        assert_eq!(body["status"], "SUCCESS");

        let wrong = server
            .post("/api/auth/login")
            .json(&json!({ "email": "ana@lavaseco.co", "password": "otra-clave" }))
            .await;
        assert_eq!(wrong.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_codes_hidden_without_debug_flag() {
        let server = test_server_with(Config::default());
        let body: Value = server
            .post("/api/auth/login")
            .json(&json!({ "email": "beto@lavaseco.co", "password": "secreto1" }))
            .await
            .json();
        assert!(body["code"].is_null());

        let unknown: Value = server
            .post("/api/auth/forgot-password")
            .json(&json!({ "email": "nadie@lavaseco.co" }))
            .await
            .json();
        let known: Value = server
            .post("/api/auth/forgot-password")
            .json(&json!({ "email": "beto@lavaseco.co" }))
            .await
            .json();
        assert_eq!(unknown, known);
    }

    #[tokio::test]
    async fn test_super_admin_cannot_be_removed() {
        let server = test_server();
        server
            .post("/api/admin/whitelist")
            .json(&json!({ "email": "jefe@lavaseco.co" }))
            .await
            .assert_status_ok();
        let response = server
            .delete("/api/admin/whitelist")
            .json(&json!({ "email": "jefe@lavaseco.co" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_chat_requires_assistant_key() {
        let server = test_server();
        let response = server.post("/api/chat").json(&json!({ "message": "hola" })).await;
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let configured = test_server_with(Config {
            openai_api_key: Some(zeroize::Zeroizing::new("sk-test".to_string())),
            ..Config::default()
        });
        let body: Value = configured
            .post("/api/chat")
            .json(&json!({ "message": "buscar mi saco" }))
            .await
            .json();
        assert_eq!(body["status"], "pending");
        assert_eq!(body["intent"]["intent"], "SEARCH_ORDER");
    }

    #[tokio::test]
    async fn test_brain_endpoints() {
        let server = test_server();
        server
            .post("/api/brain/nodes")
            .json(&json!({ "name": "Carlos", "type": "Client" }))
            .await
            .assert_status_ok();
        let gaps: Value = server.get("/api/brain/gaps").await.json();
        assert_eq!(gaps["gaps"][0]["gap_type"], "missing_data");

        let found: Value = server.get("/api/brain/query?q=carl").await.json();
        assert_eq!(found["results"].as_array().unwrap().len(), 1);

        let exec: Value = server
            .post("/api/brain/execute")
            .json(&json!({ "code": "print(1)" }))
            .await
            .json();
        assert_eq!(exec["output"], crate::sandbox::SKIPPED_NO_KEY);
    }

    #[tokio::test]
    async fn test_daily_counts_roundtrip() {
        let server = test_server();
        server
            .post("/api/logistics/daily-counts")
            .json(&json!({ "date": "2025-03-01", "plantCount": 40, "homeCount": 5 }))
            .await
            .assert_status_ok();
        let missing = server
            .post("/api/logistics/daily-counts")
            .json(&json!({ "plantCount": 1 }))
            .await;
        assert_eq!(missing.status_code(), StatusCode::BAD_REQUEST);

        let history: Value = server.get("/api/logistics/daily-counts").await.json();
        assert_eq!(history["data"][0]["plant"], 40);
    }
}
