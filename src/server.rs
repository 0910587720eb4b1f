//! HTTP JSON API.
//!
//! Identity comes from headers set by the fronting auth proxy
//! (`X-User-Id`, `X-User-Email`, optional `X-User-Name`). Store and mail
//! work is synchronous and runs on tokio's blocking pool.

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Multipart, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::csv;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::mailer::{self, EmailSink};
use crate::models::User;
use crate::query::{self, ListQuery, RawListQuery};
use crate::reminders;
use crate::stats;
use crate::validation::{
    CreateApplicationRequest, PreferencesRequest, UpdateApplicationRequest, validate_create,
    validate_preferences, validate_update,
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    /// `None` when no mail relay is configured.
    pub mailer: Option<Arc<dyn EmailSink>>,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(db: Database, mailer: Option<Arc<dyn EmailSink>>, cron_secret: Option<String>) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            mailer,
            cron_secret,
        }
    }

    fn mailer(&self) -> Result<Arc<dyn EmailSink>> {
        self.mailer.clone().ok_or(AppError::EmailNotConfigured)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/applications", get(list_applications).post(create_application))
        .route(
            "/applications/:id",
            get(get_application)
                .patch(update_application)
                .delete(delete_application),
        )
        .route("/export", get(export_csv))
        .route("/import", post(import_csv))
        .route("/reminders", get(due_reminders).post(send_reminders))
        .route("/cron/send-reminders", get(cron_send_reminders))
        .route("/dashboard", get(dashboard))
        .route("/settings", get(get_settings).patch(update_settings))
        .route("/user", delete(delete_account))
        .route("/test-email", get(email_status).post(send_test_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: &Config, state: AppState) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, mail = state.mailer.is_some(), "Listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// --- Errors ---

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation { .. }
            | AppError::BadRequest(_)
            | AppError::Import { .. }
            | AppError::ForeignKey => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Duplicate => StatusCode::CONFLICT,
            AppError::Delivery(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(_) | AppError::EmailNotConfigured | AppError::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            AppError::Store(e) => {
                tracing::error!(error = %e, "Store error");
                "Database error".to_string()
            }
            AppError::Unknown(e) => {
                tracing::error!(error = ?e, "Unhandled error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({ "error": message, "code": self.code() });
        match &self {
            AppError::Validation { details } => body["details"] = json!(details),
            AppError::Import { details, .. } if !details.is_empty() => body["details"] = json!(details),
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e.body_text())))
}

// --- Blocking bridge ---

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Blocking task panicked")?
}

async fn with_db<T, F>(state: &AppState, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(&state.db);
    run_blocking(move || f(&db.lock())).await
}

// --- Session ---

/// The caller, created on first sight from the identity headers.
pub struct Session(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let (Some(id), Some(email)) = (header("x-user-id"), header("x-user-email")) else {
            return Err(AppError::Unauthorized);
        };
        let name = header("x-user-name");

        let user = with_db(state, move |db| db.upsert_user(&id, &email, name.as_deref())).await?;
        Ok(Session(user))
    }
}

// --- Handlers ---

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_applications(
    State(state): State<AppState>,
    Session(user): Session,
    Query(raw): Query<RawListQuery>,
) -> Result<Json<query::Page>> {
    let query = ListQuery::try_from(raw)?;
    let page = with_db(&state, move |db| query::list_applications(db, &user.id, &query)).await?;
    Ok(Json(page))
}

async fn create_application(
    State(state): State<AppState>,
    Session(user): Session,
    payload: std::result::Result<Json<CreateApplicationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>)> {
    let req = json_body(payload)?;
    let app = with_db(&state, move |db| {
        let prefs = db.get_preferences(&user.id)?;
        let draft = validate_create(req, &prefs)?;
        db.insert_application(&user.id, &draft, Utc::now())
    })
    .await?;
    tracing::info!(application = %app.id, "Application created");
    Ok((StatusCode::CREATED, Json(json!({ "data": app }))))
}

async fn get_application(
    State(state): State<AppState>,
    Session(user): Session,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let app = with_db(&state, move |db| db.owned_application(&user.id, &id)).await?;
    Ok(Json(json!({ "data": app })))
}

async fn update_application(
    State(state): State<AppState>,
    Session(user): Session,
    Path(id): Path<String>,
    payload: std::result::Result<Json<UpdateApplicationRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let patch = validate_update(json_body(payload)?)?;
    let app = with_db(&state, move |db| db.update_application(&user.id, &id, &patch, Utc::now())).await?;
    Ok(Json(json!({ "data": app })))
}

async fn delete_application(
    State(state): State<AppState>,
    Session(user): Session,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let app = with_db(&state, move |db| db.delete_application(&user.id, &id)).await?;
    tracing::info!(application = %app.id, "Application deleted");
    Ok(Json(json!({ "data": app })))
}

async fn export_csv(State(state): State<AppState>, Session(user): Session) -> Result<Response> {
    let apps = with_db(&state, move |db| db.list_for_export(&user.id)).await?;
    let body = csv::encode(&apps);
    let disposition = format!(
        "attachment; filename=\"{}\"",
        csv::export_filename(Utc::now().date_naive())
    );
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn import_csv(
    State(state): State<AppState>,
    Session(user): Session,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?
    {
        if field.name() == Some("file") {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read file data: {}", e)))?;
            upload = Some((file_name, bytes.to_vec()));
            break;
        }
    }

    let (file_name, bytes) = upload.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
    if !file_name.to_lowercase().ends_with(".csv") {
        return Err(AppError::BadRequest("File must be a CSV".to_string()));
    }
    let text = String::from_utf8(bytes).map_err(|_| AppError::BadRequest("File must be UTF-8 text".to_string()))?;

    let (imported, errors) = with_db(&state, move |db| {
        let prefs = db.get_preferences(&user.id)?;
        let decoded = csv::decode(&text, Utc::now(), &prefs.default_currency)?;
        let imported = db.insert_applications(&user.id, &decoded.drafts, Utc::now())?;
        Ok((imported, decoded.errors))
    })
    .await?;

    tracing::info!(imported, skipped = errors.len(), "CSV import finished");
    let mut body = json!({
        "message": format!("Successfully imported {} applications", imported),
        "imported": imported,
    });
    if !errors.is_empty() {
        body["errors"] = json!(errors);
    }
    Ok(Json(body))
}

async fn due_reminders(State(state): State<AppState>, Session(user): Session) -> Result<Json<Value>> {
    let apps = with_db(&state, move |db| db.follow_ups_due(&user.id, Utc::now())).await?;
    Ok(Json(json!({ "count": apps.len(), "applications": apps })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRemindersRequest {
    application_id: Option<String>,
}

async fn send_reminders(
    State(state): State<AppState>,
    Session(user): Session,
    payload: Option<Json<SendRemindersRequest>>,
) -> Result<Json<Value>> {
    let sink = state.mailer()?;
    let application_id = payload
        .and_then(|Json(req)| req.application_id)
        .filter(|id| !id.trim().is_empty());
    let db = Arc::clone(&state.db);
    let email = user.email.clone();

    let report = run_blocking(move || {
        let now = Utc::now();
        match application_id {
            Some(id) => reminders::send_for_application(&db, sink.as_ref(), &user, &id, now),
            None => reminders::sweep_for_user(&db, sink.as_ref(), &user, now),
        }
    })
    .await?;

    let message = if report.total == 0 {
        report.message()
    } else {
        format!("Sent {} reminder(s) to {}", report.sent, email)
    };
    Ok(Json(json!({
        "message": message,
        "sent": report.sent,
        "total": report.total,
        "results": report.results,
    })))
}

async fn cron_send_reminders(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    if let Some(secret) = &state.cron_secret {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(secret.as_str()) {
            tracing::warn!("Rejected cron call with missing or wrong secret");
            return Err(AppError::Unauthorized);
        }
    }

    let sink = state.mailer()?;
    let db = Arc::clone(&state.db);
    let report = run_blocking(move || reminders::sweep_all(&db, sink.as_ref(), Utc::now())).await?;

    Ok(Json(json!({
        "message": report.message(),
        "checked": report.checked,
        "sent": report.sent,
        "total": report.total,
        "results": report.results,
    })))
}

async fn dashboard(State(state): State<AppState>, Session(user): Session) -> Result<Json<stats::DashboardStats>> {
    let stats = with_db(&state, move |db| stats::dashboard(db, &user.id, Utc::now().date_naive())).await?;
    Ok(Json(stats))
}

async fn get_settings(State(state): State<AppState>, Session(user): Session) -> Result<Json<Value>> {
    let settings = with_db(&state, move |db| db.get_settings(&user.id))
        .await?
        .ok_or_else(|| AppError::NotFound("User".to_string()))?;
    Ok(Json(json!(settings)))
}

async fn update_settings(
    State(state): State<AppState>,
    Session(user): Session,
    payload: std::result::Result<Json<PreferencesRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let patch = validate_preferences(json_body(payload)?)?;
    let settings = with_db(&state, move |db| db.update_preferences(&user.id, &patch))
        .await?
        .ok_or_else(|| AppError::NotFound("User".to_string()))?;
    Ok(Json(json!(settings)))
}

async fn delete_account(State(state): State<AppState>, Session(user): Session) -> Result<Json<Value>> {
    let removed = with_db(&state, move |db| db.delete_user(&user.id)).await?;
    if !removed {
        return Err(AppError::NotFound("User".to_string()));
    }
    Ok(Json(json!({ "success": true })))
}

async fn email_status(State(state): State<AppState>, Session(_user): Session) -> Json<Value> {
    Json(json!({ "configured": state.mailer.is_some() }))
}

#[derive(Debug, Default, Deserialize)]
struct TestEmailRequest {
    email: Option<String>,
}

async fn send_test_email(
    State(state): State<AppState>,
    Session(_user): Session,
    payload: std::result::Result<Json<TestEmailRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let to = json_body(payload)?
        .email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| AppError::BadRequest("Email address is required".to_string()))?;
    let sink = state.mailer()?;

    let email = mailer::test_email(&to);
    let receipt = run_blocking(move || sink.deliver(&email)).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Test email sent to {}. Check your inbox!", to),
        "messageId": receipt.message_id,
    })))
}
