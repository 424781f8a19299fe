//! Read-only web surface over the notice store: an HTML listing, a JSON
//! API, and a health endpoint. No handler mutates the store.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use redwatch_core::NoticeRow;
use redwatch_store::NoticeReader;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "redwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NoticeReader>,
}

impl AppState {
    pub fn new(store: Arc<dyn NoticeReader>) -> Self {
        Self { store }
    }
}

/// Display row with every field pre-rendered for the template.
#[derive(Debug, Clone)]
struct NoticeView {
    name: String,
    age: String,
    nationality: String,
    collected_at: String,
    updated_at: String,
}

impl From<NoticeRow> for NoticeView {
    fn from(row: NoticeRow) -> Self {
        Self {
            name: row.name,
            age: row.age.unwrap_or_else(|| "-".to_string()),
            nationality: row.nationality.unwrap_or_else(|| "-".to_string()),
            collected_at: row.collected_at.to_rfc3339(),
            updated_at: row.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    notices: Vec<NoticeView>,
    total_count: i64,
    updated_count: i64,
    current_time: String,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/red-notices", get(api_notices_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn serve(store: Arc<dyn NoticeReader>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let data = async {
        let notices = state.store.list_recent().await?;
        let updated_count = state.store.updated_count().await?;
        Ok::<_, redwatch_store::StoreError>((notices, updated_count))
    }
    .await;

    match data {
        Ok((notices, updated_count)) => {
            let total_count = notices.len() as i64;
            render_html(IndexTemplate {
                notices: notices.into_iter().map(NoticeView::from).collect(),
                total_count,
                updated_count,
                current_time: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            })
        }
        Err(err) => server_error(anyhow::anyhow!(err)),
    }
}

async fn api_notices_handler(State(state): State<AppState>) -> Response {
    match state.store.list_recent().await {
        Ok(notices) => Json(notices).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    match state.store.count().await {
        Ok(count) => Json(serde_json::json!({
            "status": "healthy",
            "database": "connected",
            "records_count": count,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "database": "disconnected",
                "error": err.to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    let body = ErrorTemplate {
        message: err.to_string(),
    }
    .render()
    .unwrap_or_else(|_| "Server error".to_string());
    (StatusCode::INTERNAL_SERVER_ERROR, Html(body)).into_response()
}
