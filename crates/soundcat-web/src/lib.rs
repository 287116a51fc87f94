//! Axum JSON API for catalog browsing and review-queue resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use soundcat_core::{ReviewStatus, ReviewTaskType};
use soundcat_storage::{CatalogStore, Page, ProductFilter, ReviewFilter, ReviewResolution};
use soundcat_sync::RunSummary;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "soundcat-web";

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(store: Arc<dyn CatalogStore>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            workspace_root: workspace_root.into(),
        }
    }
}

fn page_of(page: Option<usize>, per_page: Option<usize>) -> Page {
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let page = page.unwrap_or(1).max(1);
    Page {
        offset: (page - 1) * per_page,
        limit: per_page,
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProductsQuery {
    category: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ReviewQuery {
    status: Option<ReviewStatus>,
    #[serde(rename = "type")]
    task_type: Option<ReviewTaskType>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    decision: Decision,
}

#[derive(Debug, Serialize)]
pub struct RunReportRow {
    pub run_id: String,
    pub summary: Option<RunSummary>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/products", get(products_handler))
        .route("/review", get(review_handler))
        .route("/review/{id}/resolve", post(review_resolve_handler))
        .route("/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "review API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env(store: Arc<dyn CatalogStore>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("SOUNDCAT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let root = std::env::var("SOUNDCAT_WORKSPACE").unwrap_or_else(|_| ".".to_string());
    serve(AppState::new(store, root), port).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn products_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductsQuery>,
) -> Response {
    let filter = ProductFilter {
        category: query.category.clone(),
        ids: None,
    };
    match state.store.select_products(&filter, page_of(query.page, query.per_page)).await {
        Ok(products) => Json(products).into_response(),
        Err(err) => server_error(err),
    }
}

async fn review_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReviewQuery>,
) -> Response {
    let filter = ReviewFilter {
        status: Some(query.status.unwrap_or(ReviewStatus::Open)),
        task_type: query.task_type,
    };
    match state.store.select_review_tasks(&filter, page_of(query.page, query.per_page)).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => server_error(err),
    }
}

async fn review_resolve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<ResolveQuery>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return (StatusCode::BAD_REQUEST, format!("invalid review task id {id}")).into_response();
    };
    let resolution = match query.decision {
        Decision::Accept => ReviewResolution::Accept,
        Decision::Reject => ReviewResolution::Reject,
    };
    match state.store.resolve_review_task(id, resolution).await {
        Ok(Some(task)) => {
            info!(task_id = %task.id, task_type = task.task_type.as_str(), ?resolution, "review task resolved");
            Json(task).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, format!("review task {id} not found")).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reports_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state.workspace_root, 20) {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}")).into_response()
}

/// Most recent run reports first.
fn load_runs(workspace_root: &Path, limit: usize) -> anyhow::Result<Vec<RunReportRow>> {
    let reports_root = workspace_root.join("reports");
    if !reports_root.exists() {
        return Ok(vec![]);
    }
    let mut runs = std::fs::read_dir(&reports_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|e| {
            let summary = std::fs::read(e.path().join("run_summary.json"))
                .ok()
                .and_then(|bytes| serde_json::from_slice::<RunSummary>(&bytes).ok());
            RunReportRow {
                run_id: e.file_name().to_string_lossy().to_string(),
                summary,
            }
        })
        .collect::<Vec<_>>();
    runs.sort_by(|a, b| {
        let a_started = a.summary.as_ref().map(|s| s.started_at);
        let b_started = b.summary.as_ref().map(|s| s.started_at);
        b_started.cmp(&a_started).then_with(|| a.run_id.cmp(&b.run_id))
    });
    runs.truncate(limit);
    Ok(runs)
}
