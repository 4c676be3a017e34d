//! Axum HTTP surface: sync trigger, inspection CRUD, and the authorization gate.

pub mod auth;
pub mod config;
pub mod error;

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use insp_adapters::to_inspection_record;
use insp_core::{InspectionRecord, RawRecord, SyncWindow};
use insp_storage::{DynStore, ListQuery};
use insp_sync::{SyncPipeline, SyncRunSummary};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use auth::{AuthDecision, AuthGate, AuthRejection, Claims, TokenError};
pub use config::{AuthConfig, AuthMode, ConfigError, WebConfig};
pub use error::AppError;

pub const CRATE_NAME: &str = "insp-web";

#[derive(Clone)]
pub struct AppState {
    pub store: DynStore,
    pub pipeline: Arc<SyncPipeline>,
    pub gate: Arc<AuthGate>,
}

impl AppState {
    pub fn new(store: DynStore, pipeline: Arc<SyncPipeline>, gate: AuthGate) -> Self {
        Self {
            store,
            pipeline,
            gate: Arc::new(gate),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/sync", post(trigger_sync_handler))
        .route("/api/persist/nyc", get(trigger_sync_handler))
        .route(
            "/api/restaurants",
            get(list_restaurants_handler).post(create_restaurant_handler),
        )
        .route(
            "/api/restaurants/{id}",
            get(get_restaurant_handler)
                .put(update_restaurant_handler)
                .delete(delete_restaurant_handler),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/healthz", get(healthz_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `0.0.0.0:port` and serves until `shutdown` resolves.
pub async fn serve(
    port: u16,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sync_running: bool,
}

async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sync_running: state.pipeline.is_running(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    /// Overrides the default "yesterday" window.
    date: Option<NaiveDate>,
}

async fn trigger_sync_handler(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncRunSummary>, AppError> {
    let summary = match query.date {
        Some(day) => state.pipeline.run_sync(SyncWindow::for_day(day)).await?,
        None => state.pipeline.run_default().await?,
    };
    Ok(Json(summary))
}

async fn list_restaurants_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<InspectionRecord>>, AppError> {
    Ok(Json(state.store.list(&query).await?))
}

async fn get_restaurant_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<InspectionRecord>, AppError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("record {id} not found")))
}

async fn create_restaurant_handler(
    State(state): State<AppState>,
    Json(raw): Json<RawRecord>,
) -> Result<impl IntoResponse, AppError> {
    let record = to_inspection_record(raw).map_err(|err| AppError::bad_request(err.to_string()))?;
    state.store.insert(&record).await?;
    info!(external_id = record.external_id, "inspection created");
    Ok((StatusCode::CREATED, Json(record)))
}

/// Shallow-merges the given attributes into the stored record.
async fn update_restaurant_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<RawRecord>,
) -> Result<Json<InspectionRecord>, AppError> {
    let mut existing = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("record {id} not found")))?;
    existing.merge_fields(patch);

    let record =
        to_inspection_record(existing.fields).map_err(|err| AppError::bad_request(err.to_string()))?;
    if record.external_id != id {
        return Err(AppError::bad_request(format!(
            "identifier cannot change from {id} to {}",
            record.external_id
        )));
    }

    state.store.update(&record).await?;
    info!(external_id = id, "inspection updated");
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    external_id: i64,
    deleted: bool,
}

async fn delete_restaurant_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, AppError> {
    if !state.store.delete(id).await? {
        return Err(AppError::not_found(format!("record {id} not found")));
    }
    info!(external_id = id, "inspection deleted");
    Ok(Json(DeleteResponse {
        external_id: id,
        deleted: true,
    }))
}
