//! Axum admin surface for triggering partner imports and inspecting the mapping ledger.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use camper_adapters::adapter_for_partner;
use camper_core::EntityType;
use camper_storage::{MappingStore, PartnerMapping, PgStoreFactory, StoreError, StoreFactory};
use camper_sync::{importer_from_config, maybe_build_scheduler, ImportError, ImportReport, Importer, SyncConfig};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

mod auth;

pub use auth::{require_admin, AdminIdentity, AuthError, Claims, JwtKeys};

pub const CRATE_NAME: &str = "camper-web";

#[derive(Clone)]
pub struct AppState {
    pub stores: Arc<dyn StoreFactory>,
    pub importer: Arc<Importer>,
    pub jwt: Arc<JwtKeys>,
}

impl AppState {
    pub fn new(stores: Arc<dyn StoreFactory>, importer: Arc<Importer>, jwt: JwtKeys) -> Self {
        Self {
            stores,
            importer,
            jwt: Arc::new(jwt),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown partner {0}")]
    UnknownPartner(String),
    #[error("unknown entity type {0}")]
    UnknownEntity(String),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::UnknownPartner(_)
            | ApiError::UnknownEntity(_)
            | ApiError::Import(ImportError::UnknownPartner(_))
            | ApiError::Import(ImportError::UnsupportedEntity { .. }) => {
                (StatusCode::NOT_FOUND, "not found")
            }
            ApiError::Import(ImportError::PartnerDisabled(_)) => {
                (StatusCode::CONFLICT, "partner disabled")
            }
            ApiError::Import(_) => {
                error!(error = %self, "partner import failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "import failed")
            }
            ApiError::Store(_) => {
                error!(error = %self, "store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        };
        (status, Json(json!({ "error": message, "details": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    message: String,
    changes: Vec<String>,
}

impl ImportResponse {
    fn from_reports(reports: Vec<ImportReport>) -> Self {
        let message = reports
            .iter()
            .map(ImportReport::summary)
            .collect::<Vec<_>>()
            .join("; ");
        let changes = reports.into_iter().flat_map(|r| r.changes).collect();
        Self {
            message: format!("Import finished: {message}"),
            changes,
        }
    }
}

#[derive(Debug, Serialize)]
struct PartnerRow {
    partner_name: String,
    display_name: String,
    enabled: bool,
    base_url: String,
    entity_types: Vec<EntityType>,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let admin = Router::new()
        .route("/api/admin/partners", get(partners_handler))
        .route("/api/admin/mappings/{partner}/{entity}", get(mappings_handler))
        .route("/api/admin/import/{partner}", post(import_partner_handler))
        .route("/api/admin/import/{partner}/{entity}", post(import_entity_handler))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health_handler))
        .merge(admin)
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port: u16 = std::env::var("CAMPER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let secret = std::env::var("CAMPER_JWT_SECRET")
        .map_err(|_| anyhow::anyhow!("CAMPER_JWT_SECRET must be set"))?;

    let stores: Arc<dyn StoreFactory> =
        Arc::new(PgStoreFactory::connect(&config.database_url, 10).await?);
    let importer = Arc::new(importer_from_config(&config).await?);

    let scheduler = maybe_build_scheduler(&config, importer.clone(), stores.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.import_cron, "partner import scheduler started");
    }

    let state = AppState::new(stores, importer, JwtKeys::new(&secret));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn parse_entity(raw: &str) -> Result<EntityType, ApiError> {
    EntityType::from_str(raw).map_err(|_| ApiError::UnknownEntity(raw.to_string()))
}

async fn partners_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PartnerRow>> {
    let rows = state
        .importer
        .registry()
        .partners
        .iter()
        .map(|p| PartnerRow {
            partner_name: p.partner_name.clone(),
            display_name: p.display_name.clone(),
            enabled: p.enabled,
            base_url: p.base_url.clone(),
            entity_types: adapter_for_partner(&p.partner_name)
                .map(|a| EntityType::ALL.into_iter().filter(|e| a.supports(*e)).collect())
                .unwrap_or_default(),
        })
        .collect();
    Json(rows)
}

async fn mappings_handler(
    State(state): State<Arc<AppState>>,
    Path((partner, entity)): Path<(String, String)>,
) -> Result<Json<Vec<PartnerMapping>>, ApiError> {
    let entity_type = parse_entity(&entity)?;
    if state.importer.registry().get(&partner).is_none() {
        return Err(ApiError::UnknownPartner(partner));
    }
    let mut store = state.stores.acquire().await?;
    Ok(Json(store.mappings_for(&partner, entity_type).await?))
}

async fn import_entity_handler(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Path((partner, entity)): Path<(String, String)>,
) -> Result<Json<ImportResponse>, ApiError> {
    let entity_type = parse_entity(&entity)?;
    info!(admin = admin.user_id, partner = %partner, entity = %entity_type, "import requested");

    let mut store = state.stores.acquire().await?;
    let report = state
        .importer
        .import_entity(&mut *store, &partner, entity_type)
        .await?;
    Ok(Json(ImportResponse::from_reports(vec![report])))
}

async fn import_partner_handler(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminIdentity>,
    Path(partner): Path<String>,
) -> Result<Json<ImportResponse>, ApiError> {
    info!(admin = admin.user_id, partner = %partner, "full partner import requested");

    let mut store = state.stores.acquire().await?;
    let reports = state.importer.import_partner(&mut *store, &partner).await?;
    Ok(Json(ImportResponse::from_reports(reports)))
}
