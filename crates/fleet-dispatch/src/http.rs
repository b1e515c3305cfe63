//! Scanner HTTP surface

use axum::{
    extract::{rejection::FormRejection, Query, State},
    http::StatusCode,
    routing::{get, post},
    Form, Json, Router,
};
use fleet_proto::{Location, ObjectKind, ScanResponse, StatusEntry};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::orchestrator::CallOrchestrator;
use crate::status::MetricsSnapshot;

pub const WRONG_METHOD: &str = "Wrong method";
pub const WRONG_FORMAT: &str = "Wrong format";
pub const CACHE_UNAVAILABLE: &str = "Failed to get MapObjects from DB";

/// Scanner server configuration
pub struct ScannerConfig {
    pub bind_addr: SocketAddr,
    /// Shared secret required by `/status`
    pub secret: String,
}

struct ScannerState {
    orchestrator: Arc<CallOrchestrator>,
    secret: String,
}

/// Form fields of `POST /scan`
#[derive(Debug, Deserialize)]
pub struct ScanForm {
    pub lat: Option<String>,
    pub lng: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    /// Comma separated object kind codes; all kinds when absent
    pub types: Option<String>,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub sessions: Vec<StatusEntry>,
    pub pooled: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ScannerServer {
    config: ScannerConfig,
    state: Arc<ScannerState>,
}

impl ScannerServer {
    pub fn new(config: ScannerConfig, orchestrator: Arc<CallOrchestrator>) -> Self {
        let state = Arc::new(ScannerState {
            orchestrator,
            secret: config.secret.clone(),
        });
        Self { config, state }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/scan", post(scan).fallback(wrong_method))
            .route("/status", get(status))
            .route("/cache", get(cache))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting scanner on {}", self.config.bind_addr);
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Scanner server error: {}", e))?;

        Ok(())
    }
}

async fn scan(
    State(state): State<Arc<ScannerState>>,
    form: Result<Form<ScanForm>, FormRejection>,
) -> (StatusCode, Json<ScanResponse>) {
    let location = match form {
        Ok(Form(form)) => parse_location(&form),
        Err(e) => {
            debug!(error = %e, "Rejected scan form");
            None
        }
    };
    let Some(location) = location else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ScanResponse::failure(WRONG_FORMAT)),
        );
    };

    match state.orchestrator.scan(location).await {
        Ok(objects) => (StatusCode::OK, Json(ScanResponse::success(objects))),
        Err(e) => (StatusCode::OK, Json(ScanResponse::failure(e.public_message()))),
    }
}

fn parse_location(form: &ScanForm) -> Option<Location> {
    let lat = form.lat.as_deref()?.trim().parse::<f64>().ok()?;
    let lng = form.lng.as_deref()?.trim().parse::<f64>().ok()?;
    if !lat.is_finite() || !lng.is_finite() {
        return None;
    }
    Some(Location::new(lat, lng))
}

async fn wrong_method() -> (StatusCode, Json<ScanResponse>) {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(ScanResponse::failure(WRONG_METHOD)),
    )
}

async fn status(
    State(state): State<Arc<ScannerState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    if state.secret.is_empty() || query.secret != state.secret {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "nope".to_string(),
            }),
        ));
    }

    let orchestrator = &state.orchestrator;
    Ok(Json(StatusResponse {
        sessions: orchestrator.status().entries(),
        pooled: orchestrator.pool().len().await,
        metrics: orchestrator.metrics().snapshot(),
    }))
}

async fn cache(
    State(state): State<Arc<ScannerState>>,
    Query(query): Query<CacheQuery>,
) -> (StatusCode, Json<ScanResponse>) {
    let kinds = match query.types.as_deref() {
        None | Some("") => ObjectKind::ALL.to_vec(),
        Some(raw) => match parse_kinds(raw) {
            Some(kinds) => kinds,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ScanResponse::failure(WRONG_FORMAT)),
                )
            }
        },
    };

    match state.orchestrator.objects().get_map_objects(&kinds).await {
        Ok(objects) => (StatusCode::OK, Json(ScanResponse::success(objects))),
        Err(e) => {
            warn!(error = %e, "Failed to read cached map objects");
            (
                StatusCode::OK,
                Json(ScanResponse::failure(CACHE_UNAVAILABLE)),
            )
        }
    }
}

fn parse_kinds(raw: &str) -> Option<Vec<ObjectKind>> {
    raw.split(',')
        .map(|code| {
            code.trim()
                .parse::<u8>()
                .ok()
                .and_then(|c| ObjectKind::try_from(c).ok())
        })
        .collect()
}
