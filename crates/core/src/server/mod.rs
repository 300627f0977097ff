use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::InferenceBackend;
use crate::config::AppConfig;
use crate::model_pool::ModelPool;
use crate::model_registry::ModelEntry;
use crate::pipeline::{self, Rejection, DEFAULT_SCALE};
use crate::tier::QualityTier;

pub const PROCESSING_TIME_HEADER: &str = "x-processing-time-ms";
const ONLINE_STATUS: &str = "PixelScaleAI AI Online";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    backend: InferenceBackend,
    pool: Arc<ModelPool>,
    inference_permits: Semaphore,
}

impl AppState {
    pub fn new(config: AppConfig, pool: Arc<ModelPool>) -> Self {
        let permits = config.inference.max_concurrent_jobs.max(1);
        Self {
            inner: Arc::new(AppStateInner {
                backend: config.inference.backend(),
                config,
                pool,
                inference_permits: Semaphore::new(permits),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.inner.pool
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub device: String,
    pub model_loaded: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ModelListing {
    #[serde(flatten)]
    pub entry: ModelEntry,
    pub downloaded: bool,
    pub loaded: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.config().server.max_upload_bytes;
    Router::new()
        .route("/", get(root_status))
        .route("/upscale", post(upscale))
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let default_model = &state.config().inference.default_model;
    Json(StatusResponse {
        status: ONLINE_STATUS.to_string(),
        device: state.inner.backend.to_string(),
        model_loaded: state.pool().is_loaded(default_model),
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelListing>> {
    let pool = state.pool();
    let registry = pool.registry();
    let models = registry
        .list()
        .iter()
        .map(|entry| ModelListing {
            downloaded: registry.is_downloaded(&entry.name),
            loaded: pool.is_loaded(&entry.name),
            entry: entry.clone(),
        })
        .collect();
    Json(models)
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

#[derive(Default)]
struct UpscaleForm {
    file: Option<Vec<u8>>,
    scale: Option<String>,
    quality_tier: Option<String>,
    model: Option<String>,
}

impl UpscaleForm {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(AppError::from_multipart)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let bytes = field.bytes().await.map_err(AppError::from_multipart)?;
                    form.file = Some(bytes.to_vec());
                }
                "scale" => form.scale = Some(field.text().await.map_err(AppError::from_multipart)?),
                "quality_tier" => {
                    form.quality_tier = Some(field.text().await.map_err(AppError::from_multipart)?)
                }
                "model" => form.model = Some(field.text().await.map_err(AppError::from_multipart)?),
                other => warn!(field = %other, "Ignoring unknown form field"),
            }
        }
        Ok(form)
    }

    fn scale(&self) -> Result<u32, AppError> {
        match self.scale.as_deref().map(str::trim) {
            None | Some("") => Ok(DEFAULT_SCALE),
            Some(raw) => raw.parse().map_err(|_| {
                AppError::Unprocessable(format!("scale must be an integer, got '{raw}'"))
            }),
        }
    }
}

async fn upscale(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let request_id = Uuid::new_v4();

    let multipart = multipart.map_err(|rejection| AppError::Unprocessable(rejection.body_text()))?;
    let mut form = UpscaleForm::read(multipart).await?;
    let bytes = form
        .file
        .take()
        .ok_or_else(|| AppError::Unprocessable("file is required".to_string()))?;
    let scale = form.scale()?;
    let tier = QualityTier::from_str_lossy(form.quality_tier.as_deref().unwrap_or_default());

    let config = state.config();
    let plan = pipeline::plan(
        state.pool().registry(),
        &config.inference.default_model,
        scale,
        tier,
        form.model.as_deref(),
    )?;

    info!(
        %request_id,
        model = %plan.model,
        scale = plan.scale,
        %tier,
        upload_bytes = bytes.len(),
        "Upscale request accepted"
    );

    let limits = config.tiers.clone();
    let image = tokio::task::spawn_blocking(move || pipeline::decode_for_tier(&bytes, tier, &limits))
        .await
        .context("decode task panicked")??;

    let _permit = state
        .inner
        .inference_permits
        .acquire()
        .await
        .map_err(|_| AppError::Internal("inference queue is closed".to_string()))?;

    let enhancer = state.pool().get(&plan.model).await?;
    let (in_w, in_h) = image.dimensions();
    let png = tokio::task::spawn_blocking(move || {
        pipeline::enhance_to_png(&enhancer, &image, plan.scale)
    })
    .await
    .context("upscale task panicked")??;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        %request_id,
        input = %format!("{in_w}x{in_h}"),
        output = %format!("{}x{}", in_w * scale, in_h * scale),
        png_bytes = png.len(),
        elapsed_ms,
        "Upscale complete"
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
            (
                HeaderName::from_static(PROCESSING_TIME_HEADER),
                HeaderValue::from(elapsed_ms),
            ),
        ],
        png,
    )
        .into_response())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unprocessable(String),
    Forbidden(String),
    NotFound(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl AppError {
    fn from_multipart(err: MultipartError) -> Self {
        let message = err.body_text();
        match err.status() {
            StatusCode::PAYLOAD_TOO_LARGE => AppError::PayloadTooLarge(message),
            _ => AppError::BadRequest(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { detail: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<Rejection> for AppError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Invalid(msg) => AppError::Unprocessable(msg),
            Rejection::Forbidden(msg) => AppError::Forbidden(msg),
        }
    }
}
