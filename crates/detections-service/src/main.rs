use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use detections_core::{
    DetectionError, DetectionRecord, DetectionStore, MemoryDetectionStore, NewDetection,
};
use detections_store_sqlite::SqliteDetectionStore;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

type SharedStore = Arc<dyn DetectionStore>;

#[derive(Clone)]
struct ServiceState {
    store: SharedStore,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    unsupported_content_type_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    storage_error_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    unsupported_content_type_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    storage_error_total: u64,
    internal_error_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Sqlite,
}

#[derive(Debug, Parser)]
#[command(name = "detections-service")]
#[command(about = "HTTP service for recording detection events")]
struct Args {
    #[arg(long, env = "DETECTIONS_BACKEND", value_enum, default_value = "memory")]
    backend: Backend,
    #[arg(long, env = "DETECTIONS_DB", default_value = "./detections.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "DETECTIONS_BIND", default_value = "0.0.0.0:5000")]
    bind: SocketAddr,
    #[arg(long, env = "DETECTIONS_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DetectionError> for ServiceFailure {
    fn from(err: DetectionError) -> Self {
        let status = match &err {
            DetectionError::UnsupportedContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DetectionError::NotFound(_) => StatusCode::NOT_FOUND,
            DetectionError::MissingFields(_)
            | DetectionError::InvalidConfidenceType
            | DetectionError::ConfidenceOutOfRange
            | DetectionError::InvalidStatus(_)
            | DetectionError::InvalidDateFormat
            | DetectionError::InvalidJson => StatusCode::BAD_REQUEST,
        };
        ServiceFailure { status, code: err.code(), message: err.to_string() }
    }
}

impl ServiceState {
    fn new(store: SharedStore, operation_timeout: Duration) -> Self {
        Self { store, operation_timeout, telemetry: Arc::new(ServiceTelemetry::default()) }
    }

    fn failure(status: StatusCode, code: &'static str, message: impl Into<String>) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into() }
    }

    /// Counts a request rejected before it reached the store.
    fn reject(&self, err: DetectionError) -> ServiceFailure {
        self.reject_with(ServiceFailure::from(err))
    }

    fn reject_with(&self, failure: ServiceFailure) -> ServiceFailure {
        tracing::debug!(code = failure.code, message = %failure.message, "rejected request");
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure(failure.code, false);
        failure
    }

    fn json_rejection(&self, rejection: &JsonRejection) -> ServiceFailure {
        match rejection {
            JsonRejection::MissingJsonContentType(_) => {
                self.reject(DetectionError::UnsupportedContentType)
            }
            JsonRejection::JsonSyntaxError(_) => self.reject(DetectionError::InvalidJson),
            _ => self.reject_with(Self::failure(
                rejection.status(),
                "rejected_body",
                rejection.body_text(),
            )),
        }
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(SharedStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_store_op(operation_label, Some(self.operation_timeout), op).await
    }

    /// Writes are never abandoned once started, so the operation timeout does not apply.
    async fn run_write<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(SharedStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_store_op(operation_label, None, op).await
    }

    /// Runs a store call on the blocking pool. Callers record success once
    /// the request outcome is known.
    async fn run_store_op<T, F>(
        &self,
        operation_label: &'static str,
        deadline: Option<Duration>,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(SharedStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let store = Arc::clone(&self.store);
        let handle = tokio::task::spawn_blocking(move || op(store));
        let join_result = match deadline {
            Some(limit) => tokio::time::timeout(limit, handle).await.map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(operation = operation_label, timeout_ms, "store operation timed out");
                Self::failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "timeout",
                    format!("{operation_label} timed out after {timeout_ms} ms"),
                )
            })?,
            None => handle.await,
        };

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            tracing::error!(operation = operation_label, error = %err, "store operation panicked");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        op_result.map_err(|err| {
            self.telemetry.record_failure("storage_error", false);
            tracing::error!(operation = operation_label, error = %format!("{err:#}"), "store operation failed");
            Self::failure(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", err.to_string())
        })
    }
}

impl ServiceTelemetry {
    fn record_success(&self) {
        self.requests_success_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "unsupported_content_type" => &self.unsupported_content_type_total,
            "invalid_json" => &self.invalid_json_total,
            "missing_fields"
            | "invalid_confidence_type"
            | "confidence_out_of_range"
            | "invalid_status"
            | "invalid_date_format" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "storage_error" => &self.storage_error_total,
            "internal_error" => &self.internal_error_total,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            unsupported_content_type_total: self
                .unsupported_content_type_total
                .load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            storage_error_total: self.storage_error_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn build_store(args: &Args) -> Result<SharedStore> {
    match args.backend {
        Backend::Memory => Ok(Arc::new(MemoryDetectionStore::new())),
        Backend::Sqlite => {
            let store = SqliteDetectionStore::open_and_migrate(&args.db)?;
            Ok(Arc::new(store))
        }
    }
}

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(false))
        .init();
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/telemetry", get(telemetry))
        .route("/detections", get(list_detections).post(create_detection))
        .route("/detections/:id", get(get_detection))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let store = build_store(&args)?;
    let state = ServiceState::new(store, Duration::from_millis(args.operation_timeout_ms));
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, backend = ?args.backend, "detections service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "very healthy" })
}

async fn telemetry(State(state): State<ServiceState>) -> Json<ServiceTelemetrySnapshot> {
    Json(state.telemetry.snapshot())
}

async fn list_detections(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<DetectionRecord>>, ServiceFailure> {
    let records = state.run_blocking("list_detections", |store| store.list()).await?;
    state.telemetry.record_success();
    Ok(Json(records))
}

async fn create_detection(
    State(state): State<ServiceState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<DetectionRecord>), ServiceFailure> {
    let Json(body) = payload.map_err(|rejection| state.json_rejection(&rejection))?;
    let detection = NewDetection::from_json(&body).map_err(|err| state.reject(err))?;
    let record = state
        .run_write("create_detection", move |store| store.append(detection))
        .await?;
    state.telemetry.record_success();
    tracing::info!(id = record.id, status = %record.status, "created detection");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_detection(
    State(state): State<ServiceState>,
    Path(raw_id): Path<String>,
) -> Result<Json<DetectionRecord>, ServiceFailure> {
    let Ok(id) = raw_id.parse::<i64>() else {
        return Err(state.reject_with(ServiceState::failure(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("detection with id of {raw_id} not found"),
        )));
    };

    let record = state.run_blocking("get_detection", move |store| store.get(id)).await?;
    let Some(record) = record else {
        state.telemetry.record_failure("not_found", false);
        return Err(DetectionError::NotFound(id).into());
    };
    state.telemetry.record_success();
    Ok(Json(record))
}
