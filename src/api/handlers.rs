use axum::{extract::State, http::StatusCode, Json};

use crate::api::requests::{IdempotentOperationRequest, OperationResultRequest, ValidationError};
use crate::api::responses::{
    ApiResponse, ErrorResponse, HealthResponse, OperationResponse, ValidationErrorDetail,
};
use crate::error::AppError;
use crate::idempotency::{Admission, MetricsSnapshot};
use crate::observability::{AggregatedHealth, HealthChecker, HealthStatus};

use super::routes::AppState;

type ApiError = (StatusCode, Json<ApiResponse<()>>);

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let (status, uptime_seconds) = match &state.health_checker {
        Some(checker) => (checker.check_all().await.status, checker.uptime_seconds()),
        None => (HealthStatus::Healthy, 0),
    };

    let response = HealthResponse {
        status: match status {
            HealthStatus::Healthy => "healthy".to_string(),
            HealthStatus::Degraded => "degraded".to_string(),
            HealthStatus::Unhealthy => "unhealthy".to_string(),
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        uptime_seconds,
    };

    Json(ApiResponse::success(response))
}

/// Per-dependency health.
pub async fn detailed_health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<AggregatedHealth>>) {
    let health = match &state.health_checker {
        Some(checker) => checker.check_all().await,
        None => HealthChecker::new(None, None).check_all().await,
    };

    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(ApiResponse::success(health)))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let ready = match &state.health_checker {
        Some(checker) => checker.is_ready().await,
        None => true,
    };

    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> (StatusCode, String) {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}

/// In-process idempotency counters.
pub async fn idempotency_stats(State(state): State<AppState>) -> Json<ApiResponse<MetricsSnapshot>> {
    Json(ApiResponse::success(state.orchestrator.metrics().snapshot()))
}

// ============================================================================
// Idempotent Operation Handlers
// ============================================================================

/// Returns the stored result for a key, or locks it for the caller.
pub async fn begin_operation(
    State(state): State<AppState>,
    Json(request): Json<IdempotentOperationRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OperationResponse>>), ApiError> {
    request.validate().map_err(validation_failed)?;

    match state.orchestrator.begin(&request.key()).await {
        Ok(Admission::Cached(payload)) => Ok((
            StatusCode::OK,
            Json(ApiResponse::success(OperationResponse::cached(payload))),
        )),
        Ok(Admission::Acquired(grant)) => Ok((
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(OperationResponse::locked(&grant))),
        )),
        Err(e) => Err(error_response(e)),
    }
}

/// Records the outcome of an operation executed under a lock.
pub async fn save_operation_result(
    State(state): State<AppState>,
    Json(request): Json<OperationResultRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OperationResponse>>), ApiError> {
    request.validate().map_err(validation_failed)?;

    match state
        .orchestrator
        .complete_by_lock_id(request.lock_id, &request.key(), request.outcome())
        .await
    {
        Ok(settled) => Ok((
            StatusCode::OK,
            Json(ApiResponse::success(OperationResponse::from(settled))),
        )),
        Err(e) => Err(error_response(e)),
    }
}

fn validation_failed(errors: Vec<ValidationError>) -> ApiError {
    let details: Vec<ValidationErrorDetail> = errors
        .into_iter()
        .map(|e| ValidationErrorDetail {
            field: e.field,
            message: e.message,
        })
        .collect();

    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(
            ErrorResponse::new("VALIDATION_ERROR", "Request validation failed").with_details(details),
        )),
    )
}

/// Maps a domain error onto its HTTP status and error body.
pub fn error_response(error: AppError) -> ApiError {
    let status = match &error {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) | AppError::ConfigurationMissing { .. } => StatusCode::NOT_FOUND,
        AppError::OperationInProgress { .. } => StatusCode::CONFLICT,
        AppError::ExpiredWithoutResult { .. } => StatusCode::GONE,
        AppError::Database(_) | AppError::Redis(_) | AppError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AppError::OperationFailed { .. }
        | AppError::Serialization(_)
        | AppError::Config(_)
        | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = match &error {
        AppError::Database(_) | AppError::Redis(_) | AppError::StoreUnavailable(_) => {
            tracing::error!("Store unavailable: {}", error);
            "Idempotency store is unavailable, retry later".to_string()
        }
        AppError::Serialization(_) | AppError::Config(_) | AppError::Internal(_) => {
            tracing::error!("Request failed: {}", error);
            "An internal error occurred".to_string()
        }
        _ => error.to_string(),
    };

    (
        status,
        Json(ApiResponse::<()>::error(ErrorResponse::new(error.code(), message))),
    )
}
