//! REST API Server for the Deal Underwriting Engine
//!
//! Exposes submission intake, deal review, vendor labeling, and the
//! correction/learning flow over HTTP.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::engine::UnderwritingEngine;
use crate::models::{Frequency, Submission};

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmissionRequest {
    pub sender: String,
    /// Hex-encoded document bytes.
    pub document_hex: String,
}

#[derive(Debug, Deserialize)]
pub struct LabelVendorRequest {
    pub name: String,
    pub category: String,
    pub is_mca_lender: bool,
    pub default_frequency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CorrectionRequest {
    pub deal_id: Uuid,
    pub field: String,
    pub original_value: String,
    pub corrected_value: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<UnderwritingEngine>,
}

fn parse_frequency(value: Option<&str>) -> Option<Frequency> {
    match value.map(|v| v.to_lowercase()) {
        Some(v) if v == "daily" => Some(Frequency::Daily),
        Some(v) if v == "weekly" => Some(Frequency::Weekly),
        Some(v) if v == "monthly" => Some(Frequency::Monthly),
        Some(v) if v == "irregular" => Some(Frequency::Irregular),
        _ => None,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Submission Intake
/// =============================

async fn submit_deal(
    State(state): State<ApiState>,
    Json(req): Json<SubmissionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!("Received submission from {}", req.sender);

    let document = match hex::decode(&req.document_hex) {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("document_hex invalid: {}", e))),
            )
        }
    };
    if document.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("empty document".into())),
        );
    }

    let submission = Submission {
        sender: req.sender,
        document,
        content_hash: String::new(),
    };

    match state.engine.process(submission).await {
        Ok(receipt) => (StatusCode::OK, Json(ApiResponse::success(receipt))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Submission failed: {}", e))),
        ),
    }
}

/// =============================
/// Deal Review
/// =============================

async fn get_deal(
    State(state): State<ApiState>,
    Path(deal_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.engine.deals().get(deal_id).await {
        Ok(Some(deal)) => (StatusCode::OK, Json(ApiResponse::success(deal))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("deal {} not found", deal_id))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Deal lookup failed: {}", e))),
        ),
    }
}

async fn list_deals(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.engine.deals().list().await {
        Ok(deals) => (StatusCode::OK, Json(ApiResponse::success(deals))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Deal listing failed: {}", e))),
        ),
    }
}

async fn get_audit_trail(
    State(state): State<ApiState>,
    Path(deal_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.engine.audit().events_for(deal_id).await {
        Ok(events) => (StatusCode::OK, Json(ApiResponse::success(events))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(format!("Audit lookup failed: {}", e))),
        ),
    }
}

/// =============================
/// Vendor Labeling
/// =============================

async fn label_vendor(
    State(state): State<ApiState>,
    Json(req): Json<LabelVendorRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let frequency = parse_frequency(req.default_frequency.as_deref());

    match state
        .engine
        .vendors()
        .label(&req.name, &req.category, req.is_mca_lender, frequency)
        .await
    {
        Ok(vendor) => (StatusCode::OK, Json(ApiResponse::success(vendor))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Vendor labeling failed: {}", e))),
        ),
    }
}

/// =============================
/// Correction / Learning
/// =============================

async fn record_correction(
    State(state): State<ApiState>,
    Json(req): Json<CorrectionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(
        "Correction on deal {} field {}: '{}' -> '{}'",
        req.deal_id, req.field, req.original_value, req.corrected_value
    );

    match state
        .engine
        .record_correction(
            req.deal_id,
            &req.field,
            &req.original_value,
            &req.corrected_value,
        )
        .await
    {
        Ok(rule) => (StatusCode::OK, Json(ApiResponse::success(rule))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Correction failed: {}", e))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<UnderwritingEngine>) -> Router {
    let state = ApiState { engine };

    Router::new()
        .route("/health", get(health))
        .route("/api/deals", post(submit_deal).get(list_deals))
        .route("/api/deals/:deal_id", get(get_deal))
        .route("/api/deals/:deal_id/audit", get(get_audit_trail))
        .route("/api/vendors/label", post(label_vendor))
        .route("/api/corrections", post(record_correction))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<UnderwritingEngine>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_parsing_is_case_insensitive() {
        assert_eq!(parse_frequency(Some("Daily")), Some(Frequency::Daily));
        assert_eq!(parse_frequency(Some("WEEKLY")), Some(Frequency::Weekly));
        assert_eq!(parse_frequency(Some("something")), None);
        assert_eq!(parse_frequency(None), None);
    }

    #[test]
    fn envelope_carries_data_or_error() {
        let ok = ApiResponse::success(serde_json::json!({"x": 1}));
        assert!(ok.success);
        assert!(ok.data.is_some());
        assert!(ok.error.is_none());

        let err = ApiResponse::error("boom".into());
        assert!(!err.success);
        assert!(err.data.is_none());
        assert_eq!(err.error.as_deref(), Some("boom"));
    }
}
