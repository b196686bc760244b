use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

use crate::{
    engine::{self, Validation},
    registry::{self, Registration},
    reset,
    store::{License, Settings},
    AppState,
};

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Deserialize a field that distinguishes "absent" from "explicitly null":
/// pair with `#[serde(default)]` so absent stays `None` while null becomes
/// `Some(None)`.
fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── License validation ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    #[serde(default)]
    pub license_key: String,
    #[serde(default)]
    pub machine_id: String,
}

pub async fn validate_license(
    State(state): State<AppState>,
    Json(body): Json<ValidateRequest>,
) -> Response {
    if body.license_key.is_empty() || body.machine_id.is_empty() {
        return incomplete_request();
    }

    match engine::validate(state.store.as_ref(), &body.license_key, &body.machine_id) {
        Ok(Validation::Valid(license)) => {
            Json(json!({"valid": true, "license": license})).into_response()
        }
        // Business rejections are expected protocol outcomes, not transport
        // failures — they go out as 200 with a reason code.
        Ok(Validation::Invalid(reason)) => {
            Json(json!({"valid": false, "error": reason.as_str()})).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Machine registration / heartbeat ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    /// Absent, explicit null and a value are three distinct cases.
    #[serde(default, deserialize_with = "double_option")]
    pub license_key: Option<Option<String>>,
}

pub async fn register_machine(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Response {
    if body.machine_id.is_empty()
        || body.hostname.is_empty()
        || body.platform.is_empty()
        || body.version.is_empty()
    {
        return incomplete_request();
    }

    let registration = Registration {
        machine_id: body.machine_id,
        hostname: body.hostname,
        platform: body.platform,
        version: body.version,
        license_key: body.license_key,
    };

    match registry::register_or_heartbeat(state.store.as_ref(), registration) {
        Ok(machine) => Json(json!({"success": true, "machine": machine})).into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Trial reset ──────────────────────────────────────────────────────────────

pub async fn reset_trial(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Response {
    match reset::reset_trial(state.store.as_ref(), &machine_id) {
        Ok(Some(_)) => Json(json!({"success": true})).into_response(),
        Ok(None) => not_found("machine not found"),
        Err(e) => internal_error(e),
    }
}

// ── Licenses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLicenseRequest {
    /// Unix timestamp (seconds).
    pub expiration_date: Option<i64>,
    pub machine_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateLicenseResponse {
    pub success: bool,
    pub license: License,
}

pub async fn create_license(
    State(state): State<AppState>,
    Json(body): Json<CreateLicenseRequest>,
) -> Response {
    let Some(expiration_date) = body.expiration_date else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "expiration date required"})),
        )
            .into_response();
    };

    let license = License {
        id: uuid::Uuid::new_v4().to_string(),
        key: state.keygen.generate(),
        expiration_date,
        // Empty string means unbound, same as omitting the field.
        machine_id: body.machine_id.filter(|m| !m.is_empty()),
        is_active: true,
        usage_count: 0,
        last_used: None,
        created_at: now(),
    };

    match state.store.insert_license(&license) {
        Ok(()) => {
            info!(
                id = %license.id,
                pre_bound = license.machine_id.is_some(),
                "license created"
            );
            (
                StatusCode::CREATED,
                Json(CreateLicenseResponse {
                    success: true,
                    license,
                }),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

pub async fn list_licenses(State(state): State<AppState>) -> Response {
    match state.store.list_licenses() {
        Ok(licenses) => Json(json!({"success": true, "licenses": licenses})).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn delete_license(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.delete_license(&id) {
        Ok(true) => {
            info!(%id, "license deleted");
            Json(json!({"success": true})).into_response()
        }
        Ok(false) => not_found("license not found"),
        Err(e) => internal_error(e),
    }
}

pub async fn license_usage(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.license_by_id(&id) {
        Ok(None) => not_found("license not found"),
        Ok(Some(_)) => match state.store.usage_for_license(&id) {
            Ok(usage) => Json(json!({"success": true, "usage": usage})).into_response(),
            Err(e) => internal_error(e),
        },
        Err(e) => internal_error(e),
    }
}

// ── Machines ─────────────────────────────────────────────────────────────────

pub async fn list_machines(State(state): State<AppState>) -> Response {
    match state.store.list_machines() {
        Ok(machines) => Json(json!({"success": true, "machines": machines})).into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    pub trial_duration: Option<u32>,
    pub max_machines: Option<u32>,
}

pub async fn get_settings(State(state): State<AppState>) -> Response {
    match state.store.settings() {
        Ok(settings) => Json(json!({"success": true, "settings": settings})).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn update_settings(
    State(state): State<AppState>,
    Json(body): Json<SettingsRequest>,
) -> Response {
    let (Some(trial_duration), Some(max_machines)) = (body.trial_duration, body.max_machines)
    else {
        return incomplete_request();
    };

    match state.store.update_settings(&Settings {
        trial_duration,
        max_machines,
    }) {
        Ok(settings) => Json(json!({"success": true, "settings": settings})).into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn incomplete_request() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": "incomplete_request"})),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": message})),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": "internal server error"})),
    )
        .into_response()
}
