use crate::config::ToolInvocation;
use crate::detector::{caller_ip, preflight_validate, IdentityDetector};
use crate::measurement::{run_measurement, MeasurementJob};
use crate::registry::InFlightRegistry;
use crate::supervisor::ProcessSupervisor;
use crate::transport::stream_channel;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use speedwatch_core::stream_protocol::DEFAULT_MAX_FRAME_BYTES;
use speedwatch_core::{
    IdentityCatalog, IdentityResolution, MeasurementError, MeasurementRequest, OfficeRecord,
    WindowSchedule,
};
use speedwatch_storage::{OfficeDirectory, ResultSink};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub offices: Arc<dyn OfficeDirectory>,
    pub sink: Arc<dyn ResultSink>,
    pub catalog: Arc<IdentityCatalog>,
    pub schedule: Arc<WindowSchedule>,
    pub detector: Arc<dyn IdentityDetector>,
    pub supervisor: ProcessSupervisor,
    pub invocation: ToolInvocation,
    pub registry: InFlightRegistry,
    pub api_token: Option<String>,
    pub clock: Clock,
}

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/speedtest/stream", get(stream_handler))
        .route("/api/speedtest/active", get(active_handler))
        .route("/api/isp/validate", post(validate_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    pub office_id: String,
    #[serde(default)]
    pub isp: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub isp_validated: Option<String>,
    #[serde(default)]
    pub tz: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateBody {
    pub office_id: String,
    pub claimed_isp: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    #[serde(flatten)]
    pub resolution: IdentityResolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_isp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(json!({ "error": message.into(), "code": code })),
    )
        .into_response()
}

fn measurement_error_response(status: StatusCode, err: &MeasurementError) -> Response {
    error_response(status, err.to_string(), err.code())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.api_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing or invalid bearer token",
            "unauthorized",
        ))
    }
}

fn load_office(state: &AppState, office_id: &str) -> Result<OfficeRecord, Response> {
    match state.offices.office(office_id.trim()) {
        Ok(Some(office)) => Ok(office),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            format!("unknown office {office_id}"),
            "office_not_found",
        )),
        Err(err) => {
            error!(event = "office_lookup_failed", office_id = %office_id, error = %err);
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "office lookup failed",
                "storage_error",
            ))
        }
    }
}

fn flag_true(value: Option<&str>) -> bool {
    value.is_some_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Everything checked before a process may be spawned.
fn admit_request(
    state: &AppState,
    headers: &HeaderMap,
    params: &StreamParams,
) -> Result<(MeasurementRequest, OfficeRecord), Response> {
    authorize(state, headers)?;
    let office = load_office(state, &params.office_id)?;

    let mut request = MeasurementRequest::new(office.id.clone());
    if let Some(tz) = params.tz.as_deref() {
        request = request.with_time_zone(tz);
    }
    if let Some(isp) = params.isp.as_deref() {
        request = request.with_claimed_isp(isp, flag_true(params.isp_validated.as_deref()));
    }
    if let Some(section) = params.section.as_deref() {
        request = request.with_section(section);
    }

    let now = (state.clock)();
    let window = state
        .schedule
        .gate(&request.time_zone, now)
        .map_err(|err| {
            info!(
                event = "outside_window",
                office_id = %office.id,
                tz = %request.time_zone
            );
            measurement_error_response(StatusCode::BAD_REQUEST, &err)
        })?;

    if let Some(section) = request.section.as_deref() {
        if !office.has_section(section) {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("section {section} is not configured for office {}", office.id),
                "unknown_section",
            ));
        }
    }

    info!(
        event = "measurement_admitted",
        request_id = %request.request_id,
        office_id = %office.id,
        window = %window.label
    );
    Ok((request, office))
}

async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> Response {
    let (request, office) = match admit_request(&state, &headers, &params) {
        Ok(admitted) => admitted,
        Err(response) => return response,
    };

    let (transport, receiver) = stream_channel(DEFAULT_MAX_FRAME_BYTES);
    let guard = state.registry.enter(&request);
    let job = MeasurementJob {
        request,
        office,
        invocation: state.invocation.clone(),
        catalog: state.catalog.clone(),
        sink: state.sink.clone(),
    };
    let supervisor = state.supervisor;
    tokio::spawn(async move {
        let _guard = guard;
        run_measurement(job, supervisor, transport).await;
    });

    receiver.into_response()
}

async fn active_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    Json(json!({ "active": state.registry.snapshot() })).into_response()
}

async fn validate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<ValidateBody>,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let office = match load_office(&state, &body.office_id) {
        Ok(office) => office,
        Err(response) => return response,
    };

    let caller = caller_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    let resolution = match preflight_validate(
        state.detector.as_ref(),
        &state.catalog,
        &body.claimed_isp,
        caller,
    )
    .await
    {
        Ok(resolution) => resolution,
        Err(err) => {
            warn!(event = "detection_failed", office_id = %office.id, caller = ?caller);
            return measurement_error_response(StatusCode::BAD_GATEWAY, &err);
        }
    };

    let mut response = ValidateResponse {
        alternative_isp: None,
        error: None,
        code: None,
        resolution,
    };
    if !response.resolution.proceed {
        let err = MeasurementError::IdentityMismatch {
            claimed: response.resolution.canonical_claimed.clone(),
            detected: response.resolution.canonical_detected.clone(),
        };
        response.alternative_isp = state
            .catalog
            .alternative_for(
                &response.resolution.detected,
                &response.resolution.claimed,
                &office.isp_names,
            )
            .map(str::to_string);
        response.error = Some(err.to_string());
        response.code = Some(err.code().to_string());
        info!(
            event = "identity_mismatch",
            office_id = %office.id,
            claimed = %response.resolution.canonical_claimed,
            detected = %response.resolution.canonical_detected
        );
    }
    Json(response).into_response()
}
