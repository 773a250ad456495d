use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use rumqttc::AsyncClient;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::{Db, ScheduleRule, ThresholdConfig};
use crate::error::{CoreError, CoreResult};
use crate::mqtt::{IrrigationMode, RelayState};
use crate::normalize::CanonicalReading;
use crate::registry::{self, ActiveSelection, DeviceSummary, UsageSummary};
use crate::relay;
use crate::rules::{self, ScheduleInput, ThresholdInput};
use crate::session;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Shared handler context
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppCtx {
    pub shared: SharedState,
    pub db: Db,
    pub mqtt: AsyncClient,
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::NotReady => StatusCode::CONFLICT,
            CoreError::PermissionDenied => StatusCode::FORBIDDEN,
            CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::NetworkError(_) => StatusCode::BAD_GATEWAY,
            CoreError::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::WriteFailed(_) | CoreError::SubscriptionError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(kind = self.kind(), "request failed: {self}");
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.user_message(),
        }));
        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchBody {
    device_id: String,
}

#[derive(Deserialize)]
struct RelayBody {
    value: RelayState,
}

#[derive(Deserialize)]
struct ModeBody {
    mode: IrrigationMode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadingResponse {
    online: bool,
    reading: CanonicalReading,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageResponse {
    #[serde(flatten)]
    usage: UsageSummary,
    can_request_more: bool,
}

#[derive(Serialize)]
struct CommandResponse {
    status: &'static str,
    message: String,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(ctx: AppCtx) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/reading", get(get_reading))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/active", get(get_active).post(switch_active))
        .route("/api/devices/usage", get(get_usage))
        .route("/api/relay", post(post_relay))
        .route("/api/mode", post(post_mode))
        .route("/api/thresholds", get(get_thresholds).put(put_thresholds))
        .route("/api/schedules", get(get_schedules).post(post_schedule))
        .route("/api/schedules/{id}", delete(delete_schedule))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(ctx): State<AppCtx>) -> impl IntoResponse {
    let st = ctx.shared.read().await;
    Json(st.to_status())
}

async fn get_reading(State(ctx): State<AppCtx>) -> CoreResult<Json<ReadingResponse>> {
    let st = ctx.shared.read().await;
    let session = st.session.as_ref().ok_or(CoreError::NotReady)?;
    Ok(Json(ReadingResponse {
        online: session.is_online(),
        reading: session.reading.clone(),
    }))
}

/// Reload the assignment set from the store, reconciling the active
/// selection — a device reassigned away falls back to the newest remaining
/// one without user action.
async fn list_devices(State(ctx): State<AppCtx>) -> CoreResult<Json<Vec<DeviceSummary>>> {
    let user_id = principal_id(&ctx).await?;
    let view = registry::refresh(&ctx.db, &user_id).await?;

    enum SessionChange {
        Keep,
        Close,
        Open(String),
    }

    let change = {
        let mut st = ctx.shared.write().await;
        st.devices = view.devices.clone();
        if view.fell_back {
            if let Some(active) = &view.active {
                st.record_assignment(format!(
                    "active device fell back to {}",
                    active.device_id
                ));
            }
        }
        let current = st.session.as_ref().map(|s| s.device_id.clone());
        let target = view.active.as_ref().map(|a| a.device_id.clone());
        st.active = view.active;

        match (current, target) {
            (Some(c), Some(t)) if c == t => SessionChange::Keep,
            (_, Some(t)) => SessionChange::Open(t),
            (Some(_), None) => SessionChange::Close,
            (None, None) => SessionChange::Keep,
        }
    };

    match change {
        SessionChange::Keep => {}
        SessionChange::Close => {
            ctx.shared.write().await.session = None;
        }
        SessionChange::Open(device_id) => {
            session::activate(&ctx.shared, &ctx.mqtt, &device_id).await?;
        }
    }

    Ok(Json(view.devices))
}

async fn get_active(State(ctx): State<AppCtx>) -> Json<Option<ActiveSelection>> {
    let st = ctx.shared.read().await;
    Json(st.active.clone())
}

/// Persist an explicit switch and rebuild the device session. The target is
/// not re-validated against the assignment set (the caller has the list).
async fn switch_active(
    State(ctx): State<AppCtx>,
    Json(body): Json<SwitchBody>,
) -> CoreResult<Json<ActiveSelection>> {
    let user_id = principal_id(&ctx).await?;

    let selection = registry::switch_active(&ctx.db, &user_id, &body.device_id).await?;
    session::activate(&ctx.shared, &ctx.mqtt, &body.device_id).await?;

    let mut st = ctx.shared.write().await;
    st.active = Some(selection.clone());
    st.record_assignment(format!("switched active device to {}", body.device_id));
    Ok(Json(selection))
}

async fn get_usage(State(ctx): State<AppCtx>) -> Json<UsageResponse> {
    let st = ctx.shared.read().await;
    let count = st.devices.len();
    Json(UsageResponse {
        usage: registry::usage_summary(count),
        can_request_more: registry::can_request_more_devices(count),
    })
}

async fn post_relay(
    State(ctx): State<AppCtx>,
    Json(body): Json<RelayBody>,
) -> CoreResult<Json<CommandResponse>> {
    let command = relay::send_relay_command(&ctx.shared, &ctx.mqtt, body.value).await?;
    Ok(Json(CommandResponse {
        status: "ok",
        message: format!("Pump turned {}", command.value),
    }))
}

async fn post_mode(
    State(ctx): State<AppCtx>,
    Json(body): Json<ModeBody>,
) -> CoreResult<Json<CommandResponse>> {
    relay::set_irrigation_mode(&ctx.shared, &ctx.mqtt, body.mode).await?;
    Ok(Json(CommandResponse {
        status: "ok",
        message: format!("Irrigation mode set to {}", body.mode),
    }))
}

async fn get_thresholds(State(ctx): State<AppCtx>) -> CoreResult<Json<Option<ThresholdConfig>>> {
    let (device_id, _) = active_context(&ctx).await?;
    Ok(Json(rules::get_thresholds(&ctx.db, &device_id).await?))
}

async fn put_thresholds(
    State(ctx): State<AppCtx>,
    Json(body): Json<ThresholdInput>,
) -> CoreResult<Json<ThresholdConfig>> {
    let (device_id, user_id) = active_context(&ctx).await?;
    let saved = rules::set_thresholds(&ctx.db, &ctx.mqtt, &device_id, &user_id, body).await?;
    Ok(Json(saved))
}

async fn get_schedules(State(ctx): State<AppCtx>) -> CoreResult<Json<Vec<ScheduleRule>>> {
    let (device_id, _) = active_context(&ctx).await?;
    Ok(Json(rules::list_schedules(&ctx.db, &device_id).await?))
}

async fn post_schedule(
    State(ctx): State<AppCtx>,
    Json(body): Json<ScheduleInput>,
) -> CoreResult<Json<ScheduleRule>> {
    let (device_id, user_id) = active_context(&ctx).await?;
    let rule = rules::add_schedule(&ctx.db, &ctx.mqtt, &device_id, &user_id, body).await?;
    Ok(Json(rule))
}

async fn delete_schedule(
    State(ctx): State<AppCtx>,
    Path(id): Path<String>,
) -> CoreResult<Json<serde_json::Value>> {
    let (device_id, _) = active_context(&ctx).await?;
    let removed = rules::remove_schedule(&ctx.db, &ctx.mqtt, &device_id, &id).await?;
    Ok(Json(json!({ "removed": removed })))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn principal_id(ctx: &AppCtx) -> CoreResult<String> {
    let st = ctx.shared.read().await;
    Ok(st
        .principal
        .as_ref()
        .ok_or(CoreError::NotReady)?
        .user_id
        .clone())
}

/// Active device id + principal id, or `NotReady`.
async fn active_context(ctx: &AppCtx) -> CoreResult<(String, String)> {
    let st = ctx.shared.read().await;
    let user_id = st
        .principal
        .as_ref()
        .ok_or(CoreError::NotReady)?
        .user_id
        .clone();
    let device_id = st
        .session
        .as_ref()
        .ok_or(CoreError::NotReady)?
        .device_id
        .clone();
    Ok((device_id, user_id))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(ctx: AppCtx) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind web port");

    info!("api listening on http://{addr}");

    axum::serve(listener, router(ctx))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================
