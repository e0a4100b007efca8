//! REST surface. Standard codes: 409 when the target agent cannot take the
//! command, 413 over the body limit (layered in main), 429 under
//! backpressure, 504 on command timeout.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use pankha_protocol::commands::AgentCommand;
use pankha_protocol::curves::CurvePoint;
use pankha_protocol::frames::CommandResponse;

use crate::commands::CommandError;
use crate::profiles::{ConflictPolicy, ProfileBundle, ProfileError};
use crate::registry::FanBinding;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/systems", get(systems))
        .route("/api/systems/:id", get(system_detail))
        .route("/api/systems/:id/history", get(system_history))
        .route("/api/systems/:id/ping", post(ping_agent))
        .route("/api/systems/:id/fans/:fan_id", put(set_fan_speed))
        .route("/api/systems/:id/fans/:fan_id/profile", put(assign_profile))
        .route("/api/systems/:id/config", put(update_config))
        .route("/api/systems/:id/emergency", post(emergency_stop))
        .route("/api/systems/:id/emergency/clear", post(clear_emergency))
        .route("/api/systems/:id/update", post(trigger_update))
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route("/api/profiles/export", get(export_profiles))
        .route("/api/profiles/import", post(import_profiles))
        .route(
            "/api/profiles/:id",
            put(update_profile).delete(delete_profile),
        )
        .route("/api/deploy/stage", post(stage_binary))
        .route("/api/deploy/token", post(issue_token))
        .route("/api/deploy/linux", get(install_script))
        .route("/api/deploy/binary", get(serve_binary))
}

fn command_error(e: CommandError) -> Response {
    let (status, message) = match &e {
        CommandError::AgentOffline(_) => (StatusCode::CONFLICT, e.to_string()),
        CommandError::Backpressure(_) => (StatusCode::TOO_MANY_REQUESTS, e.to_string()),
        CommandError::Timeout => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        CommandError::SessionDropped => (StatusCode::CONFLICT, e.to_string()),
    };
    (status, Json(json!({"error": message}))).into_response()
}

fn command_result(response: CommandResponse) -> Response {
    if response.success {
        Json(json!({"success": true, "data": response.data})).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": response.error.unwrap_or_else(|| "command rejected".into()),
            })),
        )
            .into_response()
    }
}

fn profile_error(e: ProfileError) -> Response {
    let status = match &e {
        ProfileError::NotFound(_) => StatusCode::NOT_FOUND,
        ProfileError::SystemReadOnly => StatusCode::FORBIDDEN,
        ProfileError::InvalidCurve(_) | ProfileError::BadImport(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"error": e.to_string()}))).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "agents": state.registry.agent_count().await,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn systems(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.registry.snapshot().await)
}

async fn system_detail(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.registry.agent_snapshot(&id).await {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown agent: {}", id)})),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
struct HistoryQuery {
    sensor: Option<String>,
    fan: Option<String>,
}

async fn system_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state
        .history
        .chart_for(&id, query.sensor.as_deref(), query.fan.as_deref())
        .await
    {
        Some(chart) => Json(chart).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no history for agent: {}", id)})),
        )
            .into_response(),
    }
}

/// Fast-path liveness probe through the full command round trip.
async fn ping_agent(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state
        .commands
        .issue(&state.registry, &id, AgentCommand::Ping {})
        .await
    {
        Ok(response) => command_result(response),
        Err(e) => command_error(e),
    }
}

#[derive(Deserialize)]
struct FanSpeedBody {
    speed: u8,
}

async fn set_fan_speed(
    State(state): State<Arc<AppState>>,
    Path((id, fan_id)): Path<(String, String)>,
    Json(body): Json<FanSpeedBody>,
) -> Response {
    if body.speed > 100 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "speed must be 0-100"})),
        )
            .into_response();
    }
    match state
        .commands
        .issue(
            &state.registry,
            &id,
            AgentCommand::SetFanSpeed {
                fan_id,
                speed: body.speed,
            },
        )
        .await
    {
        Ok(response) => command_result(response),
        Err(e) => command_error(e),
    }
}

#[derive(Deserialize)]
struct AssignProfileBody {
    #[serde(rename = "profileId")]
    profile_id: String,
    #[serde(rename = "controlSensor")]
    control_sensor: Option<String>,
}

/// Bind a profile to a fan. The hub owns the assignment; the agent receives
/// the normalized curve with the binding.
async fn assign_profile(
    State(state): State<Arc<AppState>>,
    Path((id, fan_id)): Path<(String, String)>,
    Json(body): Json<AssignProfileBody>,
) -> Response {
    let Some(profile) = state.profiles.get(&body.profile_id).await else {
        return profile_error(ProfileError::NotFound(body.profile_id));
    };
    let control_sensor = body
        .control_sensor
        .unwrap_or_else(|| pankha_protocol::types::CONTROL_SOURCE_HIGHEST.to_string());

    let command = AgentCommand::SetFanProfile {
        fan_id: fan_id.clone(),
        profile_id: profile.id.clone(),
        points: profile.points.clone(),
        control_sensor: control_sensor.clone(),
    };
    match state.commands.issue(&state.registry, &id, command).await {
        Ok(response) if response.success => {
            state
                .registry
                .set_fan_binding(
                    &id,
                    &fan_id,
                    FanBinding {
                        profile_id: profile.id,
                        control_sensor,
                    },
                )
                .await;
            command_result(response)
        }
        Ok(response) => command_result(response),
        Err(e) => command_error(e),
    }
}

#[derive(Deserialize, Default)]
struct ConfigBody {
    update_interval: Option<f64>,
    fan_step_percent: Option<u8>,
    hysteresis_temp: Option<f64>,
    emergency_temp: Option<f64>,
    failsafe_speed: Option<u8>,
    enable_fan_control: Option<bool>,
    filter_duplicate_sensors: Option<bool>,
    duplicate_sensor_tolerance: Option<f64>,
    log_level: Option<String>,
    name: Option<String>,
}

/// Apply any subset of agent settings; each present field becomes one
/// command, applied in order. The first failure stops the batch.
async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ConfigBody>,
) -> Response {
    let mut commands: Vec<AgentCommand> = Vec::new();
    if let Some(interval) = body.update_interval {
        commands.push(AgentCommand::SetUpdateInterval { interval });
    }
    if let Some(step) = body.fan_step_percent {
        commands.push(AgentCommand::SetFanStep { step });
    }
    if let Some(hysteresis) = body.hysteresis_temp {
        commands.push(AgentCommand::SetHysteresis { hysteresis });
    }
    if let Some(temperature) = body.emergency_temp {
        commands.push(AgentCommand::SetEmergencyTemp { temperature });
    }
    if let Some(speed) = body.failsafe_speed {
        commands.push(AgentCommand::SetFailsafeSpeed { speed });
    }
    if let Some(enabled) = body.enable_fan_control {
        commands.push(AgentCommand::SetEnableFanControl { enabled });
    }
    if let Some(enabled) = body.filter_duplicate_sensors {
        commands.push(AgentCommand::SetSensorDeduplication { enabled });
    }
    if let Some(tolerance) = body.duplicate_sensor_tolerance {
        commands.push(AgentCommand::SetSensorTolerance { tolerance });
    }
    if let Some(level) = body.log_level {
        commands.push(AgentCommand::SetLogLevel { level });
    }
    if let Some(name) = body.name {
        commands.push(AgentCommand::SetAgentName { name });
    }

    if commands.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "no recognized settings in body"})),
        )
            .into_response();
    }

    let mut applied: Vec<Value> = Vec::new();
    for command in commands {
        match state.commands.issue(&state.registry, &id, command).await {
            Ok(response) if response.success => applied.push(response.data),
            Ok(response) => return command_result(response),
            Err(e) => return command_error(e),
        }
    }
    Json(json!({"success": true, "applied": applied})).into_response()
}

async fn emergency_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state
        .commands
        .issue(&state.registry, &id, AgentCommand::EmergencyStop {})
        .await
    {
        Ok(response) => command_result(response),
        Err(e) => command_error(e),
    }
}

async fn clear_emergency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state
        .commands
        .issue(&state.registry, &id, AgentCommand::ClearEmergency {})
        .await
    {
        Ok(response) => command_result(response),
        Err(e) => command_error(e),
    }
}

#[derive(Deserialize)]
struct UpdateBody {
    #[serde(default = "default_channel")]
    channel: String,
}

fn default_channel() -> String {
    "stable".to_string()
}

/// Command an agent to pull the staged binary and swap itself. The agent
/// stays `updating` until it re-registers with the staged version, or the
/// sweep times it out into `error`.
async fn trigger_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Response {
    let Some(staged) = state.deploy.staged_for(&body.channel).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no binary staged for channel {}", body.channel)})),
        )
            .into_response();
    };

    state
        .registry
        .mark_updating(&id, Some(staged.version.clone()))
        .await;

    let command = AgentCommand::SelfUpdate {
        channel: Some(body.channel),
        version: Some(staged.version.clone()),
        hash: staged.hash.clone(),
    };
    match state.commands.issue(&state.registry, &id, command).await {
        Ok(response) if response.success => (
            StatusCode::ACCEPTED,
            Json(json!({"success": true, "version": staged.version, "data": response.data})),
        )
            .into_response(),
        Ok(response) => {
            // The agent refused (e.g. hash mismatch); it is not updating
            state.registry.clear_updating(&id).await;
            command_result(response)
        }
        Err(e) => {
            state.registry.clear_updating(&id).await;
            command_error(e)
        }
    }
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Json<Value> {
    let profiles = state.profiles.list().await;
    Json(crate::profiles::profiles_response(&profiles))
}

#[derive(Deserialize)]
struct CreateProfileBody {
    name: String,
    #[serde(rename = "type", default = "default_profile_type")]
    profile_type: String,
    points: Vec<CurvePoint>,
}

fn default_profile_type() -> String {
    "case".to_string()
}

async fn create_profile(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateProfileBody>,
) -> Response {
    match state
        .profiles
        .create(body.name, body.profile_type, body.points)
        .await
    {
        Ok(profile) => (StatusCode::CREATED, Json(json!({"profile": profile}))).into_response(),
        Err(e) => profile_error(e),
    }
}

#[derive(Deserialize)]
struct UpdateProfileBody {
    name: Option<String>,
    points: Vec<CurvePoint>,
}

async fn update_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateProfileBody>,
) -> Response {
    match state.profiles.update(&id, body.name, body.points).await {
        Ok(profile) => Json(json!({"profile": profile})).into_response(),
        Err(e) => profile_error(e),
    }
}

async fn delete_profile(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.profiles.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => profile_error(e),
    }
}

async fn export_profiles(State(state): State<Arc<AppState>>) -> Json<ProfileBundle> {
    Json(state.profiles.export().await)
}

#[derive(Deserialize)]
struct ImportQuery {
    #[serde(default = "default_conflict")]
    conflict: ConflictPolicy,
}

fn default_conflict() -> ConflictPolicy {
    ConflictPolicy::Skip
}

async fn import_profiles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImportQuery>,
    Json(bundle): Json<ProfileBundle>,
) -> Response {
    match state.profiles.import(bundle, query.conflict).await {
        Ok(outcome) => Json(json!({"result": outcome})).into_response(),
        Err(e) => profile_error(e),
    }
}

#[derive(Deserialize)]
struct StageBody {
    #[serde(default = "default_channel")]
    channel: String,
    version: String,
    #[serde(default = "default_platform")]
    platform: String,
    #[serde(default = "default_arch")]
    arch: String,
}

fn default_platform() -> String {
    "linux".to_string()
}

fn default_arch() -> String {
    "x86_64".to_string()
}

async fn stage_binary(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StageBody>,
) -> Response {
    match state
        .deploy
        .stage(&body.channel, &body.version, &body.platform, &body.arch)
        .await
    {
        Ok(staged) => {
            info!("Staged {} {} ({})", staged.channel, staged.version, staged.hash);
            Json(json!({"staged": staged})).into_response()
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn issue_token(State(state): State<Arc<AppState>>) -> Json<Value> {
    let token = state.deploy.issue_token(&state.ws_url).await;
    Json(json!({
        "token": token.token,
        "expiresAt": token.expires_at,
        "installCommand": format!(
            "curl -fsSL '{}/api/deploy/linux?token={}' | sudo sh",
            state.http_url, token.token
        ),
    }))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn install_script(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> Response {
    match state.deploy.validate_token(&query.token).await {
        Some(token) => {
            let script = state.deploy.install_script(&token, &state.http_url);
            ([(header::CONTENT_TYPE, "text/x-shellscript")], script).into_response()
        }
        None => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "invalid or expired token"})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct BinaryQuery {
    #[serde(default = "default_channel")]
    channel: String,
}

async fn serve_binary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BinaryQuery>,
) -> Response {
    match state.deploy.read_binary(&query.channel).await {
        Ok((staged, bytes)) => (
            [
                (header::CONTENT_TYPE.as_str(), "application/octet-stream".to_string()),
                ("x-pankha-version", staged.version),
                ("x-pankha-hash", staged.hash),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::commands::CommandRouter;
    use crate::deploy::DeployService;
    use crate::license::CommunityLicense;
    use crate::registry::FleetRegistry;
    use crate::retention::{MemorySink, RetentionBuffer};

    fn test_state(dir: &TempDir) -> Arc<AppState> {
        Arc::new(AppState {
            registry: Arc::new(FleetRegistry::new()),
            commands: CommandRouter::new(),
            profiles: Arc::new(crate::profiles::ProfileStore::with_builtins()),
            deploy: Arc::new(DeployService::new(
                dir.path().to_path_buf(),
                "http://releases.invalid".into(),
            )),
            retention: RetentionBuffer::new(MemorySink::new()),
            history: Arc::new(crate::history::HistoryStore::new()),
            license: Arc::new(CommunityLicense),
            http_url: "http://127.0.0.1:3143".into(),
            ws_url: "ws://127.0.0.1:3143/websocket".into(),
        })
    }

    fn app(state: Arc<AppState>) -> axum::Router {
        router().with_state(state)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn put_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_fleet_size() {
        let dir = TempDir::new().unwrap();
        let app = app(test_state(&dir));
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["agents"], 0);
    }

    #[tokio::test]
    async fn fan_write_to_offline_agent_conflicts() {
        let dir = TempDir::new().unwrap();
        let app = app(test_state(&dir));
        let response = app
            .oneshot(put_json(
                "/api/systems/ghost/fans/fan1",
                json!({"speed": 50}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_system_detail_is_404() {
        let dir = TempDir::new().unwrap();
        let app = app(test_state(&dir));
        let response = app.oneshot(get("/api/systems/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn profile_crud_over_rest() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = app(state.clone()).oneshot(get("/api/profiles")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["profiles"].as_array().unwrap().len(), 7);

        let response = app(state.clone())
            .oneshot(post_json(
                "/api/profiles",
                json!({
                    "name": "Quiet Night",
                    "type": "case",
                    "points": [
                        {"temperature": 30.0, "duty": 0},
                        {"temperature": 80.0, "duty": 80}
                    ]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let profile_id = created["profile"]["id"].as_str().unwrap().to_string();

        let response = app(state.clone())
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/profiles/{}", profile_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn invalid_curve_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = app(test_state(&dir));
        let response = app
            .oneshot(post_json(
                "/api/profiles",
                json!({
                    "name": "Broken",
                    "points": [{"temperature": 30.0, "duty": 20}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn deleting_builtin_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let app = app(test_state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/profiles/builtin-silent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn deploy_token_gates_install_script() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = app(state.clone())
            .oneshot(post_json("/api/deploy/token", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let token = body["token"].as_str().unwrap().to_string();

        let response = app(state.clone())
            .oneshot(get(&format!("/api/deploy/linux?token={}", token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(state.clone())
            .oneshot(get("/api/deploy/linux?token=bogus"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn staged_binary_serves_with_hash_headers() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let response = app(state.clone())
            .oneshot(get("/api/deploy/binary?channel=stable"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let staged = state
            .deploy
            .stage_bytes("stable", "2.1.0", "linux", "x86_64", b"new-agent-binary")
            .await
            .unwrap();

        let response = app(state.clone())
            .oneshot(get("/api/deploy/binary?channel=stable"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-pankha-hash").unwrap(),
            staged.hash.as_str()
        );
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"new-agent-binary");
    }

    #[tokio::test]
    async fn update_without_staged_binary_is_404() {
        let dir = TempDir::new().unwrap();
        let app = app(test_state(&dir));
        let response = app
            .oneshot(post_json("/api/systems/a1/update", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_update_requires_known_settings() {
        let dir = TempDir::new().unwrap();
        let app = app(test_state(&dir));
        let response = app
            .oneshot(put_json("/api/systems/a1/config", json!({"bogus": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
