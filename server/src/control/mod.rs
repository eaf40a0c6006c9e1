mod auth;

pub use auth::Authenticated;

use std::sync::Arc;
use std::time::Instant;

use actix_web::{HttpResponse, web};
use serde::Deserialize;
use serde_json::{Value, json};

use support::time::now_ms;

use crate::core::error::ServiceError;
use crate::core::{ObjectKey, StateObject, strip_user_prefix};
use crate::pairing::PairingService;
use crate::state::{DeviceStateService, MergeOptions};
use crate::store::StateStore;
use crate::subscription::SubscriptionManager;

/// Thermostat firmware safety range, °C.
const SAFE_TEMPERATURE_MIN: f64 = 9.0;
const SAFE_TEMPERATURE_MAX: f64 = 32.0;

const SCOPE_COMMANDS: &str = "commands";
const SCOPE_READ: &str = "read";

#[derive(Clone)]
pub struct ControlState {
    pub state: Arc<DeviceStateService>,
    pub subs: Arc<SubscriptionManager>,
    pub store: Arc<StateStore>,
    pub pairing: Arc<PairingService>,
    pub started_at: Instant,
}

pub fn new_routes(ctx: ControlState) -> actix_web::Scope {
    web::scope("")
        .app_data(web::Data::new(ctx))
        .route("/command", web::post().to(command))
        .route("/status", web::get().to(status))
        .route("/api/devices", web::get().to(devices))
        .route("/notify-device", web::post().to(notify_device))
        .route("/api/pairing/claim", web::post().to(claim))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    serial: String,
    action: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    field: Option<String>,
}

/// Dashboard command surface. Every write goes through the state service, so
/// parked device long-polls wake exactly as they do for device writes.
async fn command(
    auth: Authenticated,
    ctx: web::Data<ControlState>,
    body: web::Json<CommandRequest>,
) -> Result<HttpResponse, ServiceError> {
    let cmd = body.into_inner();

    if !auth.0.has_scope(SCOPE_COMMANDS) || !auth.0.allows_serial(&cmd.serial) {
        return Err(ServiceError::Unauthorized);
    }

    match cmd.action.as_str() {
        "temp" | "temperature" => temp_command(&auth, &ctx, &cmd).await,
        "away" => away_command(&auth, &ctx, &cmd).await,
        "set" => set_command(&ctx, &cmd).await,
        other => Err(ServiceError::BadRequest(format!("unknown action {other}"))),
    }
}

async fn temp_command(
    auth: &Authenticated,
    ctx: &ControlState,
    cmd: &CommandRequest,
) -> Result<HttpResponse, ServiceError> {
    let target = cmd
        .value
        .as_ref()
        .and_then(Value::as_f64)
        .ok_or_else(|| ServiceError::BadRequest("temp command needs a numeric value".to_string()))?;

    let mut fields = json!({
        "target_temperature": clamp_temperature(target),
        "target_temperature_type": cmd.mode.clone().unwrap_or_else(|| "heat".to_string()),
        "touched_by": auth.0.user_id,
    });
    if let Some(low) = cmd.low {
        fields["target_temperature_low"] = json!(clamp_temperature(low));
    }
    if let Some(high) = cmd.high {
        fields["target_temperature_high"] = json!(clamp_temperature(high));
    }

    let outcome = ctx
        .state
        .merge_update(&cmd.serial, &ObjectKey::shared(&cmd.serial), &fields, MergeOptions::default())
        .await?;

    if outcome.changed {
        ctx.subs.notify(&cmd.serial, &outcome.object);
    }

    Ok(command_response(&outcome.object))
}

async fn away_command(
    auth: &Authenticated,
    ctx: &ControlState,
    cmd: &CommandRequest,
) -> Result<HttpResponse, ServiceError> {
    let away = match cmd.value.as_ref() {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(_) => return Err(ServiceError::BadRequest("away command needs a boolean value".to_string())),
    };
    let now = now_ms();

    let device_fields = json!({
        "auto_away": if away { 1 } else { 0 },
        "away": away,
        "away_timestamp": now,
    });
    let outcome = ctx
        .state
        .merge_update(&cmd.serial, &ObjectKey::device(&cmd.serial), &device_fields, MergeOptions::default())
        .await?;
    if outcome.changed {
        ctx.subs.notify(&cmd.serial, &outcome.object);
    }

    // the dashboard sets the user's own fields directly, not via aggregation
    if let Some(owner) = ctx.store.get_device_owner(&cmd.serial).await? {
        let user_key = ObjectKey::user(strip_user_prefix(&owner.user_id));
        let user_fields = json!({
            "away": away,
            "away_timestamp": now,
            "away_setter": auth.0.user_id,
        });
        let serials = ctx.store.list_user_devices(&owner.user_id).await?;
        for serial in serials {
            let user_outcome = ctx
                .state
                .merge_update(&serial, &user_key, &user_fields, MergeOptions::default())
                .await?;
            if user_outcome.changed {
                ctx.subs.notify(&serial, &user_outcome.object);
            }
        }
    }

    Ok(command_response(&outcome.object))
}

async fn set_command(ctx: &ControlState, cmd: &CommandRequest) -> Result<HttpResponse, ServiceError> {
    let object = cmd
        .object
        .as_ref()
        .ok_or_else(|| ServiceError::BadRequest("set command needs an object".to_string()))?;
    let field = cmd
        .field
        .as_ref()
        .ok_or_else(|| ServiceError::BadRequest("set command needs a field".to_string()))?;
    let value = cmd
        .value
        .as_ref()
        .ok_or_else(|| ServiceError::BadRequest("set command needs a value".to_string()))?;

    let key = ObjectKey::new(object.as_str());
    if ctx.state.get(&cmd.serial, &key).await?.is_none() {
        return Err(ServiceError::NotFound);
    }

    let mut fields = serde_json::Map::new();
    fields.insert(field.clone(), value.clone());

    let outcome = ctx
        .state
        .merge_update(&cmd.serial, &key, &Value::Object(fields), MergeOptions::default())
        .await?;

    if outcome.changed {
        ctx.subs.notify(&cmd.serial, &outcome.object);
    }

    Ok(command_response(&outcome.object))
}

async fn status(auth: Authenticated, ctx: web::Data<ControlState>) -> Result<HttpResponse, ServiceError> {
    if !auth.0.has_scope(SCOPE_READ) {
        return Err(ServiceError::Unauthorized);
    }

    let serials = ctx.store.list_serials().await?;

    Ok(HttpResponse::Ok().json(json!({
        "server_version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": ctx.started_at.elapsed().as_secs(),
        "devices": serials.len(),
        "parked_subscriptions": ctx.subs.parked_total(),
    })))
}

/// Read-only projection of the cache for the dashboard device list.
async fn devices(auth: Authenticated, ctx: web::Data<ControlState>) -> Result<HttpResponse, ServiceError> {
    if !auth.0.has_scope(SCOPE_READ) {
        return Err(ServiceError::Unauthorized);
    }

    let mut out = vec![];
    for serial in ctx.store.list_serials().await? {
        if !auth.0.allows_serial(&serial) {
            continue;
        }

        let device = ctx.state.get(&serial, &ObjectKey::device(&serial)).await?;
        let shared = ctx.state.get(&serial, &ObjectKey::shared(&serial)).await?;
        let owner = ctx.store.get_device_owner(&serial).await?;

        out.push(json!({
            "serial": serial,
            "owner": owner.as_ref().map(|o| o.user_id.clone()),
            "paired_at": owner.as_ref().map(|o| o.created_at.to_rfc3339()),
            "online": ctx.subs.parked_for(&serial) > 0,
            "sessions": ctx.subs.sessions_for(&serial),
            "current_temperature": shared.as_ref().and_then(|o| o.value.get("current_temperature").cloned()),
            "target_temperature": shared.as_ref().and_then(|o| o.value.get("target_temperature").cloned()),
            "away": device.as_ref().and_then(|o| o.value.get("away").cloned()),
            "postal_code": device.as_ref().and_then(|o| o.value.get("postal_code").cloned()),
        }));
    }

    Ok(HttpResponse::Ok().json(json!({"devices": out})))
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    serial: String,
}

/// Forces a fan-out of the device's full state to its parked subscribers.
async fn notify_device(
    auth: Authenticated,
    ctx: web::Data<ControlState>,
    body: web::Json<NotifyRequest>,
) -> Result<HttpResponse, ServiceError> {
    if !auth.0.has_scope(SCOPE_COMMANDS) || !auth.0.allows_serial(&body.serial) {
        return Err(ServiceError::Unauthorized);
    }

    let objects = ctx.state.get_all(&body.serial).await?;
    let (notified, removed) = ctx.subs.notify_all(&body.serial, &objects);

    Ok(HttpResponse::Ok().json(json!({"notified": notified, "removed": removed})))
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    code: String,
}

/// Redeems an entry code for the authenticated dashboard user.
async fn claim(
    auth: Authenticated,
    ctx: web::Data<ControlState>,
    body: web::Json<ClaimRequest>,
) -> Result<HttpResponse, ServiceError> {
    let outcome = ctx.pairing.claim(&body.code, &auth.0.user_id).await?;

    let mut by_serial: std::collections::HashMap<String, Vec<StateObject>> = std::collections::HashMap::new();
    for (serial, object) in outcome.changed {
        by_serial.entry(serial).or_default().push(object);
    }
    for (serial, objects) in by_serial {
        ctx.subs.notify_all(&serial, &objects);
    }

    Ok(HttpResponse::Ok().json(json!({
        "serial": outcome.serial,
        "structure_id": outcome.structure_id,
    })))
}

fn command_response(object: &StateObject) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "object_key": object.key.as_str(),
        "object_revision": object.revision,
        "object_timestamp": object.timestamp,
    }))
}

pub(crate) fn clamp_temperature(value: f64) -> f64 {
    value.clamp(SAFE_TEMPERATURE_MIN, SAFE_TEMPERATURE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::subscription::SubscriptionConfig;
    use actix_web::{App, test};

    async fn test_state() -> ControlState {
        let store = Arc::new(StateStore::Memory(MemoryStore::new()));
        store
            .insert_api_key("test-key", "user_xyz", "dash", &[], &[])
            .await
            .unwrap();
        let (state, writer) = DeviceStateService::new(store.clone());
        tokio::spawn(writer.run());
        let subs = Arc::new(SubscriptionManager::new(SubscriptionConfig {
            max_per_device: 6,
            timeout_ms: 60_000,
        }));
        let pairing = Arc::new(PairingService::new(store.clone(), state.clone(), 3600));

        ControlState {
            state,
            subs,
            store,
            pairing,
            started_at: Instant::now(),
        }
    }

    fn authed(req: test::TestRequest) -> test::TestRequest {
        req.insert_header(("authorization", "Bearer test-key"))
    }

    #[actix_web::test]
    async fn commands_require_a_valid_bearer_key() {
        let app = test::init_service(App::new().service(new_routes(test_state().await))).await;

        let req = test::TestRequest::post()
            .uri("/command")
            .set_json(json!({"serial": "ABC123", "action": "temp", "value": 21}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::post()
            .uri("/command")
            .insert_header(("authorization", "Bearer wrong"))
            .set_json(json!({"serial": "ABC123", "action": "temp", "value": 21}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);
    }

    #[actix_web::test]
    async fn temp_command_clamps_and_stamps_audit() {
        let ctx = test_state().await;
        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;

        let req = authed(test::TestRequest::post().uri("/command"))
            .set_json(json!({"serial": "ABC123", "action": "temp", "mode": "heat", "value": 45.0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let shared = ctx
            .state
            .get("ABC123", &ObjectKey::shared("ABC123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared.value["target_temperature"], json!(32.0));
        assert_eq!(shared.value["target_temperature_type"], json!("heat"));
        assert_eq!(shared.value["touched_by"], json!("user_xyz"));
    }

    #[actix_web::test]
    async fn temp_command_wakes_parked_subscriber() {
        let ctx = test_state().await;
        ctx.state
            .merge_update(
                "ABC123",
                &ObjectKey::shared("ABC123"),
                &json!({"target_temperature": 20.0}),
                MergeOptions::default(),
            )
            .await
            .unwrap();

        let mut body = ctx
            .subs
            .park(
                "ABC123",
                None,
                vec![crate::subscription::Interest {
                    key: ObjectKey::shared("ABC123"),
                    revision: 1,
                    timestamp: 0,
                }],
            )
            .unwrap();

        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;
        let req = authed(test::TestRequest::post().uri("/command"))
            .set_json(json!({"serial": "ABC123", "action": "temp", "mode": "heat", "value": 22.0}))
            .to_request();
        test::call_service(&app, req).await;

        use futures::StreamExt as _;
        let chunk = body.next().await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&chunk).unwrap();
        assert_eq!(doc["objects"][0]["object_revision"], json!(2));
        assert_eq!(doc["objects"][0]["value"]["target_temperature"], json!(22.0));
    }

    #[actix_web::test]
    async fn away_command_updates_device_and_user() {
        let ctx = test_state().await;
        ctx.store.put_device_owner("ABC123", "user_xyz").await.unwrap();

        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;
        let req = authed(test::TestRequest::post().uri("/command"))
            .set_json(json!({"serial": "ABC123", "action": "away", "value": true}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let device = ctx.state.get("ABC123", &ObjectKey::device("ABC123")).await.unwrap().unwrap();
        assert_eq!(device.value["auto_away"], json!(1));
        assert_eq!(device.value["away"], json!(true));

        let user = ctx.state.get("ABC123", &ObjectKey::user("xyz")).await.unwrap().unwrap();
        assert_eq!(user.value["away"], json!(true));
        assert_eq!(user.value["away_setter"], json!("user_xyz"));
    }

    #[actix_web::test]
    async fn set_command_requires_an_existing_object() {
        let ctx = test_state().await;
        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;

        let req = authed(test::TestRequest::post().uri("/command"))
            .set_json(json!({
                "serial": "ABC123", "action": "set",
                "object": "device.ABC123", "field": "fan_mode", "value": "on"
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 404);

        ctx.state
            .merge_update("ABC123", &ObjectKey::device("ABC123"), &json!({"fan_mode": "auto"}), MergeOptions::default())
            .await
            .unwrap();

        let req = authed(test::TestRequest::post().uri("/command"))
            .set_json(json!({
                "serial": "ABC123", "action": "set",
                "object": "device.ABC123", "field": "fan_mode", "value": "on"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let device = ctx.state.get("ABC123", &ObjectKey::device("ABC123")).await.unwrap().unwrap();
        assert_eq!(device.value["fan_mode"], json!("on"));
    }

    #[actix_web::test]
    async fn serial_allow_list_is_enforced() {
        let ctx = test_state().await;
        ctx.store
            .insert_api_key("scoped-key", "user_abc", "limited", &["OTHER9".to_string()], &[])
            .await
            .unwrap();

        let app = test::init_service(App::new().service(new_routes(ctx))).await;
        let req = test::TestRequest::post()
            .uri("/command")
            .insert_header(("authorization", "Bearer scoped-key"))
            .set_json(json!({"serial": "ABC123", "action": "temp", "value": 21.0}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);
    }

    #[actix_web::test]
    async fn status_reports_cache_projections() {
        let ctx = test_state().await;
        let app = test::init_service(App::new().service(new_routes(ctx))).await;

        let req = authed(test::TestRequest::get().uri("/status")).to_request();
        let doc: Value = test::read_body_json(test::call_service(&app, req).await).await;

        assert_eq!(doc["devices"], json!(0));
        assert_eq!(doc["parked_subscriptions"], json!(0));
        assert!(doc.get("server_version").is_some());
    }

    #[actix_web::test]
    async fn claim_endpoint_runs_the_pairing_flow() {
        let ctx = test_state().await;
        let code = ctx.pairing.generate("ABC123").await.unwrap().code;

        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;
        let req = authed(test::TestRequest::post().uri("/api/pairing/claim"))
            .set_json(json!({"code": code}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let doc: Value = test::read_body_json(resp).await;
        assert_eq!(doc["serial"], json!("ABC123"));
        assert_eq!(doc["structure_id"], json!("xyz"));

        let owner = ctx.store.get_device_owner("ABC123").await.unwrap().unwrap();
        assert_eq!(owner.user_id, "user_xyz");
    }
}
