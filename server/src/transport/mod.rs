mod sync;
pub mod wire;

pub use sync::SERVICE_TIMESTAMP_HEADER;

use std::path::Path;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, web};
use serde::Deserialize;
use serde_json::json;

use support::time::now_ms;

use crate::core::error::ServiceError;
use crate::core::resolve_serial;
use crate::pairing::PairingService;
use crate::settings::TransportSettings;
use crate::state::DeviceStateService;
use crate::store::StateStore;
use crate::subscription::SubscriptionManager;
use crate::weather::WeatherService;

#[derive(Clone)]
pub struct TransportState {
    pub state: Arc<DeviceStateService>,
    pub subs: Arc<SubscriptionManager>,
    pub pairing: Arc<PairingService>,
    pub weather: Arc<WeatherService>,
    pub store: Arc<StateStore>,
    pub settings: TransportSettings,
}

pub fn new_routes(ctx: TransportState) -> actix_web::Scope {
    web::scope("/nest")
        .app_data(web::Data::new(ctx))
        .route("/entry", web::get().to(entry))
        .route("/ping", web::get().to(ping))
        .route("/passphrase", web::get().to(passphrase))
        .route("/pro_info", web::get().to(pro_info))
        .route("/weather/v1", web::get().to(weather))
        .route("/transport/device/{serial}", web::get().to(sync::device_objects))
        .route("/transport", web::post().to(sync::subscribe))
        .route("/transport/put", web::post().to(sync::put))
        .route("/upload", web::post().to(upload))
}

/// Service-discovery document the firmware fetches before anything else.
async fn entry(ctx: web::Data<TransportState>) -> HttpResponse {
    let base = ctx.settings.external_url.trim_end_matches('/').to_string();

    HttpResponse::Ok().json(json!({
        "czfe_url": base,
        "transport_url": format!("{base}/transport"),
        "direct_transport_url": format!("{base}/transport"),
        "passphrase_url": format!("{base}/passphrase"),
        "ping_url": format!("{base}/ping"),
        "pro_info_url": format!("{base}/pro_info"),
        "weather_url": format!("{base}/weather/v1?query="),
        "upload_url": format!("{base}/upload"),
        "software_update_url": "",
        "server_version": env!("CARGO_PKG_VERSION"),
        "tier_name": ctx.settings.tier_name,
    }))
}

async fn ping() -> HttpResponse {
    HttpResponse::Ok().finish()
}

async fn pro_info() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "pro_name": "",
        "pro_phone": "",
        "pro_url": "",
    }))
}

/// Entry-code generation for the requesting device.
async fn passphrase(req: HttpRequest, ctx: web::Data<TransportState>) -> Result<HttpResponse, ServiceError> {
    let serial = resolve_serial(&req)?;
    let key = ctx.pairing.generate(&serial).await?;

    Ok(HttpResponse::Ok().json(json!({
        "passphrase": key.code,
        "expires_at": key.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
struct WeatherQuery {
    query: String,
}

async fn weather(
    ctx: web::Data<TransportState>,
    query: web::Query<WeatherQuery>,
) -> Result<HttpResponse, ServiceError> {
    let payload = ctx.weather.lookup(&query.query).await?;
    Ok(HttpResponse::Ok().json(payload))
}

/// Opaque log blob; filename derived from the device identity.
async fn upload(
    req: HttpRequest,
    ctx: web::Data<TransportState>,
    body: web::Bytes,
) -> Result<HttpResponse, ServiceError> {
    let serial = resolve_serial(&req)?;

    let dir = Path::new(&ctx.settings.upload_dir);
    let path = dir.join(format!("{serial}-{}.log", now_ms()));

    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::error!("Upload directory {} not writable: {}", dir.display(), e);
        return Err(ServiceError::StoreUnavailable);
    }
    if let Err(e) = tokio::fs::write(&path, &body).await {
        tracing::error!("Upload write to {} failed: {}", path.display(), e);
        return Err(ServiceError::StoreUnavailable);
    }

    tracing::debug!("Stored upload from {} ({} bytes)", serial, body.len());
    Ok(HttpResponse::Ok().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CLIENT_ID_HEADER;
    use crate::store::MemoryStore;
    use crate::subscription::SubscriptionConfig;
    use crate::weather::{StubWeatherProvider, WeatherProvider};
    use actix_web::{App, test};
    use serde_json::Value;

    fn test_state() -> TransportState {
        let store = Arc::new(StateStore::Memory(MemoryStore::new()));
        let (state, writer) = crate::state::DeviceStateService::new(store.clone());
        tokio::spawn(writer.run());
        let subs = Arc::new(SubscriptionManager::new(SubscriptionConfig {
            max_per_device: 6,
            timeout_ms: 60_000,
        }));
        let pairing = Arc::new(PairingService::new(store.clone(), state.clone(), 3600));
        let weather = Arc::new(WeatherService::new(
            store.clone(),
            state.clone(),
            subs.clone(),
            WeatherProvider::Stub(StubWeatherProvider::new(json!({"temp": 10.0}))),
            60_000,
        ));

        TransportState {
            state,
            subs,
            pairing,
            weather,
            store,
            settings: TransportSettings {
                server: infrastructure::HttpServerConfig {
                    host: "127.0.0.1".into(),
                    port: 0,
                    cert_dir: None,
                    permissive_cors: false,
                },
                external_url: "http://localhost:3000/nest".into(),
                upload_dir: std::env::temp_dir().join("renest-test-uploads").display().to_string(),
                tier_name: "production".into(),
                subscriptions: SubscriptionConfig {
                    max_per_device: 6,
                    timeout_ms: 60_000,
                },
            },
        }
    }

    fn device_headers(req: test::TestRequest) -> test::TestRequest {
        req.insert_header((CLIENT_ID_HEADER, "ABC123.5.6-7"))
    }

    #[actix_web::test]
    async fn entry_document_lists_every_url() {
        let app = test::init_service(App::new().service(new_routes(test_state()))).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/nest/entry").to_request()).await;
        assert!(resp.status().is_success());

        let doc: Value = test::read_body_json(resp).await;
        for field in [
            "czfe_url",
            "transport_url",
            "direct_transport_url",
            "passphrase_url",
            "ping_url",
            "pro_info_url",
            "weather_url",
            "upload_url",
            "software_update_url",
            "server_version",
            "tier_name",
        ] {
            assert!(doc.get(field).is_some(), "entry document missing {field}");
        }
        assert!(doc["weather_url"].as_str().unwrap().ends_with("?query="));
    }

    #[actix_web::test]
    async fn first_contact_list_is_empty_and_seeds_the_dialog() {
        let ctx = test_state();
        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;

        let req = device_headers(test::TestRequest::get().uri("/nest/transport/device/ABC123")).to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let doc: Value = test::read_body_json(resp).await;
        assert_eq!(doc["objects"], json!([]));

        let dialog = ctx
            .state
            .get("ABC123", &crate::core::ObjectKey::device_alert_dialog("ABC123"))
            .await
            .unwrap();
        assert!(dialog.is_some());

        // second list now reports the dialog
        let req = device_headers(test::TestRequest::get().uri("/nest/transport/device/ABC123")).to_request();
        let resp = test::call_service(&app, req).await;
        let doc: Value = test::read_body_json(resp).await;
        assert_eq!(doc["objects"][0]["object_key"], json!("device_alert_dialog.ABC123"));
    }

    #[actix_web::test]
    async fn passphrase_matches_the_code_shape() {
        let app = test::init_service(App::new().service(new_routes(test_state()))).await;

        let req = device_headers(test::TestRequest::get().uri("/nest/passphrase")).to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let doc: Value = test::read_body_json(resp).await;
        let code = doc["passphrase"].as_str().unwrap();
        assert_eq!(code.len(), 7);
        assert!(code[..3].chars().all(|c| c.is_ascii_digit()));
        assert!(code[3..].chars().all(|c| c.is_ascii_uppercase()));
    }

    #[actix_web::test]
    async fn device_endpoints_require_identity() {
        let app = test::init_service(App::new().service(new_routes(test_state()))).await;

        let req = test::TestRequest::get().uri("/nest/passphrase").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);

        let req = test::TestRequest::post()
            .uri("/nest/transport")
            .set_json(json!({"objects": []}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);
    }

    #[actix_web::test]
    async fn zero_probe_gets_the_current_value_immediately() {
        let ctx = test_state();
        ctx.state
            .merge_update(
                "ABC123",
                &crate::core::ObjectKey::shared("ABC123"),
                &json!({"target_temperature": 20.0}),
                crate::state::MergeOptions::default(),
            )
            .await
            .unwrap();

        let app = test::init_service(App::new().service(new_routes(ctx))).await;

        let req = device_headers(test::TestRequest::post().uri("/nest/transport"))
            .set_json(json!({"objects": [{"object_key": "shared.ABC123", "object_revision": 0, "object_timestamp": 0}]}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.headers().contains_key(SERVICE_TIMESTAMP_HEADER));

        let doc: Value = test::read_body_json(resp).await;
        assert_eq!(doc["objects"][0]["object_revision"], json!(1));
        assert_eq!(doc["objects"][0]["value"]["target_temperature"], json!(20.0));
    }

    #[actix_web::test]
    async fn update_bumps_revision_and_wakes_parked_subscriber() {
        let ctx = test_state();
        ctx.state
            .merge_update(
                "ABC123",
                &crate::core::ObjectKey::shared("ABC123"),
                &json!({"target_temperature": 20.0}),
                crate::state::MergeOptions::default(),
            )
            .await
            .unwrap();

        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;

        // park a chunked subscription at the current revision
        let req = device_headers(test::TestRequest::post().uri("/nest/transport"))
            .set_json(json!({
                "chunked": true,
                "objects": [{"object_key": "shared.ABC123", "object_revision": 1, "object_timestamp": 0}]
            }))
            .to_request();
        let parked = test::call_service(&app, req).await;
        assert!(parked.status().is_success());
        assert_eq!(ctx.subs.parked_for("ABC123"), 1);

        // a put on the same serial advances the object and fires the wake
        let req = device_headers(test::TestRequest::post().uri("/nest/transport/put"))
            .set_json(json!({"objects": [{"object_key": "shared.ABC123", "value": {"target_temperature": 22.0}}]}))
            .to_request();
        let put_resp = test::call_service(&app, req).await;
        let put_doc: Value = test::read_body_json(put_resp).await;
        assert_eq!(put_doc["objects"][0]["object_revision"], json!(2));

        let chunk = test::read_body(parked).await;
        let doc: Value = serde_json::from_slice(&chunk).unwrap();
        assert_eq!(doc["objects"][0]["object_key"], json!("shared.ABC123"));
        assert_eq!(doc["objects"][0]["object_revision"], json!(2));
        assert_eq!(ctx.subs.parked_for("ABC123"), 0);
    }

    #[actix_web::test]
    async fn noop_put_mirrors_without_value() {
        let ctx = test_state();
        let app = test::init_service(App::new().service(new_routes(ctx))).await;

        let body = json!({"objects": [{"object_key": "shared.ABC123", "value": {"target_temperature": 20.0}}]});

        let req = device_headers(test::TestRequest::post().uri("/nest/transport/put"))
            .set_json(body.clone())
            .to_request();
        let first: Value = test::read_body_json(test::call_service(&app, req).await).await;
        assert_eq!(first["objects"][0]["object_revision"], json!(1));
        assert!(first["objects"][0].get("value").is_some());

        let req = device_headers(test::TestRequest::post().uri("/nest/transport/put"))
            .set_json(body)
            .to_request();
        let second: Value = test::read_body_json(test::call_service(&app, req).await).await;
        assert_eq!(second["objects"][0]["object_revision"], json!(1));
        assert!(second["objects"][0].get("value").is_none());
    }

    #[actix_web::test]
    async fn client_newer_probe_is_accepted_into_server_state() {
        let ctx = test_state();
        ctx.state
            .merge_update(
                "ABC123",
                &crate::core::ObjectKey::shared("ABC123"),
                &json!({"target_temperature": 20.0}),
                crate::state::MergeOptions::default(),
            )
            .await
            .unwrap();

        let app = test::init_service(App::new().service(new_routes(ctx.clone()))).await;

        let req = device_headers(test::TestRequest::post().uri("/nest/transport"))
            .set_json(json!({
                "objects": [{
                    "object_key": "shared.ABC123",
                    "object_revision": 7,
                    "object_timestamp": 99_999_999_999_999i64,
                    "value": {"hvac_ac_state": false}
                }]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let stored = ctx
            .state
            .get("ABC123", &crate::core::ObjectKey::shared("ABC123"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.revision, 7);
        // server-held fields overlay the client's
        assert_eq!(stored.value["target_temperature"], json!(20.0));
        assert_eq!(stored.value["hvac_ac_state"], json!(false));
    }
}
