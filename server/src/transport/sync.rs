use actix_web::{HttpRequest, HttpResponse, web};
use serde_json::Value;

use support::time::now_ms;

use crate::core::error::ServiceError;
use crate::core::{ObjectKey, ObjectKind, StateObject, resolve_serial};
use crate::rules;
use crate::state::MergeOptions;
use crate::subscription::Interest;
use crate::transport::TransportState;
use crate::transport::wire::{ObjectList, PutRequest, SyncRequest, WireObject};

pub const SERVICE_TIMESTAMP_HEADER: &str = "x-nl-service-timestamp";

/// `GET /nest/transport/device/{serial}` — metadata of every object the
/// server holds for the device, so a reconnecting firmware can diff.
pub async fn device_objects(
    req: HttpRequest,
    ctx: web::Data<TransportState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ServiceError> {
    resolve_serial(&req)?;
    let serial = path.into_inner();

    let objects = ctx.state.get_all(&serial).await?;
    let body = ObjectList {
        objects: objects.iter().map(WireObject::meta).collect(),
    };

    // seeded after the snapshot; the device picks it up on its next sync
    rules::ensure_device_alert_dialog(&ctx.state, &serial).await?;

    Ok(ok_with_timestamp().json(body))
}

/// `POST /nest/transport` — combined update/subscribe reconciliation.
pub async fn subscribe(
    req: HttpRequest,
    ctx: web::Data<TransportState>,
    body: web::Json<SyncRequest>,
) -> Result<HttpResponse, ServiceError> {
    let serial = resolve_serial(&req)?;
    let client_id = req
        .headers()
        .get(crate::core::CLIENT_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    let body = body.into_inner();

    let mut outdated: Vec<WireObject> = vec![];
    let mut interests: Vec<Interest> = vec![];
    let mut changed: Vec<StateObject> = vec![];

    for wire in &body.objects {
        let key = ObjectKey::new(&wire.object_key);

        if let Some(value) = wire.value.as_ref().filter(|_| wire.is_update()) {
            let outcome = ctx
                .state
                .merge_update(
                    &serial,
                    &key,
                    value,
                    MergeOptions {
                        touched_id: client_id.clone(),
                    },
                )
                .await?;
            if outcome.changed {
                changed.push(outcome.object);
            }
            continue;
        }

        let (client_rev, client_ts) = (wire.revision(), wire.timestamp());
        let server = ctx.state.get(&serial, &key).await?;

        match server {
            Some(server_obj) => {
                if client_rev == 0 && client_ts == 0 {
                    // client wants the current value right away; stored
                    // revision is untouched
                    outdated.push(WireObject::with_value(&server_obj));
                } else if server_obj.is_newer_than(client_rev, client_ts) {
                    outdated.push(WireObject::with_value(&server_obj));
                } else if client_rev > server_obj.revision
                    || (client_rev == server_obj.revision && client_ts > server_obj.timestamp)
                {
                    let accepted = ctx
                        .state
                        .accept_client(&serial, &key, client_rev, client_ts, wire.value.as_ref())
                        .await?;
                    changed.push(accepted);
                }
            }
            None => {
                // nothing server-side yet; a client claiming state seeds it
                if client_rev > 0 || client_ts > 0 {
                    let accepted = ctx
                        .state
                        .accept_client(&serial, &key, client_rev, client_ts, wire.value.as_ref())
                        .await?;
                    changed.push(accepted);
                }
            }
        }

        interests.push(Interest {
            key,
            revision: client_rev,
            timestamp: client_ts,
        });
    }

    finish_writes(&ctx, &serial, &changed).await;

    if !outdated.is_empty() {
        return Ok(ok_with_timestamp().json(ObjectList { objects: outdated }));
    }

    if body.chunked {
        let parked = ctx.subs.park(&serial, body.session, interests)?;
        return Ok(ok_with_timestamp()
            .content_type("application/json")
            .streaming(parked));
    }

    Ok(ok_with_timestamp().finish())
}

/// `POST /nest/transport/put` — device push. Mirrors each object with its new
/// revision; no-op writes come back without a value.
pub async fn put(
    req: HttpRequest,
    ctx: web::Data<TransportState>,
    body: web::Json<PutRequest>,
) -> Result<HttpResponse, ServiceError> {
    let serial = resolve_serial(&req)?;
    let client_id = req
        .headers()
        .get(crate::core::CLIENT_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);

    let mut responses: Vec<WireObject> = vec![];
    let mut changed: Vec<StateObject> = vec![];

    for wire in &body.objects {
        let key = ObjectKey::new(&wire.object_key);
        let Some(value) = wire.value.as_ref() else {
            return Err(ServiceError::BadRequest(format!(
                "object {} has no value",
                wire.object_key
            )));
        };

        let outcome = ctx
            .state
            .merge_update(
                &serial,
                &key,
                value,
                MergeOptions {
                    touched_id: client_id.clone(),
                },
            )
            .await?;

        responses.push(if outcome.changed {
            WireObject::with_value(&outcome.object)
        } else {
            WireObject::meta(&outcome.object)
        });
        if outcome.changed {
            changed.push(outcome.object);
        }
    }

    finish_writes(&ctx, &serial, &changed).await;

    Ok(ok_with_timestamp().json(ObjectList { objects: responses }))
}

/// Post-write fan-out shared by subscribe and put: wake parked subscribers,
/// recompute the owner's away aggregate, kick a weather refresh on postal
/// changes.
async fn finish_writes(ctx: &TransportState, serial: &str, changed: &[StateObject]) {
    if changed.is_empty() {
        return;
    }

    ctx.subs.notify_all(serial, changed);

    let device_changes: Vec<&StateObject> = changed
        .iter()
        .filter(|o| o.key.kind() == ObjectKind::Device)
        .collect();
    if device_changes.is_empty() {
        return;
    }

    if device_changes.iter().any(|o| rules::touches_away_fields(&o.value)) {
        match ctx.store.get_device_owner(serial).await {
            Ok(Some(owner)) => match rules::recompute_user_away(&ctx.state, &ctx.store, &owner.user_id).await {
                Ok(per_serial) => {
                    for (bucket_serial, object) in per_serial {
                        ctx.subs.notify(&bucket_serial, &object);
                    }
                }
                Err(e) => tracing::warn!("Away recompute failed for {}: {}", serial, e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Owner lookup failed for {}: {}", serial, e),
        }
    }

    for postal in device_changes
        .iter()
        .filter_map(|o| o.value.get("postal_code").and_then(Value::as_str))
    {
        let weather = ctx.weather.clone();
        let postal = postal.to_string();
        // fetch and fan-out happen off the request path
        tokio::spawn(async move { weather.refresh_for_postal(&postal).await });
    }
}

fn ok_with_timestamp() -> actix_web::HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder.insert_header((SERVICE_TIMESTAMP_HEADER, now_ms().to_string()));
    builder
}
