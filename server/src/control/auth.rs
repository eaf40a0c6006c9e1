use std::future::Future;
use std::pin::Pin;

use actix_web::{FromRequest, HttpRequest, dev::Payload, web};

use crate::control::ControlState;
use crate::core::error::ServiceError;
use crate::store::ApiKeyContext;

/// Bearer API-key extractor; validation stamps `last_used_at` in the store.
pub struct Authenticated(pub ApiKeyContext);

impl FromRequest for Authenticated {
    type Error = ServiceError;
    type Future = Pin<Box<dyn Future<Output = Result<Self, ServiceError>>>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let raw = bearer_token(&req).ok_or(ServiceError::Unauthorized)?;

            let ctx = req
                .app_data::<web::Data<ControlState>>()
                .ok_or(ServiceError::Unauthorized)?;

            let context = ctx
                .store
                .validate_api_key(&raw)
                .await
                .map_err(|e| {
                    tracing::error!("API key validation failed: {}", e);
                    ServiceError::StoreUnavailable
                })?
                .ok_or(ServiceError::Unauthorized)?;

            tracing::debug!("Authenticated API key '{}' for {}", context.name, context.user_id);

            Ok(Authenticated(context))
        })
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get("authorization")?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|t| t.trim().to_string())
}
