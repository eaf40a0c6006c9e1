use actix_web::HttpRequest;

use crate::core::error::ServiceError;

/// Device identity header: `{serial}.{firmware}`, serial before the first dot.
pub const CLIENT_ID_HEADER: &str = "x-nl-client-id";

/// CN of the client certificate, forwarded by a TLS-terminating proxy.
pub const CERT_CN_HEADER: &str = "x-forwarded-client-cn";

pub fn serial_from_client_id(raw: &str) -> Option<String> {
    let token = raw.split('.').next()?.trim();
    is_valid_serial(token).then(|| token.to_string())
}

fn is_valid_serial(token: &str) -> bool {
    (6..=20).contains(&token.len())
        && token.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

/// Resolve the requesting device's serial or fail with 401.
pub fn resolve_serial(req: &HttpRequest) -> Result<String, ServiceError> {
    if let Some(raw) = header_str(req, CLIENT_ID_HEADER)
        && let Some(serial) = serial_from_client_id(raw)
    {
        return Ok(serial);
    }

    if let Some(cn) = header_str(req, CERT_CN_HEADER)
        && is_valid_serial(cn.trim())
    {
        return Ok(cn.trim().to_string());
    }

    Err(ServiceError::Unauthorized)
}

fn header_str<'r>(req: &'r HttpRequest, name: &str) -> Option<&'r str> {
    req.headers().get(name)?.to_str().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_is_the_token_before_the_first_dot() {
        assert_eq!(serial_from_client_id("01AB02AC30140ABC.5.6-7"), Some("01AB02AC30140ABC".to_string()));
        assert_eq!(serial_from_client_id("ABC123"), Some("ABC123".to_string()));
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert_eq!(serial_from_client_id("abc123.1"), None);
        assert_eq!(serial_from_client_id("AB.1"), None);
        assert_eq!(serial_from_client_id(""), None);
        assert_eq!(serial_from_client_id("THIS0SERIAL0IS0FAR0TOO0LONG.1"), None);
    }
}
