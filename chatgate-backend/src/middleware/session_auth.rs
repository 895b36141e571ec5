// Session authentication helpers.
// Handlers call `authenticate` directly rather than wrapping scopes, so the
// WebSocket upgrade and the REST controllers share one code path.

use actix_web::HttpRequest;
use std::sync::Arc;

use crate::db::Database;
use crate::error::ChatError;
use crate::models::{User, UserRole};

/// Bearer token from the Authorization header, falling back to `?token=`
/// (browsers cannot set headers on a WebSocket upgrade).
pub fn extract_token(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim_start_matches("Bearer ").trim().to_string())
        .filter(|s| !s.is_empty());

    from_header.or_else(|| {
        req.query_string()
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
            .filter(|s| !s.is_empty())
    })
}

pub fn authenticate(db: &Arc<Database>, req: &HttpRequest) -> Result<User, ChatError> {
    let token = extract_token(req).ok_or(ChatError::Unauthenticated)?;

    match db.validate_session(&token) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(ChatError::Unauthenticated),
        Err(e) => {
            log::error!("[AUTH] Session validation error: {}", e);
            Err(e.into())
        }
    }
}

pub fn require_admin(db: &Arc<Database>, req: &HttpRequest) -> Result<User, ChatError> {
    let user = authenticate(db, req)?;
    if user.role != UserRole::Admin {
        return Err(ChatError::Authorization("admin role required".to_string()));
    }
    Ok(user)
}

/// Client address used as the rate-limit subject for unauthenticated routes.
///
/// Forwarding headers are client-controlled, so they are only read when the
/// gateway is configured to sit behind a trusted proxy.
pub fn client_ip(req: &HttpRequest, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        if let Some(addr) = req.connection_info().realip_remote_addr() {
            return addr.to_string();
        }
    }
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_extract_token_sources() {
        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer abc"))
            .to_http_request();
        assert_eq!(extract_token(&req).as_deref(), Some("abc"));

        let req = TestRequest::with_uri("/ws?foo=1&token=xyz").to_http_request();
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));

        let req = TestRequest::with_uri("/ws").to_http_request();
        assert_eq!(extract_token(&req), None);
    }

    #[test]
    fn test_client_ip_ignores_forwarding_by_default() {
        let req = TestRequest::default()
            .peer_addr("10.0.0.5:5555".parse().unwrap())
            .insert_header(("X-Forwarded-For", "203.0.113.9"))
            .to_http_request();
        assert_eq!(client_ip(&req, false), "10.0.0.5");
        assert_eq!(client_ip(&req, true), "203.0.113.9");
    }

    #[test]
    fn test_authenticate() {
        let db = Arc::new(Database::in_memory().unwrap());
        let user = db.create_user("a@example.com", "hash").unwrap();
        let session = db.create_session(user.id, 1).unwrap();

        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {}", session.token)))
            .to_http_request();
        assert_eq!(authenticate(&db, &req).unwrap().id, user.id);

        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer nope"))
            .to_http_request();
        assert!(matches!(authenticate(&db, &req), Err(ChatError::Unauthenticated)));
    }
}
