//! WebSocket upgrade handler.
//!
//! Credential extraction and the origin check happen before the upgrade;
//! a rejected request never reaches the hub.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use super::client::{Client, MAX_MESSAGE_SIZE};
use crate::error::RealtimeError;
use crate::state::AppState;

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Token fallback for clients that cannot set headers
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws`: authenticate, check origin, upgrade, run the session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(token) = extract_token(&headers, query.token) else {
        return RealtimeError::Unauthorized.into_response();
    };

    let Ok(subject) = state.authenticator.validate(&token) else {
        return RealtimeError::Unauthorized.into_response();
    };

    if !origin_allowed(&headers, &state.allowed_origins) {
        warn!(user = %subject, "rejecting upgrade from disallowed origin");
        return RealtimeError::OriginForbidden.into_response();
    }

    let hub = state.hub.clone();
    let shutdown = state.shutdown.clone();
    let buffer = state.client_buffer;

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let client = Client::new(hub, &subject, socket, buffer);
            let id = client.id().clone();
            info!(client = %id, user = %subject, "client connected");
            client.run(&shutdown).await;
            info!(client = %id, user = %subject, "client disconnected");
        })
}

/// Pulls the bearer token from the `Authorization` header, falling back to
/// the `token` query parameter.
fn extract_token(headers: &HeaderMap, query_token: Option<String>) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() == 2 && fields[0].eq_ignore_ascii_case("bearer") {
            return Some(fields[1].to_string());
        }
    }

    query_token.filter(|token| !token.is_empty())
}

/// An empty allow-set accepts any origin, including a missing header.
/// Otherwise the trimmed header must match a configured origin exactly.
fn origin_allowed(headers: &HeaderMap, allowed: &HashSet<String>) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let Some(origin) = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };

    let origin = origin.trim();
    !origin.is_empty() && allowed.contains(origin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_extract_token_from_header() {
        let headers = headers(&[(header::AUTHORIZATION, "Bearer abc123")]);
        assert_eq!(extract_token(&headers, None), Some("abc123".to_string()));
    }

    #[test]
    fn test_extract_token_scheme_is_case_insensitive() {
        let headers = headers(&[(header::AUTHORIZATION, "bearer abc123")]);
        assert_eq!(extract_token(&headers, None), Some("abc123".to_string()));
    }

    #[test]
    fn test_malformed_header_falls_back_to_query() {
        let headers = headers(&[(header::AUTHORIZATION, "Bearer abc 123")]);
        assert_eq!(
            extract_token(&headers, Some("query-token".to_string())),
            Some("query-token".to_string())
        );
    }

    #[test]
    fn test_non_bearer_scheme_is_ignored() {
        let headers = headers(&[(header::AUTHORIZATION, "Basic abc123")]);
        assert_eq!(extract_token(&headers, None), None);
    }

    #[test]
    fn test_missing_credential() {
        assert_eq!(extract_token(&HeaderMap::new(), None), None);
        assert_eq!(extract_token(&HeaderMap::new(), Some(String::new())), None);
    }

    #[test]
    fn test_empty_allow_set_accepts_anything() {
        let allowed = HashSet::new();
        assert!(origin_allowed(&HeaderMap::new(), &allowed));
        assert!(origin_allowed(
            &headers(&[(header::ORIGIN, "https://anywhere.example")]),
            &allowed
        ));
    }

    #[test]
    fn test_origin_must_match_exactly() {
        let allowed: HashSet<String> = ["https://app.example.com".to_string()].into();

        assert!(origin_allowed(
            &headers(&[(header::ORIGIN, "https://app.example.com")]),
            &allowed
        ));
        assert!(origin_allowed(
            &headers(&[(header::ORIGIN, " https://app.example.com ")]),
            &allowed
        ));
        assert!(!origin_allowed(
            &headers(&[(header::ORIGIN, "https://evil.example.com")]),
            &allowed
        ));
        assert!(!origin_allowed(
            &headers(&[(header::ORIGIN, "HTTPS://APP.EXAMPLE.COM")]),
            &allowed
        ));
    }

    #[test]
    fn test_missing_origin_is_rejected_when_restricted() {
        let allowed: HashSet<String> = ["https://app.example.com".to_string()].into();
        assert!(!origin_allowed(&HeaderMap::new(), &allowed));
    }
}
