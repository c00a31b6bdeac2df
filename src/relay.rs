//! Same-origin relay: browsers post here, the relay forwards to the hub with
//! the tenant header attached and streams the answer back untouched.

use crate::client::TENANT_HEADER;
use crate::config::RelayConfig;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

struct RelayState {
    http: reqwest::Client,
    upstream_url: String,
    tenant: HeaderValue,
}

pub fn relay_router(config: &RelayConfig) -> Router {
    let tenant = HeaderValue::from_str(&config.tenant_subdomain)
        .unwrap_or_else(|_| HeaderValue::from_static(crate::config::DEFAULT_RELAY_TENANT));
    let state = Arc::new(RelayState {
        http: reqwest::Client::new(),
        upstream_url: config.upstream_url.clone(),
        tenant,
    });

    Router::new()
        .route("/", post(relay_handler).fallback(method_not_allowed))
        .route("/api/proxy", post(relay_handler).fallback(method_not_allowed))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(config: RelayConfig) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        upstream = %config.upstream_url,
        "relay listening"
    );
    axum::serve(listener, relay_router(&config)).await
}

async fn relay_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !headers.contains_key(header::AUTHORIZATION) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing authorization header" })),
        )
            .into_response();
    }

    let mut forwarded = filter_headers(&headers);
    forwarded.insert(HeaderName::from_static(TENANT_HEADER), state.tenant.clone());

    let upstream = match state
        .http
        .post(&state.upstream_url)
        .headers(forwarded)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%err, "relay could not reach upstream");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Proxy request failed", "message": err.to_string() })),
            )
                .into_response();
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        let text = upstream.text().await.unwrap_or_default();
        tracing::warn!(%status, "upstream rejected relayed request");
        return (status, Json(json!({ "error": format!("API error: {text}") }))).into_response();
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive");
    // Bytes pass through undecoded, so their encoding label must too.
    if let Some(encoding) = upstream.headers().get(header::CONTENT_ENCODING) {
        builder = builder.header(header::CONTENT_ENCODING, encoding.clone());
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "error": "Method not allowed" })),
    )
        .into_response()
}

fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str())
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::ACCEPT_ENCODING
            || name.as_str() == TENANT_HEADER
        {
            continue;
        }
        filtered.append(name, value.clone());
    }
    filtered
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_encoding_and_client_tenant() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::HOST, HeaderValue::from_static("relay.local"));
        headers.insert(TENANT_HEADER, HeaderValue::from_static("spoofed"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );

        let filtered = filter_headers(&headers);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.contains_key(header::AUTHORIZATION));
        assert!(filtered.contains_key(header::CONTENT_TYPE));
    }
}
