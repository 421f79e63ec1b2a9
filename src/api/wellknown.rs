//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;

const JRD_JSON: &str = "application/jrd+json";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/2.0
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/2.0", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actors = state.federation.actors()?;
    let resource = query
        .resource
        .ok_or_else(|| AppError::Validation("Missing resource parameter".to_string()))?;
    let host = headers.get(header::HOST).and_then(|h| h.to_str().ok());

    let response = actors.discover(&resource, host)?;
    Ok((
        [(header::CONTENT_TYPE, HeaderValue::from_static(JRD_JSON))],
        Json(response),
    )
        .into_response())
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.federation.actors()?;
    let base_url = state.config.server.base_url();
    Ok(Json(serde_json::json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}/nodeinfo/2.0", base_url)
            }
        ]
    })))
}

/// GET /nodeinfo/2.0
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<crate::data::NodeInfo>, AppError> {
    Ok(Json(state.federation.node_info().await?))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> Result<Response, AppError> {
    state.federation.actors()?;
    let base_url = state.config.server.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="application/jrd+json" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url
    );

    Ok(([(header::CONTENT_TYPE, "application/xrd+xml")], xml).into_response())
}
