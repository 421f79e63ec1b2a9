//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::federation::InboxRequest;
use crate::federation::types::{ACTIVITY_JSON, LD_JSON};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /outbox - Server outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/outbox", get(server_outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

/// Serve a document as `application/activity+json`
fn activity_json<T: Serialize>(document: T) -> Response {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON))],
        Json(document),
    )
        .into_response()
}

fn wants_activity_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|accept| accept.contains(ACTIVITY_JSON) || accept.contains(LD_JSON))
}

/// GET /users/:username
///
/// Actor document for ActivityPub clients, a small HTML page otherwise.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actors = state.federation.actors()?;

    if wants_activity_json(&headers) {
        let document = actors.actor_document(&username).await?;
        Ok(activity_json(document))
    } else {
        Ok(Html(actors.profile_html(&username)?).into_response())
    }
}

fn inbox_request<'a>(uri: &'a Uri, headers: &'a HeaderMap, body: &'a Bytes) -> InboxRequest<'a> {
    InboxRequest {
        path: uri.path_and_query().map_or(uri.path(), |p| p.as_str()),
        headers,
        body,
    }
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state
        .federation
        .inbox()?
        .receive(Some(&username), inbox_request(&uri, &headers, &body))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state
        .federation
        .inbox()?
        .receive(None, inbox_request(&uri, &headers, &body))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<String>,
}

/// GET /users/:username/outbox
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let document = state
        .federation
        .outbox()?
        .user_outbox(&username, query.page.as_deref())?;
    Ok(activity_json(document))
}

/// GET /outbox
async fn server_outbox(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let document = state
        .federation
        .outbox()?
        .server_outbox(query.page.as_deref())?;
    Ok(activity_json(document))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let collection = state
        .federation
        .actors()?
        .followers_collection(&username)
        .await?;
    Ok(activity_json(collection))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let collection = state
        .federation
        .actors()?
        .following_collection(&username)
        .await?;
    Ok(activity_json(collection))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_negotiation_recognizes_activity_types() {
        let mut headers = HeaderMap::new();
        assert!(!wants_activity_json(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
        assert!(!wants_activity_json(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
            ),
        );
        assert!(wants_activity_json(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("application/activity+json"));
        assert!(wants_activity_json(&headers));
    }
}
