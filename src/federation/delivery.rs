//! Activity delivery
//!
//! Handles delivering activities to remote servers. Every request is signed
//! individually; failures are reported per inbox and never retried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;

use crate::data::Follower;
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_DELIVERIES_TOTAL};

use super::fetch::RemoteFetcher;
use super::signature::KeyManager;
use super::types::{ACTIVITY_JSON, Activity};

/// Result of a single delivery
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub inbox: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// Outcome of fanning one activity out to a set of inboxes
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub activity_id: String,
    pub results: Vec<DeliveryResult>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }
}

/// Delivery targets for a follower set
///
/// Followers on a server with a shared inbox collapse into one target;
/// the others keep their personal inboxes. Order of first appearance is kept.
pub fn group_inboxes<'a>(followers: impl IntoIterator<Item = &'a Follower>) -> Vec<String> {
    let mut seen = HashSet::new();
    followers
        .into_iter()
        .map(Follower::delivery_inbox)
        .filter(|inbox| !inbox.is_empty() && seen.insert(inbox.to_string()))
        .map(str::to_string)
        .collect()
}

/// Activity delivery service
///
/// Sends activities to remote inbox endpoints, signed as a local user.
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: Arc<reqwest::Client>,
    keys: Arc<KeyManager>,
    fetcher: RemoteFetcher,
    timeout: Duration,
    max_concurrent: usize,
}

impl ActivityDelivery {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        keys: Arc<KeyManager>,
        fetcher: RemoteFetcher,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            http_client,
            keys,
            fetcher,
            timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Deliver activity to a single inbox
    ///
    /// # Errors
    /// Returns error if delivery fails (network, signature, rejection)
    pub async fn deliver_to_inbox(
        &self,
        username: &str,
        inbox: &str,
        activity: &Activity,
    ) -> Result<(), AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let status = self.send(username, inbox, body, &activity.kind).await?;
        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox, status
            )));
        }
        Ok(())
    }

    /// Check the destination, then sign and POST a body
    ///
    /// Any HTTP response counts as sent.
    async fn send(
        &self,
        username: &str,
        inbox: &str,
        body: Vec<u8>,
        activity_type: &str,
    ) -> Result<reqwest::StatusCode, AppError> {
        if let Err(error) = self.fetcher.check_destination(inbox).await {
            FEDERATION_DELIVERIES_TOTAL
                .with_label_values(&["failure"])
                .inc();
            return Err(error);
        }

        let mut request = self
            .http_client
            .post(inbox)
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .timeout(self.timeout)
            .body(body)
            .build()
            .map_err(|e| AppError::Federation(format!("Invalid inbox {}: {}", inbox, e)))?;

        self.keys.sign_request(username, &mut request).await?;

        let status = match self.http_client.execute(request).await {
            Ok(response) => response.status(),
            Err(e) => {
                FEDERATION_DELIVERIES_TOTAL
                    .with_label_values(&["failure"])
                    .inc();
                return Err(AppError::Federation(format!(
                    "Failed to deliver to {}: {}",
                    inbox, e
                )));
            }
        };

        if status.is_success() {
            FEDERATION_DELIVERIES_TOTAL
                .with_label_values(&["success"])
                .inc();
            ACTIVITYPUB_ACTIVITIES_SENT
                .with_label_values(&[activity_type])
                .inc();
            tracing::debug!(inbox, activity_type, "Delivered activity");
        } else {
            FEDERATION_DELIVERIES_TOTAL
                .with_label_values(&["failure"])
                .inc();
        }
        Ok(status)
    }

    async fn deliver_one(
        &self,
        username: &str,
        inbox: String,
        body: Arc<Vec<u8>>,
        activity_type: &str,
    ) -> DeliveryResult {
        let outcome = self
            .send(username, &inbox, body.as_ref().clone(), activity_type)
            .await;

        let (success, error, status_code) = match outcome {
            Ok(status) if status.is_success() => (true, None, Some(status.as_u16())),
            Ok(status) => (
                false,
                Some(format!("Inbox rejected activity: HTTP {}", status)),
                Some(status.as_u16()),
            ),
            Err(error) => (false, Some(error.to_string()), None),
        };
        if let Some(error) = &error {
            tracing::warn!(%error, inbox = %inbox, "Delivery failed");
        }

        DeliveryResult {
            inbox,
            success,
            error,
            status_code,
        }
    }

    /// Deliver one activity to many inboxes
    ///
    /// Runs at most `max_concurrent` deliveries at once. A failed inbox
    /// does not stop the others.
    pub async fn deliver_to_inboxes(
        &self,
        username: &str,
        activity: &Activity,
        inboxes: Vec<String>,
    ) -> Result<DeliveryReport, AppError> {
        let body = Arc::new(
            serde_json::to_vec(activity)
                .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?,
        );

        let results: Vec<DeliveryResult> = futures::stream::iter(inboxes)
            .map(|inbox| self.deliver_one(username, inbox, Arc::clone(&body), &activity.kind))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let report = DeliveryReport {
            activity_id: activity.id.clone(),
            results,
        };
        tracing::info!(
            activity_id = %report.activity_id,
            activity_type = %activity.kind,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Batch delivery complete"
        );
        Ok(report)
    }
}

/// Activity builders
pub mod builder {
    use serde_json::Value;

    use crate::data::EntityId;
    use crate::federation::types::{
        ACTIVITY_STREAMS_CONTEXT, Activity, ActivityObject, EmbeddedObject, Object,
    };

    /// Fresh activity id under an actor
    pub fn activity_id(actor: &str) -> String {
        format!("{}/activities/{}", actor, EntityId::new().0)
    }

    fn envelope(kind: &str, id: &str, actor: &str, object: ActivityObject) -> Activity {
        Activity {
            context: Some(Value::from(ACTIVITY_STREAMS_CONTEXT)),
            id: id.to_string(),
            kind: kind.to_string(),
            actor: actor.to_string(),
            object: Some(object),
            ..Activity::default()
        }
    }

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Activity {
        let mut activity = envelope("Follow", id, actor, ActivityObject::Reference(object.to_string()));
        activity.to = vec![object.to_string()];
        activity
    }

    /// Build an Accept of a received Follow, addressed to its sender
    pub fn accept(id: &str, actor: &str, follow: Activity) -> Activity {
        let to = vec![follow.actor.clone()];
        let mut follow = follow;
        follow.context = None;

        let mut activity = envelope("Accept", id, actor, follow.into());
        activity.to = to;
        activity
    }

    /// Wrap an object in a Create or Update, copying its addressing
    fn wrap(kind: &str, id: &str, actor: &str, object: Object) -> Activity {
        let to = object.to.clone();
        let cc = object.cc.clone();
        let embedded = match object.kind.as_str() {
            "Note" => EmbeddedObject::Note(object),
            _ => EmbeddedObject::Article(object),
        };

        let mut activity = envelope(kind, id, actor, ActivityObject::Embedded(embedded));
        activity.to = to;
        activity.cc = cc;
        activity.published = Some(chrono::Utc::now().to_rfc3339());
        activity
    }

    /// Build a Create activity
    pub fn create(id: &str, actor: &str, object: Object) -> Activity {
        wrap("Create", id, actor, object)
    }

    /// Build an Update activity
    pub fn update(id: &str, actor: &str, object: Object) -> Activity {
        wrap("Update", id, actor, object)
    }

    /// Build a Delete activity referencing the deleted object by URI
    pub fn delete(id: &str, actor: &str, object: &str, to: Vec<String>, cc: Vec<String>) -> Activity {
        let mut activity = envelope("Delete", id, actor, ActivityObject::Reference(object.to_string()));
        activity.to = to;
        activity.cc = cc;
        activity.published = Some(chrono::Utc::now().to_rfc3339());
        activity
    }
}
