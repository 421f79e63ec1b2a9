//! Inbound activity processing
//!
//! Authenticates deliveries to the personal and shared inboxes, then
//! dispatches them by type. Recognized activities mutate the social graph
//! or create comments; everything else is accepted and ignored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::config::{AppConfig, SignaturePolicy};
use crate::data::{Comment, Follower};
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_RECEIVED, FEDERATION_REQUEST_DURATION_SECONDS,
    FEDERATION_REQUESTS_TOTAL,
};
use crate::storage::Storage;

use super::actor::validate_username;
use super::delivery::{ActivityDelivery, builder};
use super::fetch::{RemoteFetcher, actor_host, document_url};
use super::key_cache::{KeySource, PublicKeyCache};
use super::signature::{KeyManager, RemoteKey, extract_signature_key_id};
use super::types::{Activity, ActivityObject, ActivityType, EmbeddedObject, Object};

/// One inbound POST, as received
#[derive(Debug, Clone, Copy)]
pub struct InboxRequest<'a> {
    /// Path and query the request was addressed to
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

impl InboxRequest<'_> {
    fn host(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
    }
}

/// What the dispatch step knows about a delivery
struct Inbound<'a> {
    username: &'a str,
    verified: bool,
    request_host: Option<&'a str>,
}

/// Stable comment id for a remote note, so redelivery does not duplicate
pub fn comment_id(note_id: &str) -> String {
    let digest = Sha256::digest(note_id.as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("comment-{}", hex)
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

pub struct InboxService {
    config: Arc<AppConfig>,
    storage: Arc<Storage>,
    keys: Arc<KeyManager>,
    key_cache: PublicKeyCache,
    fetcher: RemoteFetcher,
    delivery: ActivityDelivery,
}

impl InboxService {
    pub fn new(
        config: Arc<AppConfig>,
        storage: Arc<Storage>,
        keys: Arc<KeyManager>,
        fetcher: RemoteFetcher,
        delivery: ActivityDelivery,
    ) -> Self {
        let ttl = std::time::Duration::from_secs(config.federation.key_cache_ttl_seconds);
        Self {
            key_cache: PublicKeyCache::new(fetcher.clone(), ttl),
            config,
            storage,
            keys,
            fetcher,
            delivery,
        }
    }

    /// Process a delivery to `username`'s inbox, or to the shared inbox when `None`
    ///
    /// # Errors
    /// - `InvalidSignature`/`Unauthorized` when authentication fails
    /// - `Validation` for malformed activities
    /// - `NotFound` for unknown users
    /// - `Federation`/`Storage` when required processing fails
    pub async fn receive(
        &self,
        username: Option<&str>,
        request: InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["inbound"])
            .start_timer();

        let result = self.process(username, request).await;
        let status = match &result {
            Ok(()) => "success",
            Err(AppError::InvalidSignature | AppError::Unauthorized) => "unauthorized",
            Err(_) => "error",
        };
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", status])
            .inc();
        result
    }

    async fn process(
        &self,
        username: Option<&str>,
        request: InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let signer = match request.headers.get("signature") {
            Some(_) => {
                let key_id = extract_signature_key_id(request.headers).map_err(|error| {
                    tracing::debug!(%error, "Unparseable signature header");
                    AppError::InvalidSignature
                })?;
                let owner = self.verify(&key_id, request).await?;
                Some((key_id, owner))
            }
            None if self.config.federation.signature_policy == SignaturePolicy::Required => {
                tracing::info!(path = request.path, "Rejecting unsigned inbox delivery");
                return Err(AppError::Unauthorized);
            }
            None => None,
        };

        let activity: Activity = serde_json::from_slice(request.body)
            .map_err(|e| AppError::Validation(format!("Invalid activity: {}", e)))?;

        match &signer {
            Some((key_id, owner)) if document_url(owner) != document_url(&activity.actor) => {
                tracing::info!(
                    key_id = %key_id,
                    owner = %owner,
                    actor = %activity.actor,
                    "Signature key does not belong to activity actor"
                );
                return Err(AppError::InvalidSignature);
            }
            Some(_) => {}
            None => tracing::warn!(
                actor = %activity.actor,
                activity_type = %activity.kind,
                "Accepting unsigned activity"
            ),
        }

        let username = match username {
            Some(username) => {
                validate_username(username)?;
                if !self.config.has_user(username) {
                    return Err(AppError::NotFound);
                }
                username.to_string()
            }
            None => self.resolve_shared_target(&activity)?,
        };

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity.activity_type().as_str()])
            .inc();

        let inbound = Inbound {
            username: &username,
            verified: signer.is_some(),
            request_host: request.host(),
        };
        self.dispatch(&activity, &inbound).await
    }

    /// Verify the request signature and return the signing actor
    ///
    /// A cached key that fails verification is refetched once.
    async fn verify(&self, key_id: &str, request: InboxRequest<'_>) -> Result<String, AppError> {
        let max_age = self.config.federation.signature_max_age_seconds;
        let check = |key: RemoteKey| {
            self.keys
                .verify("post", request.path, request.headers, request.body, &key.pem, max_age)
                .map(|()| key.owner)
        };

        let (key, source) = self.key_cache.get(key_id).await.map_err(|error| {
            tracing::info!(%error, key_id, "Could not fetch signing key");
            AppError::InvalidSignature
        })?;

        match check(key) {
            Ok(owner) => Ok(owner),
            Err(_) if source == KeySource::Cache => {
                tracing::debug!(key_id, "Cached key failed verification, refetching");
                let key = self.key_cache.refresh(key_id).await.map_err(|error| {
                    tracing::info!(%error, key_id, "Could not refetch signing key");
                    AppError::InvalidSignature
                })?;
                check(key)
            }
            Err(error) => Err(error),
        }
    }

    /// Local user addressed by a URI: the actor itself or anything under it
    fn local_user_for(&self, uri: &str) -> Option<&str> {
        self.config.users.keys().map(String::as_str).find(|user| {
            let actor = self.config.actor_uri(user);
            uri.strip_prefix(actor.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('#'))
        })
    }

    /// Pick the local recipient of a shared-inbox delivery
    fn resolve_shared_target(&self, activity: &Activity) -> Result<String, AppError> {
        let mut candidates: Vec<&str> = Vec::new();
        match &activity.object {
            Some(ActivityObject::Reference(uri)) => candidates.push(uri),
            Some(ActivityObject::Embedded(EmbeddedObject::Activity(inner))) => {
                candidates.push(&inner.actor);
                candidates.extend(inner.object_id());
            }
            _ => {}
        }
        candidates.extend(activity.to.iter().map(String::as_str));
        candidates.extend(activity.cc.iter().map(String::as_str));

        candidates
            .into_iter()
            .find_map(|uri| self.local_user_for(uri))
            .or_else(|| self.config.primary_user())
            .map(str::to_string)
            .ok_or(AppError::NotFound)
    }

    async fn dispatch(&self, activity: &Activity, inbound: &Inbound<'_>) -> Result<(), AppError> {
        match activity.activity_type() {
            ActivityType::Follow => self.handle_follow(activity, inbound).await,
            ActivityType::Undo => self.handle_undo(activity, inbound).await,
            ActivityType::Accept => self.handle_accept(activity, inbound).await,
            ActivityType::Reject => self.handle_reject(activity, inbound).await,
            ActivityType::Create => self.handle_create(activity, inbound).await,
            ActivityType::Update
            | ActivityType::Delete
            | ActivityType::Like
            | ActivityType::Announce => {
                tracing::info!(
                    activity_type = %activity.kind,
                    actor = %activity.actor,
                    object = activity.object_id().unwrap_or_default(),
                    "Received activity, no action taken"
                );
                Ok(())
            }
            ActivityType::Other(kind) => {
                tracing::debug!(activity_type = %kind, actor = %activity.actor, "Ignoring activity");
                Ok(())
            }
        }
    }

    async fn handle_follow(&self, activity: &Activity, inbound: &Inbound<'_>) -> Result<(), AppError> {
        if activity.actor.is_empty() {
            return Err(AppError::Validation("Follow without actor".to_string()));
        }
        let object = activity
            .object_id()
            .ok_or_else(|| AppError::Validation("Follow without object".to_string()))?;

        let local_actor = self.config.actor_uri(inbound.username);
        if object != local_actor {
            return Err(AppError::Validation(format!(
                "Follow object {} is not {}",
                object, local_actor
            )));
        }

        let remote = self.fetcher.fetch_actor(&activity.actor).await.map_err(|e| {
            AppError::Federation(format!("Failed to fetch follower {}: {}", activity.actor, e))
        })?;
        let (inbox, shared_inbox) = self.fetcher.delivery_endpoints(&remote).await?;

        let follower = Follower {
            actor_id: activity.actor.clone(),
            inbox,
            shared_inbox,
            domain: actor_host(&activity.actor)?,
            username: remote.preferred_username.clone(),
            accepted_at: Utc::now(),
        };
        let inbox = follower.inbox.clone();

        self.storage
            .update_followers(inbound.username, |followers| {
                followers.insert(follower.actor_id.clone(), follower);
            })
            .await?;
        tracing::info!(
            username = inbound.username,
            follower = %activity.actor,
            "Accepted follower"
        );

        let accept = builder::accept(
            &builder::activity_id(&local_actor),
            &local_actor,
            activity.clone(),
        );
        if let Err(error) = self
            .delivery
            .deliver_to_inbox(inbound.username, &inbox, &accept)
            .await
        {
            tracing::warn!(%error, follower = %activity.actor, "Failed to send Accept");
        }
        Ok(())
    }

    async fn handle_undo(&self, activity: &Activity, inbound: &Inbound<'_>) -> Result<(), AppError> {
        let Some(inner) = activity.object.as_ref().and_then(ActivityObject::as_activity) else {
            tracing::debug!(
                actor = %activity.actor,
                object = activity.object_id().unwrap_or_default(),
                "Undo of unknown object, ignoring"
            );
            return Ok(());
        };

        if !inner.actor.is_empty() && inner.actor != activity.actor {
            tracing::info!(
                actor = %activity.actor,
                undone_actor = %inner.actor,
                "Undo of another actor's activity, ignoring"
            );
            return Ok(());
        }

        match inner.activity_type() {
            ActivityType::Follow => {
                let removed = self
                    .storage
                    .update_followers(inbound.username, |followers| {
                        followers.remove(&activity.actor)
                    })
                    .await?;
                if removed.is_some() {
                    tracing::info!(
                        username = inbound.username,
                        follower = %activity.actor,
                        "Removed follower"
                    );
                } else {
                    tracing::debug!(follower = %activity.actor, "Undo for unknown follower");
                }
            }
            ActivityType::Accept => {
                self.remove_following(inbound.username, &activity.actor).await?;
            }
            other => {
                tracing::info!(undone = %other.as_str(), actor = %activity.actor, "Undo received, no action taken");
            }
        }
        Ok(())
    }

    async fn handle_accept(&self, activity: &Activity, inbound: &Inbound<'_>) -> Result<(), AppError> {
        let accepted = self
            .storage
            .update_following(inbound.username, |following| {
                match following.get_mut(&activity.actor) {
                    Some(entry) if entry.is_pending() => {
                        entry.followed_at = Some(Utc::now());
                        true
                    }
                    _ => false,
                }
            })
            .await?;

        if accepted {
            tracing::info!(username = inbound.username, followed = %activity.actor, "Follow accepted");
        } else {
            tracing::debug!(actor = %activity.actor, "Accept without pending follow");
        }
        Ok(())
    }

    async fn handle_reject(&self, activity: &Activity, inbound: &Inbound<'_>) -> Result<(), AppError> {
        self.remove_following(inbound.username, &activity.actor).await
    }

    async fn remove_following(&self, username: &str, actor: &str) -> Result<(), AppError> {
        let removed = self
            .storage
            .update_following(username, |following| following.remove(actor))
            .await?;
        if removed.is_some() {
            tracing::info!(username, followed = %actor, "Removed following entry");
        }
        Ok(())
    }

    async fn handle_create(&self, activity: &Activity, inbound: &Inbound<'_>) -> Result<(), AppError> {
        match &activity.object {
            Some(ActivityObject::Embedded(EmbeddedObject::Note(note))) => {
                self.handle_note(activity, note, inbound).await
            }
            Some(ActivityObject::Embedded(EmbeddedObject::Article(article))) => {
                tracing::info!(actor = %activity.actor, article = %article.id, "Received Article");
                Ok(())
            }
            _ => {
                tracing::debug!(actor = %activity.actor, "Create of unsupported object, ignoring");
                Ok(())
            }
        }
    }

    /// `(collection, slug)` when `in_reply_to` names local content
    fn reply_target(&self, in_reply_to: &str, request_host: Option<&str>) -> Option<(String, String)> {
        let url = url::Url::parse(in_reply_to).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };

        let domain = self.config.server.domain.to_ascii_lowercase();
        let request_host = request_host.map(str::to_ascii_lowercase);
        let ours = authority == domain
            || host == domain
            || request_host.as_deref() == Some(authority.as_str());
        if !ours {
            return None;
        }

        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let collection = segments.next()?;
        let slug = segments.next()?;

        let plain = |s: &str| !s.starts_with('.') && !s.contains(['\\', '\0']);
        if !plain(collection) || !plain(slug) {
            return None;
        }
        if !self.config.collections.is_empty() && !self.config.collections.contains_key(collection) {
            return None;
        }
        Some((collection.to_string(), slug.to_string()))
    }

    async fn handle_note(
        &self,
        activity: &Activity,
        note: &Object,
        inbound: &Inbound<'_>,
    ) -> Result<(), AppError> {
        let Some(in_reply_to) = note.in_reply_to.as_deref() else {
            tracing::debug!(note = %note.id, "Note is not a reply, ignoring");
            return Ok(());
        };
        let Some((collection, slug)) = self.reply_target(in_reply_to, inbound.request_host) else {
            tracing::debug!(note = %note.id, in_reply_to, "Reply to foreign content, ignoring");
            return Ok(());
        };

        if note.id.is_empty() {
            return Err(AppError::Validation("Note without id".to_string()));
        }
        let content = note.content.as_deref().unwrap_or_default();
        if content.trim().is_empty() {
            return Err(AppError::Validation("Note without content".to_string()));
        }

        let author = note
            .attributed_to
            .as_ref()
            .and_then(|a| a.first())
            .unwrap_or(activity.actor.as_str())
            .to_string();
        if author != activity.actor {
            return Err(AppError::Validation(format!(
                "Note attributed to {} but sent by {}",
                author, activity.actor
            )));
        }

        let (author_name, author_url) = match self.fetcher.fetch_actor(&author).await {
            Ok(actor) => (
                actor.display_name().to_string(),
                actor.url.clone().unwrap_or_else(|| author.clone()),
            ),
            Err(error) => {
                tracing::warn!(%error, author = %author, "Failed to fetch comment author");
                (author.clone(), author.clone())
            }
        };

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("noteId".to_string(), note.id.clone());

        let comment = Comment {
            id: comment_id(&note.id),
            activity_id: if activity.id.is_empty() {
                note.id.clone()
            } else {
                activity.id.clone()
            },
            in_reply_to: in_reply_to.to_string(),
            author,
            author_name,
            author_url,
            content: ammonia::clean(content),
            published: parse_timestamp(note.published.as_deref()).unwrap_or_else(Utc::now),
            updated: parse_timestamp(note.updated.as_deref()),
            verified: inbound.verified,
            approved: self.config.federation.auto_approve_comments,
            hidden: false,
            post_collection: collection,
            post_slug: slug,
            metadata,
        };

        if self.storage.save_comment(&comment).await? {
            tracing::info!(
                id = %comment.id,
                author = %comment.author_name,
                collection = %comment.post_collection,
                slug = %comment.post_slug,
                "Comment created"
            );
        } else {
            tracing::debug!(id = %comment.id, "Comment already stored");
        }
        Ok(())
    }
}
