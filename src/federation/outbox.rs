//! Outbound publication
//!
//! Turns local content events into Create/Update/Delete activities and fans
//! them out to the owning actor's followers. Also serves the outbox
//! collection documents.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::storage::Storage;

use super::actor::validate_username;
use super::delivery::{ActivityDelivery, DeliveryReport, builder, group_inboxes};
use super::types::{
    ACTIVITY_STREAMS_CONTEXT, Activity, Attribution, Object, OrderedCollection,
    OrderedCollectionPage, PUBLIC_COLLECTION, Source, Tag,
};

/// Outbox page size
pub const PAGE_SIZE: usize = 20;

/// A content item as supplied by the publishing side of the application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Post {
    pub title: String,
    /// Canonical URL; doubles as the Article id
    pub url: String,
    pub html_content: String,
    /// Markup the HTML was rendered from, if any
    #[serde(default)]
    pub source_markup: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Usernames credited on the post, primary author first
    #[serde(default)]
    pub authors: Vec<String>,
    pub collection: String,
}

/// Either the collection summary or one page of it
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboxDocument {
    Summary(OrderedCollection),
    Page(OrderedCollectionPage),
}

/// Parse the `page` query parameter
///
/// # Errors
/// `Validation` unless the value is an integer of at least 1
pub fn parse_page(page: Option<&str>) -> Result<Option<usize>, AppError> {
    match page {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Some(n)),
            _ => Err(AppError::Validation(format!("Invalid page parameter: {}", raw))),
        },
    }
}

fn collection_summary(outbox_uri: &str, total_items: usize) -> OrderedCollection {
    OrderedCollection {
        context: Value::from(ACTIVITY_STREAMS_CONTEXT),
        id: outbox_uri.to_string(),
        kind: "OrderedCollection".to_string(),
        total_items,
        ordered_items: None,
        first: Some(format!("{}?page=1", outbox_uri)),
        last: (total_items > 0).then(|| format!("{}?page={}", outbox_uri, total_items / PAGE_SIZE + 1)),
    }
}

fn collection_page(outbox_uri: &str, page: usize, items: Vec<Value>) -> OrderedCollectionPage {
    OrderedCollectionPage {
        context: Value::from(ACTIVITY_STREAMS_CONTEXT),
        id: format!("{}?page={}", outbox_uri, page),
        kind: "OrderedCollectionPage".to_string(),
        part_of: outbox_uri.to_string(),
        prev: (page > 1).then(|| format!("{}?page={}", outbox_uri, page - 1)),
        next: (items.len() == PAGE_SIZE).then(|| format!("{}?page={}", outbox_uri, page + 1)),
        ordered_items: items,
    }
}

pub struct OutboxService {
    config: Arc<AppConfig>,
    storage: Arc<Storage>,
    delivery: ActivityDelivery,
}

impl OutboxService {
    pub fn new(config: Arc<AppConfig>, storage: Arc<Storage>, delivery: ActivityDelivery) -> Self {
        Self {
            config,
            storage,
            delivery,
        }
    }

    /// Local user that sends activities for content in `collection`
    ///
    /// Explicit collection owner, then the first listed author that is a
    /// configured user, then the primary user.
    pub fn resolve_actor(&self, collection: &str, authors: &[String]) -> Option<String> {
        let owner = self
            .config
            .collections
            .get(collection)
            .and_then(|c| c.owner.as_deref())
            .filter(|owner| self.config.has_user(owner));
        if let Some(owner) = owner {
            return Some(owner.to_string());
        }

        if let Some(author) = authors.iter().find(|a| self.config.has_user(a)) {
            if authors.first() != Some(author) {
                tracing::warn!(authors = ?authors, using = %author, "Primary author is not a local user");
            }
            return Some(author.clone());
        }

        self.config.primary_user().map(str::to_string)
    }

    /// Local users credited on a post, falling back to the sending actor
    fn credited_users(&self, post: &Post, actor: &str) -> Vec<String> {
        let mut users: Vec<String> = Vec::new();
        for author in &post.authors {
            if self.config.has_user(author) && !users.contains(author) {
                users.push(author.clone());
            }
        }
        if users.is_empty() {
            users.push(actor.to_string());
        }
        users
    }

    /// Article object for a post, addressed to the public and the authors' followers
    pub fn build_article(&self, post: &Post, actor: &str, updated: Option<DateTime<Utc>>) -> Object {
        let credited = self.credited_users(post, actor);
        let mut attributed: Vec<String> = credited
            .iter()
            .map(|user| self.config.actor_uri(user))
            .collect();
        let cc = attributed.iter().map(|uri| format!("{}/followers", uri)).collect();
        let attributed_to = if attributed.len() == 1 {
            Attribution::One(attributed.remove(0))
        } else {
            Attribution::Many(attributed)
        };

        Object {
            id: post.url.clone(),
            kind: "Article".to_string(),
            name: Some(post.title.clone()),
            summary: post.summary.clone().filter(|s| !s.is_empty()),
            content: Some(post.html_content.clone()),
            media_type: Some("text/html".to_string()),
            url: Some(post.url.clone()),
            attributed_to: Some(attributed_to),
            published: Some(post.published_at.to_rfc3339()),
            updated: updated.map(|t| t.to_rfc3339()),
            to: vec![PUBLIC_COLLECTION.to_string()],
            cc,
            tag: post
                .tags
                .iter()
                .map(|tag| Tag {
                    kind: "Hashtag".to_string(),
                    name: format!("#{}", tag.trim_start_matches('#')),
                    href: None,
                })
                .collect(),
            source: post
                .source_markup
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|content| Source {
                    content: content.clone(),
                    media_type: "text/markdown".to_string(),
                }),
            ..Object::default()
        }
    }

    /// Actor for a post, or `None` when its collection does not federate
    fn sender(&self, collection: &str, authors: &[String]) -> Result<Option<String>, AppError> {
        if !self.config.collection_federates(collection) {
            tracing::info!(collection, "Federation disabled for collection, skipping");
            return Ok(None);
        }
        self.resolve_actor(collection, authors)
            .map(Some)
            .ok_or_else(|| AppError::Config(format!("No local user can send for {}", collection)))
    }

    /// Announce a newly published post with a Create
    pub async fn publish_post(&self, post: &Post) -> Result<Option<DeliveryReport>, AppError> {
        let Some(username) = self.sender(&post.collection, &post.authors)? else {
            return Ok(None);
        };
        let actor = self.config.actor_uri(&username);
        let article = self.build_article(post, &actor, None);
        let activity = builder::create(&builder::activity_id(&actor), &actor, article);

        let report = self.deliver_to_followers(&username, &activity).await?;
        tracing::info!(title = %post.title, url = %post.url, actor = %actor, "Post published");
        Ok(Some(report))
    }

    /// Announce changes to a post with an Update
    pub async fn update_post(&self, post: &Post) -> Result<Option<DeliveryReport>, AppError> {
        let Some(username) = self.sender(&post.collection, &post.authors)? else {
            return Ok(None);
        };
        let actor = self.config.actor_uri(&username);
        let article = self.build_article(post, &actor, Some(Utc::now()));
        let activity = builder::update(&builder::activity_id(&actor), &actor, article);

        let report = self.deliver_to_followers(&username, &activity).await?;
        tracing::info!(title = %post.title, url = %post.url, actor = %actor, "Post update published");
        Ok(Some(report))
    }

    /// Announce removal of a post with a Delete naming its URL
    pub async fn delete_post(&self, post: &Post) -> Result<Option<DeliveryReport>, AppError> {
        let Some(username) = self.sender(&post.collection, &post.authors)? else {
            return Ok(None);
        };
        let actor = self.config.actor_uri(&username);
        let activity = builder::delete(
            &builder::activity_id(&actor),
            &actor,
            &post.url,
            vec![PUBLIC_COLLECTION.to_string()],
            vec![format!("{}/followers", actor)],
        );

        let report = self.deliver_to_followers(&username, &activity).await?;
        tracing::info!(url = %post.url, actor = %actor, "Post deletion published");
        Ok(Some(report))
    }

    /// One signed delivery per distinct inbox among `username`'s current followers
    async fn deliver_to_followers(
        &self,
        username: &str,
        activity: &Activity,
    ) -> Result<DeliveryReport, AppError> {
        let followers = self.storage.followers(username).await?;
        let inboxes = group_inboxes(followers.values());
        if inboxes.is_empty() {
            tracing::info!(username, "No followers to deliver to");
            return Ok(DeliveryReport {
                activity_id: activity.id.clone(),
                results: Vec::new(),
            });
        }

        tracing::debug!(
            username,
            followers = followers.len(),
            inboxes = inboxes.len(),
            "Delivering to followers"
        );
        self.delivery.deliver_to_inboxes(username, activity, inboxes).await
    }

    fn outbox_document(&self, outbox_uri: &str, page: Option<usize>) -> OutboxDocument {
        // Published activities are not retained, so the collection is always empty.
        match page {
            None => OutboxDocument::Summary(collection_summary(outbox_uri, 0)),
            Some(page) => OutboxDocument::Page(collection_page(outbox_uri, page, Vec::new())),
        }
    }

    /// Outbox of one local user
    pub fn user_outbox(&self, username: &str, page: Option<&str>) -> Result<OutboxDocument, AppError> {
        validate_username(username)?;
        if !self.config.has_user(username) {
            return Err(AppError::NotFound);
        }
        let page = parse_page(page)?;
        let uri = format!("{}/outbox", self.config.actor_uri(username));
        Ok(self.outbox_document(&uri, page))
    }

    /// Server-wide outbox
    pub fn server_outbox(&self, page: Option<&str>) -> Result<OutboxDocument, AppError> {
        let page = parse_page(page)?;
        let uri = format!("{}/outbox", self.config.server.base_url());
        Ok(self.outbox_document(&uri, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::data::Follower;
    use crate::federation::fetch::RemoteFetcher;
    use crate::federation::signature::KeyManager;
    use crate::storage::SecretBox;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn service_with(dir: &TempDir, config: AppConfig) -> OutboxService {
        let storage = Arc::new(
            Storage::local(
                dir.path(),
                SecretBox::from_master_key("outbox test key").unwrap(),
                Duration::from_secs(600),
            )
            .await
            .unwrap(),
        );
        let client = Arc::new(reqwest::Client::new());
        let fetcher = RemoteFetcher::new(Arc::clone(&client), Duration::from_secs(1), false);
        let keys = Arc::new(KeyManager::new(Arc::clone(&storage), fetcher.clone(), 1024));
        let delivery = ActivityDelivery::new(client, keys, fetcher, Duration::from_secs(1), 4);
        OutboxService::new(Arc::new(config), storage, delivery)
    }

    fn post(collection: &str, authors: &[&str]) -> Post {
        Post {
            title: "Hello".to_string(),
            url: format!("https://example.com/{}/hello", collection),
            html_content: "<p>Hello world</p>".to_string(),
            source_markup: Some("Hello world".to_string()),
            summary: Some("Greeting".to_string()),
            published_at: DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            tags: vec!["rust".to_string(), "#web".to_string()],
            authors: authors.iter().map(|a| a.to_string()).collect(),
            collection: collection.to_string(),
        }
    }

    #[test]
    fn page_parameter_must_be_positive_integer() {
        assert_eq!(parse_page(None).unwrap(), None);
        assert_eq!(parse_page(Some("3")).unwrap(), Some(3));
        for bad in ["0", "-1", "two", ""] {
            assert!(matches!(parse_page(Some(bad)), Err(AppError::Validation(_))), "{bad}");
        }
    }

    #[test]
    fn summary_links_last_page_only_when_populated() {
        let empty = collection_summary("https://example.com/outbox", 0);
        assert_eq!(empty.first.as_deref(), Some("https://example.com/outbox?page=1"));
        assert!(empty.last.is_none());

        let full = collection_summary("https://example.com/outbox", 45);
        assert_eq!(full.last.as_deref(), Some("https://example.com/outbox?page=3"));
    }

    #[test]
    fn page_links_neighbours() {
        let first = collection_page("https://example.com/outbox", 1, Vec::new());
        assert_eq!(first.id, "https://example.com/outbox?page=1");
        assert_eq!(first.part_of, "https://example.com/outbox");
        assert!(first.prev.is_none());
        assert!(first.next.is_none());

        let items = vec![Value::from("x"); PAGE_SIZE];
        let second = collection_page("https://example.com/outbox", 2, items);
        assert_eq!(second.prev.as_deref(), Some("https://example.com/outbox?page=1"));
        assert_eq!(second.next.as_deref(), Some("https://example.com/outbox?page=3"));
    }

    #[tokio::test]
    async fn actor_resolution_order() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, valid_config()).await;

        let authors = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        assert_eq!(service.resolve_actor("team", &authors(&["alice"])).as_deref(), Some("bob"));
        assert_eq!(service.resolve_actor("blog", &authors(&["bob"])).as_deref(), Some("bob"));
        assert_eq!(
            service.resolve_actor("blog", &authors(&["mallory", "bob"])).as_deref(),
            Some("bob")
        );
        assert_eq!(service.resolve_actor("blog", &[]).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn article_credits_all_local_authors() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, valid_config()).await;

        let article = service.build_article(
            &post("blog", &["alice", "mallory", "bob"]),
            "https://example.com/users/alice",
            None,
        );
        assert_eq!(article.kind, "Article");
        assert_eq!(article.id, "https://example.com/blog/hello");
        assert_eq!(
            article.attributed_to,
            Some(Attribution::Many(vec![
                "https://example.com/users/alice".to_string(),
                "https://example.com/users/bob".to_string(),
            ]))
        );
        assert_eq!(article.to, vec![PUBLIC_COLLECTION.to_string()]);
        assert_eq!(
            article.cc,
            vec![
                "https://example.com/users/alice/followers".to_string(),
                "https://example.com/users/bob/followers".to_string(),
            ]
        );
        let tags: Vec<&str> = article.tag.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tags, ["#rust", "#web"]);
        assert_eq!(article.source.unwrap().media_type, "text/markdown");
        assert!(article.updated.is_none());
    }

    #[tokio::test]
    async fn article_without_local_authors_credits_sender() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, valid_config()).await;

        let mut anonymous = post("blog", &[]);
        anonymous.source_markup = None;
        let article = service.build_article(&anonymous, "https://example.com/users/alice", Some(Utc::now()));
        assert_eq!(
            article.attributed_to,
            Some(Attribution::One("https://example.com/users/alice".to_string()))
        );
        assert!(article.source.is_none());
        assert!(article.updated.is_some());
    }

    #[tokio::test]
    async fn non_federating_collections_are_skipped() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, valid_config()).await;

        assert!(service.publish_post(&post("drafts", &["alice"])).await.unwrap().is_none());
        assert!(service.delete_post(&post("drafts", &["alice"])).await.unwrap().is_none());

        let mut disabled = valid_config();
        disabled.federation.enabled = false;
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, disabled).await;
        assert!(service.update_post(&post("blog", &["alice"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_without_followers_attempts_nothing() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, valid_config()).await;

        let report = service.publish_post(&post("blog", &["alice"])).await.unwrap().unwrap();
        assert_eq!(report.attempted(), 0);
        assert!(report.activity_id.starts_with("https://example.com/users/alice/activities/"));
    }

    #[tokio::test]
    async fn publish_refuses_private_inboxes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = axum::Router::new().route(
            "/internal-admin",
            axum::routing::post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { http::StatusCode::ACCEPTED }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, valid_config()).await;
        let actor = "https://remote.example/users/carol".to_string();
        let follower = Follower {
            actor_id: actor.clone(),
            inbox: format!("http://127.0.0.1:{}/internal-admin", port),
            shared_inbox: None,
            domain: "remote.example".to_string(),
            username: "carol".to_string(),
            accepted_at: Utc::now(),
        };
        service
            .storage
            .update_followers("alice", |followers| {
                followers.insert(actor, follower);
            })
            .await
            .unwrap();

        let report = service.publish_post(&post("blog", &["alice"])).await.unwrap().unwrap();
        assert_eq!(report.attempted(), 1);
        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.failed(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn outbox_documents() {
        let dir = TempDir::new().unwrap();
        let service = service_with(&dir, valid_config()).await;

        let summary = serde_json::to_value(service.user_outbox("alice", None).unwrap()).unwrap();
        assert_eq!(summary["type"], "OrderedCollection");
        assert_eq!(summary["id"], "https://example.com/users/alice/outbox");
        assert_eq!(summary["totalItems"], 0);
        assert_eq!(summary["first"], "https://example.com/users/alice/outbox?page=1");
        assert!(summary.get("last").is_none());

        let page = serde_json::to_value(service.server_outbox(Some("2")).unwrap()).unwrap();
        assert_eq!(page["type"], "OrderedCollectionPage");
        assert_eq!(page["partOf"], "https://example.com/outbox");
        assert_eq!(page["prev"], "https://example.com/outbox?page=1");
        assert_eq!(page["orderedItems"], serde_json::json!([]));

        assert!(matches!(service.user_outbox("mallory", None), Err(AppError::NotFound)));
        assert!(matches!(
            service.user_outbox("alice", Some("x")),
            Err(AppError::Validation(_))
        ));
    }
}
