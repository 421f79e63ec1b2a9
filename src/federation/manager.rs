//! Federation composition root
//!
//! Builds the federation services once per process and exposes the narrow
//! surface the rest of the application needs: publish hooks, comments,
//! the enabled flag and the services behind the HTTP routes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::AppConfig;
use crate::data::{
    Comment, FederationMetadata, Following, NodeInfo, NodeInfoServices, NodeInfoSoftware,
    NodeInfoUsage, NodeInfoUsers,
};
use crate::error::AppError;
use crate::storage::Storage;

use super::actor::ActorService;
use super::delivery::{ActivityDelivery, DeliveryReport, builder};
use super::fetch::{RemoteFetcher, actor_host};
use super::inbox::InboxService;
use super::outbox::{OutboxService, Post};
use super::signature::KeyManager;

/// Services that exist only while federation is enabled
struct Federation {
    storage: Arc<Storage>,
    keys: Arc<KeyManager>,
    fetcher: RemoteFetcher,
    delivery: ActivityDelivery,
    actors: ActorService,
    inbox: InboxService,
    outbox: OutboxService,
}

pub struct FederationManager {
    config: Arc<AppConfig>,
    inner: Option<Federation>,
}

impl FederationManager {
    /// Open storage and initialize keys for every configured user
    ///
    /// Returns a disabled manager when federation is switched off.
    pub async fn new(
        config: Arc<AppConfig>,
        http_client: Arc<reqwest::Client>,
    ) -> Result<Self, AppError> {
        if !config.federation.enabled {
            tracing::info!("Federation is disabled");
            return Ok(Self::disabled(config));
        }

        let storage = Storage::open(&config).await?;
        Self::with_storage(config, http_client, storage).await
    }

    /// Build the services on an already opened store
    pub async fn with_storage(
        config: Arc<AppConfig>,
        http_client: Arc<reqwest::Client>,
        storage: Storage,
    ) -> Result<Self, AppError> {
        tracing::info!("Initializing federation services");
        let federation = &config.federation;
        let storage = Arc::new(storage);

        let fetcher = RemoteFetcher::new(
            Arc::clone(&http_client),
            Duration::from_secs(federation.fetch_timeout_seconds),
            federation.allow_private_hosts,
        );
        let keys = Arc::new(KeyManager::new(
            Arc::clone(&storage),
            fetcher.clone(),
            federation.key_bits,
        ));
        let delivery = ActivityDelivery::new(
            http_client,
            Arc::clone(&keys),
            fetcher.clone(),
            Duration::from_secs(federation.delivery_timeout_seconds),
            federation.max_concurrent_deliveries,
        );

        for username in config.users.keys() {
            keys.initialize(username, &config.actor_uri(username)).await?;
        }
        Self::seed_metadata(&config, &storage).await?;

        let inner = Federation {
            actors: ActorService::new(Arc::clone(&config), Arc::clone(&storage), Arc::clone(&keys)),
            inbox: InboxService::new(
                Arc::clone(&config),
                Arc::clone(&storage),
                Arc::clone(&keys),
                fetcher.clone(),
                delivery.clone(),
            ),
            outbox: OutboxService::new(Arc::clone(&config), Arc::clone(&storage), delivery.clone()),
            storage,
            keys,
            fetcher,
            delivery,
        };

        tracing::info!(users = config.users.len(), "Federation services initialized");
        Ok(Self {
            config,
            inner: Some(inner),
        })
    }

    pub fn disabled(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            inner: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    async fn seed_metadata(config: &AppConfig, storage: &Storage) -> Result<(), AppError> {
        if storage.load_metadata().await?.is_some() {
            return Ok(());
        }

        let mut metadata = FederationMetadata {
            instance_name: config.instance.title.clone(),
            instance_description: config.instance.description.clone(),
            admin_email: config.instance.contact_email.clone(),
            settings: Default::default(),
            updated_at: Utc::now(),
        };
        storage.save_metadata(&mut metadata).await?;
        tracing::info!(instance = %metadata.instance_name, "Seeded federation metadata");
        Ok(())
    }

    /// Enabled services, or `NotFound` so that routes answer 404 when disabled
    fn enabled(&self) -> Result<&Federation, AppError> {
        self.inner.as_ref().ok_or(AppError::NotFound)
    }

    pub fn actors(&self) -> Result<&ActorService, AppError> {
        Ok(&self.enabled()?.actors)
    }

    pub fn inbox(&self) -> Result<&InboxService, AppError> {
        Ok(&self.enabled()?.inbox)
    }

    pub fn outbox(&self) -> Result<&OutboxService, AppError> {
        Ok(&self.enabled()?.outbox)
    }

    // =========================================================================
    // Publication hooks
    // =========================================================================

    pub async fn publish_post(&self, post: &Post) -> Result<Option<DeliveryReport>, AppError> {
        match &self.inner {
            Some(federation) => federation.outbox.publish_post(post).await,
            None => Ok(None),
        }
    }

    pub async fn update_post(&self, post: &Post) -> Result<Option<DeliveryReport>, AppError> {
        match &self.inner {
            Some(federation) => federation.outbox.update_post(post).await,
            None => Ok(None),
        }
    }

    pub async fn delete_post(&self, post: &Post) -> Result<Option<DeliveryReport>, AppError> {
        match &self.inner {
            Some(federation) => federation.outbox.delete_post(post).await,
            None => Ok(None),
        }
    }

    // =========================================================================
    // Social graph
    // =========================================================================

    /// Send a Follow from `username` to a remote actor
    ///
    /// The entry stays pending until the remote side answers with Accept.
    /// If the Follow cannot be delivered, the pending entry is removed again.
    pub async fn follow(&self, username: &str, remote_actor: &str) -> Result<Following, AppError> {
        let federation = self.enabled()?;
        federation.actors.ensure_user(username)?;

        let existing = federation.storage.following(username).await?;
        if let Some(entry) = existing.get(remote_actor).filter(|e| !e.is_pending()) {
            tracing::debug!(username, followed = %remote_actor, "Already following");
            return Ok(entry.clone());
        }

        let remote = federation.fetcher.fetch_actor(remote_actor).await?;
        let (inbox, shared_inbox) = federation.fetcher.delivery_endpoints(&remote).await?;

        let local_actor = self.config.actor_uri(username);
        let activity = builder::follow(&builder::activity_id(&local_actor), &local_actor, &remote.id);
        let entry = Following {
            actor_id: remote.id.clone(),
            inbox,
            shared_inbox,
            domain: actor_host(&remote.id)?,
            username: remote.preferred_username.clone(),
            follow_activity_id: Some(activity.id.clone()),
            followed_at: None,
        };

        let recorded = entry.clone();
        federation
            .storage
            .update_following(username, |following| {
                following.insert(recorded.actor_id.clone(), recorded);
            })
            .await?;

        if let Err(error) = federation
            .delivery
            .deliver_to_inbox(username, &entry.inbox, &activity)
            .await
        {
            federation
                .storage
                .update_following(username, |following| following.remove(&entry.actor_id))
                .await?;
            return Err(error);
        }

        tracing::info!(username, followed = %entry.actor_id, "Follow sent");
        Ok(entry)
    }

    // =========================================================================
    // Comments
    // =========================================================================

    /// Comments on one content item; empty when federation is disabled
    pub async fn get_comments(&self, collection: &str, slug: &str) -> Result<Vec<Comment>, AppError> {
        match &self.inner {
            Some(federation) => federation.storage.load_comments(collection, slug).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn all_comments(&self) -> Result<Vec<Comment>, AppError> {
        match &self.inner {
            Some(federation) => federation.storage.load_all_comments().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn moderate_comment(
        &self,
        collection: &str,
        slug: &str,
        id: &str,
        approved: bool,
        hidden: bool,
    ) -> Result<Comment, AppError> {
        let comment = self
            .enabled()?
            .storage
            .moderate_comment(collection, slug, id, approved, hidden)
            .await?;
        tracing::info!(id, approved, hidden, "Comment moderated");
        Ok(comment)
    }

    // =========================================================================
    // Instance
    // =========================================================================

    pub async fn metadata(&self) -> Result<Option<FederationMetadata>, AppError> {
        self.enabled()?.storage.load_metadata().await
    }

    /// Replace instance metadata (last write wins)
    pub async fn update_metadata(
        &self,
        mut metadata: FederationMetadata,
    ) -> Result<FederationMetadata, AppError> {
        self.enabled()?.storage.save_metadata(&mut metadata).await?;
        Ok(metadata)
    }

    /// NodeInfo 2.0 description of this instance
    pub async fn node_info(&self) -> Result<NodeInfo, AppError> {
        let (name, description) = match self.metadata().await? {
            Some(metadata) => (metadata.instance_name, metadata.instance_description),
            None => (
                self.config.instance.title.clone(),
                self.config.instance.description.clone(),
            ),
        };

        Ok(NodeInfo {
            version: "2.0".to_string(),
            software: NodeInfoSoftware {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocols: vec!["activitypub".to_string()],
            services: NodeInfoServices::default(),
            open_registrations: false,
            usage: NodeInfoUsage {
                users: NodeInfoUsers {
                    total: self.config.users.len() as u64,
                },
                local_posts: 0,
            },
            metadata: serde_json::json!({
                "nodeName": name,
                "nodeDescription": description,
            }),
        })
    }

    /// Replace the key pair of every configured user
    ///
    /// Remote servers holding a cached copy of an old key will fail to
    /// verify until their cache expires.
    pub async fn force_regenerate_keys(&self) -> Result<Vec<String>, AppError> {
        let federation = self.enabled()?;
        let mut regenerated = Vec::new();
        for username in self.config.users.keys() {
            federation
                .keys
                .regenerate(username, &self.config.actor_uri(username))
                .await?;
            regenerated.push(username.clone());
        }
        tracing::warn!(users = ?regenerated, "Regenerated signing keys");
        Ok(regenerated)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the background commit task
    pub fn spawn_committer(&self) -> Option<tokio::task::JoinHandle<()>> {
        let federation = self.inner.as_ref()?;
        let handle = tokio::spawn(federation.storage.committer().run());
        tracing::info!(
            interval_seconds = self.config.storage.commit_interval_seconds,
            "Federation commit task spawned"
        );
        Some(handle)
    }

    /// Commit pending changes and release storage
    pub async fn close(&self) -> Result<(), AppError> {
        let Some(federation) = &self.inner else {
            return Ok(());
        };
        tracing::info!("Shutting down federation services");
        federation.storage.close().await
    }
}
