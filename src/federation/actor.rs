//! Local actor documents
//!
//! Discovery, actor profiles and the followers/following collections of
//! configured users.

use std::sync::Arc;

use serde_json::Value;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::storage::Storage;

use super::signature::KeyManager;
use super::types::{
    ACTIVITY_STREAMS_CONTEXT, Actor, Endpoints, Image, OrderedCollection, PublicKey,
    default_context,
};
use super::webfinger::{WebFingerResponse, generate_webfinger_response, parse_acct_resource};

/// Reject usernames that cannot name a local actor
pub fn validate_username(username: &str) -> Result<(), AppError> {
    let valid = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !username.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid username: {:?}", username)))
    }
}

/// Strip a `:port` suffix from a Host header value
fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map_or(host, |(h, _)| h).trim_start_matches('[');
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(h, _)| h)
}

pub struct ActorService {
    config: Arc<AppConfig>,
    storage: Arc<Storage>,
    keys: Arc<KeyManager>,
}

impl ActorService {
    pub fn new(config: Arc<AppConfig>, storage: Arc<Storage>, keys: Arc<KeyManager>) -> Self {
        Self {
            config,
            storage,
            keys,
        }
    }

    /// Confirm `username` names a configured local user
    ///
    /// Malformed names fail with `Validation`, unknown ones with `NotFound`.
    pub fn ensure_user(&self, username: &str) -> Result<(), AppError> {
        validate_username(username)?;
        if self.config.has_user(username) {
            Ok(())
        } else {
            Err(AppError::NotFound)
        }
    }

    pub fn actor_uri(&self, username: &str) -> String {
        self.config.actor_uri(username)
    }

    /// Resolve an `acct:` resource
    ///
    /// The resource domain must be the host the request was addressed to,
    /// or the configured domain when the request carried no Host header.
    pub fn discover(
        &self,
        resource: &str,
        request_host: Option<&str>,
    ) -> Result<WebFingerResponse, AppError> {
        let acct = parse_acct_resource(resource)?;
        let domain = acct.domain.to_ascii_lowercase();

        let domain_matches = match request_host {
            Some(host) => {
                let host = host.to_ascii_lowercase();
                domain == host || domain == host_without_port(&host)
            }
            None => domain == self.config.server.domain.to_ascii_lowercase(),
        };
        if !domain_matches {
            return Err(AppError::Validation(format!(
                "Resource domain {} is not served here",
                acct.domain
            )));
        }

        self.ensure_user(acct.username)?;
        Ok(generate_webfinger_response(
            acct.username,
            acct.domain,
            &self.actor_uri(acct.username),
        ))
    }

    /// Actor document of a local user, public key embedded
    pub async fn actor_document(&self, username: &str) -> Result<Actor, AppError> {
        self.ensure_user(username)?;
        let actor_uri = self.actor_uri(username);
        let pair = self.keys.initialize(username, &actor_uri).await?;

        let profile = self.config.users.get(username).cloned().unwrap_or_default();
        let federation = &self.config.federation;
        let image = |url: &Option<String>| {
            url.as_ref().map(|url| Image {
                kind: "Image".to_string(),
                url: url.clone(),
                media_type: None,
            })
        };

        Ok(Actor {
            context: Some(default_context()),
            id: actor_uri.clone(),
            kind: "Person".to_string(),
            preferred_username: username.to_string(),
            name: Some(profile.display_name.unwrap_or_else(|| username.to_string())),
            summary: Some(profile.bio.unwrap_or_default()),
            url: Some(actor_uri.clone()),
            inbox: format!("{}/inbox", actor_uri),
            outbox: format!("{}/outbox", actor_uri),
            followers: format!("{}/followers", actor_uri),
            following: format!("{}/following", actor_uri),
            endpoints: Some(Endpoints {
                shared_inbox: Some(format!("{}/inbox", self.config.server.base_url())),
            }),
            public_key: Some(PublicKey {
                id: pair.key_id,
                owner: actor_uri,
                public_key_pem: pair.public_key_pem,
            }),
            manually_approves_followers: Some(false),
            discoverable: Some(true),
            icon: image(&federation.icon_url),
            image: image(&federation.banner_url),
        })
    }

    /// Minimal HTML profile for browsers
    pub fn profile_html(&self, username: &str) -> Result<String, AppError> {
        self.ensure_user(username)?;
        let profile = self.config.users.get(username).cloned().unwrap_or_default();
        let name = profile.display_name.unwrap_or_else(|| username.to_string());
        let name = html_escape::encode_text(&name);
        let bio = html_escape::encode_text(profile.bio.as_deref().unwrap_or_default());
        let handle = html_escape::encode_text(username);
        let domain = html_escape::encode_text(&self.config.server.domain);

        Ok(format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{name}</title></head>\n\
             <body>\n<h1>{name}</h1>\n<p>@{handle}@{domain}</p>\n<p>{bio}</p>\n</body>\n</html>\n"
        ))
    }

    /// Followers collection, unpaged
    pub async fn followers_collection(&self, username: &str) -> Result<OrderedCollection, AppError> {
        self.ensure_user(username)?;
        let ids = self.storage.followers(username).await?.into_keys();
        Ok(self.id_collection(format!("{}/followers", self.actor_uri(username)), ids))
    }

    /// Following collection, unpaged. Pending follows are not listed.
    pub async fn following_collection(&self, username: &str) -> Result<OrderedCollection, AppError> {
        self.ensure_user(username)?;
        let ids = self
            .storage
            .following(username)
            .await?
            .into_values()
            .filter(|f| !f.is_pending())
            .map(|f| f.actor_id);
        Ok(self.id_collection(format!("{}/following", self.actor_uri(username)), ids))
    }

    fn id_collection(
        &self,
        id: String,
        ids: impl Iterator<Item = String>,
    ) -> OrderedCollection {
        let items: Vec<Value> = ids.map(Value::String).collect();
        OrderedCollection {
            context: Value::from(ACTIVITY_STREAMS_CONTEXT),
            id,
            kind: "OrderedCollection".to_string(),
            total_items: items.len(),
            ordered_items: Some(items),
            first: None,
            last: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::data::Follower;
    use crate::federation::fetch::RemoteFetcher;
    use crate::storage::SecretBox;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> ActorService {
        service_with(dir, valid_config()).await
    }

    async fn service_with(dir: &TempDir, config: AppConfig) -> ActorService {
        let config = Arc::new(config);
        let storage = Arc::new(
            Storage::local(
                dir.path(),
                SecretBox::from_master_key("actor test key").unwrap(),
                Duration::from_secs(600),
            )
            .await
            .unwrap(),
        );
        let fetcher = RemoteFetcher::new(
            Arc::new(reqwest::Client::new()),
            Duration::from_secs(1),
            false,
        );
        let keys = Arc::new(KeyManager::new(Arc::clone(&storage), fetcher, 1024));
        ActorService::new(config, storage, keys)
    }

    #[test]
    fn username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a.b-c_d").is_ok());
        for bad in ["", "../alice", ".hidden", "al ice", "alice/inbox"] {
            assert!(validate_username(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn host_port_is_stripped() {
        assert_eq!(host_without_port("example.com:8080"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:80"), "::1");
    }

    #[tokio::test]
    async fn discovery_checks_request_host() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let found = service
            .discover("acct:alice@example.com", Some("example.com"))
            .unwrap();
        assert_eq!(found.links[0].href.as_deref(), Some("https://example.com/users/alice"));

        assert!(matches!(
            service.discover("acct:alice@example.com", Some("other.com")),
            Err(AppError::Validation(_))
        ));
        assert!(service.discover("acct:alice@example.com", None).is_ok());
        assert!(service.discover("acct:alice@example.com", Some("example.com:443")).is_ok());
        assert!(matches!(
            service.discover("acct:nobody@example.com", Some("example.com")),
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            service.discover("alice@example.com", Some("example.com")),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn actor_document_embeds_key_and_collections() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let actor = service.actor_document("alice").await.unwrap();
        assert_eq!(actor.id, "https://example.com/users/alice");
        assert_eq!(actor.kind, "Person");
        assert_eq!(actor.name.as_deref(), Some("Alice"));
        assert_eq!(actor.inbox, "https://example.com/users/alice/inbox");
        assert_eq!(actor.followers, "https://example.com/users/alice/followers");
        assert_eq!(actor.shared_inbox(), Some("https://example.com/inbox"));

        let key = actor.public_key.unwrap();
        assert_eq!(key.id, "https://example.com/users/alice#main-key");
        assert_eq!(key.owner, actor.id);
        assert!(key.public_key_pem.contains("BEGIN PUBLIC KEY"));

        assert!(matches!(
            service.actor_document("mallory").await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn followers_collection_lists_actor_ids() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        service
            .storage
            .update_followers("alice", |map| {
                map.insert(
                    "https://remote.example/users/carol".to_string(),
                    Follower {
                        actor_id: "https://remote.example/users/carol".to_string(),
                        inbox: "https://remote.example/users/carol/inbox".to_string(),
                        shared_inbox: None,
                        domain: "remote.example".to_string(),
                        username: "carol".to_string(),
                        accepted_at: chrono::Utc::now(),
                    },
                );
            })
            .await
            .unwrap();

        let collection = service.followers_collection("alice").await.unwrap();
        assert_eq!(collection.id, "https://example.com/users/alice/followers");
        assert_eq!(collection.total_items, 1);
        assert_eq!(
            collection.ordered_items.unwrap(),
            vec![Value::from("https://remote.example/users/carol")]
        );

        let following = service.following_collection("bob").await.unwrap();
        assert_eq!(following.total_items, 0);
    }

    #[tokio::test]
    async fn profile_html_escapes_names() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config();
        config.users.get_mut("alice").unwrap().display_name =
            Some("<script>alert(1)</script>".to_string());
        let service = service_with(&dir, config).await;

        let html = service.profile_html("alice").unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("@alice@example.com"));
    }
}
