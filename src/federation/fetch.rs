//! Remote document fetching
//!
//! Fetches actor documents from other servers with a bounded timeout.
//! Unless explicitly allowed, hosts that are local or private, or that
//! resolve to such addresses, are refused to limit SSRF exposure.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::metrics::FEDERATION_REQUESTS_TOTAL;

use super::types::{ACTIVITY_JSON, Actor, LD_JSON};

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve remote host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for remote host".to_string(),
        ));
    }

    Ok(())
}

/// Strip the fragment from an actor id or key id
pub fn document_url(id: &str) -> &str {
    id.split('#').next().unwrap_or(id)
}

/// Lower-cased host of an actor URL or key id
///
/// Rejects non-HTTP(S) URLs.
pub fn actor_host(actor_or_key_id: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(document_url(actor_or_key_id))
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    parsed
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))
}

/// Fetches remote actor documents
#[derive(Clone)]
pub struct RemoteFetcher {
    http_client: Arc<reqwest::Client>,
    timeout: Duration,
    allow_private_hosts: bool,
}

impl RemoteFetcher {
    pub fn new(http_client: Arc<reqwest::Client>, timeout: Duration, allow_private_hosts: bool) -> Self {
        Self {
            http_client,
            timeout,
            allow_private_hosts,
        }
    }

    /// Refuse URLs this server must not contact
    ///
    /// Applies to every outbound request: document fetches as well as
    /// signed deliveries to inboxes taken from remote documents.
    pub async fn check_destination(&self, url: &str) -> Result<(), AppError> {
        let host = actor_host(url)?;
        if self.allow_private_hosts {
            return Ok(());
        }

        if is_disallowed_host(&host) {
            tracing::warn!(url, "Refusing private or local destination");
            return Err(AppError::Forbidden);
        }

        let port = url::Url::parse(url)
            .ok()
            .and_then(|u| u.port_or_known_default())
            .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;
        validate_resolved_host_ips(&host, port).await
    }

    /// Inbox and shared inbox of `actor`, checked before they are stored
    ///
    /// A refused personal inbox fails the whole actor. A refused shared
    /// inbox is dropped so deliveries use the personal inbox instead.
    pub async fn delivery_endpoints(
        &self,
        actor: &Actor,
    ) -> Result<(String, Option<String>), AppError> {
        if actor.inbox.is_empty() {
            return Err(AppError::Federation(format!("Actor {} has no inbox", actor.id)));
        }
        self.check_destination(&actor.inbox).await?;

        let shared_inbox = match actor.shared_inbox() {
            Some(shared) => match self.check_destination(shared).await {
                Ok(()) => Some(shared.to_string()),
                Err(error) => {
                    tracing::warn!(%error, actor = %actor.id, shared, "Ignoring shared inbox");
                    None
                }
            },
            None => None,
        };
        Ok((actor.inbox.clone(), shared_inbox))
    }

    /// Fetch a JSON-LD document and decode it as `T`
    ///
    /// Any fragment (such as `#main-key`) is dropped before fetching.
    pub async fn fetch_document<T: DeserializeOwned>(&self, id: &str) -> Result<T, AppError> {
        let url = document_url(id);
        self.check_destination(url).await?;

        let response = self
            .http_client
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                format!("{}, {}", ACTIVITY_JSON, LD_JSON),
            )
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound", "error"])
                    .inc();
                AppError::Federation(format!("Failed to fetch {}: {}", url, e))
            })?;

        if !response.status().is_success() {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                url,
                response.status()
            )));
        }

        let document = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", url, e)))?;
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", "success"])
            .inc();
        Ok(document)
    }

    /// Fetch and parse the actor document behind `actor_id`
    pub async fn fetch_actor(&self, actor_id: &str) -> Result<Actor, AppError> {
        let actor: Actor = self.fetch_document(actor_id).await?;
        if actor.id.is_empty() {
            return Err(AppError::Federation(format!(
                "Actor {} has no id",
                document_url(actor_id)
            )));
        }
        Ok(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::types::Endpoints;

    fn fetcher(allow_private_hosts: bool) -> RemoteFetcher {
        RemoteFetcher::new(
            Arc::new(reqwest::Client::new()),
            Duration::from_secs(1),
            allow_private_hosts,
        )
    }

    #[test]
    fn document_url_drops_fragment() {
        assert_eq!(
            document_url("https://remote.example/users/carol#main-key"),
            "https://remote.example/users/carol"
        );
    }

    #[test]
    fn actor_host_rejects_other_schemes() {
        assert!(matches!(
            actor_host("ftp://remote.example/users/carol"),
            Err(AppError::Validation(_))
        ));
        assert_eq!(
            actor_host("https://Remote.Example/users/carol#main-key").unwrap(),
            "remote.example"
        );
    }

    #[tokio::test]
    async fn refuses_private_destinations_by_default() {
        for url in [
            "https://localhost/users/carol",
            "http://192.168.1.10/users/carol",
            "http://127.0.0.1:9/users/carol",
            "http://[::1]/users/carol",
        ] {
            assert!(
                matches!(fetcher(false).check_destination(url).await, Err(AppError::Forbidden)),
                "{url} should be refused"
            );
        }
    }

    #[tokio::test]
    async fn private_destinations_can_be_allowed() {
        assert!(
            fetcher(true)
                .check_destination("http://127.0.0.1:9/users/carol")
                .await
                .is_ok()
        );
    }

    fn actor(inbox: &str, shared_inbox: Option<&str>) -> Actor {
        Actor {
            id: "https://93.184.216.34/users/carol".to_string(),
            inbox: inbox.to_string(),
            endpoints: Some(Endpoints {
                shared_inbox: shared_inbox.map(str::to_string),
            }),
            ..Actor::default()
        }
    }

    #[tokio::test]
    async fn private_shared_inbox_is_dropped() {
        let (inbox, shared) = fetcher(false)
            .delivery_endpoints(&actor(
                "https://93.184.216.34/users/carol/inbox",
                Some("http://10.0.0.1/inbox"),
            ))
            .await
            .unwrap();
        assert_eq!(inbox, "https://93.184.216.34/users/carol/inbox");
        assert!(shared.is_none());
    }

    #[tokio::test]
    async fn private_inbox_fails_the_actor() {
        let result = fetcher(false)
            .delivery_endpoints(&actor("http://127.0.0.1:9/inbox", None))
            .await;
        assert!(matches!(result, Err(AppError::Forbidden)));

        let result = fetcher(false).delivery_endpoints(&actor("", None)).await;
        assert!(matches!(result, Err(AppError::Federation(_))));
    }
}
