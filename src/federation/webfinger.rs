//! WebFinger protocol implementation
//!
//! Used to resolve `acct:user@domain` resources to local actor URIs.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

use super::types::ACTIVITY_JSON;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Account named by an `acct:` resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcctResource<'a> {
    pub username: &'a str,
    pub domain: &'a str,
}

/// Split `acct:user@domain` into its parts
///
/// # Errors
/// `Validation` when the scheme is missing or either part is empty.
pub fn parse_acct_resource(resource: &str) -> Result<AcctResource<'_>, AppError> {
    let acct = resource
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::Validation("Resource must start with 'acct:'".to_string()))?;

    match acct.split_once('@') {
        Some((username, domain))
            if !username.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(AcctResource { username, domain })
        }
        _ => Err(AppError::Validation("Invalid acct format".to_string())),
    }
}

/// Generate WebFinger response for a local account.
///
/// The only link is the actor document.
pub fn generate_webfinger_response(username: &str, domain: &str, actor_uri: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: vec![actor_uri.to_string()],
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_uri.to_string()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_acct_resource() {
        let parsed = parse_acct_resource("acct:alice@example.com").unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.domain, "example.com");
    }

    #[test]
    fn rejects_malformed_resources() {
        for resource in [
            "alice@example.com",
            "acct:alice",
            "acct:@example.com",
            "acct:alice@",
            "acct:alice@example.com@other",
            "https://example.com/users/alice",
        ] {
            assert!(
                matches!(parse_acct_resource(resource), Err(AppError::Validation(_))),
                "{resource} should be rejected"
            );
        }
    }

    #[test]
    fn response_links_only_to_actor() {
        let response = generate_webfinger_response(
            "alice",
            "example.com",
            "https://example.com/users/alice",
        );
        assert_eq!(response.subject, "acct:alice@example.com");
        assert_eq!(response.links.len(), 1);
        assert_eq!(response.links[0].rel, "self");
        assert_eq!(
            response.links[0].href.as_deref(),
            Some("https://example.com/users/alice")
        );
    }
}
