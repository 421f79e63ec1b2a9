//! Data models
//!
//! Records persisted by the federation storage layer.
//! Generated IDs use ULID and timestamps use chrono.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Signing key pair of one local actor
///
/// Never serialized outside the encrypted keys file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub private_key_pem: String,
    pub public_key_pem: String,
    /// `<actor URI>#main-key`; fixed once generated
    pub key_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Social graph
// =============================================================================

/// A remote actor following a local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Follower {
    pub actor_id: String,
    #[serde(rename = "inboxUrl")]
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
    pub domain: String,
    #[serde(default)]
    pub username: String,
    pub accepted_at: DateTime<Utc>,
}

impl Follower {
    /// Inbox that deliveries to this follower should target
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .unwrap_or(&self.inbox)
    }
}

/// A remote actor a local user follows
///
/// `followed_at` stays empty until the remote side sends an Accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Following {
    pub actor_id: String,
    #[serde(rename = "inboxUrl")]
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
    pub domain: String,
    #[serde(default)]
    pub username: String,
    /// Id of the Follow activity we sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_activity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followed_at: Option<DateTime<Utc>>,
}

impl Following {
    pub fn is_pending(&self) -> bool {
        self.followed_at.is_none()
    }
}

/// Followers of one local user, keyed by remote actor id
pub type FollowerMap = BTreeMap<String, Follower>;

/// Accounts one local user follows, keyed by remote actor id
pub type FollowingMap = BTreeMap<String, Following>;

// =============================================================================
// Comments
// =============================================================================

/// A remote reply materialized against local content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    /// Id of the remote Note (or of the Create wrapping it)
    pub activity_id: String,
    pub in_reply_to: String,
    /// Remote actor id
    pub author: String,
    pub author_name: String,
    pub author_url: String,
    /// Sanitized HTML
    pub content: String,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    /// Request carrying the reply had a valid signature
    pub verified: bool,
    pub approved: bool,
    pub hidden: bool,
    pub post_collection: String,
    pub post_slug: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

// =============================================================================
// Instance metadata
// =============================================================================

/// Instance-level descriptive settings (singleton, last write wins)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationMetadata {
    pub instance_name: String,
    #[serde(default)]
    pub instance_description: String,
    #[serde(default)]
    pub admin_email: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

/// NodeInfo 2.0 document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: String,
    pub software: NodeInfoSoftware,
    pub protocols: Vec<String>,
    pub services: NodeInfoServices,
    pub open_registrations: bool,
    pub usage: NodeInfoUsage,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoSoftware {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfoServices {
    pub inbound: Vec<String>,
    pub outbound: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoUsage {
    pub users: NodeInfoUsers,
    pub local_posts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoUsers {
    pub total: u64,
}
