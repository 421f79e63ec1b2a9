//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default, config/local)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub instance: InstanceConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Local authors, keyed by username. Ordered so that "first user" is stable.
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
    /// Content collections, keyed by collection name.
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionConfig>,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blog.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://blog.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub contact_email: String,
}

/// How unsigned inbox deliveries are treated
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    /// Verify when a signature is present, accept (and log) unsigned requests
    #[default]
    Optional,
    /// Reject unsigned requests with 401
    Required,
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub enabled: bool,
    /// User whose actor fronts the server-wide endpoints
    pub primary_user: Option<String>,
    /// Operator secret; hashed into the key that encrypts stored key pairs
    pub master_key: Option<String>,
    pub signature_policy: SignaturePolicy,
    /// Maximum accepted age of a signed `date` header. 0 disables the check.
    pub signature_max_age_seconds: u64,
    pub key_bits: usize,
    pub fetch_timeout_seconds: u64,
    pub delivery_timeout_seconds: u64,
    pub max_concurrent_deliveries: usize,
    pub key_cache_ttl_seconds: u64,
    /// Permit fetching documents from loopback/private hosts (tests, LAN setups)
    pub allow_private_hosts: bool,
    pub auto_approve_comments: bool,
    pub icon_url: Option<String>,
    pub banner_url: Option<String>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            primary_user: None,
            master_key: None,
            signature_policy: SignaturePolicy::Optional,
            signature_max_age_seconds: 43_200,
            key_bits: 2048,
            fetch_timeout_seconds: 10,
            delivery_timeout_seconds: 30,
            max_concurrent_deliveries: 10,
            key_cache_ttl_seconds: 3600,
            allow_private_hosts: false,
            auto_approve_comments: true,
            icon_url: None,
            banner_url: None,
        }
    }
}

/// Federation data storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the content tree; federation data lives here in local mode
    pub content_path: PathBuf,
    /// Seconds between background commits. 0 commits after every write.
    pub commit_interval_seconds: u64,
    pub git: GitConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            content_path: PathBuf::from("."),
            commit_interval_seconds: 600,
            git: GitConfig::default(),
        }
    }
}

/// Version-controlled backing for federation data
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Remote repository URL. When set, a dedicated checkout is used.
    pub repository: Option<String>,
    /// Branch holding federation data
    pub branch: String,
    /// Branch holding content, merged before each commit
    pub content_branch: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Where to place the dedicated checkout (defaults to a temp dir)
    pub checkout_path: Option<PathBuf>,
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repository: None,
            branch: default_data_branch(),
            content_branch: "main".to_string(),
            username: None,
            password: None,
            checkout_path: None,
            author_name: "Folio Federation".to_string(),
            author_email: "federation@folio.local".to_string(),
        }
    }
}

fn default_data_branch() -> String {
    "activitypub-data".to_string()
}

/// Local author profile
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UserConfig {
    pub display_name: Option<String>,
    pub bio: Option<String>,
}

/// Per-collection federation settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CollectionConfig {
    /// Whether posts in this collection federate (default: true)
    pub federate: Option<bool>,
    /// Local user that owns the collection's activities
    pub owner: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FOLIO__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("instance.title", "Folio")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FOLIO")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Actor URI for a local user
    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/users/{}", self.server.base_url(), username)
    }

    /// Whether `username` is a configured local author
    pub fn has_user(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// The configured primary user, falling back to the first configured user
    pub fn primary_user(&self) -> Option<&str> {
        self.federation
            .primary_user
            .as_deref()
            .filter(|name| self.has_user(name))
            .or_else(|| self.users.keys().next().map(String::as_str))
    }

    /// Whether posts from `collection` should federate
    pub fn collection_federates(&self, collection: &str) -> bool {
        self.federation.enabled
            && self
                .collections
                .get(collection)
                .and_then(|c| c.federate)
                .unwrap_or(true)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Config(
                "server.protocol must be http or https".to_string(),
            ));
        }

        if !self.federation.enabled {
            return Ok(());
        }

        if self
            .federation
            .master_key
            .as_deref()
            .map(str::trim)
            .is_none_or(str::is_empty)
        {
            return Err(AppError::Config(
                "federation.master_key is required when federation is enabled".to_string(),
            ));
        }

        if self.users.is_empty() {
            return Err(AppError::Config(
                "at least one user must be configured when federation is enabled".to_string(),
            ));
        }

        if let Some(primary) = &self.federation.primary_user {
            if !self.has_user(primary) {
                return Err(AppError::Config(format!(
                    "federation.primary_user '{}' is not a configured user",
                    primary
                )));
            }
        }

        for (name, collection) in &self.collections {
            if let Some(owner) = &collection.owner {
                if !self.has_user(owner) {
                    return Err(AppError::Config(format!(
                        "collections.{}.owner '{}' is not a configured user",
                        name, owner
                    )));
                }
            }
        }

        if self.federation.key_bits < 1024 {
            return Err(AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        Ok(())
    }
}
