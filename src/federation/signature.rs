//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outgoing requests always sign `(request-target) host date digest`.
//! [`KeyManager`] owns one RSA key pair per local actor.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::data::KeyPair;
use crate::error::AppError;
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;
use crate::storage::{KeyRing, Storage};

use super::fetch::{RemoteFetcher, actor_host, document_url};
use super::types::PublicKey;

/// Header list signed on every outgoing request
const SIGNED_HEADERS: [&str; 4] = ["(request-target)", "host", "date", "digest"];

/// Key id of a local actor's main key
pub fn key_id_for(actor_id: &str) -> String {
    format!("{}#main-key", actor_id)
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 7231)
    pub date: String,
    /// Digest header value
    pub digest: String,
    /// Host header value the signature covers
    pub host: String,
}

/// Host header value for a URL, port included when it is not the scheme default
fn host_header(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Encryption(format!("Invalid private key: {}", e)))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, String> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| format!("invalid public key: {}", e))
}

/// Sign an HTTP request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (digested even when empty)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     &body,
///     &private_key,
///     "https://my.server/users/me#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = host_header(&parsed_url)?;

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = generate_digest(body);
    let request_target = format!("{} {}", method.to_lowercase(), path_and_query(&parsed_url));

    let signing_string = [
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
        format!("digest: {}", digest),
    ]
    .join("\n");

    let private_key = parse_private_key(private_key_pem)?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNED_HEADERS.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
        host,
    })
}

/// Verify an HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path including the query string
/// * `headers` - All request headers
/// * `body` - Request body
/// * `public_key_pem` - RSA public key in PEM format
/// * `max_age_seconds` - Accepted clock skew of a signed `date`; 0 disables
///
/// # Errors
/// Every failure is reported as [`AppError::InvalidSignature`]; the reason
/// is logged at debug level.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    public_key_pem: &str,
    max_age_seconds: u64,
) -> Result<(), AppError> {
    check_signature(method, path, headers, body, public_key_pem, max_age_seconds).map_err(
        |reason| {
            tracing::debug!(%reason, "Signature verification failed");
            AppError::InvalidSignature
        },
    )
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, String> {
    headers
        .get(name)
        .ok_or_else(|| format!("missing {} header", name))?
        .to_str()
        .map_err(|_| format!("invalid {} header", name))
}

fn check_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    public_key_pem: &str,
    max_age_seconds: u64,
) -> Result<(), String> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)
        .map_err(|e| e.to_string())?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(format!("unsupported algorithm {}", parsed.algorithm));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.signs(required) {
            return Err(format!("{} is not signed", required));
        }
    }

    if parsed.signs("digest") {
        let received = header_str(headers, "digest")?;
        let expected = generate_digest(body);
        let matches = received.split(',').any(|d| match d.trim().split_once('=') {
            Some((algorithm, value)) => {
                algorithm.eq_ignore_ascii_case("sha-256")
                    && expected.strip_prefix("SHA-256=") == Some(value)
            }
            None => false,
        });
        if !matches {
            return Err("digest mismatch".to_string());
        }
    } else if !body.is_empty() {
        return Err("digest is not signed".to_string());
    }

    if max_age_seconds > 0 {
        let date = header_str(headers, "date")?;
        let date = DateTime::parse_from_rfc2822(date).map_err(|_| "invalid date format")?;
        let skew = (Utc::now().timestamp() - date.timestamp()).unsigned_abs();
        if skew > max_age_seconds {
            return Err(format!("date is {}s away from now", skew));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            other => header_str(headers, other)?.to_string(),
        };
        signing_parts.push(format!("{}: {}", name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| "invalid signature encoding")?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| format!("invalid signature format: {}", e))?;

    let public_key = parse_public_key(public_key_pem)?;
    VerifyingKey::<Sha256>::new(public_key)
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| "signature does not match".to_string())
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::Validation("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Validation("Invalid Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;
    Ok(parsed.key_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names, lower-cased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

impl ParsedSignature {
    fn signs(&self, header: &str) -> bool {
        self.headers.iter().any(|h| h == header)
    }
}

/// Parse Signature header value
///
/// Values may be quoted, and quoted values may contain commas and
/// backslash escapes. `headers` defaults to `date` when absent.
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut params: HashMap<String, String> = HashMap::new();
    let mut chars = header.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(AppError::Validation(format!(
                "Malformed signature parameter: {}",
                key.trim()
            )));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(AppError::Validation(
                    "Unterminated quoted signature parameter".to_string(),
                ));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.insert(key.trim().to_string(), value);
    }

    let mut take = |name: &str| params.remove(name);
    Ok(ParsedSignature {
        key_id: take("keyId").ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: take("algorithm").unwrap_or_else(|| "hs2019".to_string()),
        headers: take("headers")
            .unwrap_or_else(|| "date".to_string())
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect(),
        signature: take("signature")
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Public key of a remote actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKey {
    pub pem: String,
    /// Actor the key belongs to
    pub owner: String,
}

/// Document behind a key id: an actor embedding the key, or the key itself
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct KeyDocument {
    id: String,
    public_key: Option<PublicKey>,
    owner: String,
    public_key_pem: String,
}

/// Fetch the public key behind `key_id` and resolve its owner
///
/// Key ids may be fragments of the actor (`.../users/carol#main-key`) or
/// separate documents (`.../users/carol/main-key`). In the second case the
/// owner must live on the same host and advertise `key_id` as its key.
pub async fn fetch_public_key(fetcher: &RemoteFetcher, key_id: &str) -> Result<RemoteKey, AppError> {
    let document: KeyDocument = fetcher.fetch_document(key_id).await?;
    let key = match document.public_key {
        Some(key) => key,
        None => PublicKey {
            id: document.id.clone(),
            owner: document.owner,
            public_key_pem: document.public_key_pem,
        },
    };

    if key.id != key_id {
        return Err(AppError::Federation(format!(
            "Document advertises key {} instead of {}",
            key.id, key_id
        )));
    }

    if key.public_key_pem.trim().is_empty() {
        return Err(AppError::Federation(
            "Missing publicKeyPem in actor".to_string(),
        ));
    }

    let owner = if key.owner.is_empty() { document.id } else { key.owner };
    if actor_host(&owner)? != actor_host(key_id)? {
        return Err(AppError::Federation(format!(
            "Key {} claims owner {} on another host",
            key_id, owner
        )));
    }

    if document_url(&owner) != document_url(key_id) {
        let actor = fetcher.fetch_actor(&owner).await?;
        let advertised = actor.public_key.map(|k| k.id).unwrap_or_default();
        if actor.id != owner || advertised != key_id {
            return Err(AppError::Federation(format!(
                "Actor {} does not advertise key {}",
                owner, key_id
            )));
        }
    }

    Ok(RemoteKey {
        pem: key.public_key_pem,
        owner,
    })
}

/// Generate a fresh RSA key pair for `actor_id`
async fn generate_key_pair(actor_id: &str, bits: usize) -> Result<KeyPair, AppError> {
    let key_id = key_id_for(actor_id);

    let (private_key_pem, public_key_pem) = tokio::task::spawn_blocking(move || {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Encryption(format!("Key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Encryption(format!("Private key encoding failed: {}", e)))?
            .to_string();
        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Encryption(format!("Public key encoding failed: {}", e)))?;
        Ok::<_, AppError>((private_pem, public_pem))
    })
    .await
    .map_err(|e| AppError::Internal(anyhow::anyhow!("key generation task failed: {}", e)))??;

    Ok(KeyPair {
        private_key_pem,
        public_key_pem,
        key_id,
        created_at: Utc::now(),
    })
}

/// Owns the signing key pairs of local actors
pub struct KeyManager {
    storage: Arc<Storage>,
    fetcher: RemoteFetcher,
    key_bits: usize,
    keys: RwLock<HashMap<String, KeyPair>>,
    /// Serializes read-modify-write of the stored key ring
    ring_lock: Mutex<()>,
}

impl KeyManager {
    pub fn new(storage: Arc<Storage>, fetcher: RemoteFetcher, key_bits: usize) -> Self {
        Self {
            storage,
            fetcher,
            key_bits,
            keys: RwLock::new(HashMap::new()),
            ring_lock: Mutex::new(()),
        }
    }

    /// Load the stored key pair of `username`, generating one on first use
    pub async fn initialize(&self, username: &str, actor_id: &str) -> Result<KeyPair, AppError> {
        if let Some(pair) = self.keys.read().await.get(username) {
            return Ok(pair.clone());
        }

        let _guard = self.ring_lock.lock().await;
        let mut ring = self.storage.load_keys().await?.unwrap_or_default();

        let pair = match ring.get(username) {
            Some(stored) => {
                let expected = key_id_for(actor_id);
                if stored.key_id != expected {
                    tracing::warn!(
                        username,
                        stored = %stored.key_id,
                        expected = %expected,
                        "Stored key id differs from actor URI, keeping stored id"
                    );
                }
                tracing::debug!(username, "Loaded signing key");
                stored.clone()
            }
            None => {
                let pair = generate_key_pair(actor_id, self.key_bits).await?;
                ring.insert(username.to_string(), pair.clone());
                self.storage.save_keys(&ring).await?;
                tracing::info!(username, key_id = %pair.key_id, "Generated signing key");
                pair
            }
        };

        self.keys
            .write()
            .await
            .insert(username.to_string(), pair.clone());
        Ok(pair)
    }

    /// Replace the key pair of `username` with a freshly generated one
    pub async fn regenerate(&self, username: &str, actor_id: &str) -> Result<KeyPair, AppError> {
        let _guard = self.ring_lock.lock().await;
        let mut ring: KeyRing = self.storage.load_keys().await?.unwrap_or_default();

        let mut pair = generate_key_pair(actor_id, self.key_bits).await?;
        if let Some(previous) = ring.get(username) {
            pair.key_id = previous.key_id.clone();
        }
        ring.insert(username.to_string(), pair.clone());
        self.storage.save_keys(&ring).await?;

        self.keys
            .write()
            .await
            .insert(username.to_string(), pair.clone());
        tracing::warn!(username, key_id = %pair.key_id, "Regenerated signing key");
        Ok(pair)
    }

    /// Initialized key pair of `username`
    pub async fn key_pair(&self, username: &str) -> Result<KeyPair, AppError> {
        self.keys
            .read()
            .await
            .get(username)
            .cloned()
            .ok_or_else(|| {
                AppError::Federation(format!("No signing key initialized for {}", username))
            })
    }

    pub async fn public_key_pem(&self, username: &str) -> Result<String, AppError> {
        Ok(self.key_pair(username).await?.public_key_pem)
    }

    pub async fn key_id(&self, username: &str) -> Result<String, AppError> {
        Ok(self.key_pair(username).await?.key_id)
    }

    /// Sign an outgoing request as `username`
    ///
    /// Sets `Host`, `Date`, `Digest` and `Signature` on the request.
    pub async fn sign_request(
        &self,
        username: &str,
        request: &mut reqwest::Request,
    ) -> Result<(), AppError> {
        let pair = self.key_pair(username).await?;
        let body = request
            .body()
            .and_then(|b| b.as_bytes())
            .unwrap_or_default()
            .to_vec();

        let signed = sign_request(
            request.method().as_str(),
            request.url().as_str(),
            &body,
            &pair.private_key_pem,
            &pair.key_id,
        )?;

        let headers = request.headers_mut();
        for (name, value) in [
            ("host", signed.host),
            ("date", signed.date),
            ("digest", signed.digest),
            ("signature", signed.signature),
        ] {
            let value = reqwest::header::HeaderValue::from_str(&value)
                .map_err(|e| AppError::Federation(format!("Invalid {} header: {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(())
    }

    /// Verify a request against the supplied public key, recording the outcome
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
        public_key_pem: &str,
        max_age_seconds: u64,
    ) -> Result<(), AppError> {
        let result = verify_signature(method, path, headers, body, public_key_pem, max_age_seconds);
        let label = if result.is_ok() { "success" } else { "failure" };
        SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&[label]).inc();
        result
    }

    /// Fetch a remote actor's public key by key id
    pub async fn fetch_public_key(&self, key_id: &str) -> Result<RemoteKey, AppError> {
        fetch_public_key(&self.fetcher, key_id).await
    }
}
