//! ActivityPub federation module
//!
//! Handles:
//! - Discovery and actor documents
//! - Activity processing (inbox)
//! - Publication and delivery (outbox)
//! - HTTP Signatures
//! - Remote actor fetching
//! - Public key caching

mod actor;
mod delivery;
mod fetch;
mod inbox;
mod key_cache;
mod manager;
mod outbox;
mod signature;
pub mod types;
mod webfinger;

pub use actor::{ActorService, validate_username};
pub use delivery::{ActivityDelivery, DeliveryReport, DeliveryResult, builder, group_inboxes};
pub use fetch::{RemoteFetcher, actor_host, document_url};
pub use inbox::{InboxRequest, InboxService, comment_id};
pub use key_cache::{KeySource, PublicKeyCache};
pub use manager::FederationManager;
pub use outbox::{OutboxDocument, OutboxService, PAGE_SIZE, Post, parse_page};
pub use signature::{
    KeyManager, ParsedSignature, RemoteKey, SignatureHeaders, extract_signature_key_id,
    fetch_public_key, generate_digest, key_id_for, parse_signature_header, sign_request,
    verify_signature,
};
pub use webfinger::{
    AcctResource, WebFingerLink, WebFingerResponse, generate_webfinger_response,
    parse_acct_resource,
};
