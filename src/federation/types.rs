//! ActivityPub wire documents
//!
//! Inbound documents come from many implementations, so deserialization is
//! lenient: unknown fields are ignored, single values are accepted where
//! arrays are usual, and references may arrive as bare URIs or as embedded
//! objects carrying an `id`.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const LD_JSON: &str = "application/ld+json";

/// Default `@context` for documents we publish
pub fn default_context() -> Value {
    Value::from(vec![ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT])
}

/// Accept either a URI string or an object with an `id`
fn uri_or_object<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(uri)) => Some(uri),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

fn uri_or_object_required<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(uri_or_object(deserializer)?.unwrap_or_default())
}

/// Accept a single URI, an array of URIs, or embedded objects with ids
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn as_uri(value: &Value) -> Option<String> {
        match value {
            Value::String(uri) => Some(uri.clone()),
            Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }

    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items.iter().filter_map(as_uri).collect(),
        Some(other) => as_uri(&other).into_iter().collect(),
        None => Vec::new(),
    })
}

// =============================================================================
// Actor
// =============================================================================

/// Actor document, as served for local users and as fetched for remote ones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub preferred_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "uri_or_object")]
    pub url: Option<String>,
    #[serde(default)]
    pub inbox: String,
    #[serde(default)]
    pub outbox: String,
    #[serde(default)]
    pub followers: String,
    #[serde(default)]
    pub following: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manually_approves_followers: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discoverable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

impl Actor {
    pub fn shared_inbox(&self) -> Option<&str> {
        self.endpoints
            .as_ref()
            .and_then(|e| e.shared_inbox.as_deref())
            .filter(|uri| !uri.is_empty())
    }

    /// Human-facing name: display name, then username, then the id
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| Some(self.preferred_username.as_str()).filter(|u| !u.is_empty()))
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

// =============================================================================
// Activity
// =============================================================================

/// ActivityPub activity types this server distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Other(String),
}

impl ActivityType {
    pub fn parse(s: &str) -> Self {
        match s {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Undo" => Self::Undo,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Other(other) => other,
        }
    }

    fn is_activity(kind: &str) -> bool {
        !matches!(Self::parse(kind), Self::Other(_))
    }
}

/// Generic activity envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, deserialize_with = "uri_or_object_required")]
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ActivityObject>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "uri_or_object")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub bto: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub bcc: Vec<String>,
}

impl Activity {
    pub fn activity_type(&self) -> ActivityType {
        ActivityType::parse(&self.kind)
    }

    /// Id of the object, whether referenced or embedded
    pub fn object_id(&self) -> Option<&str> {
        self.object.as_ref().and_then(ActivityObject::id)
    }
}

/// The `object` of an activity: a bare URI or an embedded typed object
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityObject {
    Reference(String),
    Embedded(EmbeddedObject),
}

/// Embedded objects, discriminated by their `type`
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddedObject {
    Note(Object),
    Article(Object),
    Activity(Box<Activity>),
    /// Anything else (Person, Tombstone, Image, ...), kept verbatim
    Other {
        kind: String,
        id: Option<String>,
        raw: Value,
    },
}

impl ActivityObject {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Reference(uri) => Some(uri),
            Self::Embedded(EmbeddedObject::Note(o) | EmbeddedObject::Article(o)) => {
                Some(o.id.as_str()).filter(|id| !id.is_empty())
            }
            Self::Embedded(EmbeddedObject::Activity(a)) => {
                Some(a.id.as_str()).filter(|id| !id.is_empty())
            }
            Self::Embedded(EmbeddedObject::Other { id, .. }) => id.as_deref(),
        }
    }

    /// `type` of an embedded object; `None` for references
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Reference(_) => None,
            Self::Embedded(EmbeddedObject::Note(_)) => Some("Note"),
            Self::Embedded(EmbeddedObject::Article(_)) => Some("Article"),
            Self::Embedded(EmbeddedObject::Activity(a)) => Some(a.kind.as_str()),
            Self::Embedded(EmbeddedObject::Other { kind, .. }) => Some(kind.as_str()),
        }
    }

    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            Self::Embedded(EmbeddedObject::Activity(a)) => Some(a),
            _ => None,
        }
    }
}

impl From<Activity> for ActivityObject {
    fn from(activity: Activity) -> Self {
        Self::Embedded(EmbeddedObject::Activity(Box::new(activity)))
    }
}

impl<'de> Deserialize<'de> for ActivityObject {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let (kind, id) = match &value {
            Value::String(uri) => return Ok(Self::Reference(uri.clone())),
            Value::Object(map) => (
                map.get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                map.get("id").and_then(Value::as_str).map(str::to_string),
            ),
            other => {
                return Err(de::Error::custom(format!(
                    "object must be a URI or an object, got {}",
                    other
                )));
            }
        };

        let embedded = match kind.as_str() {
            "Note" => EmbeddedObject::Note(serde_json::from_value(value).map_err(de::Error::custom)?),
            "Article" => {
                EmbeddedObject::Article(serde_json::from_value(value).map_err(de::Error::custom)?)
            }
            k if ActivityType::is_activity(k) => EmbeddedObject::Activity(Box::new(
                serde_json::from_value(value).map_err(de::Error::custom)?,
            )),
            _ => EmbeddedObject::Other {
                id,
                kind: kind.clone(),
                raw: value,
            },
        };
        Ok(Self::Embedded(embedded))
    }
}

impl Serialize for ActivityObject {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Reference(uri) => serializer.serialize_str(uri),
            Self::Embedded(EmbeddedObject::Note(o) | EmbeddedObject::Article(o)) => {
                o.serialize(serializer)
            }
            Self::Embedded(EmbeddedObject::Activity(a)) => a.serialize(serializer),
            Self::Embedded(EmbeddedObject::Other { raw, .. }) => raw.serialize(serializer),
        }
    }
}

// =============================================================================
// Objects
// =============================================================================

/// `attributedTo`: one actor, or several for co-authored posts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attribution {
    One(String),
    Many(Vec<String>),
}

impl Attribution {
    /// First attributed actor id, tolerating embedded actor objects
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::One(id) => Some(id),
            Self::Many(ids) => ids.first().map(String::as_str),
        }
    }
}

fn attribution<'de, D>(deserializer: D) -> Result<Option<Attribution>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = one_or_many(deserializer)?;
    Ok(match ids.len() {
        0 => None,
        1 => ids.into_iter().next().map(Attribution::One),
        _ => Some(Attribution::Many(ids)),
    })
}

/// Note or Article
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "uri_or_object")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "attribution")]
    pub attributed_to: Option<Attribution>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "uri_or_object")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Original markup a rendered object was produced from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub content: String,
    pub media_type: String,
}

// =============================================================================
// Collections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollection {
    #[serde(rename = "@context")]
    pub context: Value,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub total_items: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered_items: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollectionPage {
    #[serde(rename = "@context")]
    pub context: Value,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub part_of: String,
    pub ordered_items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Activity {
        serde_json::from_value(value).expect("activity should parse")
    }

    #[test]
    fn object_reference_is_decoded_as_uri() {
        let activity = parse(json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/carol",
            "object": "https://example.com/users/alice"
        }));

        assert_eq!(activity.activity_type(), ActivityType::Follow);
        assert_eq!(
            activity.object,
            Some(ActivityObject::Reference(
                "https://example.com/users/alice".to_string()
            ))
        );
    }

    #[test]
    fn embedded_follow_inside_undo_is_an_activity() {
        let activity = parse(json!({
            "type": "Undo",
            "actor": "https://remote.example/users/carol",
            "object": {
                "id": "https://remote.example/follows/1",
                "type": "Follow",
                "actor": "https://remote.example/users/carol",
                "object": "https://example.com/users/alice"
            }
        }));

        let inner = activity
            .object
            .as_ref()
            .and_then(ActivityObject::as_activity)
            .expect("embedded activity");
        assert_eq!(inner.activity_type(), ActivityType::Follow);
        assert_eq!(inner.object_id(), Some("https://example.com/users/alice"));
    }

    #[test]
    fn embedded_note_keeps_reply_target_and_attribution() {
        let activity = parse(json!({
            "type": "Create",
            "actor": {"id": "https://remote.example/users/carol", "type": "Person"},
            "to": "https://www.w3.org/ns/activitystreams#Public",
            "object": {
                "id": "https://remote.example/notes/1",
                "type": "Note",
                "content": "<p>hi</p>",
                "inReplyTo": {"id": "https://example.com/blog/hello"},
                "attributedTo": "https://remote.example/users/carol",
                "tag": [{"type": "Mention", "name": "@alice", "href": "https://example.com/users/alice"}]
            }
        }));

        assert_eq!(activity.actor, "https://remote.example/users/carol");
        assert_eq!(activity.to, vec![PUBLIC_COLLECTION.to_string()]);
        match activity.object {
            Some(ActivityObject::Embedded(EmbeddedObject::Note(note))) => {
                assert_eq!(note.in_reply_to.as_deref(), Some("https://example.com/blog/hello"));
                assert_eq!(
                    note.attributed_to.as_ref().and_then(Attribution::first),
                    Some("https://remote.example/users/carol")
                );
                assert_eq!(note.tag.len(), 1);
            }
            other => panic!("expected note, got {other:?}"),
        }
    }

    #[test]
    fn unknown_object_types_are_kept_verbatim() {
        let activity = parse(json!({
            "type": "Delete",
            "actor": "https://remote.example/users/carol",
            "object": {"id": "https://remote.example/notes/1", "type": "Tombstone"}
        }));

        let object = activity.object.expect("object");
        assert_eq!(object.kind(), Some("Tombstone"));
        assert_eq!(object.id(), Some("https://remote.example/notes/1"));
        assert_eq!(
            serde_json::to_value(&object).unwrap(),
            json!({"id": "https://remote.example/notes/1", "type": "Tombstone"})
        );
    }

    #[test]
    fn non_object_values_are_rejected() {
        let result: Result<Activity, _> = serde_json::from_value(json!({
            "type": "Follow",
            "actor": "https://remote.example/users/carol",
            "object": 42
        }));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_activity_types_parse_as_other() {
        let activity = parse(json!({"type": "Move", "actor": "https://remote.example/u"}));
        assert_eq!(activity.activity_type(), ActivityType::Other("Move".to_string()));
        assert!(activity.object.is_none());
    }

    #[test]
    fn actor_display_name_falls_back_to_username_then_id() {
        let mut actor = Actor {
            id: "https://remote.example/users/carol".to_string(),
            ..Actor::default()
        };
        assert_eq!(actor.display_name(), "https://remote.example/users/carol");

        actor.preferred_username = "carol".to_string();
        assert_eq!(actor.display_name(), "carol");

        actor.name = Some("Carol".to_string());
        assert_eq!(actor.display_name(), "Carol");
    }
}
