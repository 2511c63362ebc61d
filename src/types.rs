//! Core event types for clusterbus
//!
//! The JSON shape of [`Event`] is the wire format shared by the store
//! records and the client connections:
//!
//! ```json
//! { "type": "create", "resource": { "rtype": "cluster", "rid": "c-1", "values": { "status": "running" } } }
//! ```
//!
//! Empty fields are omitted.

use serde::{Deserialize, Serialize};

/// Field snapshot carried by a [`Resource`]
pub type Values = serde_json::Map<String, serde_json::Value>;

/// What happened to the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The changed entity and a snapshot of its relevant fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource type (e.g., "cluster", "app", "job")
    #[serde(rename = "rtype", default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,

    /// Resource identifier
    #[serde(rename = "rid", default, skip_serializing_if = "String::is_empty")]
    pub resource_id: String,

    /// Snapshot of fields such as status
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub values: Values,
}

impl Resource {
    /// Create a resource with no values
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            values: Values::new(),
        }
    }

    /// Add a value entry, replacing any previous value for the key
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.resource_type.is_empty() && self.resource_id.is_empty() && self.values.is_empty()
    }
}

/// A resource-change event. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Resource::is_empty")]
    pub resource: Resource,
}

impl Event {
    pub fn new(kind: EventKind, resource: Resource) -> Self {
        Self { kind, resource }
    }

    /// Encode to the JSON wire format
    pub fn to_vec(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the JSON wire format
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An event addressed to one user, passed from the watcher to the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub user_id: String,
    pub event: Event,
}

impl Envelope {
    pub fn new(user_id: impl Into<String>, event: Event) -> Self {
        Self {
            user_id: user_id.into(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_event() -> Event {
        Event::new(
            EventKind::Create,
            Resource::new("repo_event", "evt-1").with_value("status", "pending"),
        )
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_string(&pending_event()).unwrap();
        assert_eq!(
            json,
            r#"{"type":"create","resource":{"rtype":"repo_event","rid":"evt-1","values":{"status":"pending"}}}"#
        );
    }

    #[test]
    fn test_empty_fields_omitted() {
        let event = Event::new(EventKind::Delete, Resource::new("cluster", ""));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"delete","resource":{"rtype":"cluster"}}"#);

        let bare = Event::new(EventKind::Update, Resource::default());
        assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"type":"update"}"#);
    }

    #[test]
    fn test_decode_tolerates_missing_resource_fields() {
        let event = Event::from_slice(br#"{"type":"update","resource":{"rid":"j-9"}}"#).unwrap();
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.resource.resource_id, "j-9");
        assert!(event.resource.resource_type.is_empty());
        assert!(event.resource.values.is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(Event::from_slice(br#"{"type":"rename"}"#).is_err());
        assert!(Event::from_slice(br#"{"resource":{"rid":"x"}}"#).is_err());
        assert!(Event::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_values_hold_arbitrary_json() {
        let resource = Resource::new("app", "a-1")
            .with_value("replicas", 3)
            .with_value("ready", true)
            .with_value("labels", serde_json::json!({"tier": "web"}));
        let event = Event::new(EventKind::Update, resource);

        let decoded = Event::from_slice(&event.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.resource.values["replicas"], 3);
        assert_eq!(decoded.resource.values["labels"]["tier"], "web");
    }

    #[test]
    fn test_with_value_replaces_existing_key() {
        let resource = Resource::new("job", "j-1")
            .with_value("status", "pending")
            .with_value("status", "successful");
        assert_eq!(resource.values.len(), 1);
        assert_eq!(resource.values["status"], "successful");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::Create.to_string(), "create");
        assert_eq!(EventKind::Update.to_string(), "update");
        assert_eq!(EventKind::Delete.to_string(), "delete");
    }
}
