//! Lifecycle notifications about cluster resources.

use serde::{Deserialize, Serialize};

use crate::types::ClusterResource;

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Modified => "MODIFIED",
            WatchEventType::Deleted => "DELETED",
        };
        write!(f, "{}", s)
    }
}

/// A notification carrying the resource snapshot at notification time.
///
/// Serialized the way watch streams frame objects:
/// `{"type": "ADDED", "object": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,

    pub object: ClusterResource,
}

impl WatchEvent {
    pub fn added(object: ClusterResource) -> Self {
        Self {
            event_type: WatchEventType::Added,
            object,
        }
    }

    pub fn modified(object: ClusterResource) -> Self {
        Self {
            event_type: WatchEventType::Modified,
            object,
        }
    }

    pub fn deleted(object: ClusterResource) -> Self {
        Self {
            event_type: WatchEventType::Deleted,
            object,
        }
    }

    /// Name of the resource the event is about.
    pub fn name(&self) -> &str {
        self.object.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_wire_format() {
        let cluster = ClusterResource::new("db1", "team-a").with_version("v1.9.3");
        let event = WatchEvent::added(cluster);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ADDED");
        assert_eq!(json["object"]["metadata"]["name"], "db1");
        assert_eq!(json["object"]["spec"]["version"], "v1.9.3");
        assert_eq!(json["object"]["status"]["phase"], "");
    }

    #[test]
    fn test_watch_event_parses_minimal_object() {
        let json = serde_json::json!({
            "type": "MODIFIED",
            "object": {
                "metadata": {
                    "name": "db1",
                    "namespace": "team-a",
                    "uid": nestplane_id::ClusterUid::new(),
                }
            }
        });

        let event: WatchEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.event_type, WatchEventType::Modified);
        assert_eq!(event.name(), "db1");
        assert_eq!(event.object.metadata.resource_version, 0);
        assert!(event.object.spec.version.is_none());
    }

    #[test]
    fn test_watch_event_assigns_missing_uid() {
        let line = r#"{"type":"ADDED","object":{"metadata":{"name":"db1","namespace":"team-a"}}}"#;
        let event: WatchEvent = serde_json::from_str(line).unwrap();
        assert!(event
            .object
            .metadata
            .uid
            .to_string()
            .starts_with("cls_"));
    }
}
