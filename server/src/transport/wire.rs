use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::StateObject;

/// Body of `POST /nest/transport`.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub chunked: bool,
    #[serde(default)]
    pub objects: Vec<WireObject>,
}

/// Body of `POST /nest/transport/put`.
#[derive(Debug, Deserialize)]
pub struct PutRequest {
    #[serde(default)]
    pub objects: Vec<WireObject>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireObject {
    pub object_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl WireObject {
    /// Revision/timestamp only, the List and no-op Put shape.
    pub fn meta(object: &StateObject) -> Self {
        Self {
            object_key: object.key.as_str().to_string(),
            object_revision: Some(object.revision),
            object_timestamp: Some(object.timestamp),
            value: None,
        }
    }

    pub fn with_value(object: &StateObject) -> Self {
        Self {
            value: Some(object.value.clone()),
            ..Self::meta(object)
        }
    }

    pub fn revision(&self) -> i64 {
        self.object_revision.unwrap_or(0)
    }

    pub fn timestamp(&self) -> i64 {
        self.object_timestamp.unwrap_or(0)
    }

    /// An object with a value and no claimed revision is an update; anything
    /// else is a subscription probe.
    pub fn is_update(&self) -> bool {
        self.value.is_some() && self.revision() == 0 && self.timestamp() == 0
    }
}

#[derive(Debug, Serialize)]
pub struct ObjectList {
    pub objects: Vec<WireObject>,
}
