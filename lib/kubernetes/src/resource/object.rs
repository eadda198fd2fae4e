use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ObjectMeta;

/// A resource of any kind, the typed envelope (`apiVersion`, `kind`,
/// `metadata`) plus every other top level field as raw JSON.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DynamicObject {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    #[serde(default)]
    pub metadata: ObjectMeta,

    /// `spec`, `status`, `data` and whatever else the kind defines.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DynamicObject {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        DynamicObject {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ObjectMeta::default(),
            data: Map::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_generate_name(mut self, prefix: impl Into<String>) -> Self {
        self.metadata.generate_name = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.resource_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }

    #[inline]
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    #[inline]
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// Equality that ignores the server managed `resourceVersion` and `uid`.
    pub fn same_content(&self, other: &DynamicObject) -> bool {
        let strip = |meta: &ObjectMeta| ObjectMeta {
            resource_version: None,
            uid: None,
            ..meta.clone()
        };

        self.api_version == other.api_version
            && self.kind == other.kind
            && self.data == other.data
            && strip(&self.metadata) == strip(&other.metadata)
    }
}
