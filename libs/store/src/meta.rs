//! Object identity and metadata shared by all stored resources.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Namespaced identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata carried by every stored object.
///
/// `uid` and `resource_version` are store-assigned. The version is the
/// compare-and-swap token: writes whose version does not match the stored
/// one are rejected with `Conflict`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Assigned on create, stable for the object's lifetime.
    #[serde(default)]
    pub uid: Option<Ulid>,
    /// Monotonic per object, bumped on every committed write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Set when deletion was requested while finalizers were present.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Names of parties that must act before the object may be removed.
    #[serde(default)]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            resource_version: 0,
            created_at: None,
            deletion_timestamp: None,
            finalizers: Vec::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// True once deletion has been requested.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    #[must_use]
    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }

    /// Adds a finalizer if not already present. Returns whether it was added.
    pub fn add_finalizer(&mut self, name: &str) -> bool {
        if self.has_finalizer(name) {
            return false;
        }
        self.finalizers.push(name.to_string());
        true
    }

    /// Removes a finalizer. Returns whether it was present.
    pub fn remove_finalizer(&mut self, name: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != name);
        self.finalizers.len() != before
    }
}

/// A resource the store can hold.
///
/// `restore_spec` and `restore_status` let the store enforce write ownership
/// without knowing each resource's shape: `update` keeps the stored status,
/// `update_status` keeps the stored spec.
pub trait Object: Clone + Send + Sync + 'static {
    /// Kind name used in logs and error messages.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Overwrites this object's spec with the stored one.
    fn restore_spec(&mut self, stored: &Self);

    /// Overwrites this object's status with the stored one.
    fn restore_status(&mut self, stored: &Self);

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_is_namespace_slash_name() {
        let key = ObjectKey::new("chaos", "web-1");
        assert_eq!(key.to_string(), "chaos/web-1");
    }

    #[test]
    fn finalizer_add_is_idempotent() {
        let mut meta = ObjectMeta::new("chaos", "web-1");
        assert!(meta.add_finalizer("faultline.sh/recover"));
        assert!(!meta.add_finalizer("faultline.sh/recover"));
        assert_eq!(meta.finalizers.len(), 1);

        assert!(meta.remove_finalizer("faultline.sh/recover"));
        assert!(!meta.remove_finalizer("faultline.sh/recover"));
        assert!(meta.finalizers.is_empty());
    }

    #[test]
    fn fresh_meta_is_not_deleting() {
        let meta = ObjectMeta::new("chaos", "web-1");
        assert!(!meta.is_deleting());
        assert_eq!(meta.resource_version, 0);
        assert!(meta.uid.is_none());
    }
}
