//! Object identity and metadata shared by every persisted kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label binding an execution job to the name of its owning run.
pub const RUN_NAME_LABEL: &str = "qualification.ci/run";
/// Label carrying the content hash of a job's derived name.
pub const JOB_NAME_HASH_LABEL: &str = "qualification.ci/job-name-hash";
/// Annotation carrying the human-readable derived job name.
pub const JOB_NAME_ANNOTATION: &str = "qualification.ci/job-name";
/// Label shared by aggregated member jobs and their aggregator.
pub const AGGREGATION_ID_LABEL: &str = "qualification.ci/aggregation-id";
/// Finalizer held on a run until its dependent jobs are finished.
pub const DEPENDENT_JOBS_FINALIZER: &str = "qualification.ci/dependent-jobs";

/// Namespaced object name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace.
    pub namespace: String,
    /// Name, unique within the namespace.
    pub name: String,
}

impl ObjectKey {
    /// Builds a key from its parts.
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

/// Error parsing a `namespace/name` string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid object key '{0}': expected namespace/name")]
pub struct ParseKeyError(String);

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// Metadata carried by every stored object.
///
/// `resource_version`, `creation_timestamp_ms` and `deletion_timestamp_ms`
/// are owned by the store; values supplied by clients are ignored or checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Object namespace.
    pub namespace: String,
    /// Indexed key/value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Free-form key/value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Markers that defer physical deletion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Optimistic concurrency token; must match on update.
    #[serde(default)]
    pub resource_version: u64,
    /// Set by the store on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp_ms: Option<i64>,
    /// Set by the store when deletion was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp_ms: Option<i64>,
}

impl ObjectMeta {
    /// Creates metadata with just a name and namespace.
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Returns the object's key.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// True once deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp_ms.is_some()
    }

    /// Looks up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// True if the finalizer is present.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds a finalizer; returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes a finalizer; returns false if it was absent.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

/// A stored object kind.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind name used in errors and logs.
    const KIND: &'static str;

    /// Object metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Mutable object metadata.
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Object key.
    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key() {
        let key: ObjectKey = "ci/run-1".parse().unwrap();
        assert_eq!(key, ObjectKey::new("ci", "run-1"));
        assert_eq!(key.to_string(), "ci/run-1");
        assert!("run-1".parse::<ObjectKey>().is_err());
        assert!("ci/".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_finalizers() {
        let mut meta = ObjectMeta::named("ci", "run");
        assert!(meta.add_finalizer(DEPENDENT_JOBS_FINALIZER));
        assert!(!meta.add_finalizer(DEPENDENT_JOBS_FINALIZER));
        assert_eq!(meta.finalizers.len(), 1);
        assert!(meta.remove_finalizer(DEPENDENT_JOBS_FINALIZER));
        assert!(!meta.remove_finalizer(DEPENDENT_JOBS_FINALIZER));
        assert!(meta.finalizers.is_empty());
    }
}
