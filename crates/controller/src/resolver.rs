//! Build configuration resolution.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use qualification_core::model::{ConfigMetadata, TestSelector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A test defined in a build configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestConfiguration {
    /// Test name.
    #[serde(rename = "as")]
    pub name: String,
    /// Hard timeout; the builder default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Build cluster pinned by the configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    /// Environment passed to the test.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A fully resolved build configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildConfiguration {
    /// Identity of the configuration.
    pub metadata: ConfigMetadata,
    /// Import path the sources are checked out under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_go_repository: Option<String>,
    /// Tests the configuration defines.
    #[serde(default)]
    pub tests: Vec<TestConfiguration>,
}

impl BuildConfiguration {
    /// Looks up a test by name.
    pub fn test(&self, name: &str) -> Option<&TestConfiguration> {
        self.tests.iter().find(|t| t.name == name)
    }
}

/// Failure to resolve a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No configuration for the selector's identity.
    #[error("no configuration found for {0}")]
    ConfigNotFound(String),
    /// The configuration does not define the test.
    #[error("test '{test}' not found in configuration {config}")]
    TestNotFound {
        /// Requested test.
        test: String,
        /// Configuration searched.
        config: String,
    },
    /// The resolver could not be reached.
    #[error("config resolver unavailable: {0}")]
    Unavailable(String),
}

/// Resolves `(base metadata, test selector)` into a build configuration.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    /// Returns the configuration for the sources under test with the selected
    /// test injected.
    async fn resolve_config(
        &self,
        base: &ConfigMetadata,
        selector: &TestSelector,
    ) -> Result<BuildConfiguration, ResolveError>;
}

/// `org/repo@branch[__variant]`.
pub fn describe_config(meta: &ConfigMetadata) -> String {
    match meta.variant.as_deref().filter(|v| !v.is_empty()) {
        Some(variant) => format!("{}/{}@{}__{}", meta.org, meta.repo, meta.branch, variant),
        None => format!("{}/{}@{}", meta.org, meta.repo, meta.branch),
    }
}

/// Resolver over a fixed set of configurations.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    configs: HashMap<ConfigMetadata, BuildConfiguration>,
}

impl StaticResolver {
    /// Indexes configurations by their metadata; later entries win.
    pub fn new(configs: impl IntoIterator<Item = BuildConfiguration>) -> Self {
        Self {
            configs: configs
                .into_iter()
                .map(|c| (c.metadata.clone(), c))
                .collect(),
        }
    }

    /// Number of known configurations.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// True if no configuration is known.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[async_trait]
impl ConfigResolver for StaticResolver {
    async fn resolve_config(
        &self,
        base: &ConfigMetadata,
        selector: &TestSelector,
    ) -> Result<BuildConfiguration, ResolveError> {
        let config = self
            .configs
            .get(&selector.config)
            .ok_or_else(|| ResolveError::ConfigNotFound(describe_config(&selector.config)))?;
        let test = config
            .test(&selector.test)
            .ok_or_else(|| ResolveError::TestNotFound {
                test: selector.test.clone(),
                config: describe_config(&selector.config),
            })?;
        Ok(BuildConfiguration {
            metadata: base.clone(),
            canonical_go_repository: config.canonical_go_repository.clone(),
            tests: vec![test.clone()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(repo: &str, variant: Option<&str>) -> ConfigMetadata {
        ConfigMetadata {
            org: "org".into(),
            repo: repo.into(),
            branch: "main".into(),
            variant: variant.map(Into::into),
        }
    }

    fn resolver() -> StaticResolver {
        StaticResolver::new([BuildConfiguration {
            metadata: meta("release", Some("nightly")),
            canonical_go_repository: Some("example.com/release".into()),
            tests: vec![
                TestConfiguration {
                    name: "e2e-aws".into(),
                    timeout_secs: None,
                    cluster: None,
                    env: BTreeMap::new(),
                },
                TestConfiguration {
                    name: "e2e-gcp".into(),
                    timeout_secs: Some(60),
                    cluster: None,
                    env: BTreeMap::new(),
                },
            ],
        }])
    }

    #[tokio::test]
    async fn test_resolve_injects_selected_test() {
        let base = meta("operator", None);
        let selector = TestSelector {
            config: meta("release", Some("nightly")),
            test: "e2e-gcp".into(),
        };
        let config = resolver().resolve_config(&base, &selector).await.unwrap();
        assert_eq!(config.metadata, base);
        assert_eq!(config.tests.len(), 1);
        assert_eq!(config.tests[0].name, "e2e-gcp");
        assert_eq!(config.canonical_go_repository.as_deref(), Some("example.com/release"));
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let base = meta("operator", None);
        let missing_config = TestSelector {
            config: meta("release", None),
            test: "e2e-aws".into(),
        };
        let err = resolver().resolve_config(&base, &missing_config).await.unwrap_err();
        assert_eq!(err, ResolveError::ConfigNotFound("org/release@main".into()));

        let missing_test = TestSelector {
            config: meta("release", Some("nightly")),
            test: "e2e-azure".into(),
        };
        let err = resolver().resolve_config(&base, &missing_test).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "test 'e2e-azure' not found in configuration org/release@main__nightly"
        );
    }
}
