//! Seed file: configurations for the resolver and runs to create at startup.

use std::path::Path;

use anyhow::Context;
use qualification_controller::resolver::BuildConfiguration;
use qualification_core::model::QualificationRun;
use serde::Deserialize;

/// Contents of a seed file.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    /// Build configurations served by the static resolver.
    #[serde(default)]
    pub configs: Vec<BuildConfiguration>,
    /// Runs created once the controllers are up.
    #[serde(default)]
    pub runs: Vec<QualificationRun>,
}

impl Seed {
    /// Parses a seed document.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reads and parses a seed file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading seed file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing seed file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed() {
        let seed = Seed::parse(
            r#"
configs:
  - metadata: { org: org, repo: repo, branch: main }
    tests:
      - as: e2e-aws
        timeout_secs: 3600
runs:
  - metadata: { name: run-1, namespace: ci }
    spec:
      pull_requests:
        - org: org
          repo: repo
          base_ref: main
          base_sha: abc
          pull_request: { number: 1, author: dev, sha: def }
      jobs:
        jobs:
          - { org: org, repo: repo, branch: main, test: e2e-aws }
          - { org: org, repo: repo, branch: main, test: e2e-aws, aggregated_count: 2 }
"#,
        )
        .unwrap();

        assert_eq!(seed.configs.len(), 1);
        assert_eq!(seed.configs[0].tests[0].timeout_secs, Some(3600));
        let run = &seed.runs[0];
        assert_eq!(run.metadata.name, "run-1");
        assert_eq!(run.spec.jobs.jobs.len(), 2);
        assert_eq!(run.spec.jobs.jobs[1].aggregated_count, 2);
        assert!(run.status.jobs.is_empty());
    }

    #[test]
    fn test_empty_seed() {
        let seed = Seed::parse("{}").unwrap();
        assert!(seed.configs.is_empty());
        assert!(seed.runs.is_empty());
    }
}
