//! Repository metadata collaborator
//!
//! The analyzer and coordinator learn about repositories only through
//! [`RepositoryMetadataProvider`]. [`StaticMetadataProvider`] serves a fixed
//! fleet, built in code or loaded from a YAML manifest:
//!
//! ```yaml
//! version: 1
//! repositories:
//!   org/web:
//!     dependencies:
//!       - repository: org/api
//!         kind: runtime
//!         impact: high
//!     configuration:
//!       dns.upstream: 1.1.1.1
//!     resources:
//!       - resource_type: port
//!         identifier: "8080"
//! ```

use crate::dependency_graph::{DependencyEdge, DependencyKind, ImpactLevel, RepoId};
use crate::error::{CoordinationError, Result};
use crate::resources::ResourceDeclaration;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Declared configuration of one repository
pub type ConfigMap = BTreeMap<String, serde_json::Value>;

#[async_trait]
pub trait RepositoryMetadataProvider: Send + Sync {
    /// Direct outgoing edges of `repo`
    async fn get_dependencies(&self, repo: &str) -> Result<Vec<DependencyEdge>>;

    /// Shared configuration keys `repo` declares
    async fn get_configuration(&self, repo: &str) -> Result<ConfigMap>;

    /// Shared resources `repo` touches when deployed
    async fn get_resources(&self, _repo: &str) -> Result<Vec<ResourceDeclaration>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestDependency {
    pub repository: RepoId,
    #[serde(default = "default_kind")]
    pub kind: DependencyKind,
    #[serde(default)]
    pub impact: ImpactLevel,
}

fn default_kind() -> DependencyKind {
    DependencyKind::Runtime
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryManifest {
    pub dependencies: Vec<ManifestDependency>,
    pub configuration: ConfigMap,
    pub resources: Vec<ResourceDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetManifest {
    pub version: u32,
    #[serde(default)]
    pub repositories: BTreeMap<RepoId, RepositoryManifest>,
}

/// In-memory fleet. Unknown repositories are leaves with no configuration.
#[derive(Default)]
pub struct StaticMetadataProvider {
    repositories: RwLock<HashMap<RepoId, RepositoryManifest>>,
}

impl StaticMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_manifest(manifest: FleetManifest) -> Result<Self> {
        if manifest.version != 1 {
            return Err(CoordinationError::Config(format!(
                "Unsupported fleet manifest version {}",
                manifest.version
            )));
        }
        for (repo, entry) in &manifest.repositories {
            if let Some(dep) = entry.dependencies.iter().find(|d| &d.repository == repo) {
                return Err(CoordinationError::InvalidInput(format!(
                    "Self-dependency not allowed: {}",
                    dep.repository
                )));
            }
        }

        Ok(Self {
            repositories: RwLock::new(manifest.repositories.into_iter().collect()),
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let manifest: FleetManifest = serde_yaml::from_str(content)?;
        Self::from_manifest(manifest)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn with_repository(self, repo: impl Into<RepoId>) -> Self {
        self.repositories.write().entry(repo.into()).or_default();
        self
    }

    /// `from` depends on `to` (runtime, medium impact)
    pub fn with_dependency(self, from: impl Into<RepoId>, to: impl Into<RepoId>) -> Self {
        self.with_typed_dependency(from, to, DependencyKind::Runtime, ImpactLevel::Medium)
    }

    pub fn with_typed_dependency(
        self,
        from: impl Into<RepoId>,
        to: impl Into<RepoId>,
        kind: DependencyKind,
        impact: ImpactLevel,
    ) -> Self {
        let to = to.into();
        {
            let mut repos = self.repositories.write();
            repos.entry(to.clone()).or_default();
            repos
                .entry(from.into())
                .or_default()
                .dependencies
                .push(ManifestDependency {
                    repository: to,
                    kind,
                    impact,
                });
        }
        self
    }

    pub fn with_configuration(
        self,
        repo: impl Into<RepoId>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.repositories
            .write()
            .entry(repo.into())
            .or_default()
            .configuration
            .insert(key.into(), value);
        self
    }

    pub fn with_resource(self, repo: impl Into<RepoId>, declaration: ResourceDeclaration) -> Self {
        self.repositories
            .write()
            .entry(repo.into())
            .or_default()
            .resources
            .push(declaration);
        self
    }

    /// Replace one repository's metadata (pair with a store refresh)
    pub fn upsert(&self, repo: impl Into<RepoId>, manifest: RepositoryManifest) {
        self.repositories.write().insert(repo.into(), manifest);
    }

    pub fn repositories(&self) -> Vec<RepoId> {
        let mut repos: Vec<RepoId> = self.repositories.read().keys().cloned().collect();
        repos.sort();
        repos
    }
}

#[async_trait]
impl RepositoryMetadataProvider for StaticMetadataProvider {
    async fn get_dependencies(&self, repo: &str) -> Result<Vec<DependencyEdge>> {
        let repos = self.repositories.read();
        let Some(entry) = repos.get(repo) else {
            return Ok(Vec::new());
        };

        entry
            .dependencies
            .iter()
            .map(|dep| {
                DependencyEdge::new(repo, dep.repository.as_str(), dep.kind)
                    .map(|edge| edge.with_impact(dep.impact))
            })
            .collect()
    }

    async fn get_configuration(&self, repo: &str) -> Result<ConfigMap> {
        Ok(self
            .repositories
            .read()
            .get(repo)
            .map(|entry| entry.configuration.clone())
            .unwrap_or_default())
    }

    async fn get_resources(&self, repo: &str) -> Result<Vec<ResourceDeclaration>> {
        Ok(self
            .repositories
            .read()
            .get(repo)
            .map(|entry| entry.resources.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_builder() {
        let provider = StaticMetadataProvider::new()
            .with_dependency("web", "api")
            .with_configuration("web", "dns.upstream", json!("1.1.1.1"))
            .with_resource("web", ResourceDeclaration::exclusive("port", "8080"));

        let edges = provider.get_dependencies("web").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, "api");
        assert_eq!(edges[0].kind, DependencyKind::Runtime);

        assert!(provider.get_dependencies("api").await.unwrap().is_empty());
        assert_eq!(
            provider.get_configuration("web").await.unwrap()["dns.upstream"],
            json!("1.1.1.1")
        );
        assert_eq!(provider.get_resources("web").await.unwrap().len(), 1);
        assert_eq!(provider.repositories(), vec!["api", "web"]);
    }

    #[tokio::test]
    async fn test_unknown_repository_is_leaf() {
        let provider = StaticMetadataProvider::new();
        assert!(provider.get_dependencies("ghost").await.unwrap().is_empty());
        assert!(provider.get_configuration("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_from_file() {
        let yaml = r#"
version: 1
repositories:
  org/web:
    dependencies:
      - repository: org/api
        kind: build
        impact: critical
    resources:
      - resource_type: port
        identifier: "443"
        exclusive: false
  org/api:
    configuration:
      log:
        level: info
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let provider = StaticMetadataProvider::from_yaml(file.path()).unwrap();

        let edges = provider.get_dependencies("org/web").await.unwrap();
        assert_eq!(edges[0].kind, DependencyKind::Build);
        assert_eq!(edges[0].impact, ImpactLevel::Critical);

        let resources = provider.get_resources("org/web").await.unwrap();
        assert!(!resources[0].exclusive);

        let config = provider.get_configuration("org/api").await.unwrap();
        assert_eq!(config["log"], json!({"level": "info"}));
    }

    #[test]
    fn test_manifest_rejects_self_dependency() {
        let yaml = "version: 1\nrepositories:\n  a:\n    dependencies:\n      - repository: a\n";
        assert!(matches!(
            StaticMetadataProvider::from_yaml_str(yaml),
            Err(CoordinationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_manifest_version_checked() {
        assert!(matches!(
            StaticMetadataProvider::from_yaml_str("version: 3\n"),
            Err(CoordinationError::Config(_))
        ));
    }
}
