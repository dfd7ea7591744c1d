use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One downstream server as described by the catalog. Exactly one of three
/// shapes is active: a remote endpoint, a containerized stdio server, or a
/// bundle of one-shot tools (see [`ServerConfig::shape`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    #[serde(skip)]
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secrets: Vec<SecretBinding>,
    pub volumes: Vec<String>,
    pub allow_hosts: Vec<String>,
    pub long_lived: bool,
    pub disable_network: bool,
    pub user: Option<String>,
    pub remote: Option<RemoteEndpoint>,
    /// Deprecated alias for `remote.url` with SSE transport. Accepted on
    /// input, never written back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sse_endpoint: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteEndpoint {
    pub url: String,
    pub transport: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Binds a named secret from the secrets map to an environment variable in
/// the server container. Values stay out of this type on purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretBinding {
    pub name: String,
    pub env: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub container: ToolContainer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolContainer {
    pub image: String,
    pub command: Vec<String>,
    pub volumes: Vec<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerShape {
    Remote,
    Container,
    ToolBundle,
}

impl ServerConfig {
    pub fn shape(&self) -> ServerShape {
        if self.remote.is_some() || self.sse_endpoint.is_some() {
            ServerShape::Remote
        } else if !self.tools.is_empty() {
            ServerShape::ToolBundle
        } else {
            ServerShape::Container
        }
    }

    /// Remote URL, honoring the deprecated SSE alias.
    pub fn remote_url(&self) -> Option<&str> {
        self.remote
            .as_ref()
            .map(|r| r.url.as_str())
            .or(self.sse_endpoint.as_deref())
    }

    pub fn is_sse_remote(&self) -> bool {
        match &self.remote {
            Some(r) => matches!(r.transport.as_deref(), Some("sse")),
            None => self.sse_endpoint.is_some(),
        }
    }
}

pub type ServerConfigs = BTreeMap<String, ServerConfig>;

/// A full configuration snapshot: catalog entries plus the already-fetched
/// template context (`config`) and secret values (`secrets`). The secrets map
/// is confidential throughout; only key names may be logged.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub servers: ServerConfigs,
    pub config: BTreeMap<String, serde_json::Value>,
    pub secrets: BTreeMap<String, String>,
    pub server_names: Vec<String>,
    /// Per-server tool toggles; absent means enabled.
    pub tools_enabled: BTreeMap<String, BTreeMap<String, bool>>,
}

impl Configuration {
    pub fn is_tool_enabled(&self, server: &str, tool: &str) -> bool {
        self.tools_enabled
            .get(server)
            .and_then(|m| m.get(tool))
            .copied()
            .unwrap_or(true)
    }

    /// The servers selected for this run: the explicit selection when present,
    /// otherwise every catalog entry.
    pub fn enabled_servers(&self) -> Vec<&ServerConfig> {
        if self.server_names.is_empty() {
            self.servers.values().collect()
        } else {
            self.server_names
                .iter()
                .filter_map(|n| self.servers.get(n))
                .collect()
        }
    }
}

/// Where configuration snapshots come from. The gateway reads once at startup
/// and again on each update; file parsing details stay behind this seam.
#[async_trait::async_trait]
pub trait ConfigurationSource: Send + Sync {
    async fn read(&self) -> Result<Configuration>;

    /// Paths a watcher should observe; empty means updates are unsupported.
    fn watch_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileConfigurationSource {
    pub catalog_paths: Vec<PathBuf>,
    pub registry_paths: Vec<PathBuf>,
    pub config_paths: Vec<PathBuf>,
    pub tools_paths: Vec<PathBuf>,
    /// Colon-separated secret file paths; the literal `docker-desktop`
    /// selects the platform secret API, which this build does not ship.
    pub secrets_spec: Option<String>,
    pub server_names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    registry: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    registry: BTreeMap<String, serde_yaml::Value>,
}

#[async_trait::async_trait]
impl ConfigurationSource for FileConfigurationSource {
    async fn read(&self) -> Result<Configuration> {
        let mut cfg = Configuration {
            server_names: self.server_names.clone(),
            ..Default::default()
        };

        for path in &self.catalog_paths {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read catalog {}", path.display()))?;
            let parsed: CatalogFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parse catalog {}", path.display()))?;
            for (name, mut server) in parsed.registry {
                server.name = name.clone();
                // later catalogs override earlier ones
                cfg.servers.insert(name, server);
            }
        }

        if cfg.server_names.is_empty() {
            for path in &self.registry_paths {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("read registry {}", path.display()))?;
                let parsed: RegistryFile = serde_yaml::from_str(&text)
                    .with_context(|| format!("parse registry {}", path.display()))?;
                for name in parsed.registry.into_keys() {
                    if !cfg.server_names.contains(&name) {
                        cfg.server_names.push(name);
                    }
                }
            }
        }

        for path in &self.config_paths {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read config {}", path.display()))?;
            let parsed: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&text)
                .with_context(|| format!("parse config {}", path.display()))?;
            for (server, value) in parsed {
                let json = serde_json::to_value(&value)
                    .with_context(|| format!("config for {server} is not plain data"))?;
                cfg.config.insert(server, json);
            }
        }

        for path in &self.tools_paths {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read tools config {}", path.display()))?;
            let parsed: BTreeMap<String, BTreeMap<String, bool>> = serde_yaml::from_str(&text)
                .with_context(|| format!("parse tools config {}", path.display()))?;
            for (server, toggles) in parsed {
                cfg.tools_enabled.entry(server).or_default().extend(toggles);
            }
        }

        if let Some(spec) = &self.secrets_spec {
            for part in spec.split(':').filter(|p| !p.is_empty()) {
                if part == "docker-desktop" {
                    tracing::warn!(
                        target = "config",
                        "docker-desktop secret source is unavailable in this build; skipping"
                    );
                    continue;
                }
                read_env_file(Path::new(part), &mut cfg.secrets)
                    .with_context(|| format!("read secrets {part}"))?;
            }
        }

        Ok(cfg)
    }

    fn watch_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.catalog_paths.clone();
        paths.extend(self.registry_paths.clone());
        paths.extend(self.config_paths.clone());
        paths.extend(self.tools_paths.clone());
        paths
    }
}

fn read_env_file(path: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(())
}

// User-level state directory abstraction, kept as a trait so tests can point
// it at a temp dir.
pub trait ConfigProvider: Send + Sync {
    fn base_dir(&self) -> PathBuf;
}

#[derive(Default, Clone)]
pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
        base.join("mcp-gateway")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_prefers_remote_then_tools() {
        let mut server = ServerConfig {
            remote: Some(RemoteEndpoint {
                url: "https://example.com/mcp".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(server.shape(), ServerShape::Remote);
        server.remote = None;
        server.tools.push(ToolDefinition::default());
        assert_eq!(server.shape(), ServerShape::ToolBundle);
        server.tools.clear();
        server.image = "alpine".into();
        assert_eq!(server.shape(), ServerShape::Container);
    }

    #[test]
    fn sse_endpoint_is_a_remote_alias() {
        let server = ServerConfig {
            sse_endpoint: Some("https://old.example.com/sse".into()),
            ..Default::default()
        };
        assert_eq!(server.shape(), ServerShape::Remote);
        assert_eq!(server.remote_url(), Some("https://old.example.com/sse"));
        assert!(server.is_sse_remote());
    }

    #[tokio::test]
    async fn catalog_and_secrets_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.yaml");
        std::fs::write(
            &catalog,
            r#"
registry:
  github:
    image: ghcr.io/github/github-mcp-server:latest
    longLived: true
    secrets:
      - name: github.token
        env: GITHUB_TOKEN
  fetch:
    image: mcp/fetch:latest
"#,
        )
        .unwrap();
        let secrets = dir.path().join("secrets.env");
        std::fs::write(&secrets, "github.token=s3cret\n# comment\n").unwrap();

        let source = FileConfigurationSource {
            catalog_paths: vec![catalog],
            secrets_spec: Some(secrets.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let cfg = source.read().await.unwrap();
        assert_eq!(cfg.servers.len(), 2);
        let github = &cfg.servers["github"];
        assert_eq!(github.name, "github");
        assert!(github.long_lived);
        assert_eq!(github.secrets[0].env, "GITHUB_TOKEN");
        assert_eq!(cfg.secrets["github.token"], "s3cret");
        // no selection: everything is enabled
        assert_eq!(cfg.enabled_servers().len(), 2);
    }

    #[tokio::test]
    async fn registry_file_selects_servers() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = dir.path().join("catalog.yaml");
        std::fs::write(
            &catalog,
            "registry:\n  a:\n    image: x\n  b:\n    image: y\n",
        )
        .unwrap();
        let registry = dir.path().join("registry.yaml");
        std::fs::write(&registry, "registry:\n  b:\n    ref: b\n").unwrap();

        let source = FileConfigurationSource {
            catalog_paths: vec![catalog],
            registry_paths: vec![registry],
            ..Default::default()
        };
        let cfg = source.read().await.unwrap();
        let enabled: Vec<_> = cfg.enabled_servers().iter().map(|s| s.name.clone()).collect();
        assert_eq!(enabled, vec!["b".to_string()]);
    }
}
