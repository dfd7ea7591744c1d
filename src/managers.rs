use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, PostParams};
use kube::Client;

use crate::config::{Configuration, ServerShape};
use crate::resolver::{ConfigResolver, normalize_key};
use crate::session::{Component, SessionId, resource_labels};

pub const DEFAULT_SECRET_NAME: &str = "mcp-gateway-secrets";
pub const DEFAULT_CONFIG_NAME: &str = "mcp-gateway-config";

/// Whether the gateway owns the cluster Secret/ConfigMap resources or merely
/// references ones the operator created beforehand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderMode {
    #[default]
    SelfManaged,
    PreExisting,
}

/// Union of every enabled server's secret values, keyed by the normalized
/// secret name. This is the data a self-managed Secret resource carries.
pub fn collect_secret_data(
    resolver: &ConfigResolver,
    configuration: &Configuration,
) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for server in configuration.enabled_servers() {
        let by_env = resolver.resolve_secrets(&server.name, &server.secrets);
        for binding in &server.secrets {
            if let Some(value) = by_env.get(&binding.env) {
                data.insert(normalize_key(&binding.name), value.clone());
            }
        }
    }
    data
}

/// Union of every enabled server's templated env values, keyed by env name.
/// Injected wholesale through `envFrom: configMapRef`.
pub fn collect_config_data(
    resolver: &ConfigResolver,
    configuration: &Configuration,
) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    for server in configuration.enabled_servers() {
        if server.shape() == ServerShape::Remote {
            continue;
        }
        let resolved = resolver.resolve_env(&server.name, &server.env);
        for (name, raw) in &server.env {
            if ConfigResolver::is_templated(raw)
                && let Some(value) = resolved.get(name)
            {
                data.insert(name.clone(), value.clone());
            }
        }
    }
    data
}

/// Creates or overwrites the shared Secret resource. `Get` then `Create` or
/// `Update`, per the creation discipline shutdown sweeps rely on.
pub struct SecretManager {
    pub name: String,
    session: SessionId,
}

impl SecretManager {
    pub fn new(name: String, session: SessionId) -> Self {
        Self { name, session }
    }

    pub async fn ensure(
        &self,
        client: Client,
        namespace: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(client, namespace);
        let mut secret = Secret {
            string_data: Some(data),
            type_: Some("Opaque".into()),
            ..Default::default()
        };
        secret.metadata.name = Some(self.name.clone());
        secret.metadata.labels = Some(resource_labels(
            &self.session,
            Component::ServerSecret,
            &self.name,
        ));
        match api.get(&self.name).await {
            Ok(existing) => {
                secret.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&self.name, &PostParams::default(), &secret)
                    .await
                    .with_context(|| format!("update secret {}", self.name))?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &secret)
                    .await
                    .with_context(|| format!("create secret {}", self.name))?;
            }
            Err(err) => return Err(err).with_context(|| format!("get secret {}", self.name)),
        }
        tracing::info!(target = "managers", secret = %self.name, "ensured");
        Ok(())
    }
}

/// ConfigMap twin of [`SecretManager`].
pub struct ConfigMapManager {
    pub name: String,
    session: SessionId,
}

impl ConfigMapManager {
    pub fn new(name: String, session: SessionId) -> Self {
        Self { name, session }
    }

    pub async fn ensure(
        &self,
        client: Client,
        namespace: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(client, namespace);
        let mut config_map = ConfigMap {
            data: Some(data),
            ..Default::default()
        };
        config_map.metadata.name = Some(self.name.clone());
        config_map.metadata.labels = Some(resource_labels(
            &self.session,
            Component::ServerConfig,
            &self.name,
        ));
        match api.get(&self.name).await {
            Ok(existing) => {
                config_map.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&self.name, &PostParams::default(), &config_map)
                    .await
                    .with_context(|| format!("update configmap {}", self.name))?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &config_map)
                    .await
                    .with_context(|| format!("create configmap {}", self.name))?;
            }
            Err(err) => return Err(err).with_context(|| format!("get configmap {}", self.name)),
        }
        tracing::info!(target = "managers", configmap = %self.name, "ensured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SecretBinding, ServerConfig};

    fn configuration() -> Configuration {
        let mut cfg = Configuration::default();
        cfg.servers.insert(
            "github".into(),
            ServerConfig {
                name: "github".into(),
                image: "ghcr.io/github/github-mcp-server".into(),
                secrets: vec![SecretBinding {
                    name: "github.token".into(),
                    env: "GITHUB_TOKEN".into(),
                }],
                env: BTreeMap::from([
                    ("STATIC".into(), "plain".into()),
                    ("USER".into(), "{{dockerhub.username}}".into()),
                ]),
                ..Default::default()
            },
        );
        cfg.secrets.insert("github.token".into(), "s3cret".into());
        cfg.config.insert(
            "github".into(),
            serde_json::json!({"dockerhub": {"username": "alice"}}),
        );
        cfg
    }

    #[test]
    fn secret_data_is_keyed_by_normalized_name() {
        let cfg = configuration();
        let resolver = ConfigResolver::from_snapshot(&cfg);
        let data = collect_secret_data(&resolver, &cfg);
        assert_eq!(data["github.token"], "s3cret");
    }

    #[test]
    fn config_data_holds_only_templated_env() {
        let cfg = configuration();
        let resolver = ConfigResolver::from_snapshot(&cfg);
        let data = collect_config_data(&resolver, &cfg);
        assert_eq!(data.get("USER").map(String::as_str), Some("alice"));
        assert!(!data.contains_key("STATIC"));
    }
}
