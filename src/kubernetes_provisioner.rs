use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;

use crate::config::{Configuration, ServerConfig, ServerShape, ToolDefinition};
use crate::container::{ContainerRuntime, ContainerSpec, RunResult, SecretKeyRef};
use crate::kubernetes::KubeRuntime;
use crate::managers::{
    ConfigMapManager, ProviderMode, SecretManager, collect_config_data, collect_secret_data,
};
use crate::provisioner::{
    Cleanup, GatewayClientHandler, ProvisionedClient, Provisioner, connect_remote, connect_stdio,
    container_name, render_tool_command,
};
use crate::resolver::{ConfigResolver, normalize_key};
use crate::session::{Component, SessionId, resource_labels};

#[derive(Debug, Clone)]
pub struct KubernetesProvisionerOptions {
    pub secret_provider: ProviderMode,
    pub config_provider: ProviderMode,
    pub secret_name: String,
    pub config_name: String,
    pub long_lived_default: bool,
    pub cpus: Option<u64>,
    pub memory: Option<String>,
    pub startup_timeout: Option<Duration>,
}

impl Default for KubernetesProvisionerOptions {
    fn default() -> Self {
        Self {
            secret_provider: ProviderMode::SelfManaged,
            config_provider: ProviderMode::SelfManaged,
            secret_name: crate::managers::DEFAULT_SECRET_NAME.into(),
            config_name: crate::managers::DEFAULT_CONFIG_NAME.into(),
            long_lived_default: false,
            cpus: None,
            memory: None,
            startup_timeout: None,
        }
    }
}

/// Provisions MCP servers as Pods. Secret material flows through cluster
/// Secret/ConfigMap resources, created by the gateway in self-managed mode
/// and merely referenced in pre-existing mode.
pub struct KubernetesProvisioner {
    runtime: Arc<KubeRuntime>,
    session: SessionId,
    options: KubernetesProvisionerOptions,
    resolver: RwLock<Arc<ConfigResolver>>,
}

impl KubernetesProvisioner {
    pub fn new(
        runtime: Arc<KubeRuntime>,
        session: SessionId,
        options: KubernetesProvisionerOptions,
    ) -> Self {
        Self {
            runtime,
            session,
            options,
            resolver: RwLock::new(Arc::new(ConfigResolver::default())),
        }
    }

    pub fn runtime(&self) -> Arc<KubeRuntime> {
        self.runtime.clone()
    }

    fn resolver(&self) -> Arc<ConfigResolver> {
        self.resolver.read().expect("resolver lock poisoned").clone()
    }

    fn is_long_lived(&self, server: &ServerConfig) -> bool {
        server.long_lived || self.options.long_lived_default
    }
}

/// Container spec for a server Pod. Static env is inlined; templated env
/// stays out of the spec (the ConfigMap carries it in either provider mode)
/// and secrets are wired as `secretKeyRef`s into the shared resource.
fn build_container_spec(
    resolver: &ConfigResolver,
    server: &ServerConfig,
    session: &SessionId,
    options: &KubernetesProvisionerOptions,
    long_lived: bool,
) -> ContainerSpec {
    let resolved = resolver.resolve_env(&server.name, &server.env);
    let env: BTreeMap<String, String> = server
        .env
        .iter()
        .filter(|(_, raw)| !ConfigResolver::is_templated(raw))
        .filter_map(|(name, _)| resolved.get(name).map(|v| (name.clone(), v.clone())))
        .collect();
    ContainerSpec {
        name: container_name(&server.name, "server"),
        image: server.image.clone(),
        command: resolver.resolve_command(&server.name, &server.command),
        env,
        labels: resource_labels(session, Component::Server, &server.name),
        persistent: long_lived,
        interactive: true,
        keep_stdin_open: true,
        startup_timeout: options.startup_timeout,
        cpus: options.cpus,
        memory: options.memory.clone(),
        user: server.user.clone(),
        secret_key_refs: shared_secret_refs(server, &options.secret_name),
        config_map_refs: vec![options.config_name.clone()],
        ..Default::default()
    }
}

fn shared_secret_refs(server: &ServerConfig, secret_name: &str) -> BTreeMap<String, SecretKeyRef> {
    server
        .secrets
        .iter()
        .map(|binding| {
            (
                binding.env.clone(),
                SecretKeyRef {
                    secret: secret_name.to_string(),
                    key: normalize_key(&binding.name),
                },
            )
        })
        .collect()
}

#[async_trait::async_trait]
impl Provisioner for KubernetesProvisioner {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn initialize(
        &self,
        resolver: Arc<ConfigResolver>,
        configuration: &Configuration,
    ) -> Result<()> {
        *self.resolver.write().expect("resolver lock poisoned") = resolver.clone();

        if self.options.secret_provider == ProviderMode::SelfManaged {
            let data = collect_secret_data(&resolver, configuration);
            tracing::debug!(target = "provisioner", keys = data.len(), "syncing shared secret");
            SecretManager::new(self.options.secret_name.clone(), self.session.clone())
                .ensure(self.runtime.client(), self.runtime.namespace(), data)
                .await
                .context("ensure shared secret")?;
        }
        if self.options.config_provider == ProviderMode::SelfManaged {
            let data = collect_config_data(&resolver, configuration);
            ConfigMapManager::new(self.options.config_name.clone(), self.session.clone())
                .ensure(self.runtime.client(), self.runtime.namespace(), data)
                .await
                .context("ensure shared configmap")?;
        }
        Ok(())
    }

    async fn provision(&self, server: &ServerConfig) -> Result<ProvisionedClient> {
        self.pre_validate(server)?;
        if server.shape() == ServerShape::Remote {
            let handler = GatewayClientHandler::new(self.name());
            let client = connect_remote(server, handler.clone()).await?;
            return Ok(ProvisionedClient {
                client,
                handler,
                cleanup: None,
            });
        }

        let spec = build_container_spec(
            &self.resolver(),
            server,
            &self.session,
            &self.options,
            self.is_long_lived(server),
        );
        let handle = self
            .runtime
            .start_container(&spec)
            .await
            .with_context(|| format!("start pod for {}", server.name))?;
        let pod_name = handle.id.clone();

        let handler = GatewayClientHandler::new(self.name());
        let client = match connect_stdio(&server.name, handle, handler.clone()).boxed().await {
            Ok(client) => client,
            Err(err) => {
                let _ = self.runtime.stop_container(&pod_name).await;
                return Err(err);
            }
        };

        let runtime = self.runtime.clone();
        let cleanup: Cleanup = Box::pin(async move {
            if let Err(err) = runtime.stop_container(&pod_name).await {
                tracing::warn!(target = "provisioner", pod = %pod_name, "stop failed: {err:#}");
            }
        });
        Ok(ProvisionedClient {
            client,
            handler,
            cleanup: Some(cleanup),
        })
    }

    async fn run_tool(
        &self,
        server: &ServerConfig,
        tool: &ToolDefinition,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<RunResult> {
        let resolver = self.resolver();
        let command = render_tool_command(
            &resolver.resolve_command(&server.name, &tool.container.command),
            arguments,
        );
        let mut spec = ContainerSpec {
            name: container_name(&tool.name, "tool"),
            image: tool.container.image.clone(),
            command,
            labels: resource_labels(&self.session, Component::Tool, &server.name),
            remove_after_run: true,
            user: tool.container.user.clone(),
            cpus: self.options.cpus,
            memory: self.options.memory.clone(),
            secret_key_refs: shared_secret_refs(server, &self.options.secret_name),
            ..Default::default()
        };
        self.apply_tool_providers(&mut spec, &tool.name);
        self.runtime.run_container(&spec).await
    }

    fn apply_tool_providers(&self, spec: &mut ContainerSpec, tool_name: &str) {
        tracing::debug!(target = "provisioner", tool = %tool_name, "wiring shared providers");
        if !spec.config_map_refs.contains(&self.options.config_name) {
            spec.config_map_refs.push(self.options.config_name.clone());
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.runtime
            .remove_session_resources(&self.session)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(target = "provisioner", "session sweep failed: {err:#}");
            });
        self.runtime.shutdown().await
    }

    async fn sweep_stale(&self, max_age: chrono::Duration) -> Result<()> {
        self.runtime.remove_stale_resources(max_age).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, SecretBinding};

    fn server() -> ServerConfig {
        ServerConfig {
            name: "github".into(),
            image: "ghcr.io/github/github-mcp-server".into(),
            command: vec!["serve".into()],
            env: BTreeMap::from([
                ("STATIC".into(), "plain".into()),
                ("USER".into(), "{{dockerhub.username}}".into()),
            ]),
            secrets: vec![SecretBinding {
                name: "github.token".into(),
                env: "GITHUB_TOKEN".into(),
            }],
            long_lived: true,
            ..Default::default()
        }
    }

    fn resolver() -> ConfigResolver {
        let mut cfg = Configuration::default();
        cfg.config.insert(
            "github".into(),
            serde_json::json!({"dockerhub": {"username": "alice"}}),
        );
        ConfigResolver::from_snapshot(&cfg)
    }

    #[test]
    fn templated_env_stays_out_of_the_spec() {
        let spec = build_container_spec(
            &resolver(),
            &server(),
            &SessionId::generate(),
            &KubernetesProvisionerOptions::default(),
            true,
        );
        assert_eq!(spec.env.get("STATIC").map(String::as_str), Some("plain"));
        assert!(!spec.env.contains_key("USER"));
        assert_eq!(spec.config_map_refs, vec!["mcp-gateway-config".to_string()]);
    }

    #[test]
    fn secret_bindings_map_to_shared_secret_keys() {
        let spec = build_container_spec(
            &resolver(),
            &server(),
            &SessionId::generate(),
            &KubernetesProvisionerOptions::default(),
            true,
        );
        let key_ref = &spec.secret_key_refs["GITHUB_TOKEN"];
        assert_eq!(key_ref.secret, "mcp-gateway-secrets");
        assert_eq!(key_ref.key, "github.token");
        // the secret value itself never lands in the spec
        assert!(!format!("{spec:?}").contains("s3cret"));
    }

    #[test]
    fn long_lived_maps_to_persistent_pod() {
        let spec = build_container_spec(
            &resolver(),
            &server(),
            &SessionId::generate(),
            &KubernetesProvisionerOptions::default(),
            true,
        );
        assert!(spec.persistent);
        let spec = build_container_spec(
            &resolver(),
            &server(),
            &SessionId::generate(),
            &KubernetesProvisionerOptions::default(),
            false,
        );
        assert!(!spec.persistent);
    }
}
