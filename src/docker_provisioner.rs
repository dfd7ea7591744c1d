use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;

use crate::config::{Configuration, RemoteEndpoint, ServerConfig, ServerShape, ToolDefinition};
use crate::container::{ContainerRuntime, ContainerSpec, DockerOverrides, RunResult};
use crate::docker::DockerRuntime;
use crate::provisioner::{
    Cleanup, GatewayClientHandler, McpClient, ProvisionedClient, Provisioner, connect_remote,
    connect_stdio, container_name, render_tool_command, validate_deployment,
};
use crate::proxy::ProxyRunner;
use crate::resolver::ConfigResolver;
use crate::session::{Component, SessionId, resource_labels};

#[derive(Debug, Clone, Default)]
pub struct DockerProvisionerOptions {
    /// Static (tunnel) mode: nothing is started, every non-remote server is
    /// reached over this already-running endpoint.
    pub static_endpoint: Option<String>,
    pub long_lived_default: bool,
    pub block_network: bool,
    /// IN_DIND=1: spawned containers need the privileged flag.
    pub privileged: bool,
    pub cpus: Option<u64>,
    pub memory: Option<String>,
    pub startup_timeout: Option<Duration>,
}

struct State {
    resolver: Arc<ConfigResolver>,
    networks: Vec<String>,
}

/// Provisions MCP servers as containers on the local daemon.
pub struct DockerProvisioner {
    runtime: Arc<DockerRuntime>,
    session: SessionId,
    options: DockerProvisionerOptions,
    proxy: Arc<dyn ProxyRunner>,
    state: RwLock<State>,
}

impl DockerProvisioner {
    pub fn new(
        runtime: Arc<DockerRuntime>,
        session: SessionId,
        proxy: Arc<dyn ProxyRunner>,
        options: DockerProvisionerOptions,
    ) -> Self {
        Self {
            runtime,
            session,
            options,
            proxy,
            state: RwLock::new(State {
                resolver: Arc::new(ConfigResolver::default()),
                networks: Vec::new(),
            }),
        }
    }

    pub fn runtime(&self) -> Arc<DockerRuntime> {
        self.runtime.clone()
    }

    fn resolver(&self) -> Arc<ConfigResolver> {
        self.state.read().expect("state lock poisoned").resolver.clone()
    }

    fn networks(&self) -> Vec<String> {
        self.state.read().expect("state lock poisoned").networks.clone()
    }

    fn is_long_lived(&self, server: &ServerConfig) -> bool {
        server.long_lived || self.options.long_lived_default
    }

    fn base_networks(&self, server: &ServerConfig) -> Vec<String> {
        if server.disable_network || self.options.block_network {
            vec!["none".into()]
        } else {
            self.networks()
        }
    }

    async fn provision_container<'a>(&'a self, server: &'a ServerConfig) -> Result<ProvisionedClient> {
        let resolver = self.resolver();
        let mut env = resolver.resolve_env(&server.name, &server.env);
        env.extend(resolver.resolve_secrets(&server.name, &server.secrets));
        let command = resolver.resolve_command(&server.name, &server.command);

        let mut networks = self.base_networks(server);
        let mut overrides = DockerOverrides::default();
        let mut proxy_cleanup = None;
        if !server.allow_hosts.is_empty() && !server.disable_network {
            let (target, cleanup) = self
                .proxy
                .run_proxies(&server.allow_hosts, self.is_long_lived(server))
                .await
                .with_context(|| format!("proxies for {}", server.name))?;
            if let Some(network) = target.network {
                networks.insert(0, network);
            }
            overrides.links = target.links;
            overrides.dns = target.dns;
            env.extend(target.env);
            proxy_cleanup = cleanup;
        }

        let spec = ContainerSpec {
            name: container_name(&server.name, "server"),
            image: server.image.clone(),
            command,
            env,
            volumes: server.volumes.clone(),
            networks,
            labels: resource_labels(&self.session, Component::Server, &server.name),
            persistent: self.is_long_lived(server),
            remove_after_run: true,
            interactive: true,
            keep_stdin_open: true,
            startup_timeout: self.options.startup_timeout,
            cpus: self.options.cpus,
            memory: self.options.memory.clone(),
            user: server.user.clone(),
            privileged: self.options.privileged,
            docker: Some(overrides),
            ..Default::default()
        };

        let handle = match self.runtime.start_container(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                if let Some(cleanup) = proxy_cleanup {
                    cleanup.await;
                }
                return Err(err.context(format!("start container for {}", server.name)));
            }
        };
        let container_id = handle.id.clone();

        let handler = GatewayClientHandler::new(self.name());
        let client = match connect_stdio(&server.name, handle, handler.clone()).await {
            Ok(client) => client,
            Err(err) => {
                let _ = self.runtime.stop_container(&container_id).await;
                if let Some(cleanup) = proxy_cleanup {
                    cleanup.await;
                }
                return Err(err);
            }
        };

        let runtime = self.runtime.clone();
        let cleanup: Cleanup = Box::pin(async move {
            if let Err(err) = runtime.stop_container(&container_id).await {
                tracing::warn!(target = "provisioner", container = %container_id, "stop failed: {err:#}");
            }
            if let Some(cleanup) = proxy_cleanup {
                cleanup.await;
            }
        });
        Ok(ProvisionedClient {
            client,
            handler,
            cleanup: Some(cleanup),
        })
    }

    async fn connect_static<'a>(&'a self, server: &'a ServerConfig, endpoint: &'a str) -> Result<McpClient> {
        let tunnel = ServerConfig {
            name: server.name.clone(),
            remote: Some(RemoteEndpoint {
                url: endpoint.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        connect_remote(&tunnel, GatewayClientHandler::new(self.name())).await
    }
}

#[async_trait::async_trait]
impl Provisioner for DockerProvisioner {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn pre_validate(&self, server: &ServerConfig) -> Result<()> {
        validate_deployment(server, self.options.static_endpoint.is_some())
    }

    async fn initialize(
        &self,
        resolver: Arc<ConfigResolver>,
        _configuration: &Configuration,
    ) -> Result<()> {
        self.state.write().expect("state lock poisoned").resolver = resolver;
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
        if let Some(endpoint) = self.options.static_endpoint.clone() {
            let handler = GatewayClientHandler::new(self.name());
            let client = self.connect_static(server, &endpoint).boxed().await?;
            return Ok(ProvisionedClient {
                client,
                handler,
                cleanup: None,
            });
        }
        self.provision_container(server).boxed().await
    }

    async fn run_tool(
        &self,
        server: &ServerConfig,
        tool: &ToolDefinition,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<RunResult> {
        let resolver = self.resolver();
        let mut env: BTreeMap<String, String> = resolver.resolve_env(&server.name, &server.env);
        env.extend(resolver.resolve_secrets(&server.name, &server.secrets));
        let command = render_tool_command(
            &resolver.resolve_command(&server.name, &tool.container.command),
            arguments,
        );
        let mut spec = ContainerSpec {
            name: container_name(&tool.name, "tool"),
            image: tool.container.image.clone(),
            command,
            env,
            volumes: tool.container.volumes.clone(),
            networks: self.base_networks(server),
            labels: resource_labels(&self.session, Component::Tool, &server.name),
            remove_after_run: true,
            user: tool.container.user.clone(),
            cpus: self.options.cpus,
            memory: self.options.memory.clone(),
            privileged: self.options.privileged,
            ..Default::default()
        };
        self.apply_tool_providers(&mut spec, &tool.name);
        self.runtime.run_container(&spec).await
    }

    fn apply_tool_providers(&self, _spec: &mut ContainerSpec, _tool_name: &str) {
        // secrets are already inlined as env on the local backend
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

    fn set_networks(&self, networks: Vec<String>) {
        self.state.write().expect("state lock poisoned").networks = networks;
    }
}
