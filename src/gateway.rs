use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use axum::Router;
use notify::Watcher;
use rmcp::model as mcp;
use rmcp::service::{NotificationContext, RequestContext, RoleServer};
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{Service as McpService, serve_server};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::{CapabilityRegistry, aggregate_capabilities, split_qualified};
use crate::config::{Configuration, ConfigurationSource};
use crate::container::RunResult;
use crate::docker::DockerRuntime;
use crate::interceptor::{Interceptor, When, run_hooks};
use crate::pool::{AcquireOptions, ClientPool};
use crate::provisioner::Provisioner;
use crate::resolver::{ConfigResolver, UNKNOWN_SECRET};
use crate::session::SessionId;

const CLEANUP_DEADLINE: Duration = Duration::from_secs(30);
const STALE_MAX_AGE_HOURS: i64 = 24;
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    Streaming,
}

pub fn in_container() -> bool {
    std::env::var("IN_CONTAINER").map(|v| v == "1").unwrap_or(false)
}

pub fn in_dind() -> bool {
    std::env::var("IN_DIND").map(|v| v == "1").unwrap_or(false)
}

/// Shared state behind every upstream session: the pool, the selected
/// provisioner, the live capability snapshot and the configuration it came
/// from.
pub struct Gateway {
    pub session: SessionId,
    pub provisioner: Arc<dyn Provisioner>,
    pub pool: Arc<ClientPool>,
    pub registry: CapabilityRegistry,
    configuration: std::sync::RwLock<Arc<Configuration>>,
    pub interceptors: Vec<Interceptor>,
    pub log_calls: bool,
    pub block_secrets: bool,
    healthy: AtomicBool,
    upstream_peers: tokio::sync::Mutex<Vec<rmcp::service::Peer<RoleServer>>>,
}

impl Gateway {
    pub fn new(
        session: SessionId,
        provisioner: Arc<dyn Provisioner>,
        pool: Arc<ClientPool>,
        interceptors: Vec<Interceptor>,
        log_calls: bool,
        block_secrets: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            provisioner,
            pool,
            registry: CapabilityRegistry::default(),
            configuration: std::sync::RwLock::new(Arc::new(Configuration::default())),
            interceptors,
            log_calls,
            block_secrets,
            healthy: AtomicBool::new(false),
            upstream_peers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    async fn register_upstream_peer(&self, peer: rmcp::service::Peer<RoleServer>) {
        self.upstream_peers.lock().await.push(peer);
    }

    /// Tells every connected upstream client the tool set changed; peers that
    /// went away are dropped here.
    async fn notify_upstream_peers(&self) {
        let peers = std::mem::take(&mut *self.upstream_peers.lock().await);
        let mut alive = Vec::with_capacity(peers.len());
        for peer in peers {
            if peer.notify_tool_list_changed().await.is_ok() {
                alive.push(peer);
            }
        }
        *self.upstream_peers.lock().await = alive;
    }

    pub fn configuration(&self) -> Arc<Configuration> {
        self.configuration
            .read()
            .expect("configuration lock poisoned")
            .clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Swaps in a new configuration snapshot: fresh resolver into the
    /// provisioner, concurrent capability listing, then one atomic registry
    /// swap. Request handlers racing with this see either the old or the new
    /// set, never a mix.
    pub async fn reload<'a>(
        &'a self,
        mut configuration: Configuration,
        selected: Option<&'a [String]>,
    ) -> Result<()> {
        if let Some(selected) = selected
            && !selected.is_empty()
        {
            configuration.server_names = selected.to_vec();
        }
        let resolver = Arc::new(ConfigResolver::from_snapshot(&configuration));
        self.provisioner
            .initialize(resolver, &configuration)
            .await
            .context("provisioner initialize")?;
        let configuration = Arc::new(configuration);
        *self
            .configuration
            .write()
            .expect("configuration lock poisoned") = configuration.clone();

        let set = aggregate_capabilities(&self.pool, &configuration).await;
        let report = self.registry.swap(set);
        self.healthy.store(true, Ordering::Relaxed);
        tracing::info!(
            target = "gateway",
            registered = report.added,
            removed = report.removed.len(),
            "capabilities refreshed"
        );
        self.notify_upstream_peers().await;
        Ok(())
    }

    /// `--block-secrets`: a tool result carrying any known secret value is
    /// replaced wholesale.
    fn guard_secrets(&self, result: mcp::CallToolResult) -> mcp::CallToolResult {
        if !self.block_secrets {
            return result;
        }
        let configuration = self.configuration();
        let Ok(serialized) = serde_json::to_string(&result) else {
            return result;
        };
        let leaked = configuration
            .secrets
            .values()
            .any(|value| value.len() >= 8 && value != UNKNOWN_SECRET && serialized.contains(value));
        if leaked {
            tracing::warn!(target = "gateway", "secret value detected in tool result; blocking");
            tool_error_result("a secret value was detected in the tool result and blocked")
        } else {
            result
        }
    }
}

fn tool_error_result(message: impl Into<String>) -> mcp::CallToolResult {
    mcp::CallToolResult {
        content: vec![mcp::Content::text(message.into())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

fn server_capabilities() -> mcp::ServerCapabilities {
    mcp::ServerCapabilities::builder()
        .enable_tools()
        .enable_tool_list_changed()
        .enable_prompts()
        .enable_resources()
        .build()
}

/// Tool-bundle runs surface the container stdout as the first content item;
/// a nonzero exit marks the result as an error but never raises.
fn bundle_result(run: RunResult) -> mcp::CallToolResult {
    let mut content = vec![mcp::Content::text(run.stdout)];
    if !run.success && !run.stderr.is_empty() {
        content.push(mcp::Content::text(run.stderr));
    }
    mcp::CallToolResult {
        content,
        structured_content: None,
        is_error: Some(!run.success),
        meta: None,
    }
}

/// One upstream session. The id is minted at initialize time and keys the
/// pool's long-lived entries for this client.
#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
    upstream_session: Arc<tokio::sync::RwLock<Option<String>>>,
}

impl GatewayService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            upstream_session: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    async fn call_tool(
        &self,
        params: mcp::CallToolRequestParam,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        let name = params.name.to_string();
        let arguments = params.arguments.unwrap_or_default();
        let snapshot = self.gateway.registry.snapshot();
        let Some(registered) = snapshot.tools.get(&name).cloned() else {
            return Ok(mcp::ServerResult::CallToolResult(tool_error_result(
                format!("tool not found: {name}"),
            )));
        };
        let configuration = self.gateway.configuration();
        let Some(server) = configuration.servers.get(&registered.server).cloned() else {
            return Ok(mcp::ServerResult::CallToolResult(tool_error_result(
                format!("no server for tool {name}"),
            )));
        };
        if let Err(err) = self.gateway.provisioner.pre_validate(&server) {
            return Err(mcp::ErrorData::invalid_params(format!("{err:#}"), None));
        }

        let payload = serde_json::json!({
            "tool": name,
            "arguments": serde_json::Value::Object(arguments.clone()),
        });
        run_hooks(&self.gateway.interceptors, When::Before, &payload).await;
        if self.gateway.log_calls {
            tracing::info!(target = "calls", tool = %name, server = %registered.server, "call");
        }
        let started = std::time::Instant::now();

        let result = match &registered.bundle {
            Some(tool_def) => match self
                .gateway
                .provisioner
                .run_tool(&server, tool_def, &arguments)
                .await
            {
                Ok(run) => bundle_result(run),
                Err(err) => tool_error_result(format!("error: {err:#}")),
            },
            None => {
                let upstream_session = self.upstream_session.read().await.clone();
                match self
                    .gateway
                    .pool
                    .acquire(
                        &server,
                        AcquireOptions {
                            upstream_session,
                            read_only: false,
                        },
                    )
                    .await
                {
                    Ok(client) => {
                        let tool_name = split_qualified(&name)
                            .map(|(_, tool)| tool.to_string())
                            .unwrap_or_else(|| name.clone());
                        let forwarded = client
                            .client()
                            .call_tool(mcp::CallToolRequestParam {
                                name: tool_name.into(),
                                arguments: Some(arguments),
                            })
                            .await;
                        self.gateway.pool.release(client).await;
                        match forwarded {
                            Ok(result) => result,
                            // a dropped downstream session is the caller's
                            // problem to retry; the entry is not evicted
                            Err(err) => tool_error_result(format!("error: {err}")),
                        }
                    }
                    Err(err) => tool_error_result(format!("error: {err:#}")),
                }
            }
        };

        let result = self.gateway.guard_secrets(result);
        if self.gateway.log_calls {
            tracing::info!(
                target = "calls",
                tool = %name,
                ok = result.is_error != Some(true),
                duration_ms = started.elapsed().as_millis() as u64,
                "done"
            );
        }
        let payload = serde_json::json!({"tool": name, "isError": result.is_error});
        run_hooks(&self.gateway.interceptors, When::After, &payload).await;
        Ok(mcp::ServerResult::CallToolResult(result))
    }

    async fn get_prompt(
        &self,
        params: mcp::GetPromptRequestParam,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        let Some((server_name, prompt_name)) = split_qualified(&params.name) else {
            return Err(mcp::ErrorData::invalid_params(
                format!("unknown prompt {:?}", params.name),
                None,
            ));
        };
        let configuration = self.gateway.configuration();
        let Some(server) = configuration.servers.get(server_name).cloned() else {
            return Err(mcp::ErrorData::invalid_params(
                format!("unknown server {server_name:?}"),
                None,
            ));
        };
        let upstream_session = self.upstream_session.read().await.clone();
        let client = self
            .gateway
            .pool
            .acquire(
                &server,
                AcquireOptions {
                    upstream_session,
                    read_only: false,
                },
            )
            .await
            .map_err(|err| mcp::ErrorData::internal_error(format!("{err:#}"), None))?;
        let fetched = client
            .client()
            .get_prompt(mcp::GetPromptRequestParam {
                name: prompt_name.to_string(),
                arguments: params.arguments,
            })
            .await;
        self.gateway.pool.release(client).await;
        fetched
            .map(mcp::ServerResult::GetPromptResult)
            .map_err(|err| mcp::ErrorData::internal_error(format!("{err}"), None))
    }

    async fn read_resource(
        &self,
        params: mcp::ReadResourceRequestParam,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        let snapshot = self.gateway.registry.snapshot();
        let server_name = snapshot
            .resources
            .get(&params.uri)
            .map(|r| r.server.clone())
            .or_else(|| {
                // fall back to a template whose static prefix matches
                snapshot.templates.values().find_map(|t| {
                    let prefix = t
                        .template
                        .uri_template
                        .split('{')
                        .next()
                        .unwrap_or_default();
                    (!prefix.is_empty() && params.uri.starts_with(prefix))
                        .then(|| t.server.clone())
                })
            });
        let Some(server_name) = server_name else {
            return Err(mcp::ErrorData::resource_not_found(
                format!("unknown resource {:?}", params.uri),
                None,
            ));
        };
        let configuration = self.gateway.configuration();
        let Some(server) = configuration.servers.get(&server_name).cloned() else {
            return Err(mcp::ErrorData::resource_not_found(
                format!("unknown server {server_name:?}"),
                None,
            ));
        };
        let upstream_session = self.upstream_session.read().await.clone();
        let client = self
            .gateway
            .pool
            .acquire(
                &server,
                AcquireOptions {
                    upstream_session,
                    read_only: false,
                },
            )
            .await
            .map_err(|err| mcp::ErrorData::internal_error(format!("{err:#}"), None))?;
        let read = client
            .client()
            .read_resource(mcp::ReadResourceRequestParam { uri: params.uri })
            .await;
        self.gateway.pool.release(client).await;
        read.map(mcp::ServerResult::ReadResourceResult)
            .map_err(|err| mcp::ErrorData::internal_error(format!("{err}"), None))
    }
}

impl McpService<RoleServer> for GatewayService {
    async fn handle_request(
        &self,
        request: mcp::ClientRequest,
        context: RequestContext<RoleServer>,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        match request {
            mcp::ClientRequest::InitializeRequest(req) => {
                let id = format!("up-{}", &Uuid::new_v4().simple().to_string()[..12]);
                tracing::info!(
                    target = "gateway",
                    client = %req.params.client_info.name,
                    version = %req.params.client_info.version,
                    session = %id,
                    "upstream connected"
                );
                *self.upstream_session.write().await = Some(id);
                self.gateway.register_upstream_peer(context.peer.clone()).await;
                Ok(mcp::ServerResult::InitializeResult(mcp::InitializeResult {
                    protocol_version: mcp::ProtocolVersion::V_2025_03_26,
                    capabilities: server_capabilities(),
                    server_info: mcp::Implementation {
                        name: "MCP Gateway".into(),
                        version: env!("CARGO_PKG_VERSION").into(),
                        title: None,
                        website_url: None,
                        icons: None,
                    },
                    instructions: None,
                }))
            }
            mcp::ClientRequest::ListToolsRequest(_req) => {
                let snapshot = self.gateway.registry.snapshot();
                Ok(mcp::ServerResult::ListToolsResult(mcp::ListToolsResult {
                    tools: snapshot.tools.values().map(|t| t.tool.clone()).collect(),
                    next_cursor: None,
                }))
            }
            mcp::ClientRequest::CallToolRequest(req) => self.call_tool(req.params).await,
            mcp::ClientRequest::ListPromptsRequest(_req) => {
                let snapshot = self.gateway.registry.snapshot();
                Ok(mcp::ServerResult::ListPromptsResult(
                    mcp::ListPromptsResult {
                        prompts: snapshot.prompts.values().map(|p| p.prompt.clone()).collect(),
                        next_cursor: None,
                    },
                ))
            }
            mcp::ClientRequest::GetPromptRequest(req) => self.get_prompt(req.params).await,
            mcp::ClientRequest::ListResourcesRequest(_req) => {
                let snapshot = self.gateway.registry.snapshot();
                Ok(mcp::ServerResult::ListResourcesResult(
                    mcp::ListResourcesResult {
                        resources: snapshot
                            .resources
                            .values()
                            .map(|r| r.resource.clone())
                            .collect(),
                        next_cursor: None,
                    },
                ))
            }
            mcp::ClientRequest::ListResourceTemplatesRequest(_req) => {
                let snapshot = self.gateway.registry.snapshot();
                Ok(mcp::ServerResult::ListResourceTemplatesResult(
                    mcp::ListResourceTemplatesResult {
                        resource_templates: snapshot
                            .templates
                            .values()
                            .map(|t| t.template.clone())
                            .collect(),
                        next_cursor: None,
                    },
                ))
            }
            mcp::ClientRequest::ReadResourceRequest(req) => self.read_resource(req.params).await,
            other => {
                let _ = other;
                Ok(mcp::ServerResult::empty(()))
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: mcp::ClientNotification,
        context: NotificationContext<RoleServer>,
    ) -> Result<(), mcp::ErrorData> {
        if let mcp::ClientNotification::RootsListChangedNotification(_) = notification {
            let session = self.upstream_session.read().await.clone();
            if let Some(session) = session {
                let gateway = self.gateway.clone();
                let peer = context.peer.clone();
                tokio::spawn(async move {
                    match peer.list_roots().await {
                        Ok(result) => gateway.pool.update_roots(&session, result.roots).await,
                        Err(err) => {
                            tracing::debug!(target = "gateway", "roots fetch failed: {err}");
                        }
                    }
                });
            }
        }
        Ok(())
    }

    fn get_info(&self) -> mcp::ServerInfo {
        mcp::ServerInfo {
            protocol_version: mcp::ProtocolVersion::V_2025_03_26,
            capabilities: server_capabilities(),
            server_info: mcp::Implementation {
                name: "MCP Gateway".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: None,
        }
    }
}

pub struct RunConfig {
    pub session: SessionId,
    pub source: Arc<dyn ConfigurationSource>,
    pub provisioner: Arc<dyn Provisioner>,
    /// Present on the local backend: pre-pull and network discovery.
    pub docker_runtime: Option<Arc<DockerRuntime>>,
    pub transport: TransportKind,
    pub port: u16,
    pub watch: bool,
    pub static_mode: bool,
    pub dry_run: bool,
    pub long_lived: bool,
    pub log_calls: bool,
    pub block_secrets: bool,
    pub interceptors: Vec<Interceptor>,
    pub selected: Option<Vec<String>>,
    pub shutdown: CancellationToken,
}

/// The gateway run loop: sweep stale resources, read configuration, do the
/// initial reload, start the watcher, serve the chosen transport, and tear
/// everything down under a bounded deadline on cancellation.
pub async fn run(config: RunConfig) -> Result<()> {
    let RunConfig {
        session,
        source,
        provisioner,
        docker_runtime,
        transport,
        port,
        watch,
        static_mode,
        dry_run,
        long_lived,
        log_calls,
        block_secrets,
        interceptors,
        selected,
        shutdown,
    } = config;

    tracing::info!(target = "gateway", session = %session, "starting");
    if let Ok(interval) = std::env::var("MCP_GATEWAY_METRICS_INTERVAL") {
        tracing::debug!(target = "gateway", %interval, "metrics export interval requested; no exporter in this build");
    }
    if std::env::var("MCP_GATEWAY_TELEMETRY_DEBUG").is_ok() {
        tracing::debug!(target = "gateway", "telemetry debug requested; no exporter in this build");
    }
    if let Err(err) = provisioner
        .sweep_stale(chrono::Duration::hours(STALE_MAX_AGE_HOURS))
        .await
    {
        tracing::warn!(target = "gateway", "stale sweep failed: {err:#}");
    }

    let configuration = source.read().await.context("read configuration")?;

    let pool = Arc::new(ClientPool::new(provisioner.clone(), long_lived));
    let gateway = Gateway::new(
        session,
        provisioner.clone(),
        pool.clone(),
        interceptors,
        log_calls,
        block_secrets,
    );

    if let Some(runtime) = &docker_runtime
        && !static_mode
    {
        pre_pull_images(runtime, &configuration).await;
        if in_container() {
            discover_networks(runtime, &pool).await;
        }
    }

    let reload_outcome = gateway.reload(configuration, selected.as_deref()).await;
    if let Err(err) = reload_outcome {
        cleanup(&gateway).await;
        return Err(err.context("initial reload"));
    }

    if dry_run {
        tracing::info!(target = "gateway", "dry run complete");
        cleanup(&gateway).await;
        return Ok(());
    }

    // keep the watcher alive for the lifetime of the run
    let _watcher = if watch && !static_mode {
        spawn_watcher(
            source.clone(),
            gateway.clone(),
            docker_runtime.clone(),
            selected.clone(),
        )?
    } else {
        None
    };

    let serve_outcome = serve(transport, port, gateway.clone(), shutdown).await;
    cleanup(&gateway).await;
    serve_outcome
}

async fn serve(
    transport: TransportKind,
    port: u16,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> Result<()> {
    match transport {
        TransportKind::Stdio => {
            let service = GatewayService::new(gateway);
            let running = serve_server(service, rmcp::transport::io::stdio())
                .await
                .context("serve stdio")?;
            tokio::select! {
                quit = running.waiting() => {
                    tracing::info!(target = "gateway", "stdio client disconnected: {quit:?}");
                }
                _ = shutdown.cancelled() => {}
            }
            Ok(())
        }
        TransportKind::Sse => {
            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
            let server = SseServer::serve(addr)
                .await
                .with_context(|| format!("bind sse listener on {addr}"))?;
            tracing::info!(target = "gateway", %addr, "sse listening");
            let ct = server.with_service(move || GatewayService::new(gateway.clone()));
            shutdown.cancelled().await;
            ct.cancel();
            Ok(())
        }
        TransportKind::Streaming => {
            let service: StreamableHttpService<GatewayService, LocalSessionManager> =
                StreamableHttpService::new(
                    move || Ok(GatewayService::new(gateway.clone())),
                    Default::default(),
                    StreamableHttpServerConfig {
                        stateful_mode: true,
                        sse_keep_alive: Some(SSE_KEEP_ALIVE),
                    },
                );
            let router = Router::new().nest_service("/mcp", service);
            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind listener on {addr}"))?;
            tracing::info!(target = "gateway", %addr, "streaming listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .context("transport server")?;
            Ok(())
        }
    }
}

fn spawn_watcher(
    source: Arc<dyn ConfigurationSource>,
    gateway: Arc<Gateway>,
    docker_runtime: Option<Arc<DockerRuntime>>,
    selected: Option<Vec<String>>,
) -> Result<Option<notify::RecommendedWatcher>> {
    let paths = source.watch_paths();
    if paths.is_empty() {
        return Ok(None);
    }
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res
            && (event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove())
        {
            let _ = tx.send(());
        }
    })
    .context("create watcher")?;
    for path in &paths {
        if path.exists() {
            watcher
                .watch(path, notify::RecursiveMode::NonRecursive)
                .with_context(|| format!("watch {}", path.display()))?;
        }
    }
    tracing::info!(target = "gateway", files = paths.len(), "watching for configuration changes");
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // editors fire bursts; coalesce them
            tokio::time::sleep(Duration::from_millis(250)).await;
            while rx.try_recv().is_ok() {}
            tracing::info!(target = "gateway", "configuration changed; reloading");
            match source.read().boxed().await {
                Ok(configuration) => {
                    if let Some(runtime) = &docker_runtime {
                        pre_pull_images(runtime, &configuration).boxed().await;
                    }
                    if let Err(err) = gateway
                        .reload(configuration, selected.as_deref())
                        .boxed()
                        .await
                    {
                        tracing::error!(target = "gateway", "reload failed: {err:#}");
                    }
                }
                Err(err) => {
                    tracing::error!(target = "gateway", "configuration read failed: {err:#}");
                }
            }
        }
    });
    Ok(Some(watcher))
}

async fn pre_pull_images<'a>(runtime: &'a DockerRuntime, configuration: &'a Configuration) {
    for server in configuration.enabled_servers() {
        let mut images: Vec<&str> = Vec::new();
        if !server.image.is_empty() {
            images.push(&server.image);
        }
        for tool in &server.tools {
            if !tool.container.image.is_empty() {
                images.push(&tool.container.image);
            }
        }
        for image in images {
            if runtime.image_exists(image).await {
                continue;
            }
            tracing::info!(target = "gateway", image = %image, "pulling");
            if let Err(err) = runtime.pull_image(image).await {
                tracing::warn!(target = "gateway", image = %image, "pull failed: {err:#}");
            }
        }
    }
}

async fn discover_networks(runtime: &DockerRuntime, pool: &ClientPool) {
    let hostname = std::env::var("HOSTNAME").ok().or_else(|| {
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
    });
    let Some(hostname) = hostname else {
        return;
    };
    match runtime.container_networks(&hostname).await {
        Ok(networks) => {
            tracing::info!(target = "gateway", networks = %networks.join(","), "discovered host networks");
            pool.set_networks(networks);
        }
        Err(err) => {
            tracing::debug!(target = "gateway", "network discovery failed: {err:#}");
        }
    }
}

/// Shutdown runs on a fresh deadline, never on a caller's context, so an
/// upstream cancellation cannot abort resource reaping.
async fn cleanup(gateway: &Gateway) {
    let work = async {
        if let Err(err) = gateway.provisioner.shutdown().await {
            tracing::warn!(target = "gateway", "provisioner shutdown failed: {err:#}");
        }
        gateway.pool.close().await;
    };
    if tokio::time::timeout(CLEANUP_DEADLINE, work).await.is_err() {
        tracing::warn!(
            target = "gateway",
            "cleanup did not finish within {}s",
            CLEANUP_DEADLINE.as_secs()
        );
    }
    tracing::info!(target = "gateway", session = %gateway.session, "shutdown complete");
}
