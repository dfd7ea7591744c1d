use std::sync::{Arc, RwLock};

use anyhow::{Result, anyhow, bail};
use futures::future::BoxFuture;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{
    ClientCapabilities, ClientInfo, ErrorData, Implementation, ListRootsResult, ProtocolVersion,
    Root, RootsCapabilities,
};
use rmcp::serve_client;
use rmcp::service::{RequestContext, RoleClient, RunningService};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use uuid::Uuid;

use crate::config::{Configuration, ServerConfig, ServerShape, ToolDefinition};
use crate::container::{ContainerHandle, ContainerSpec, RunResult};
use crate::resolver::ConfigResolver;

pub type McpClient = RunningService<RoleClient, GatewayClientHandler>;
pub type Cleanup = BoxFuture<'static, ()>;

/// Client side of the MCP initialize handshake: fixed protocol version,
/// `clientInfo` naming the provisioner, and a mutable root set the pool can
/// push updates into.
#[derive(Clone)]
pub struct GatewayClientHandler {
    info: ClientInfo,
    roots: Arc<RwLock<Vec<Root>>>,
}

impl GatewayClientHandler {
    pub fn new(provisioner: &str) -> Self {
        Self {
            info: ClientInfo {
                protocol_version: ProtocolVersion::V_2025_03_26,
                capabilities: ClientCapabilities {
                    roots: Some(RootsCapabilities {
                        list_changed: Some(true),
                    }),
                    ..Default::default()
                },
                client_info: Implementation {
                    name: format!("mcp-gateway ({provisioner})"),
                    version: env!("CARGO_PKG_VERSION").into(),
                    title: None,
                    website_url: None,
                    icons: None,
                },
            },
            roots: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn set_roots(&self, roots: Vec<Root>) {
        *self.roots.write().expect("roots lock poisoned") = roots;
    }
}

impl ClientHandler for GatewayClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }

    async fn list_roots(
        &self,
        _context: RequestContext<RoleClient>,
    ) -> Result<ListRootsResult, ErrorData> {
        Ok(ListRootsResult {
            roots: self.roots.read().expect("roots lock poisoned").clone(),
        })
    }
}

/// A freshly provisioned downstream session. `cleanup` owns whatever has to
/// be torn down with it (container stop, proxy teardown); the handler hands
/// the pool a way to update roots later.
pub struct ProvisionedClient {
    pub client: McpClient,
    pub handler: GatewayClientHandler,
    pub cleanup: Option<Cleanup>,
}

/// One provisioning backend. The decision tree (remote / static / persistent
/// container / ephemeral container) is shared; only the runtime and the
/// secret wiring differ between implementations.
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;

    fn pre_validate(&self, server: &ServerConfig) -> Result<()> {
        validate_deployment(server, false)
    }

    /// Captures the resolver built from the current snapshot and creates any
    /// shared resources the backend needs. Called on every reload.
    async fn initialize(
        &self,
        resolver: Arc<ConfigResolver>,
        configuration: &Configuration,
    ) -> Result<()>;

    async fn provision(&self, server: &ServerConfig) -> Result<ProvisionedClient>;

    /// Invokes one tool-bundle tool as a single synchronous container run.
    async fn run_tool(
        &self,
        server: &ServerConfig,
        tool: &ToolDefinition,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<RunResult>;

    /// Gives a tool-bundle container spec the same secret/config provider
    /// wiring MCP server containers get.
    fn apply_tool_providers(&self, spec: &mut ContainerSpec, tool_name: &str);

    async fn shutdown(&self) -> Result<()>;

    /// Startup sweep: removes gateway-managed resources left behind by
    /// crashed runs, selected by label and age. Best-effort.
    async fn sweep_stale(&self, _max_age: chrono::Duration) -> Result<()> {
        Ok(())
    }

    /// Networks discovered by the pool (gateway-in-container case); only the
    /// local backend cares.
    fn set_networks(&self, _networks: Vec<String>) {}
}

pub fn validate_deployment(server: &ServerConfig, allow_missing_image: bool) -> Result<()> {
    if server.name.trim().is_empty() {
        bail!("server name is empty");
    }
    if allow_missing_image {
        return Ok(());
    }
    match server.shape() {
        ServerShape::Remote => Ok(()),
        ServerShape::Container => {
            if server.image.trim().is_empty() {
                bail!("server {:?} has no image", server.name);
            }
            Ok(())
        }
        ServerShape::ToolBundle => {
            for tool in &server.tools {
                if tool.container.image.trim().is_empty() {
                    bail!("tool {:?} of server {:?} has no image", tool.name, server.name);
                }
            }
            Ok(())
        }
    }
}

/// Remote servers short-circuit the runtime entirely: plain HTTP client,
/// SSE when the endpoint says so (or came in through the deprecated alias).
pub async fn connect_remote(
    server: &ServerConfig,
    handler: GatewayClientHandler,
) -> Result<McpClient> {
    let url = server
        .remote_url()
        .ok_or_else(|| anyhow!("server {:?} has no remote url", server.name))?
        .to_string();
    let headers = server
        .remote
        .as_ref()
        .map(|r| r.headers.clone())
        .unwrap_or_default();
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in &headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| anyhow!("invalid header name {k}: {e}"))?;
        let value = reqwest::header::HeaderValue::from_str(v)
            .map_err(|e| anyhow!("invalid header value for {k}: {e}"))?;
        map.insert(name, value);
    }
    let http = reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| anyhow!("http client build: {e}"))?;

    if server.is_sse_remote() {
        let transport = SseClientTransport::start_with_client(
            http,
            SseClientConfig {
                sse_endpoint: url.into(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| anyhow!("sse start: {e}"))?;
        serve_client(handler, transport)
            .await
            .map_err(|e| anyhow!("initialize {}: {e}", server.name))
    } else {
        let transport = StreamableHttpClientTransport::with_client(
            http,
            StreamableHttpClientTransportConfig::with_uri(url),
        );
        serve_client(handler, transport)
            .await
            .map_err(|e| anyhow!("initialize {}: {e}", server.name))
    }
}

/// Wraps an attached container's stdio in an MCP client session, performing
/// the initialize handshake.
pub async fn connect_stdio(
    server_name: &str,
    handle: ContainerHandle,
    handler: GatewayClientHandler,
) -> Result<McpClient> {
    let ContainerHandle {
        id,
        stdin,
        stdout,
        stderr,
    } = handle;
    if let Some(stderr) = stderr {
        drain_stderr(id.clone(), stderr);
    }
    serve_client(handler, (stdout, stdin))
        .await
        .map_err(|e| anyhow!("initialize {server_name}: {e}"))
}

fn drain_stderr(id: String, stderr: Box<dyn tokio::io::AsyncRead + Send + Unpin>) {
    use tokio::io::AsyncBufReadExt;
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target = "downstream", container = %id, "{line}");
        }
    });
}

/// Unique, DNS-safe container/pod name for one provisioned instance.
pub fn container_name(server: &str, component: &str) -> String {
    let mut slug: String = server
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.truncate(32);
    let suffix = &Uuid::new_v4().simple().to_string()[..6];
    format!("mcp-{component}-{}-{suffix}", slug.trim_matches('-'))
}

/// Substitutes `{{param}}` placeholders in a tool command from the call
/// arguments. Elements that were a single placeholder with no value are
/// dropped, so optional parameters disappear instead of passing "".
pub fn render_tool_command(
    command: &[String],
    arguments: &serde_json::Map<String, serde_json::Value>,
) -> Vec<String> {
    let render = |value: &serde_json::Value| -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    };
    let mut out = Vec::with_capacity(command.len());
    for element in command {
        let trimmed = element.trim();
        let whole = trimmed.strip_prefix("{{").and_then(|r| r.strip_suffix("}}"));
        if let Some(key) = whole {
            if let Some(value) = arguments.get(key.trim()) {
                out.push(render(value));
            }
            continue;
        }
        let mut rendered = String::with_capacity(element.len());
        let mut rest = element.as_str();
        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                rendered.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let key = after[..end].trim();
            if let Some(value) = arguments.get(key) {
                rendered.push_str(&render(value));
            }
            rest = &after[end + 2..];
        }
        rendered.push_str(rest);
        out.push(rendered);
    }
    out
}
