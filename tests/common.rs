//! Shared fixtures: a stub downstream MCP server living on an in-memory
//! duplex pipe and a provisioner that hands out real rmcp sessions to it.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use mcp_gateway::config::{Configuration, ServerConfig, ToolDefinition};
use mcp_gateway::container::{ContainerSpec, RunResult};
use mcp_gateway::pool::AcquireOptions;
use mcp_gateway::provisioner::{GatewayClientHandler, ProvisionedClient, Provisioner};
use mcp_gateway::resolver::ConfigResolver;
use rmcp::model as mcp;
use rmcp::service::{NotificationContext, RequestContext, RoleServer};
use rmcp::{Service as McpService, serve_client, serve_server};

#[derive(Clone, Default)]
pub struct StubServer {
    pub roots_changes: Arc<AtomicUsize>,
}

impl McpService<RoleServer> for StubServer {
    async fn handle_request(
        &self,
        request: mcp::ClientRequest,
        _context: RequestContext<RoleServer>,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        match request {
            mcp::ClientRequest::InitializeRequest(_) => {
                Ok(mcp::ServerResult::InitializeResult(stub_info()))
            }
            mcp::ClientRequest::ListToolsRequest(_) => {
                Ok(mcp::ServerResult::ListToolsResult(mcp::ListToolsResult {
                    tools: vec![mcp::Tool::new("echo", "echo", mcp::JsonObject::default())],
                    next_cursor: None,
                }))
            }
            mcp::ClientRequest::CallToolRequest(_) => {
                Ok(mcp::ServerResult::CallToolResult(mcp::CallToolResult {
                    content: vec![mcp::Content::text("ok")],
                    structured_content: None,
                    is_error: None,
                    meta: None,
                }))
            }
            _ => Ok(mcp::ServerResult::empty(())),
        }
    }

    async fn handle_notification(
        &self,
        notification: mcp::ClientNotification,
        _context: NotificationContext<RoleServer>,
    ) -> Result<(), mcp::ErrorData> {
        if matches!(
            notification,
            mcp::ClientNotification::RootsListChangedNotification(_)
        ) {
            self.roots_changes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn get_info(&self) -> mcp::ServerInfo {
        stub_info()
    }
}

fn stub_info() -> mcp::InitializeResult {
    mcp::InitializeResult {
        protocol_version: mcp::ProtocolVersion::V_2025_03_26,
        capabilities: mcp::ServerCapabilities::builder().enable_tools().build(),
        server_info: mcp::Implementation {
            name: "stub".into(),
            version: "0.0.1".into(),
            title: None,
            website_url: None,
            icons: None,
        },
        instructions: None,
    }
}

/// Constructs real rmcp sessions over duplex pipes, counting constructions,
/// cleanups and injectable failures.
#[derive(Default)]
pub struct FakeProvisioner {
    pub constructions: AtomicUsize,
    pub cleanups: Arc<AtomicUsize>,
    pub fail_next: AtomicUsize,
    pub delay_ms: u64,
    pub stubs: std::sync::Mutex<Vec<StubServer>>,
}

impl FakeProvisioner {
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            ..Default::default()
        }
    }

    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn stub_for(&self, index: usize) -> StubServer {
        self.stubs.lock().unwrap()[index].clone()
    }
}

#[async_trait::async_trait]
impl Provisioner for FakeProvisioner {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn initialize(
        &self,
        _resolver: Arc<ConfigResolver>,
        _configuration: &Configuration,
    ) -> Result<()> {
        Ok(())
    }

    async fn provision(&self, _server: &ServerConfig) -> Result<ProvisionedClient> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(anyhow!("injected provisioning failure"));
        }

        let (upstream, downstream) = tokio::io::duplex(4096);
        let stub = StubServer::default();
        self.stubs.lock().unwrap().push(stub.clone());
        tokio::spawn(async move {
            let (read, write) = tokio::io::split(downstream);
            if let Ok(running) = serve_server(stub, (read, write)).await {
                let _ = running.waiting().await;
            }
        });

        let (read, write) = tokio::io::split(upstream);
        let handler = GatewayClientHandler::new("fake");
        let client = serve_client(handler.clone(), (read, write))
            .await
            .map_err(|e| anyhow!("client init: {e}"))?;
        self.constructions.fetch_add(1, Ordering::SeqCst);

        let cleanups = self.cleanups.clone();
        Ok(ProvisionedClient {
            client,
            handler,
            cleanup: Some(Box::pin(async move {
                cleanups.fetch_add(1, Ordering::SeqCst);
            })),
        })
    }

    async fn run_tool(
        &self,
        _server: &ServerConfig,
        _tool: &ToolDefinition,
        _arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<RunResult> {
        Ok(RunResult {
            stdout: "ran".into(),
            success: true,
            ..Default::default()
        })
    }

    fn apply_tool_providers(&self, _spec: &mut ContainerSpec, _tool_name: &str) {}

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub fn long_lived_server(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.into(),
        image: "example/server".into(),
        long_lived: true,
        ..Default::default()
    }
}

pub fn session(name: &str) -> AcquireOptions {
    AcquireOptions {
        upstream_session: Some(name.into()),
        read_only: false,
    }
}
