use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use rmcp::model as mcp;

use crate::config::{Configuration, ServerConfig, ServerShape, ToolDefinition};
use crate::pool::{AcquireOptions, ClientPool};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_CONCURRENCY: usize = 8;

/// Capabilities are namespaced `<server>/<name>` so cross-server collisions
/// cannot happen and routing stays syntactic.
pub fn qualify(server: &str, name: &str) -> String {
    format!("{server}/{name}")
}

pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once('/')
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub server: String,
    pub tool: mcp::Tool,
    /// Present for tool-bundle entries: the handler runs this container once
    /// per call instead of going through a session.
    pub bundle: Option<ToolDefinition>,
}

#[derive(Clone)]
pub struct RegisteredPrompt {
    pub server: String,
    pub prompt: mcp::Prompt,
}

#[derive(Clone)]
pub struct RegisteredResource {
    pub server: String,
    pub resource: mcp::Resource,
}

#[derive(Clone)]
pub struct RegisteredTemplate {
    pub server: String,
    pub template: mcp::ResourceTemplate,
}

#[derive(Clone, Default)]
pub struct CapabilitySet {
    pub tools: BTreeMap<String, RegisteredTool>,
    pub prompts: BTreeMap<String, RegisteredPrompt>,
    pub resources: BTreeMap<String, RegisteredResource>,
    pub templates: BTreeMap<String, RegisteredTemplate>,
}

impl CapabilitySet {
    fn merge(&mut self, other: CapabilitySet) {
        self.tools.extend(other.tools);
        self.prompts.extend(other.prompts);
        for (uri, resource) in other.resources {
            if let Some(existing) = self.resources.get(&uri) {
                tracing::warn!(
                    target = "aggregator",
                    uri = %uri,
                    winner = %existing.server,
                    loser = %resource.server,
                    "resource uri collision; first registration wins"
                );
                continue;
            }
            self.resources.insert(uri, resource);
        }
        self.templates.extend(other.templates);
    }

    fn names(&self) -> RegisteredNames {
        RegisteredNames {
            tools: self.tools.keys().cloned().collect(),
            prompts: self.prompts.keys().cloned().collect(),
            resources: self.resources.keys().cloned().collect(),
            templates: self.templates.keys().cloned().collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisteredNames {
    pub tools: Vec<String>,
    pub prompts: Vec<String>,
    pub resources: Vec<String>,
    pub templates: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SwapReport {
    pub added: usize,
    pub removed: Vec<String>,
}

/// Holds the live capability snapshot. Handlers read an `Arc` that is swapped
/// whole on reload, so between two reloads a request sees either the old or
/// the new registration set, never a mix. The registry remembers the exact
/// names it registered last so removal on reload is precise.
pub struct CapabilityRegistry {
    current: RwLock<Arc<CapabilitySet>>,
    last: Mutex<RegisteredNames>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self {
            current: RwLock::new(Arc::new(CapabilitySet::default())),
            last: Mutex::new(RegisteredNames::default()),
        }
    }
}

impl CapabilityRegistry {
    pub fn snapshot(&self) -> Arc<CapabilitySet> {
        self.current.read().expect("registry lock poisoned").clone()
    }

    pub fn swap(&self, next: CapabilitySet) -> SwapReport {
        let next_names = next.names();
        let mut last = self.last.lock().expect("registry names lock poisoned");
        let removed: Vec<String> = last
            .tools
            .iter()
            .chain(&last.prompts)
            .chain(&last.resources)
            .chain(&last.templates)
            .filter(|name| {
                !next_names.tools.contains(name)
                    && !next_names.prompts.contains(name)
                    && !next_names.resources.contains(name)
                    && !next_names.templates.contains(name)
            })
            .cloned()
            .collect();
        let added = next_names.tools.len()
            + next_names.prompts.len()
            + next_names.resources.len()
            + next_names.templates.len();
        *last = next_names;
        *self.current.write().expect("registry lock poisoned") = Arc::new(next);
        SwapReport { added, removed }
    }
}

/// Fans the list calls out over every enabled server (bounded concurrency,
/// per-server timeout) and assembles the registration set. Servers that fail
/// or time out contribute nothing and are logged.
pub async fn aggregate_capabilities(
    pool: &ClientPool,
    configuration: &Configuration,
) -> CapabilitySet {
    let jobs = configuration.enabled_servers().into_iter().map(|server| {
        let server = server.clone();
        async move {
            if server.shape() == ServerShape::ToolBundle {
                return Some(bundle_capabilities(&server));
            }
            match tokio::time::timeout(LIST_TIMEOUT, list_server(pool, &server)).await {
                Ok(Ok(set)) => Some(set),
                Ok(Err(err)) => {
                    tracing::warn!(target = "aggregator", server = %server.name, "listing failed: {err:#}");
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        target = "aggregator",
                        server = %server.name,
                        "listing timed out after {}s",
                        LIST_TIMEOUT.as_secs()
                    );
                    None
                }
            }
        }
    });
    let results: Vec<Option<CapabilitySet>> = futures::stream::iter(jobs)
        .buffer_unordered(LIST_CONCURRENCY)
        .collect()
        .await;

    let mut set = CapabilitySet::default();
    for partial in results.into_iter().flatten() {
        set.merge(partial);
    }
    // persisted per-tool toggles, default enabled
    set.tools.retain(|qualified, _| match split_qualified(qualified) {
        Some((server, tool)) => configuration.is_tool_enabled(server, tool),
        None => true,
    });
    set
}

fn bundle_capabilities(server: &ServerConfig) -> CapabilitySet {
    let mut set = CapabilitySet::default();
    for tool in &server.tools {
        let schema = tool
            .parameters
            .as_object()
            .cloned()
            .unwrap_or_default();
        let qualified = qualify(&server.name, &tool.name);
        let registered = RegisteredTool {
            server: server.name.clone(),
            tool: mcp::Tool::new(qualified.clone(), tool.description.clone(), schema),
            bundle: Some(tool.clone()),
        };
        if set.tools.insert(qualified.clone(), registered).is_some() {
            tracing::warn!(target = "aggregator", tool = %qualified, "duplicate bundle tool; last wins");
        }
    }
    set
}

async fn list_server(pool: &ClientPool, server: &ServerConfig) -> Result<CapabilitySet> {
    let client = pool
        .acquire(
            server,
            AcquireOptions {
                upstream_session: None,
                read_only: true,
            },
        )
        .await?;

    let listed = async {
        let capabilities = client
            .client()
            .peer()
            .peer_info()
            .map(|info| info.capabilities.clone())
            .unwrap_or_default();
        let mut set = CapabilitySet::default();

        if capabilities.tools.is_some() {
            for mut tool in client.client().list_all_tools().await? {
                let qualified = qualify(&server.name, &tool.name);
                tool.name = qualified.clone().into();
                set.tools.insert(
                    qualified,
                    RegisteredTool {
                        server: server.name.clone(),
                        tool,
                        bundle: None,
                    },
                );
            }
        }
        if capabilities.prompts.is_some() {
            for mut prompt in client.client().list_all_prompts().await? {
                let qualified = qualify(&server.name, &prompt.name);
                prompt.name = qualified.clone();
                set.prompts.insert(
                    qualified,
                    RegisteredPrompt {
                        server: server.name.clone(),
                        prompt,
                    },
                );
            }
        }
        if capabilities.resources.is_some() {
            for resource in client.client().list_all_resources().await? {
                set.resources.insert(
                    resource.uri.clone(),
                    RegisteredResource {
                        server: server.name.clone(),
                        resource,
                    },
                );
            }
            for template in client.client().list_all_resource_templates().await? {
                set.templates.insert(
                    template.uri_template.clone(),
                    RegisteredTemplate {
                        server: server.name.clone(),
                        template,
                    },
                );
            }
        }
        Ok(set)
    }
    .await;

    pool.release(client).await;
    listed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolContainer;

    fn tool(name: &str) -> mcp::Tool {
        mcp::Tool::new(name.to_string(), "d", mcp::JsonObject::default())
    }

    fn set_with_tools(server: &str, names: &[&str]) -> CapabilitySet {
        let mut set = CapabilitySet::default();
        for name in names {
            let qualified = qualify(server, name);
            set.tools.insert(
                qualified.clone(),
                RegisteredTool {
                    server: server.to_string(),
                    tool: tool(&qualified),
                    bundle: None,
                },
            );
        }
        set
    }

    #[test]
    fn qualified_names_round_trip() {
        let name = qualify("github", "create_issue");
        assert_eq!(name, "github/create_issue");
        assert_eq!(split_qualified(&name), Some(("github", "create_issue")));
    }

    #[test]
    fn swap_reports_exactly_the_dropped_names() {
        let registry = CapabilityRegistry::default();
        let report = registry.swap(set_with_tools("a", &["x", "y"]));
        assert!(report.removed.is_empty());
        assert_eq!(report.added, 2);

        let report = registry.swap(set_with_tools("a", &["y", "z"]));
        assert_eq!(report.removed, vec!["a/x".to_string()]);
        assert_eq!(report.added, 2);
    }

    #[test]
    fn snapshot_is_atomic_across_swap() {
        let registry = CapabilityRegistry::default();
        registry.swap(set_with_tools("a", &["x"]));
        let before = registry.snapshot();
        registry.swap(set_with_tools("a", &["y"]));
        let after = registry.snapshot();
        // the old snapshot is untouched by the swap
        assert!(before.tools.contains_key("a/x"));
        assert!(!before.tools.contains_key("a/y"));
        assert!(after.tools.contains_key("a/y"));
        assert!(!after.tools.contains_key("a/x"));
    }

    #[test]
    fn resource_collisions_keep_the_first_registration() {
        let mut base = CapabilitySet::default();
        let resource = mcp::RawResource::new("file:///data", "data").no_annotation();
        base.merge(CapabilitySet {
            resources: BTreeMap::from([(
                "file:///data".to_string(),
                RegisteredResource {
                    server: "a".into(),
                    resource: resource.clone(),
                },
            )]),
            ..Default::default()
        });
        base.merge(CapabilitySet {
            resources: BTreeMap::from([(
                "file:///data".to_string(),
                RegisteredResource {
                    server: "b".into(),
                    resource,
                },
            )]),
            ..Default::default()
        });
        assert_eq!(base.resources["file:///data"].server, "a");
    }

    #[test]
    fn bundle_tools_register_directly() {
        let server = ServerConfig {
            name: "toolbox".into(),
            tools: vec![ToolDefinition {
                name: "echo".into(),
                description: "prints".into(),
                parameters: serde_json::json!({"type": "object"}),
                container: ToolContainer {
                    image: "alpine".into(),
                    ..Default::default()
                },
            }],
            ..Default::default()
        };
        let set = bundle_capabilities(&server);
        let registered = &set.tools["toolbox/echo"];
        assert!(registered.bundle.is_some());
        assert_eq!(registered.tool.name, "toolbox/echo");
    }
}
