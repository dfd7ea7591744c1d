use std::collections::BTreeMap;

use uuid::Uuid;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_SESSION: &str = "mcp-gateway/session";

pub const MANAGED_BY: &str = "mcp-gateway";

/// What kind of external resource a label set is attached to. Shutdown and
/// stale-resource sweeps select on these labels, never on resource names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Server,
    ServerSecret,
    ServerConfig,
    Tool,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Server => "mcp-server",
            Component::ServerSecret => "mcp-server-secret",
            Component::ServerConfig => "mcp-server-config",
            Component::Tool => "mcp-tool",
        }
    }
}

/// Process-wide identifier for one gateway run. Every container, pod, secret
/// and config map the gateway creates carries it as a label so that cleanup
/// can be done with selectors alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        SessionId(format!("mcp-gateway-{}", &raw[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn resource_labels(
    session: &SessionId,
    component: Component,
    server_name: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_COMPONENT.to_string(), component.as_str().to_string()),
        (LABEL_INSTANCE.to_string(), session.as_str().to_string()),
        (LABEL_SESSION.to_string(), session.as_str().to_string()),
        (LABEL_NAME.to_string(), server_name.to_string()),
    ])
}

/// Selector matching every resource of this run, for session cleanup.
pub fn session_selector(session: &SessionId) -> String {
    format!("{LABEL_SESSION}={}", session.as_str())
}

/// Selector matching every gateway-managed resource of any run, for the
/// stale-resource sweep (age filtering happens on top of it).
pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGED_BY}")
}
