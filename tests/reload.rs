mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::FakeProvisioner;
use mcp_gateway::config::{Configuration, ServerConfig, ToolContainer, ToolDefinition};
use mcp_gateway::gateway::Gateway;
use mcp_gateway::pool::ClientPool;
use mcp_gateway::session::SessionId;

fn server(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.into(),
        image: "example/server".into(),
        ..Default::default()
    }
}

fn gateway_with(provisioner: Arc<FakeProvisioner>) -> Arc<Gateway> {
    let pool = Arc::new(ClientPool::new(provisioner.clone(), false));
    Gateway::new(
        SessionId::generate(),
        provisioner,
        pool,
        Vec::new(),
        false,
        false,
    )
}

#[tokio::test]
async fn reload_aggregates_and_hot_swaps() {
    let provisioner = Arc::new(FakeProvisioner::default());
    let gateway = gateway_with(provisioner.clone());

    let mut configuration = Configuration::default();
    configuration.servers.insert("a".into(), server("a"));
    gateway.reload(configuration, None).await.unwrap();

    let before = gateway.registry.snapshot();
    assert!(before.tools.contains_key("a/echo"));
    assert_eq!(
        provisioner.cleanups(),
        1,
        "listing sessions are ephemeral and closed after use"
    );

    let mut configuration = Configuration::default();
    configuration.servers.insert("b".into(), server("b"));
    gateway.reload(configuration, None).await.unwrap();

    let after = gateway.registry.snapshot();
    assert!(!after.tools.contains_key("a/echo"));
    assert!(after.tools.contains_key("b/echo"));
    // a snapshot taken before the swap still serves the old set whole
    assert!(before.tools.contains_key("a/echo"));
    assert!(!before.tools.contains_key("b/echo"));
}

#[tokio::test]
async fn reload_honors_the_server_selection() {
    let provisioner = Arc::new(FakeProvisioner::default());
    let gateway = gateway_with(provisioner.clone());

    let mut configuration = Configuration::default();
    configuration.servers.insert("a".into(), server("a"));
    configuration.servers.insert("b".into(), server("b"));
    gateway
        .reload(configuration, Some(&["b".to_string()]))
        .await
        .unwrap();

    let snapshot = gateway.registry.snapshot();
    assert!(!snapshot.tools.contains_key("a/echo"));
    assert!(snapshot.tools.contains_key("b/echo"));
    assert_eq!(provisioner.constructions(), 1);
}

#[tokio::test]
async fn tool_bundles_register_without_sessions() {
    let provisioner = Arc::new(FakeProvisioner::default());
    let gateway = gateway_with(provisioner.clone());

    let mut configuration = Configuration::default();
    configuration.servers.insert(
        "toolbox".into(),
        ServerConfig {
            name: "toolbox".into(),
            tools: vec![ToolDefinition {
                name: "hello".into(),
                description: "says hello".into(),
                parameters: serde_json::json!({"type": "object"}),
                container: ToolContainer {
                    image: "alpine".into(),
                    command: vec!["echo".into(), "hello".into()],
                    ..Default::default()
                },
            }],
            ..Default::default()
        },
    );
    gateway.reload(configuration, None).await.unwrap();

    let snapshot = gateway.registry.snapshot();
    let registered = &snapshot.tools["toolbox/hello"];
    assert!(registered.bundle.is_some());
    assert_eq!(
        provisioner.constructions(),
        0,
        "bundles register directly, no session is provisioned"
    );
}

#[tokio::test]
async fn disabled_tools_are_dropped_from_the_set() {
    let provisioner = Arc::new(FakeProvisioner::default());
    let gateway = gateway_with(provisioner.clone());

    let mut configuration = Configuration::default();
    configuration.servers.insert("a".into(), server("a"));
    configuration.tools_enabled.insert(
        "a".into(),
        BTreeMap::from([("echo".to_string(), false)]),
    );
    gateway.reload(configuration, None).await.unwrap();

    let snapshot = gateway.registry.snapshot();
    assert!(snapshot.tools.is_empty());
}

#[tokio::test]
async fn failed_listing_leaves_other_servers_registered() {
    let provisioner = Arc::new(FakeProvisioner::default());
    provisioner
        .fail_next
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let gateway = gateway_with(provisioner.clone());

    // one of the two listings fails; the reload still succeeds with the rest
    let mut configuration = Configuration::default();
    configuration.servers.insert("a".into(), server("a"));
    configuration.servers.insert("b".into(), server("b"));
    gateway.reload(configuration, None).await.unwrap();

    let snapshot = gateway.registry.snapshot();
    assert_eq!(snapshot.tools.len(), 1);
}
