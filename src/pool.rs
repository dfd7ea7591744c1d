use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rmcp::model::Root;
use tokio::sync::{Mutex, RwLock};

use crate::config::ServerConfig;
use crate::provisioner::{Cleanup, GatewayClientHandler, McpClient, Provisioner};

/// Pool key: one cached downstream session per (server, upstream session).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub server: String,
    pub session: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    pub upstream_session: Option<String>,
    /// Listing-only acquires never install long-lived entries.
    pub read_only: bool,
}

/// A live downstream session plus everything needed to tear it down. The
/// catalog config it was built from is memoized alongside.
pub struct PooledClient {
    pub server_name: String,
    pub upstream_session: Option<String>,
    pub long_lived: bool,
    pub config: ServerConfig,
    client: McpClient,
    handler: GatewayClientHandler,
    cleanup: Mutex<Option<Cleanup>>,
}

impl PooledClient {
    pub fn client(&self) -> &McpClient {
        &self.client
    }

    pub async fn update_roots(&self, roots: Vec<Root>) {
        self.handler.set_roots(roots);
        if let Err(err) = self.client.peer().notify_roots_list_changed().await {
            tracing::debug!(target = "pool", server = %self.server_name, "roots notify failed: {err}");
        }
    }

    async fn close(&self) {
        self.client.cancellation_token().cancel();
        if let Some(cleanup) = self.cleanup.lock().await.take() {
            cleanup.await;
        }
    }
}

// Shared futures need a cloneable error.
#[derive(Clone)]
struct BuildError(Arc<anyhow::Error>);

impl BuildError {
    fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    fn to_anyhow(&self) -> anyhow::Error {
        anyhow!("{:#}", self.0)
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<Arc<PooledClient>, BuildError>>>;

/// Memoized one-shot constructor. The real work runs on a spawned task, so a
/// canceled awaiter detaches instead of tearing down the shared client; every
/// awaiter observes the same outcome.
struct LazyEntry {
    build: SharedBuild,
}

impl LazyEntry {
    fn spawn(
        provisioner: Arc<dyn Provisioner>,
        server: ServerConfig,
        upstream_session: Option<String>,
    ) -> Self {
        let handle = tokio::spawn(build_client(provisioner, server, upstream_session, true));
        let build = async move {
            match handle.await {
                Ok(Ok(client)) => Ok(client),
                Ok(Err(err)) => Err(BuildError::new(err)),
                Err(join_err) => Err(BuildError::new(anyhow!(
                    "client construction panicked: {join_err}"
                ))),
            }
        }
        .boxed()
        .shared();
        Self { build }
    }
}

async fn build_client(
    provisioner: Arc<dyn Provisioner>,
    server: ServerConfig,
    upstream_session: Option<String>,
    long_lived: bool,
) -> Result<Arc<PooledClient>> {
    let provisioned = provisioner
        .provision(&server)
        .await
        .with_context(|| format!("provision {} via {}", server.name, provisioner.name()))?;
    if let Some(info) = provisioned.client.peer().peer_info() {
        tracing::debug!(
            target = "pool",
            server = %server.name,
            downstream = %info.server_info.name,
            version = %info.server_info.version,
            "session established"
        );
    }
    Ok(Arc::new(PooledClient {
        server_name: server.name.clone(),
        upstream_session,
        long_lived,
        config: server,
        client: provisioned.client,
        handler: provisioned.handler,
        cleanup: Mutex::new(provisioned.cleanup),
    }))
}

/// Caches downstream sessions by [`ClientKey`] and guarantees at-most-one
/// construction per key regardless of concurrent acquirers. Ephemeral
/// acquires bypass the map entirely.
pub struct ClientPool {
    provisioner: Arc<dyn Provisioner>,
    long_lived_default: bool,
    entries: RwLock<HashMap<ClientKey, Arc<LazyEntry>>>,
    networks: std::sync::RwLock<Vec<String>>,
}

impl ClientPool {
    pub fn new(provisioner: Arc<dyn Provisioner>, long_lived_default: bool) -> Self {
        Self {
            provisioner,
            long_lived_default,
            entries: RwLock::new(HashMap::new()),
            networks: std::sync::RwLock::new(Vec::new()),
        }
    }

    fn is_long_lived(&self, server: &ServerConfig, options: &AcquireOptions) -> bool {
        (server.long_lived || self.long_lived_default)
            && options.upstream_session.is_some()
            && !options.read_only
    }

    pub async fn acquire(
        &self,
        server: &ServerConfig,
        options: AcquireOptions,
    ) -> Result<Arc<PooledClient>> {
        if !self.is_long_lived(server, &options) {
            // transient path: construction is canceled with the caller
            return build_client(
                self.provisioner.clone(),
                server.clone(),
                options.upstream_session,
                false,
            )
            .await;
        }

        let key = ClientKey {
            server: server.name.clone(),
            session: options.upstream_session.clone(),
        };
        let existing = self.entries.read().await.get(&key).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                let mut map = self.entries.write().await;
                map.entry(key.clone())
                    .or_insert_with(|| {
                        Arc::new(LazyEntry::spawn(
                            self.provisioner.clone(),
                            server.clone(),
                            options.upstream_session.clone(),
                        ))
                    })
                    .clone()
            }
        };
        self.await_entry(&key, entry).await
    }

    async fn await_entry(
        &self,
        key: &ClientKey,
        entry: Arc<LazyEntry>,
    ) -> Result<Arc<PooledClient>> {
        match entry.build.clone().await {
            Ok(client) => Ok(client),
            Err(err) => {
                // evict exactly this failed entry so the next acquire retries
                let mut map = self.entries.write().await;
                if let Some(current) = map.get(key)
                    && Arc::ptr_eq(current, &entry)
                {
                    map.remove(key);
                }
                Err(err.to_anyhow())
            }
        }
    }

    /// No-op for clients held by a long-lived entry; closes everything else.
    pub async fn release(&self, client: Arc<PooledClient>) {
        if client.long_lived {
            return;
        }
        client.close().await;
    }

    /// Atomically orphans the map, then closes every already-built client.
    pub async fn close(&self) {
        let entries = {
            let mut map = self.entries.write().await;
            std::mem::take(&mut *map)
        };
        for (key, entry) in entries {
            if let Some(Ok(client)) = entry.build.peek() {
                tracing::debug!(target = "pool", server = %key.server, "closing pooled client");
                client.close().await;
            }
        }
    }

    /// Pushes a new root set into every entry bound to the given upstream
    /// session.
    pub async fn update_roots(&self, upstream_session: &str, roots: Vec<Root>) {
        let entries: Vec<(ClientKey, Arc<LazyEntry>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, entry) in entries {
            if key.session.as_deref() == Some(upstream_session)
                && let Some(Ok(client)) = entry.build.peek()
            {
                client.update_roots(roots.clone()).await;
            }
        }
    }

    /// Host networks discovered at startup; recorded here and propagated to
    /// the provisioner so later specs inherit them.
    pub fn set_networks(&self, networks: Vec<String>) {
        *self.networks.write().expect("networks lock poisoned") = networks.clone();
        self.provisioner.set_networks(networks);
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.read().expect("networks lock poisoned").clone()
    }
}
