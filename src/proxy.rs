use std::collections::BTreeMap;

use anyhow::Result;
use futures::future::BoxFuture;

/// What a proxy run hands back for folding into a container spec.
#[derive(Debug, Clone, Default)]
pub struct ProxyTargetConfig {
    pub network: Option<String>,
    pub links: Vec<String>,
    pub dns: Vec<String>,
    pub env: BTreeMap<String, String>,
}

pub type ProxyCleanup = BoxFuture<'static, ()>;

/// Narrow capability for establishing egress proxies when a server declares
/// `allow-hosts`. The pool side owns the docker plumbing; the provisioner
/// only needs this one operation, which breaks what would otherwise be a
/// circular ownership between the two.
#[async_trait::async_trait]
pub trait ProxyRunner: Send + Sync {
    async fn run_proxies(
        &self,
        allow_hosts: &[String],
        long_running: bool,
    ) -> Result<(ProxyTargetConfig, Option<ProxyCleanup>)>;
}

/// Stand-in used when no proxy infrastructure is available: allow-hosts are
/// logged and the container runs on its configured networks unfiltered.
#[derive(Default)]
pub struct NoopProxyRunner;

#[async_trait::async_trait]
impl ProxyRunner for NoopProxyRunner {
    async fn run_proxies(
        &self,
        allow_hosts: &[String],
        _long_running: bool,
    ) -> Result<(ProxyTargetConfig, Option<ProxyCleanup>)> {
        tracing::warn!(
            target = "proxy",
            hosts = %allow_hosts.join(","),
            "no proxy runner available; allow-hosts not enforced"
        );
        Ok((ProxyTargetConfig::default(), None))
    }
}
