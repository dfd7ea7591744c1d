use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::config::{ConfigProvider, FileConfigurationSource};
use crate::features::{
    FEATURE_CONFIGURED_CATALOGS, FEATURE_KUBERNETES_PROVISIONING, is_feature_enabled_with,
};
use crate::gateway::{TransportKind, in_container};
use crate::interceptor::{self, Interceptor};
use crate::managers::ProviderMode;

pub const DEFAULT_PORT: u16 = 8811;
const DEFAULT_STATIC_ENDPOINT: &str = "http://localhost:8811/mcp";
const IN_CONTAINER_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(
    name = "mcp-gateway",
    version,
    about = "Aggregates containerized MCP servers behind a single endpoint"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway.
    Run(Box<RunArgs>),
    /// Inspect or change persisted feature flags.
    Feature {
        #[command(subcommand)]
        action: FeatureAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum FeatureAction {
    Enable { name: String },
    Disable { name: String },
    List,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportArg {
    Stdio,
    Sse,
    #[value(alias = "http", alias = "streamable", alias = "streamable-http")]
    Streaming,
}

impl TransportArg {
    pub fn kind(self) -> TransportKind {
        match self {
            TransportArg::Stdio => TransportKind::Stdio,
            TransportArg::Sse => TransportKind::Sse,
            TransportArg::Streaming => TransportKind::Streaming,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerArg {
    Docker,
    #[value(alias = "k8s")]
    Kubernetes,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterProviderArg {
    /// The gateway materializes the resource from its own secret sources.
    #[value(name = "docker-engine", alias = "docker")]
    DockerEngine,
    /// The resource already exists in the cluster; only references are
    /// generated.
    #[value(name = "cluster", alias = "k8s", alias = "kubernetes-cluster")]
    Cluster,
}

impl ClusterProviderArg {
    pub fn mode(self) -> ProviderMode {
        match self {
            ClusterProviderArg::DockerEngine => ProviderMode::SelfManaged,
            ClusterProviderArg::Cluster => ProviderMode::PreExisting,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Comma-separated server names to enable; empty means the registry
    /// selection (or everything).
    #[arg(long, value_delimiter = ',')]
    pub servers: Vec<String>,

    #[arg(long = "catalog")]
    pub catalogs: Vec<PathBuf>,

    /// Appended with lowest precedence.
    #[arg(long = "additional-catalog")]
    pub additional_catalogs: Vec<PathBuf>,

    #[arg(long)]
    pub registry: Option<PathBuf>,

    #[arg(long = "additional-registry")]
    pub additional_registries: Vec<PathBuf>,

    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long = "additional-config")]
    pub additional_configs: Vec<PathBuf>,

    #[arg(long = "tools-config")]
    pub tools_config: Option<PathBuf>,

    #[arg(long = "additional-tools-config")]
    pub additional_tools_configs: Vec<PathBuf>,

    /// Colon-separated secret file paths; the literal `docker-desktop`
    /// selects the platform secret API.
    #[arg(long)]
    pub secrets: Option<String>,

    /// `when:type:path` hook around tool calls, repeatable.
    #[arg(long = "interceptor")]
    pub interceptors: Vec<String>,

    #[arg(long, value_enum, default_value_t = TransportArg::Stdio)]
    pub transport: TransportArg,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub log_calls: bool,

    #[arg(long)]
    pub block_secrets: bool,

    #[arg(long)]
    pub block_network: bool,

    #[arg(long)]
    pub verify_signatures: bool,

    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub verbose: bool,

    /// Treat every server as long-lived.
    #[arg(long)]
    pub long_lived: bool,

    #[arg(long)]
    pub debug_dns: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub watch: bool,

    /// Speak to an already-running side-loaded server instead of starting
    /// containers.
    #[arg(long = "static")]
    pub static_mode: bool,

    /// Experimental: streaming transport, no watching.
    #[arg(long)]
    pub central: bool,

    #[arg(long)]
    pub cpus: Option<u64>,

    /// Memory limit with unit, e.g. `512m`.
    #[arg(long)]
    pub memory: Option<String>,

    /// Seconds to wait for a server container to become ready.
    #[arg(long = "max-server-startup-timeout")]
    pub max_server_startup_timeout: Option<u64>,

    #[arg(long, value_enum, default_value_t = ProvisionerArg::Docker)]
    pub provisioner: ProvisionerArg,

    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, default_value = "default")]
    pub namespace: String,

    #[arg(long = "kube-context")]
    pub kube_context: Option<String>,

    #[arg(long = "cluster-secret-provider", value_enum, default_value_t = ClusterProviderArg::DockerEngine)]
    pub cluster_secret_provider: ClusterProviderArg,

    #[arg(long = "cluster-secret-name", default_value = "mcp-gateway-secrets")]
    pub cluster_secret_name: String,

    #[arg(long = "cluster-config-provider", value_enum, default_value_t = ClusterProviderArg::DockerEngine)]
    pub cluster_config_provider: ClusterProviderArg,

    #[arg(long = "cluster-config-name", default_value = "mcp-gateway-config")]
    pub cluster_config_name: String,

    /// Include catalogs configured in the user config dir (requires the
    /// `configured-catalogs` feature).
    #[arg(long)]
    pub use_configured_catalogs: bool,
}

impl RunArgs {
    /// Applies the flag-forcing rules and the IN_CONTAINER defaults before
    /// validation.
    pub fn normalize(&mut self) {
        if self.central {
            self.transport = TransportArg::Streaming;
            self.watch = false;
        }
        if self.static_mode {
            self.watch = false;
        }
        if in_container() {
            self.watch = false;
            self.verify_signatures = true;
            if self.max_server_startup_timeout.is_none() {
                self.max_server_startup_timeout =
                    Some(IN_CONTAINER_STARTUP_TIMEOUT.as_secs());
            }
        }
    }

    pub fn validate(&self, cp: &dyn ConfigProvider) -> Result<()> {
        if self.transport == TransportArg::Stdio && self.port.is_some() {
            bail!("--port cannot be used with the stdio transport");
        }
        if self.provisioner == ProvisionerArg::Kubernetes
            && !is_feature_enabled_with(cp, FEATURE_KUBERNETES_PROVISIONING)
        {
            bail!(
                "the kubernetes provisioner requires `mcp-gateway feature enable {FEATURE_KUBERNETES_PROVISIONING}`"
            );
        }
        if self.use_configured_catalogs
            && !is_feature_enabled_with(cp, FEATURE_CONFIGURED_CATALOGS)
        {
            bail!(
                "--use-configured-catalogs requires `mcp-gateway feature enable {FEATURE_CONFIGURED_CATALOGS}`"
            );
        }
        self.parsed_interceptors()?;
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn parsed_interceptors(&self) -> Result<Vec<Interceptor>> {
        self.interceptors
            .iter()
            .map(|spec| interceptor::parse(spec))
            .collect()
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.max_server_startup_timeout.map(Duration::from_secs)
    }

    pub fn static_endpoint(&self) -> Option<String> {
        self.static_mode.then(|| {
            std::env::var("MCP_GATEWAY_STATIC_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_STATIC_ENDPOINT.to_string())
        })
    }

    /// Catalog merge order is lowest-precedence first: additional catalogs,
    /// then user-configured ones, then the CLI catalogs.
    pub fn configuration_source(&self, cp: &dyn ConfigProvider) -> FileConfigurationSource {
        let mut catalog_paths = self.additional_catalogs.clone();
        if self.use_configured_catalogs {
            let dir = cp.base_dir().join("catalogs");
            if let Ok(entries) = std::fs::read_dir(&dir) {
                let mut configured: Vec<PathBuf> = entries
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| {
                        matches!(
                            p.extension().and_then(|e| e.to_str()),
                            Some("yaml") | Some("yml")
                        )
                    })
                    .collect();
                configured.sort();
                catalog_paths.extend(configured);
            }
        }
        catalog_paths.extend(self.catalogs.clone());
        let lowest_first = |additional: &[PathBuf], main: &Option<PathBuf>| {
            let mut paths = additional.to_vec();
            paths.extend(main.clone());
            paths
        };
        FileConfigurationSource {
            catalog_paths,
            registry_paths: lowest_first(&self.additional_registries, &self.registry),
            config_paths: lowest_first(&self.additional_configs, &self.config),
            tools_paths: lowest_first(&self.additional_tools_configs, &self.tools_config),
            secrets_spec: self.secrets.clone(),
            server_names: self.servers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[derive(Clone)]
    struct TempConfigProvider(PathBuf);

    impl ConfigProvider for TempConfigProvider {
        fn base_dir(&self) -> PathBuf {
            self.0.clone()
        }
    }

    fn parse(args: &[&str]) -> RunArgs {
        let mut full = vec!["mcp-gateway", "run"];
        full.extend(args);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Run(run) => *run,
            _ => unreachable!(),
        }
    }

    #[test]
    fn transport_aliases_map_to_streaming() {
        for alias in ["streaming", "http", "streamable", "streamable-http"] {
            let args = parse(&["--transport", alias]);
            assert_eq!(args.transport, TransportArg::Streaming, "alias {alias}");
        }
    }

    #[test]
    fn stdio_rejects_port() {
        let dir = tempfile::tempdir().unwrap();
        let cp = TempConfigProvider(dir.path().to_path_buf());
        let args = parse(&["--port", "9000"]);
        let err = args.validate(&cp).unwrap_err();
        assert!(err.to_string().contains("--port"));

        let args = parse(&["--transport", "sse", "--port", "9000"]);
        assert!(args.validate(&cp).is_ok());
        assert_eq!(args.port(), 9000);
    }

    #[test]
    fn non_stdio_defaults_port() {
        let args = parse(&["--transport", "streaming"]);
        assert_eq!(args.port(), DEFAULT_PORT);
    }

    #[test]
    fn central_forces_streaming_without_watch() {
        let mut args = parse(&["--central"]);
        args.normalize();
        assert_eq!(args.transport, TransportArg::Streaming);
        assert!(!args.watch);
    }

    #[test]
    #[serial_test::serial]
    fn static_disables_watch() {
        let mut args = parse(&["--static"]);
        assert!(args.watch);
        args.normalize();
        assert!(!args.watch);
        assert_eq!(
            args.static_endpoint().as_deref(),
            Some("http://localhost:8811/mcp")
        );
    }

    #[test]
    #[serial_test::serial]
    fn static_endpoint_honors_the_env_override() {
        let args = parse(&["--static"]);
        unsafe { std::env::set_var("MCP_GATEWAY_STATIC_ENDPOINT", "http://tunnel:9000/mcp") };
        let endpoint = args.static_endpoint();
        unsafe { std::env::remove_var("MCP_GATEWAY_STATIC_ENDPOINT") };
        assert_eq!(endpoint.as_deref(), Some("http://tunnel:9000/mcp"));
    }

    #[test]
    fn kubernetes_provisioner_is_feature_gated() {
        let dir = tempfile::tempdir().unwrap();
        let cp = TempConfigProvider(dir.path().to_path_buf());
        let args = parse(&["--provisioner", "kubernetes"]);
        let err = args.validate(&cp).unwrap_err();
        assert!(err.to_string().contains("kubernetes-provisioning"));

        crate::features::set_feature_with(&cp, FEATURE_KUBERNETES_PROVISIONING, true).unwrap();
        assert!(args.validate(&cp).is_ok());
    }

    #[test]
    fn provisioner_and_secret_provider_aliases() {
        let args = parse(&["--provisioner", "k8s"]);
        assert_eq!(args.provisioner, ProvisionerArg::Kubernetes);
        let args = parse(&["--cluster-secret-provider", "docker"]);
        assert_eq!(args.cluster_secret_provider.mode(), ProviderMode::SelfManaged);
        let args = parse(&["--cluster-secret-provider", "kubernetes-cluster"]);
        assert_eq!(args.cluster_secret_provider.mode(), ProviderMode::PreExisting);
    }

    #[test]
    fn bad_interceptor_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let cp = TempConfigProvider(dir.path().to_path_buf());
        let args = parse(&["--interceptor", "sometimes:exec:/x"]);
        assert!(args.validate(&cp).is_err());
    }

    #[test]
    fn servers_flag_is_comma_separated() {
        let args = parse(&["--servers", "github,fetch"]);
        assert_eq!(args.servers, vec!["github".to_string(), "fetch".to_string()]);
    }

    #[test]
    fn catalog_precedence_orders_additional_first() {
        let dir = tempfile::tempdir().unwrap();
        let cp = TempConfigProvider(dir.path().to_path_buf());
        let args = parse(&[
            "--catalog",
            "/tmp/cli.yaml",
            "--additional-catalog",
            "/tmp/extra.yaml",
        ]);
        let source = args.configuration_source(&cp);
        assert_eq!(
            source.catalog_paths,
            vec![PathBuf::from("/tmp/extra.yaml"), PathBuf::from("/tmp/cli.yaml")]
        );
    }
}
