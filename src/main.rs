use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use mcp_gateway::cli::{Cli, Command, FeatureAction, ProvisionerArg, RunArgs};
use mcp_gateway::config::OsConfigProvider;
use mcp_gateway::docker::DockerRuntime;
use mcp_gateway::docker_provisioner::{DockerProvisioner, DockerProvisionerOptions};
use mcp_gateway::features::{KNOWN_FEATURES, load_features_with, set_feature_with};
use mcp_gateway::gateway::{self, RunConfig, in_dind};
use mcp_gateway::kubernetes::KubeRuntime;
use mcp_gateway::kubernetes_provisioner::{KubernetesProvisioner, KubernetesProvisionerOptions};
use mcp_gateway::logging;
use mcp_gateway::provisioner::Provisioner;
use mcp_gateway::proxy::NoopProxyRunner;
use mcp_gateway::session::SessionId;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Feature { action } => match run_feature(action) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
        Command::Run(args) => {
            logging::init(args.verbose);
            match run(*args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(target = "gateway", "fatal: {err:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run_feature(action: FeatureAction) -> Result<()> {
    let cp = OsConfigProvider;
    match action {
        FeatureAction::Enable { name } => {
            set_feature_with(&cp, &name, true)?;
            println!("{name}: enabled");
        }
        FeatureAction::Disable { name } => {
            set_feature_with(&cp, &name, false)?;
            println!("{name}: disabled");
        }
        FeatureAction::List => {
            let map = load_features_with(&cp);
            for name in KNOWN_FEATURES {
                let state = map.get(*name).map(String::as_str).unwrap_or("disabled");
                println!("{name}: {state}");
            }
        }
    }
    Ok(())
}

async fn run(mut args: RunArgs) -> Result<()> {
    let cp = OsConfigProvider;
    args.normalize();
    args.validate(&cp)?;
    if args.verify_signatures {
        tracing::info!(
            target = "gateway",
            "signature verification is not performed by this build"
        );
    }
    if args.debug_dns {
        tracing::debug!(target = "gateway", "dns debugging enabled");
    }

    let session = SessionId::generate();
    let source = Arc::new(args.configuration_source(&cp));
    let interceptors = args.parsed_interceptors()?;

    let (provisioner, docker_runtime): (Arc<dyn Provisioner>, Option<Arc<DockerRuntime>>) =
        match args.provisioner {
            ProvisionerArg::Docker => {
                let runtime = Arc::new(DockerRuntime::new(args.verbose));
                let options = DockerProvisionerOptions {
                    static_endpoint: args.static_endpoint(),
                    long_lived_default: args.long_lived,
                    block_network: args.block_network,
                    privileged: in_dind(),
                    cpus: args.cpus,
                    memory: args.memory.clone(),
                    startup_timeout: args.startup_timeout(),
                };
                let provisioner = DockerProvisioner::new(
                    runtime.clone(),
                    session.clone(),
                    Arc::new(NoopProxyRunner),
                    options,
                );
                (Arc::new(provisioner), Some(runtime))
            }
            ProvisionerArg::Kubernetes => {
                let runtime = Arc::new(
                    KubeRuntime::new(
                        args.kubeconfig.clone(),
                        args.kube_context.clone(),
                        args.namespace.clone(),
                    )
                    .await
                    .context("kubernetes provisioner unavailable")?,
                );
                let options = KubernetesProvisionerOptions {
                    secret_provider: args.cluster_secret_provider.mode(),
                    config_provider: args.cluster_config_provider.mode(),
                    secret_name: args.cluster_secret_name.clone(),
                    config_name: args.cluster_config_name.clone(),
                    long_lived_default: args.long_lived,
                    cpus: args.cpus,
                    memory: args.memory.clone(),
                    startup_timeout: args.startup_timeout(),
                };
                (
                    Arc::new(KubernetesProvisioner::new(runtime, session.clone(), options)),
                    None,
                )
            }
        };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(target = "gateway", "interrupt received; shutting down");
                shutdown.cancel();
            }
        });
    }

    gateway::run(RunConfig {
        session,
        source,
        provisioner,
        docker_runtime,
        transport: args.transport.kind(),
        port: args.port(),
        watch: args.watch,
        static_mode: args.static_mode,
        dry_run: args.dry_run,
        long_lived: args.long_lived,
        log_calls: args.log_calls,
        block_secrets: args.block_secrets,
        interceptors,
        selected: (!args.servers.is_empty()).then(|| args.servers.clone()),
        shutdown,
    })
    .await
}
