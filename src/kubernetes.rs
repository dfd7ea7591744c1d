use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, EmptyDirVolumeSource, EnvFromSource, EnvVar,
    EnvVarSource, Event, ExecAction, Lifecycle, LifecycleHandler, Pod, PodSpec,
    ResourceRequirements, Secret, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::AsyncReadExt;

use crate::container::{
    COMPLETION_POLL, COMPLETION_TIMEOUT, ContainerHandle, ContainerRuntime, ContainerSpec,
    DEFAULT_READINESS_TIMEOUT, MARKER_POLL, MARKER_TIMEOUT, PRE_STOP_SLEEP_SECS, READINESS_POLL,
    RunResult, STOP_GRACE,
};
use crate::registry::{ImageConfig, RegistryClient};
use crate::session::{SessionId, managed_selector, session_selector};

const MAIN_CONTAINER: &str = "main";
const SIDECAR_CONTAINER: &str = "logs";
const SIDECAR_IMAGE: &str = "alpine";
const LOGS_VOLUME: &str = "logs";
const LOGS_PATH: &str = "/logs";

/// Cluster runtime speaking to the API server directly. Persistent servers
/// are single-container Pods attached over the `attach` subresource; tool
/// bundles run as two-container Pods that capture stdio into a shared volume.
pub struct KubeRuntime {
    client: Client,
    namespace: String,
    registry: RegistryClient,
}

impl KubeRuntime {
    pub async fn new(
        kubeconfig: Option<PathBuf>,
        context: Option<String>,
        namespace: String,
    ) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(&path)
                    .with_context(|| format!("read kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(
                    kc,
                    &KubeConfigOptions {
                        context,
                        ..Default::default()
                    },
                )
                .await
                .context("kubeconfig options")?
            }
            None if context.is_some() => Config::from_kubeconfig(&KubeConfigOptions {
                context,
                ..Default::default()
            })
            .await
            .context("kubeconfig context")?,
            None => Config::infer().await.context("infer cluster config")?,
        };
        let client = Client::try_from(config).context("build cluster client")?;
        Ok(Self {
            client,
            namespace,
            registry: RegistryClient::new(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn image_config(&self, image: &str) -> ImageConfig {
        match self.registry.inspect(image).await {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(target = "kube", image = %image, "image inspect failed, assuming no entrypoint: {err:#}");
                ImageConfig::default()
            }
        }
    }

    async fn wait_for_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let pods = self.pods();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pod = pods.get(name).await.context("poll pod")?;
            let status = pod.status.as_ref();
            if let Some(status) = status {
                if status.phase.as_deref() == Some("Failed") {
                    return Err(anyhow!("pod entered Failed phase"));
                }
                let ready = status
                    .container_statuses
                    .as_ref()
                    .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready));
                if status.phase.as_deref() == Some("Running") && ready {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("pod not ready after {}s", timeout.as_secs()));
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
    }

    /// Waits for the main container to terminate. The Pod itself never
    /// reaches Succeeded because the log sidecar outlives it. The container's
    /// own exit status is the wrapper's trailing `touch`, not the wrapped
    /// command, so it is not returned from here; the real code is read back
    /// from `exit_code.log`.
    async fn wait_for_main_terminated(&self, name: &str) -> Result<()> {
        let pods = self.pods();
        let deadline = tokio::time::Instant::now() + COMPLETION_TIMEOUT;
        loop {
            let pod = pods.get(name).await.context("poll pod")?;
            let terminated = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|cs| cs.iter().find(|c| c.name == MAIN_CONTAINER))
                .and_then(|c| c.state.as_ref())
                .is_some_and(|s| s.terminated.is_some());
            if terminated {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "tool container did not finish within {}s",
                    COMPLETION_TIMEOUT.as_secs()
                ));
            }
            tokio::time::sleep(COMPLETION_POLL).await;
        }
    }

    /// The wrapper touches the marker only after its redirections are
    /// flushed; waiting for it defeats the log-not-flushed race.
    async fn wait_for_marker(&self, name: &str) {
        let deadline = tokio::time::Instant::now() + MARKER_TIMEOUT;
        loop {
            let probe = self
                .exec_capture(
                    name,
                    SIDECAR_CONTAINER,
                    vec![
                        "sh".into(),
                        "-c".into(),
                        format!("test -f {LOGS_PATH}/complete.marker && echo present"),
                    ],
                )
                .await;
            if matches!(&probe, Ok(out) if out.contains("present")) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(target = "kube", pod = %name, "completion marker never appeared; logs may be truncated");
                return;
            }
            tokio::time::sleep(MARKER_POLL).await;
        }
    }

    async fn exec_capture(
        &self,
        name: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<String> {
        let mut attached = self
            .pods()
            .exec(
                name,
                command,
                &AttachParams::default()
                    .container(container)
                    .stdin(false)
                    .stdout(true)
                    .stderr(true),
            )
            .await
            .context("exec in pod")?;
        let mut out = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_string(&mut out).await.context("read exec output")?;
        }
        let _ = attached.join().await;
        Ok(out)
    }

    /// Collects everything useful about a failed Pod into one error: status
    /// message/reason, per-container waiting/terminated details, the five
    /// most recent events and the last ten log lines.
    async fn diagnose(&self, name: &str) -> String {
        let mut lines: Vec<String> = Vec::new();
        if let Ok(pod) = self.pods().get(name).await
            && let Some(status) = pod.status
        {
            if let Some(reason) = status.reason {
                lines.push(format!("pod reason: {reason}"));
            }
            if let Some(message) = status.message {
                lines.push(format!("pod message: {message}"));
            }
            for cs in status.container_statuses.unwrap_or_default() {
                if let Some(state) = cs.state {
                    if let Some(waiting) = state.waiting {
                        lines.push(format!(
                            "container {} waiting: {} {}",
                            cs.name,
                            waiting.reason.unwrap_or_default(),
                            waiting.message.unwrap_or_default()
                        ));
                    }
                    if let Some(terminated) = state.terminated {
                        lines.push(format!(
                            "container {} terminated: exit={} {} {}",
                            cs.name,
                            terminated.exit_code,
                            terminated.reason.unwrap_or_default(),
                            terminated.message.unwrap_or_default()
                        ));
                    }
                }
            }
        }
        let events: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);
        if let Ok(list) = events
            .list(&ListParams::default().fields(&format!("involvedObject.name={name}")))
            .await
        {
            let mut items = list.items;
            items.sort_by_key(|e| e.last_timestamp.clone().map(|t| t.0));
            for event in items.iter().rev().take(5) {
                lines.push(format!(
                    "event: {} {}",
                    event.reason.clone().unwrap_or_default(),
                    event.message.clone().unwrap_or_default()
                ));
            }
        }
        if let Ok(logs) = self
            .pods()
            .logs(
                name,
                &LogParams {
                    container: Some(MAIN_CONTAINER.into()),
                    tail_lines: Some(10),
                    ..Default::default()
                },
            )
            .await
            && !logs.is_empty()
        {
            lines.push(format!("last logs:\n{logs}"));
        }
        if lines.is_empty() {
            "no diagnostics available".into()
        } else {
            lines.join("\n")
        }
    }

    async fn delete_pod(&self, name: &str, grace: Option<u32>) {
        let params = match grace {
            Some(secs) => DeleteParams::default().grace_period(secs),
            None => DeleteParams::default(),
        };
        if let Err(err) = self.pods().delete(name, &params).await {
            tracing::debug!(target = "kube", pod = %name, "delete failed: {err}");
        }
    }

    pub async fn remove_session_resources(&self, session: &SessionId) -> Result<()> {
        self.remove_by_selector(&session_selector(session), None).await
    }

    pub async fn remove_stale_resources(&self, max_age: chrono::Duration) -> Result<()> {
        self.remove_by_selector(&managed_selector(), Some(max_age)).await
    }

    async fn remove_by_selector(
        &self,
        selector: &str,
        older_than: Option<chrono::Duration>,
    ) -> Result<()> {
        let lp = ListParams::default().labels(selector);
        let cutoff = older_than.map(|age| chrono::Utc::now() - age);
        macro_rules! sweep {
            ($ty:ty, $what:literal) => {{
                let api: Api<$ty> = Api::namespaced(self.client.clone(), &self.namespace);
                if let Ok(list) = api.list(&lp).await {
                    for item in list.items {
                        let meta = &item.metadata;
                        let stale = match (&cutoff, &meta.creation_timestamp) {
                            (Some(cutoff), Some(created)) => created.0 < *cutoff,
                            (Some(_), None) => false,
                            (None, _) => true,
                        };
                        if stale && let Some(name) = &meta.name {
                            tracing::info!(target = "kube", kind = $what, name = %name, "removing");
                            let _ = api.delete(name, &DeleteParams::default().grace_period(0)).await;
                        }
                    }
                }
            }};
        }
        sweep!(Pod, "pod");
        sweep!(Secret, "secret");
        sweep!(ConfigMap, "configmap");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for KubeRuntime {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<RunResult> {
        let image = self.image_config(&spec.image).await;
        let pod = build_tool_pod(spec, &image);
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .with_context(|| format!("create tool pod {}", spec.name))?;

        let outcome = async {
            if let Err(err) = self.wait_for_main_terminated(&spec.name).await {
                let diagnosis = self.diagnose(&spec.name).await;
                return Err(err.context(diagnosis));
            }
            self.wait_for_marker(&spec.name).await;
            Ok(read_back_run_result(|command| {
                self.exec_capture(&spec.name, SIDECAR_CONTAINER, command)
            })
            .await)
        }
        .await;

        self.delete_pod(&spec.name, Some(0)).await;
        outcome
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let image = self.image_config(&spec.image).await;
        let pod = build_server_pod(spec, &image);
        tracing::info!(target = "kube", pod = %spec.name, image = %spec.image, "creating");
        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .with_context(|| format!("create pod {}", spec.name))?;

        if spec.persistent {
            let timeout = spec.startup_timeout.unwrap_or(DEFAULT_READINESS_TIMEOUT);
            if let Err(err) = self.wait_for_ready(&spec.name, timeout).await {
                let diagnosis = self.diagnose(&spec.name).await;
                self.delete_pod(&spec.name, Some(0)).await;
                return Err(err.context(diagnosis));
            }
        }

        let mut attached = match self
            .pods()
            .attach(
                &spec.name,
                &AttachParams::default()
                    .container(MAIN_CONTAINER)
                    .stdin(true)
                    .stdout(true)
                    .stderr(true),
            )
            .await
        {
            Ok(attached) => attached,
            Err(err) => {
                let diagnosis = self.diagnose(&spec.name).await;
                self.delete_pod(&spec.name, Some(0)).await;
                return Err(anyhow!(err).context(diagnosis).context("attach to pod"));
            }
        };

        let stdin = attached.stdin().ok_or_else(|| anyhow!("attach gave no stdin"))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| anyhow!("attach gave no stdout"))?;
        let stderr = attached.stderr();
        Ok(ContainerHandle {
            id: spec.name.clone(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as _),
        })
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        tracing::info!(target = "kube", pod = %id, "stopping");
        self.delete_pod(id, Some(STOP_GRACE.as_secs() as u32)).await;
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        loop {
            match self.pods().get(id).await {
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                _ if tokio::time::Instant::now() >= deadline => break,
                _ => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
        self.delete_pod(id, Some(0)).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        // per-session pods are reaped by the provisioner's label sweep
        Ok(())
    }
}

fn env_vars(spec: &ContainerSpec) -> Option<Vec<EnvVar>> {
    let mut env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect();
    for (name, key_ref) in &spec.secret_key_refs {
        env.push(EnvVar {
            name: name.clone(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: key_ref.secret.clone(),
                    key: key_ref.key.clone(),
                    optional: Some(true),
                }),
                ..Default::default()
            }),
        });
    }
    (!env.is_empty()).then_some(env)
}

fn env_from(spec: &ContainerSpec) -> Option<Vec<EnvFromSource>> {
    let refs: Vec<EnvFromSource> = spec
        .config_map_refs
        .iter()
        .map(|name| EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: name.clone(),
                optional: Some(true),
            }),
            ..Default::default()
        })
        .collect();
    (!refs.is_empty()).then_some(refs)
}

fn resource_limits(spec: &ContainerSpec) -> Option<ResourceRequirements> {
    let mut limits = BTreeMap::new();
    if let Some(cpus) = spec.cpus {
        limits.insert("cpu".to_string(), Quantity(cpus.to_string()));
    }
    if let Some(memory) = &spec.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!limits.is_empty()).then_some(ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    })
}

/// Single-container manifest for a persistent or ephemeral MCP server Pod.
/// When the image declares an entrypoint, the user command goes into `args`
/// so the entrypoint is preserved.
pub fn build_server_pod(spec: &ContainerSpec, image: &ImageConfig) -> Pod {
    let (command, args) = if spec.command.is_empty() {
        (None, None)
    } else if image.entrypoint.is_empty() {
        (Some(spec.command.clone()), None)
    } else {
        (None, Some(spec.command.clone()))
    };
    let container = Container {
        name: MAIN_CONTAINER.into(),
        image: Some(spec.image.clone()),
        command,
        args,
        stdin: Some(true),
        stdin_once: Some(false),
        tty: Some(false),
        env: env_vars(spec),
        env_from: env_from(spec),
        resources: resource_limits(spec),
        lifecycle: Some(Lifecycle {
            // keep stdout readable while the gateway drains
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "sleep".into(),
                        PRE_STOP_SLEEP_SECS.to_string(),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".into()),
            termination_grace_period_seconds: Some(STOP_GRACE.as_secs() as i64),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Two-container manifest for a synchronous tool run. The main container's
/// process is wrapped so its stdout/stderr/exit code land in a volume the
/// sidecar can read back after termination.
pub fn build_tool_pod(spec: &ContainerSpec, image: &ImageConfig) -> Pod {
    let main = Container {
        name: MAIN_CONTAINER.into(),
        image: Some(spec.image.clone()),
        command: Some(vec!["/bin/sh".into(), "-c".into(), wrapper_script(spec, image)]),
        env: env_vars(spec),
        env_from: env_from(spec),
        resources: resource_limits(spec),
        volume_mounts: Some(vec![VolumeMount {
            name: LOGS_VOLUME.into(),
            mount_path: LOGS_PATH.into(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let sidecar = Container {
        name: SIDECAR_CONTAINER.into(),
        image: Some(SIDECAR_IMAGE.into()),
        command: Some(vec!["sh".into(), "-c".into(), "sleep 3600".into()]),
        volume_mounts: Some(vec![VolumeMount {
            name: LOGS_VOLUME.into(),
            mount_path: LOGS_PATH.into(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![main, sidecar],
            restart_policy: Some("Never".into()),
            termination_grace_period_seconds: Some(STOP_GRACE.as_secs() as i64),
            volumes: Some(vec![Volume {
                name: LOGS_VOLUME.into(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `<entrypoint> <cmd-or-user-args>` reconstructed and wrapped so that the
/// streams and exit code survive the process.
fn wrapper_script(spec: &ContainerSpec, image: &ImageConfig) -> String {
    let mut full: Vec<String> = image.entrypoint.clone();
    if spec.command.is_empty() {
        full.extend(image.cmd.iter().cloned());
    } else {
        full.extend(spec.command.iter().cloned());
    }
    let line = full
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{line} >{LOGS_PATH}/stdout.log 2>{LOGS_PATH}/stderr.log; \
         echo $? > {LOGS_PATH}/exit_code.log; touch {LOGS_PATH}/complete.marker"
    )
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Reads the wrapper's three files back through the sidecar once the main
/// container has terminated. Missing streams read as empty; a missing or
/// garbled exit code reads as -1 and the run is not a success.
async fn read_back_run_result<E, Fut>(exec: E) -> RunResult
where
    E: Fn(Vec<String>) -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    let cat = |file: &str| vec!["cat".to_string(), format!("{LOGS_PATH}/{file}")];
    let stdout = exec(cat("stdout.log")).await.unwrap_or_default();
    let stderr = exec(cat("stderr.log")).await.unwrap_or_default();
    let exit_code = parse_exit_code(&exec(cat("exit_code.log")).await.unwrap_or_default());
    RunResult {
        stdout,
        stderr,
        exit_code,
        success: exit_code == 0,
    }
}

/// Exit code as written by the wrapper into `exit_code.log`.
pub fn parse_exit_code(raw: &str) -> i64 {
    raw.trim().parse().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Component, resource_labels};

    fn spec() -> ContainerSpec {
        let session = SessionId::generate();
        ContainerSpec {
            name: "mcp-github-abc123".into(),
            image: "ghcr.io/github/github-mcp-server:latest".into(),
            command: vec!["serve".into(), "--stdio".into()],
            labels: resource_labels(&session, Component::Server, "github"),
            persistent: true,
            ..Default::default()
        }
    }

    #[test]
    fn server_pod_attaches_stdio_without_tty() {
        let pod = build_server_pod(&spec(), &ImageConfig::default());
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.stdin, Some(true));
        assert_eq!(container.stdin_once, Some(false));
        assert_eq!(container.tty, Some(false));
        let pod_spec = pod.spec.as_ref().unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.termination_grace_period_seconds, Some(5));
        let pre_stop = container
            .lifecycle
            .as_ref()
            .and_then(|l| l.pre_stop.as_ref())
            .and_then(|h| h.exec.as_ref())
            .and_then(|e| e.command.clone())
            .unwrap();
        assert_eq!(pre_stop, vec!["sleep".to_string(), "10".to_string()]);
    }

    #[test]
    fn entrypoint_image_puts_user_command_in_args() {
        let image = ImageConfig {
            entrypoint: vec!["python".into()],
            cmd: vec![],
        };
        let pod = build_server_pod(&spec(), &image);
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert!(container.command.is_none());
        assert_eq!(
            container.args.as_deref(),
            Some(&["serve".to_string(), "--stdio".to_string()][..])
        );
    }

    #[test]
    fn plain_image_uses_command_directly() {
        let pod = build_server_pod(&spec(), &ImageConfig::default());
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            container.command.as_deref(),
            Some(&["serve".to_string(), "--stdio".to_string()][..])
        );
        assert!(container.args.is_none());
    }

    #[test]
    fn pods_carry_the_full_label_set() {
        let spec = spec();
        for pod in [
            build_server_pod(&spec, &ImageConfig::default()),
            build_tool_pod(&spec, &ImageConfig::default()),
        ] {
            let labels = pod.metadata.labels.as_ref().unwrap();
            assert_eq!(labels, &spec.labels);
            assert_eq!(labels.len(), 5);
        }
    }

    #[test]
    fn tool_pod_has_sidecar_sharing_logs_volume() {
        let pod = build_tool_pod(&spec(), &ImageConfig::default());
        let pod_spec = pod.spec.as_ref().unwrap();
        assert_eq!(pod_spec.containers.len(), 2);
        for container in &pod_spec.containers {
            let mounts = container.volume_mounts.as_ref().unwrap();
            assert!(mounts.iter().any(|m| m.mount_path == "/logs"));
        }
        assert!(pod_spec.volumes.as_ref().unwrap()[0].empty_dir.is_some());
    }

    #[test]
    fn wrapper_preserves_entrypoint_and_captures_exit_code() {
        let image = ImageConfig {
            entrypoint: vec!["python".into()],
            cmd: vec!["-c".into(), "print(1)".into()],
        };
        let script = wrapper_script(
            &ContainerSpec {
                command: vec![],
                ..spec()
            },
            &image,
        );
        assert!(script.starts_with("python -c 'print(1)'"));
        assert!(script.contains(">/logs/stdout.log 2>/logs/stderr.log"));
        assert!(script.contains("echo $? > /logs/exit_code.log"));
        assert!(script.contains("touch /logs/complete.marker"));
    }

    #[test]
    fn wrapper_prefers_user_command_over_image_cmd() {
        let image = ImageConfig {
            entrypoint: vec!["python".into()],
            cmd: vec!["-c".into(), "print(1)".into()],
        };
        let script = wrapper_script(&spec(), &image);
        assert!(script.starts_with("python serve --stdio"));
    }

    #[test]
    fn secret_refs_become_env_value_from() {
        let mut s = spec();
        s.secret_key_refs.insert(
            "GITHUB_TOKEN".into(),
            crate::container::SecretKeyRef {
                secret: "mcp-gateway-secrets".into(),
                key: "github.token".into(),
            },
        );
        let env = env_vars(&s).unwrap();
        let var = env.iter().find(|e| e.name == "GITHUB_TOKEN").unwrap();
        let key_ref = var
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(key_ref.name.as_deref(), Some("mcp-gateway-secrets"));
        assert_eq!(key_ref.key, "github.token");
        assert!(var.value.is_none());
    }

    #[test]
    fn shell_quote_escapes_only_when_needed(){
        assert_eq!(shell_quote("plain-arg"), "plain-arg");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn exit_code_parse_tolerates_noise() {
        assert_eq!(parse_exit_code("3\n"), 3);
        assert_eq!(parse_exit_code("garbage"), -1);
    }

    // Drives the post-termination read-back against an in-memory stand-in
    // for the sidecar's /logs volume.
    async fn read_back_from(files: &[(&str, &str)]) -> RunResult {
        let fs: std::collections::HashMap<String, String> = files
            .iter()
            .map(|(path, contents)| (path.to_string(), contents.to_string()))
            .collect();
        read_back_run_result(|command| {
            let fs = fs.clone();
            async move {
                assert_eq!(command[0], "cat");
                fs.get(&command[1])
                    .cloned()
                    .ok_or_else(|| anyhow!("cat: {}: No such file or directory", command[1]))
            }
        })
        .await
    }

    #[tokio::test]
    async fn read_back_reports_the_wrapped_commands_exit_code() {
        // a wrapped `exit 3`: the container itself exits 0 via the trailing
        // touch, the volume carries the real code
        let result = read_back_from(&[
            ("/logs/stdout.log", ""),
            ("/logs/stderr.log", "boom\n"),
            ("/logs/exit_code.log", "3\n"),
        ])
        .await;
        assert_eq!(result.exit_code, 3);
        assert!(!result.success);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "boom\n");
    }

    #[tokio::test]
    async fn read_back_returns_streams_byte_exact_on_success() {
        let result = read_back_from(&[
            ("/logs/stdout.log", "1\n"),
            ("/logs/stderr.log", ""),
            ("/logs/exit_code.log", "0\n"),
        ])
        .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.success);
        assert_eq!(result.stdout, "1\n");
        assert_eq!(result.stderr, "");
    }

    #[tokio::test]
    async fn read_back_without_files_is_a_failure() {
        let result = read_back_from(&[]).await;
        assert_eq!(result.exit_code, -1);
        assert!(!result.success);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "");
    }
}
