use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::container::{
    ContainerHandle, ContainerRuntime, ContainerSpec, RunResult, STOP_GRACE,
};
use crate::session::{SessionId, managed_selector, session_selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    #[default]
    Never,
    Missing,
    Always,
}

impl PullPolicy {
    fn as_str(self) -> &'static str {
        match self {
            PullPolicy::Never => "never",
            PullPolicy::Missing => "missing",
            PullPolicy::Always => "always",
        }
    }
}

/// Local-container runtime driving the host daemon through its CLI.
pub struct DockerRuntime {
    binary: String,
    verbose: bool,
    pull_policy: PullPolicy,
    children: Mutex<HashMap<String, Child>>,
}

impl DockerRuntime {
    pub fn new(verbose: bool) -> Self {
        Self {
            binary: std::env::var("MCP_GATEWAY_DOCKER_CLI").unwrap_or_else(|_| "docker".into()),
            verbose,
            pull_policy: PullPolicy::default(),
            children: Mutex::new(HashMap::new()),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output> {
        tracing::debug!(target = "docker", args = %args.join(" "), "cli");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("{} {}", self.binary, args.first().cloned().unwrap_or_default()))
    }

    async fn docker_ok(&self, args: &[String]) -> Result<String> {
        let out = self.docker(args).await?;
        if !out.status.success() {
            return Err(anyhow!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker(&["image".into(), "inspect".into(), image.into()])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub async fn pull_image(&self, image: &str) -> Result<()> {
        self.docker_ok(&["pull".into(), image.into()]).await.map(|_| ())
    }

    /// Networks the given container (usually the gateway's own, when running
    /// inside one) is attached to.
    pub async fn container_networks(&self, container: &str) -> Result<Vec<String>> {
        let out = self
            .docker_ok(&[
                "inspect".into(),
                "--format".into(),
                "{{json .NetworkSettings.Networks}}".into(),
                container.into(),
            ])
            .await?;
        let map: HashMap<String, serde_json::Value> =
            serde_json::from_str(out.trim()).context("parse networks")?;
        Ok(map.into_keys().collect())
    }

    pub async fn remove_session_resources(&self, session: &SessionId) -> Result<()> {
        self.remove_by_filter(&format!("label={}", session_selector(session)), None)
            .await
    }

    pub async fn remove_stale_resources(&self, max_age: chrono::Duration) -> Result<()> {
        self.remove_by_filter(&format!("label={}", managed_selector()), Some(max_age))
            .await
    }

    async fn remove_by_filter(
        &self,
        filter: &str,
        older_than: Option<chrono::Duration>,
    ) -> Result<()> {
        let out = self
            .docker_ok(&["ps".into(), "-aq".into(), "--filter".into(), filter.into()])
            .await?;
        let ids: Vec<&str> = out.split_whitespace().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let mut doomed: Vec<String> = Vec::new();
        match older_than {
            None => doomed.extend(ids.iter().map(|s| s.to_string())),
            Some(age) => {
                let cutoff = chrono::Utc::now() - age;
                for id in ids {
                    let created = self
                        .docker_ok(&[
                            "inspect".into(),
                            "--format".into(),
                            "{{.Created}}".into(),
                            id.into(),
                        ])
                        .await?;
                    if let Ok(ts) = created.trim().parse::<chrono::DateTime<chrono::Utc>>()
                        && ts < cutoff
                    {
                        doomed.push(id.to_string());
                    }
                }
            }
        }
        for id in doomed {
            tracing::info!(target = "docker", container = %id, "removing");
            let _ = self.docker(&["rm".into(), "-f".into(), id]).await;
        }
        Ok(())
    }

    fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        build_run_args(spec, self.pull_policy)
    }
}

/// Pure argument builder for `docker run`, split out for tests.
fn build_run_args(spec: &ContainerSpec, pull: PullPolicy) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into()];
    if spec.remove_after_run {
        args.push("--rm".into());
    }
    if spec.interactive {
        args.push("-i".into());
    }
    args.push("--name".into());
    args.push(spec.name.clone());
    args.push("--security-opt".into());
    args.push("no-new-privileges".into());
    args.push("--pull".into());
    args.push(pull.as_str().into());
    for (key, value) in &spec.labels {
        args.push("-l".into());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    for volume in &spec.volumes {
        args.push("-v".into());
        args.push(volume.clone());
    }
    // `docker run` only accepts one network; extra ones are connected after
    // start in start_container.
    if let Some(network) = spec.networks.first() {
        args.push("--network".into());
        args.push(network.clone());
    }
    if let Some(overrides) = &spec.docker {
        for link in &overrides.links {
            args.push("--link".into());
            args.push(link.clone());
        }
        for dns in &overrides.dns {
            args.push("--dns".into());
            args.push(dns.clone());
        }
    }
    if let Some(user) = &spec.user {
        args.push("-u".into());
        args.push(user.clone());
    }
    if spec.privileged {
        args.push("--privileged".into());
    }
    if let Some(cpus) = spec.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(memory) = &spec.memory {
        args.push("--memory".into());
        args.push(memory.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<RunResult> {
        let args = self.run_args(spec);
        let out = self.docker(&args).await?;
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        if self.verbose && !stderr.is_empty() {
            tracing::debug!(target = "docker", container = %spec.name, "stderr: {}", stderr.trim());
        }
        let exit_code = out.status.code().unwrap_or(-1) as i64;
        Ok(RunResult {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr,
            exit_code,
            success: out.status.success(),
        })
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let args = self.run_args(spec);
        tracing::info!(target = "docker", container = %spec.name, image = %spec.image, "starting");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {} for {}", self.binary, spec.name))?;

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin pipe"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout pipe"))?;
        let stderr = child.stderr.take();

        for network in spec.networks.iter().skip(1) {
            let _ = self
                .docker(&[
                    "network".into(),
                    "connect".into(),
                    network.clone(),
                    spec.name.clone(),
                ])
                .await;
        }

        self.children.lock().await.insert(spec.name.clone(), child);
        Ok(ContainerHandle {
            id: spec.name.clone(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as _),
        })
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        tracing::info!(target = "docker", container = %id, "stopping");
        let _ = self
            .docker(&[
                "stop".into(),
                "-t".into(),
                STOP_GRACE.as_secs().to_string(),
                id.into(),
            ])
            .await;
        if let Some(mut child) = self.children.lock().await.remove(id) {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(status) => {
                    let _ = status?;
                }
                Err(_) => {
                    tracing::warn!(target = "docker", container = %id, "graceful stop timed out; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        let _ = self.docker(&["rm".into(), "-f".into(), id.into()]).await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let ids: Vec<String> = self.children.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop_container(&id).await {
                tracing::warn!(target = "docker", container = %id, "shutdown stop failed: {err:#}");
            }
        }
        Ok(())
    }
}
