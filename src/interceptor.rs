use std::process::Stdio;

use anyhow::{Result, anyhow};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run an executable with the JSON payload on stdin.
    Exec { path: String },
    /// Write the payload through tracing.
    Log,
}

/// One `when:type:path` hook applied around tool calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interceptor {
    pub when: When,
    pub action: Action,
}

pub fn parse(spec: &str) -> Result<Interceptor> {
    let mut parts = spec.splitn(3, ':');
    let when = match parts.next() {
        Some("before") => When::Before,
        Some("after") => When::After,
        other => {
            return Err(anyhow!(
                "interceptor {spec:?}: expected before|after, got {:?}",
                other.unwrap_or_default()
            ));
        }
    };
    let action = match (parts.next(), parts.next()) {
        (Some("exec"), Some(path)) if !path.is_empty() => Action::Exec { path: path.into() },
        (Some("exec"), _) => return Err(anyhow!("interceptor {spec:?}: exec needs a path")),
        (Some("log"), _) => Action::Log,
        (other, _) => {
            return Err(anyhow!(
                "interceptor {spec:?}: unknown type {:?}",
                other.unwrap_or_default()
            ));
        }
    };
    Ok(Interceptor { when, action })
}

impl Interceptor {
    pub async fn run(&self, payload: &serde_json::Value) {
        match &self.action {
            Action::Log => {
                tracing::info!(target = "interceptor", payload = %payload, "hook");
            }
            Action::Exec { path } => {
                if let Err(err) = exec_hook(path, payload).await {
                    tracing::warn!(target = "interceptor", hook = %path, "hook failed: {err:#}");
                }
            }
        }
    }
}

async fn exec_hook(path: &str, payload: &serde_json::Value) -> Result<()> {
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload.to_string().as_bytes()).await?;
    }
    let out = child.wait_with_output().await?;
    if !out.stdout.is_empty() {
        tracing::debug!(
            target = "interceptor",
            hook = %path,
            "{}",
            String::from_utf8_lossy(&out.stdout).trim()
        );
    }
    Ok(())
}

/// All hooks for one phase, in declaration order.
pub async fn run_hooks(interceptors: &[Interceptor], when: When, payload: &serde_json::Value) {
    for interceptor in interceptors.iter().filter(|i| i.when == when) {
        interceptor.run(payload).await;
    }
}
