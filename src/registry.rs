use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tokio::sync::Mutex;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json";

/// Entrypoint and default command an image declares. Needed by the cluster
/// runtime to reconstruct `<entrypoint> <cmd-or-user-args>` before wrapping,
/// and to decide whether a user command goes into `command` or `args`.
#[derive(Debug, Clone, Default)]
pub struct ImageConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

/// Splits `[registry/]repo[:tag|@digest]`, defaulting to Docker Hub and the
/// `library/` namespace the way the docker CLI does.
pub fn parse_image_ref(image: &str) -> ImageRef {
    let (name, reference) = match image.split_once('@') {
        Some((n, d)) => (n.to_string(), d.to_string()),
        None => match image.rsplit_once(':') {
            // a colon after the last slash is a tag; before it, a registry port
            Some((n, t)) if !t.contains('/') => (n.to_string(), t.to_string()),
            _ => (image.to_string(), "latest".to_string()),
        },
    };
    let (registry, repository) = match name.split_once('/') {
        Some((head, rest)) if head.contains('.') || head.contains(':') || head == "localhost" => {
            (head.to_string(), rest.to_string())
        }
        _ => (
            "registry-1.docker.io".to_string(),
            if name.contains('/') {
                name.clone()
            } else {
                format!("library/{name}")
            },
        ),
    };
    ImageRef {
        registry,
        repository,
        reference,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    manifests: Vec<PlatformDescriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct PlatformDescriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: RuntimeConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeConfig {
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

/// Minimal registry v2 client: anonymous token auth for Docker Hub,
/// unauthenticated elsewhere. Results are cached for the gateway's lifetime;
/// image contents do not change under a fixed reference while a run lasts.
pub struct RegistryClient {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, ImageConfig>>,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn inspect(&self, image: &str) -> Result<ImageConfig> {
        if let Some(hit) = self.cache.lock().await.get(image) {
            return Ok(hit.clone());
        }
        let config = self.fetch_config(image).await?;
        self.cache
            .lock()
            .await
            .insert(image.to_string(), config.clone());
        Ok(config)
    }

    async fn fetch_config(&self, image: &str) -> Result<ImageConfig> {
        let image_ref = parse_image_ref(image);
        let token = self.auth_token(&image_ref).await?;

        let manifest = self
            .get_json::<Manifest>(
                &format!(
                    "https://{}/v2/{}/manifests/{}",
                    image_ref.registry, image_ref.repository, image_ref.reference
                ),
                token.as_deref(),
                Some(MANIFEST_ACCEPT),
            )
            .await
            .with_context(|| format!("fetch manifest for {image}"))?;

        // An index needs a second hop to the per-platform manifest.
        let manifest = if manifest.config.is_none() {
            let digest = manifest
                .manifests
                .iter()
                .find(|m| {
                    m.platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
                })
                .or(manifest.manifests.first())
                .map(|m| m.digest.clone())
                .ok_or_else(|| anyhow!("manifest index for {image} has no entries"))?;
            self.get_json::<Manifest>(
                &format!(
                    "https://{}/v2/{}/manifests/{digest}",
                    image_ref.registry, image_ref.repository
                ),
                token.as_deref(),
                Some(MANIFEST_ACCEPT),
            )
            .await
            .with_context(|| format!("fetch platform manifest for {image}"))?
        } else {
            manifest
        };

        let digest = manifest
            .config
            .ok_or_else(|| anyhow!("manifest for {image} has no config descriptor"))?
            .digest;
        let blob = self
            .get_json::<ConfigBlob>(
                &format!(
                    "https://{}/v2/{}/blobs/{digest}",
                    image_ref.registry, image_ref.repository
                ),
                token.as_deref(),
                None,
            )
            .await
            .with_context(|| format!("fetch config blob for {image}"))?;

        Ok(ImageConfig {
            entrypoint: blob.config.entrypoint.unwrap_or_default(),
            cmd: blob.config.cmd.unwrap_or_default(),
        })
    }

    async fn auth_token(&self, image_ref: &ImageRef) -> Result<Option<String>> {
        if image_ref.registry != "registry-1.docker.io" {
            return Ok(None);
        }
        let url = format!(
            "https://auth.docker.io/token?service=registry.docker.io&scope=repository:{}:pull",
            image_ref.repository
        );
        let token: TokenResponse = self
            .http
            .get(&url)
            .send()
            .await
            .context("registry token request")?
            .error_for_status()
            .context("registry token status")?
            .json()
            .await
            .context("registry token body")?;
        Ok(Some(token.token))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
        accept: Option<&str>,
    ) -> Result<T> {
        let mut req = self.http.get(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(accept) = accept {
            req = req.header(reqwest::header::ACCEPT, accept);
        }
        Ok(req
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}
