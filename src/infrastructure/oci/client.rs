//! OCI distribution HTTP client
//!
//! Minimal registry-v2 client used for image pulls, bundle-artifact pulls
//! and cluster-registry pushes. Handles the bearer-token dance, rate-limit
//! retries (HTTP 429), and streams blobs to and from disk so large layers
//! never sit in memory.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use sha2::Digest as _;
use reqwest::{header, Response, StatusCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::ImageRef;
use crate::error::RegistryError;

/// Accept values offered when resolving manifests.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Media types that denote a multi-platform index.
pub const INDEX_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";
const RATE_LIMIT_RETRIES: u32 = 2;

/// A fetched manifest document
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub content_type: String,
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl FetchedManifest {
    pub fn is_index(&self) -> bool {
        INDEX_MEDIA_TYPES.contains(&self.content_type.as_str())
    }
}

#[derive(Debug)]
pub struct RegistryHttpClient {
    http: reqwest::Client,
    plain_http: bool,
    credentials: Option<(String, String)>,
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryHttpClient {
    pub fn new(plain_http: bool, insecure_skip_tls_verify: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_tls_verify)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build registry HTTP client")?;
        Ok(Self {
            http,
            plain_http,
            credentials: None,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Attach basic credentials (cluster registry pushes).
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    fn base_url(&self, registry: &str) -> String {
        // Localhost registries are plain HTTP unless TLS was asked for.
        let scheme = if self.plain_http || registry.starts_with("127.0.0.1") || registry.starts_with("localhost") {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{registry}/v2")
    }

    fn cached_token(&self, key: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Resolve the `WWW-Authenticate: Bearer ...` challenge into a token.
    async fn fetch_token(&self, challenge: &str, key: &str) -> Result<String> {
        let fields: HashMap<String, String> = challenge
            .trim_start_matches("Bearer ")
            .split(',')
            .filter_map(|kv| {
                kv.trim()
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.trim_matches('"').to_string()))
            })
            .collect();
        let realm = fields
            .get("realm")
            .ok_or_else(|| anyhow!("auth challenge without realm: {challenge}"))?;
        let mut request = self.http.get(realm).query(
            &fields
                .iter()
                .filter(|(k, _)| k.as_str() != "realm")
                .collect::<Vec<_>>(),
        );
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send().await.context("Token request failed")?;
        if !response.status().is_success() {
            bail!("token endpoint returned {}", response.status());
        }
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            #[serde(alias = "access_token")]
            token: String,
        }
        let token: TokenResponse = response.json().await.context("Bad token response")?;
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), token.token.clone());
        Ok(token.token)
    }

    /// Issue a request, transparently handling 401 token challenges and
    /// retrying 429 rate limits.
    async fn send<F>(&self, registry: &str, repository: &str, build: F) -> Result<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let token_key = format!("{registry}/{repository}");
        let mut rate_limited = 0u32;
        let mut authed = false;
        loop {
            let mut request = build();
            if let Some(token) = self.cached_token(&token_key) {
                request = request.bearer_auth(token);
            } else if let Some((user, pass)) = &self.credentials {
                request = request.basic_auth(user, Some(pass));
            }
            let response = request.send().await?;
            match response.status() {
                StatusCode::UNAUTHORIZED if !authed => {
                    let challenge = response
                        .headers()
                        .get(header::WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if !challenge.starts_with("Bearer ") {
                        return Ok(response);
                    }
                    debug!(registry, repository, "fetching registry token");
                    self.fetch_token(&challenge, &token_key).await?;
                    authed = true;
                }
                StatusCode::TOO_MANY_REQUESTS if rate_limited < RATE_LIMIT_RETRIES => {
                    rate_limited += 1;
                    warn!(registry, repository, attempt = rate_limited, "rate limited, backing off");
                    tokio::time::sleep(Duration::from_secs(2 * rate_limited as u64)).await;
                }
                _ => return Ok(response),
            }
        }
    }

    /// Fetch a manifest (or index) by tag or digest.
    pub async fn get_manifest(&self, image: &ImageRef, reference: &str) -> Result<FetchedManifest> {
        let url = format!(
            "{}/{}/manifests/{reference}",
            self.base_url(&image.registry),
            image.repository
        );
        let response = self
            .send(&image.registry, &image.repository, || {
                self.http.get(&url).header(header::ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                status: response.status().as_u16(),
                url,
            }
            .into());
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();
        let header_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        let digest = header_digest.unwrap_or_else(|| {
            format!("sha256:{}", hex::encode(sha2::Sha256::digest(&bytes)))
        });
        Ok(FetchedManifest {
            content_type,
            digest,
            bytes,
        })
    }

    /// Stream a blob to `dest`, returning its size in bytes.
    pub async fn download_blob(&self, image: &ImageRef, digest: &str, dest: &Path) -> Result<i64> {
        let url = format!(
            "{}/{}/blobs/{digest}",
            self.base_url(&image.registry),
            image.repository
        );
        let response = self
            .send(&image.registry, &image.repository, || self.http.get(&url))
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                status: response.status().as_u16(),
                url,
            }
            .into());
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut stream = response.bytes_stream();
        let mut written = 0i64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            written += chunk.len() as i64;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        Ok(written)
    }

    /// HEAD a blob in the target repository.
    pub async fn blob_exists(&self, image: &ImageRef, digest: &str) -> Result<bool> {
        let url = format!(
            "{}/{}/blobs/{digest}",
            self.base_url(&image.registry),
            image.repository
        );
        let response = self
            .send(&image.registry, &image.repository, || self.http.head(&url))
            .await?;
        Ok(response.status().is_success())
    }

    /// Upload a blob via the two-step (POST then monolithic PUT) flow,
    /// streaming the file body.
    pub async fn upload_blob(&self, image: &ImageRef, digest: &str, src: &Path) -> Result<()> {
        let start_url = format!(
            "{}/{}/blobs/uploads/",
            self.base_url(&image.registry),
            image.repository
        );
        let response = self
            .send(&image.registry, &image.repository, || {
                self.http.post(&start_url)
            })
            .await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(RegistryError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: start_url,
            }
            .into());
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow!("upload start returned no Location"))?;
        let put_url = if location.starts_with("http") {
            location.to_string()
        } else {
            let scheme_host = self
                .base_url(&image.registry)
                .trim_end_matches("/v2")
                .to_string();
            format!("{scheme_host}{location}")
        };
        let separator = if put_url.contains('?') { '&' } else { '?' };
        let put_url = format!("{put_url}{separator}digest={digest}");

        let file = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("Failed to open {}", src.display()))?;
        let size = file.metadata().await?.len();
        let mut request = self
            .http
            .put(&put_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));
        if let Some(token) = self.cached_token(&format!("{}/{}", image.registry, image.repository)) {
            request = request.bearer_auth(token);
        } else if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: put_url,
            }
            .into());
        }
        Ok(())
    }

    /// PUT a manifest at a tag or digest.
    pub async fn put_manifest(
        &self,
        image: &ImageRef,
        reference: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/manifests/{reference}",
            self.base_url(&image.registry),
            image.repository
        );
        let content_type = content_type.to_string();
        let response = self
            .send(&image.registry, &image.repository, || {
                self.http
                    .put(&url)
                    .header(header::CONTENT_TYPE, content_type.clone())
                    .body(bytes.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                status: response.status().as_u16(),
                url,
            }
            .into());
        }
        Ok(())
    }

    /// Pull every layer of an OCI artifact into `dest`, named by the
    /// standard title annotation. Returns the written paths.
    pub async fn pull_artifact(&self, reference: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        let image = ImageRef::parse(reference)?;
        let manifest = self
            .get_manifest(&image, &image.manifest_reference())
            .await?;
        if manifest.is_index() {
            bail!("artifact {reference} resolved to an index; a direct manifest is required");
        }
        let parsed: oci_spec::image::ImageManifest = serde_json::from_slice(&manifest.bytes)?;
        let mut files = Vec::new();
        for layer in parsed.layers() {
            let name = layer
                .annotations()
                .as_ref()
                .and_then(|a| a.get(TITLE_ANNOTATION))
                .cloned()
                .unwrap_or_else(|| super::layout::digest_hex(layer.digest()).to_string());
            // Annotation-derived names must stay inside dest.
            let name = name.replace("..", "_");
            let path = dest.join(&name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.download_blob(&image, layer.digest(), &path).await?;
            files.push(path);
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_schemes() {
        let client = RegistryHttpClient::new(false, false).unwrap();
        assert_eq!(client.base_url("ghcr.io"), "https://ghcr.io/v2");
        assert_eq!(client.base_url("127.0.0.1:31999"), "http://127.0.0.1:31999/v2");

        let plain = RegistryHttpClient::new(true, false).unwrap();
        assert_eq!(plain.base_url("registry.lan"), "http://registry.lan/v2");
    }

    #[test]
    fn test_fetched_manifest_index_detection() {
        let fetched = FetchedManifest {
            content_type: "application/vnd.oci.image.index.v1+json".to_string(),
            digest: "sha256:abc".to_string(),
            bytes: Vec::new(),
        };
        assert!(fetched.is_index());
        let fetched = FetchedManifest {
            content_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            ..fetched
        };
        assert!(!fetched.is_index());
    }
}
