//! OCI distribution client.
//!
//! Implements the two read paths of the OCI Distribution Specification the
//! agent needs: `GET /v2/<name>/manifests/<reference>` and
//! `GET /v2/<name>/blobs/<digest>` with `Range` support.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RANGE, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{BlobStream, Registry, RegistryError};
use crate::image::{
    is_index_media_type, Digest, ImageReference, LayerDescriptor, OciIndex, OciManifest, Platform,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};

/// Credentials presented to the registry.
#[derive(Clone, Default)]
pub enum Credentials {
    /// No credentials; token exchange is still attempted anonymously.
    #[default]
    Anonymous,
    /// A pre-issued bearer token.
    Bearer(String),
    /// Username and password, used directly and for token exchange.
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
        }
    }
}

/// Configuration for [`HttpRegistry`].
#[derive(Debug, Clone)]
pub struct HttpRegistryConfig {
    /// Base URL to use instead of `https://<registry host>` (mirrors, tests).
    pub endpoint: Option<String>,
    /// Credentials for this backend.
    pub credentials: Credentials,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Timeout for a manifest request, or for blob response headers.
    pub request_timeout: Duration,
    /// Platform picked out of image indexes.
    pub platform: Platform,
}

impl Default for HttpRegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            credentials: Credentials::Anonymous,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            platform: Platform::default(),
        }
    }
}

/// Registry backend speaking the OCI distribution HTTP API.
pub struct HttpRegistry {
    name: String,
    config: HttpRegistryConfig,
    client: Client,
    /// Bearer tokens obtained by exchange, keyed by scope.
    tokens: Mutex<HashMap<String, String>>,
}

enum Auth {
    None,
    Bearer(String),
    Basic(String, String),
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestShape {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

impl HttpRegistry {
    /// Create a new client.
    pub fn new(config: HttpRegistryConfig) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(RegistryError::from_reqwest)?;
        let name = config
            .endpoint
            .clone()
            .unwrap_or_else(|| "upstream".to_string());

        Ok(Self {
            name,
            config,
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}", reference.registry()),
        }
    }

    fn auth_for(&self, scope: &str) -> Auth {
        if let Some(token) = self.tokens.lock().get(scope) {
            return Auth::Bearer(token.clone());
        }
        match &self.config.credentials {
            Credentials::Anonymous => Auth::None,
            Credentials::Bearer(token) => Auth::Bearer(token.clone()),
            Credentials::Basic { username, password } => {
                Auth::Basic(username.clone(), password.clone())
            }
        }
    }

    async fn send(&self, url: &str, headers: &HeaderMap, auth: Auth) -> Result<Response, RegistryError> {
        let mut request = self.client.get(url).headers(headers.clone());
        request = match auth {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic(user, pass) => request.basic_auth(user, Some(pass)),
        };
        request.send().await.map_err(RegistryError::from_reqwest)
    }

    /// Sends a GET, performing one token exchange if the registry asks for it.
    async fn get(&self, url: &str, scope: &str, headers: HeaderMap) -> Result<Response, RegistryError> {
        let response = self.send(url, &headers, self.auth_for(scope)).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let scope_to_request = challenge.scope.clone().unwrap_or_else(|| scope.to_string());
        let token = self.exchange_token(&challenge, &scope_to_request).await?;
        self.tokens.lock().insert(scope.to_string(), token.clone());
        debug!(registry = %self.name, scope = %scope, "Obtained registry token");

        self.send(url, &headers, Auth::Bearer(token)).await
    }

    async fn exchange_token(
        &self,
        challenge: &BearerChallenge,
        scope: &str,
    ) -> Result<String, RegistryError> {
        let mut query = vec![("scope", scope.to_string())];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let mut request = self.client.get(&challenge.realm).query(&query);
        if let Credentials::Basic { username, password } = &self.config.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = tokio::time::timeout(self.config.request_timeout, request.send())
            .await
            .map_err(|_| RegistryError::Timeout)?
            .map_err(RegistryError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(RegistryError::AuthFailure(format!(
                "token exchange with {} returned HTTP {}",
                challenge.realm,
                response.status()
            )));
        }

        let body: TokenResponse = response.json().await.map_err(RegistryError::from_reqwest)?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::AuthFailure("token response carried no token".into()))
    }

    /// Fetches one manifest document, returning its media type and raw body.
    async fn fetch_manifest_document(
        &self,
        reference: &ImageReference,
        tag_or_digest: &str,
    ) -> Result<(Option<String>, bytes::Bytes), RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository(),
            tag_or_digest
        );
        debug!(url = %url, "Pulling manifest");

        let mut headers = HeaderMap::new();
        let accept = HeaderValue::from_str(&SUPPORTED_MANIFEST_TYPES.join(", "))
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        headers.insert(ACCEPT, accept);

        let scope = pull_scope(reference);
        let response = tokio::time::timeout(self.config.request_timeout, async {
            let response = self.get(&url, &scope, headers).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status, &reference.to_string()));
            }
            let media_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
            let body = response.bytes().await.map_err(RegistryError::from_reqwest)?;
            Ok((media_type, body))
        })
        .await
        .map_err(|_| RegistryError::Timeout)??;

        Ok(response)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<Vec<LayerDescriptor>, RegistryError> {
        let (media_type, body) = self
            .fetch_manifest_document(reference, &reference.reference().to_string())
            .await?;

        if let Some(expected) = reference.digest() {
            verify_document(expected, &body)?;
        }

        let shape: ManifestShape = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;
        let declared = media_type.or(shape.media_type);
        let is_index =
            declared.as_deref().is_some_and(is_index_media_type) || shape.manifests.is_some();

        let manifest_body = if is_index {
            let index: OciIndex = serde_json::from_slice(&body)
                .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;
            let chosen = index.select(&self.config.platform).ok_or_else(|| {
                RegistryError::InvalidManifest(format!(
                    "{reference} has no manifest for {}/{}",
                    self.config.platform.os, self.config.platform.architecture
                ))
            })?;
            let (_, platform_body) = self
                .fetch_manifest_document(reference, chosen.digest.as_str())
                .await?;
            verify_document(&chosen.digest, &platform_body)?;
            platform_body
        } else {
            body
        };

        let manifest: OciManifest = serde_json::from_slice(&manifest_body)
            .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?;

        info!(
            reference = %reference,
            registry = %self.name,
            layer_count = manifest.layers.len(),
            "Manifest resolved"
        );
        Ok(manifest.layers)
    }

    async fn fetch_blob_range(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        offset: u64,
    ) -> Result<BlobStream, RegistryError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(reference),
            reference.repository(),
            digest
        );
        debug!(url = %url, offset, "Pulling blob");

        let mut headers = HeaderMap::new();
        if offset > 0 {
            let range = HeaderValue::from_str(&format!("bytes={offset}-"))
                .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
            headers.insert(RANGE, range);
        }

        let scope = pull_scope(reference);
        let response = tokio::time::timeout(self.config.request_timeout, self.get(&url, &scope, headers))
            .await
            .map_err(|_| RegistryError::Timeout)??;

        let start = match response.status() {
            StatusCode::PARTIAL_CONTENT => offset,
            StatusCode::OK => 0,
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(RegistryError::RangeNotSatisfiable { offset })
            }
            status => return Err(status_error(status, digest.as_str())),
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RegistryError::from_reqwest))
            .boxed();

        Ok(BlobStream {
            offset: start,
            body,
        })
    }
}

fn pull_scope(reference: &ImageReference) -> String {
    format!("repository:{}:pull", reference.repository())
}

fn verify_document(expected: &Digest, body: &[u8]) -> Result<(), RegistryError> {
    let actual = Digest::sha256_of(body);
    if &actual != expected {
        return Err(RegistryError::InvalidManifest(format!(
            "manifest digest mismatch: expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

fn status_error(status: StatusCode, subject: &str) -> RegistryError {
    match status {
        StatusCode::NOT_FOUND => RegistryError::NotFound(subject.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RegistryError::AuthFailure(format!("{subject}: HTTP {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            RegistryError::Unavailable(format!("{subject}: HTTP {status}"))
        }
        s if s.is_server_error() => RegistryError::Unavailable(format!("{subject}: HTTP {s}")),
        s => RegistryError::Rejected {
            status: s.as_u16(),
            message: subject.to_string(),
        },
    }
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut fields = HashMap::new();
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut in_quotes = false;

        for c in params.chars().chain(std::iter::once(',')) {
            match c {
                '"' => in_quotes = !in_quotes,
                '=' if !in_value && !in_quotes => in_value = true,
                ',' if !in_quotes => {
                    if !key.trim().is_empty() {
                        fields.insert(key.trim().to_ascii_lowercase(), value.clone());
                    }
                    key.clear();
                    value.clear();
                    in_value = false;
                }
                c if in_value => value.push(c),
                c => key.push(c),
            }
        }

        Some(Self {
            realm: fields.remove("realm")?,
            service: fields.remove("service"),
            scope: fields.remove("scope"),
        })
    }
}

/// Media types this client understands, in preference order.
const SUPPORTED_MANIFEST_TYPES: [&str; 4] = [
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
];
