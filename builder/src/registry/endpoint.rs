//! Registry API endpoints and their response handling.

use async_trait::async_trait;
use lateen_core::error::{BuildError, Result};
use reqwest::{header, Method, Response, Url};

use super::error::from_response_body;
use crate::digest::{BlobDescriptor, Digest};
use crate::image::json::{
    parse_manifest, ManifestTemplate, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_V21_MANIFEST, MEDIA_TYPE_V21_SIGNED_MANIFEST,
};

/// One registry API operation: request shape plus response interpretation.
///
/// The caller owns transport concerns (fallback, redirects, auth headers);
/// endpoints own URLs, bodies and status handling beyond 3xx/401/403.
#[async_trait]
pub trait Endpoint: Send + Sync {
    type Output: Send;

    /// Short name for logs and redirect-loop errors.
    fn name(&self) -> &'static str;

    fn method(&self) -> Method;

    /// Request URL given `base` of the form `scheme://registry`.
    fn url(&self, base: &str) -> Result<Url>;

    fn accept(&self) -> Vec<String> {
        Vec::new()
    }

    fn content_type(&self) -> Option<String> {
        None
    }

    fn request_body(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// When true, 401/403 reach [`Endpoint::handle_response`] instead of
    /// becoming an unauthorized error.
    fn accepts_unauthorized(&self) -> bool {
        false
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output>;
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| BuildError::Other(format!("invalid URL '{}': {}", raw, e)))
}

/// Read an error body and translate it into a registry error.
async fn unexpected_response(response: Response) -> BuildError {
    let url = response.url().to_string();
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .unwrap_or_default();
    from_response_body(&url, status, &body)
}

fn header_digest(response: &Response) -> Option<Digest> {
    response
        .headers()
        .get("docker-content-digest")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Digest::parse(value).ok())
}

/// `GET /v2/`: probes API support and captures the auth challenge.
pub struct ApiVersionEndpoint;

#[async_trait]
impl Endpoint for ApiVersionEndpoint {
    /// The `WWW-Authenticate` challenge, or `None` when no auth is required.
    type Output = Option<String>;

    fn name(&self) -> &'static str {
        "check API version"
    }

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, base: &str) -> Result<Url> {
        parse_url(&format!("{}/v2/", base))
    }

    fn accepts_unauthorized(&self) -> bool {
        true
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        let status = response.status();
        if status.is_success() {
            return Ok(None);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return match challenge {
                Some(challenge) => Ok(Some(challenge)),
                None => Err(BuildError::Registry(format!(
                    "{} answered 401 without a WWW-Authenticate challenge",
                    response.url()
                ))),
            };
        }
        Err(unexpected_response(response).await)
    }
}

/// `GET /v2/<name>/manifests/<reference>`.
pub struct ManifestPullEndpoint {
    repository: String,
    reference: String,
}

impl ManifestPullEndpoint {
    pub fn new(repository: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: reference.into(),
        }
    }
}

#[async_trait]
impl Endpoint for ManifestPullEndpoint {
    /// The parsed manifest and the digest of its canonical bytes.
    type Output = (ManifestTemplate, Digest);

    fn name(&self) -> &'static str {
        "pull manifest"
    }

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, base: &str) -> Result<Url> {
        parse_url(&format!(
            "{}/v2/{}/manifests/{}",
            base, self.repository, self.reference
        ))
    }

    fn accept(&self) -> Vec<String> {
        vec![
            MEDIA_TYPE_OCI_MANIFEST.to_string(),
            MEDIA_TYPE_DOCKER_MANIFEST.to_string(),
            MEDIA_TYPE_V21_MANIFEST.to_string(),
            MEDIA_TYPE_V21_SIGNED_MANIFEST.to_string(),
        ]
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        if !response.status().is_success() {
            return Err(unexpected_response(response).await);
        }
        let url = response.url().to_string();
        let announced = header_digest(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| BuildError::Registry(format!("failed reading manifest body: {}", e)))?;

        let digest = Digest::of_bytes(&body);
        if let Some(announced) = announced {
            if announced != digest {
                return Err(BuildError::Registry(format!(
                    "manifest from {} hashes to {} but the registry announced {}",
                    url, digest, announced
                )));
            }
        }
        Ok((parse_manifest(&body)?, digest))
    }
}

/// `PUT /v2/<name>/manifests/<reference>`.
pub struct ManifestPushEndpoint {
    repository: String,
    reference: String,
    media_type: String,
    bytes: Vec<u8>,
}

impl ManifestPushEndpoint {
    pub fn new(
        repository: impl Into<String>,
        reference: impl Into<String>,
        media_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            repository: repository.into(),
            reference: reference.into(),
            media_type: media_type.into(),
            bytes,
        }
    }
}

#[async_trait]
impl Endpoint for ManifestPushEndpoint {
    /// Digest the registry acknowledged, when it announced one.
    type Output = Option<Digest>;

    fn name(&self) -> &'static str {
        "push manifest"
    }

    fn method(&self) -> Method {
        Method::PUT
    }

    fn url(&self, base: &str) -> Result<Url> {
        parse_url(&format!(
            "{}/v2/{}/manifests/{}",
            base, self.repository, self.reference
        ))
    }

    fn content_type(&self) -> Option<String> {
        Some(self.media_type.clone())
    }

    fn request_body(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.bytes.clone()))
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        if !response.status().is_success() {
            return Err(unexpected_response(response).await);
        }
        Ok(header_digest(&response))
    }
}

/// `HEAD /v2/<name>/blobs/<digest>`.
pub struct BlobCheckEndpoint {
    repository: String,
    digest: Digest,
}

impl BlobCheckEndpoint {
    pub fn new(repository: impl Into<String>, digest: Digest) -> Self {
        Self {
            repository: repository.into(),
            digest,
        }
    }
}

#[async_trait]
impl Endpoint for BlobCheckEndpoint {
    /// Descriptor when the blob exists, `None` on 404.
    type Output = Option<BlobDescriptor>;

    fn name(&self) -> &'static str {
        "check blob"
    }

    fn method(&self) -> Method {
        Method::HEAD
    }

    fn url(&self, base: &str) -> Result<Url> {
        parse_url(&format!(
            "{}/v2/{}/blobs/{}",
            base, self.repository, self.digest
        ))
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            // HEAD responses have no body to translate.
            return Err(BuildError::Http {
                url: response.url().to_string(),
                status: status.as_u16(),
            });
        }
        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(Some(BlobDescriptor::new(size, self.digest.clone())))
    }
}

/// `GET /v2/<name>/blobs/<digest>`, handing the open response to the caller
/// for streaming.
pub struct BlobPullEndpoint {
    repository: String,
    digest: Digest,
}

impl BlobPullEndpoint {
    pub fn new(repository: impl Into<String>, digest: Digest) -> Self {
        Self {
            repository: repository.into(),
            digest,
        }
    }
}

#[async_trait]
impl Endpoint for BlobPullEndpoint {
    type Output = Response;

    fn name(&self) -> &'static str {
        "pull blob"
    }

    fn method(&self) -> Method {
        Method::GET
    }

    fn url(&self, base: &str) -> Result<Url> {
        parse_url(&format!(
            "{}/v2/{}/blobs/{}",
            base, self.repository, self.digest
        ))
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        if !response.status().is_success() {
            return Err(unexpected_response(response).await);
        }
        Ok(response)
    }
}

/// Outcome of starting a blob upload.
#[derive(Debug)]
pub enum BlobUploadStart {
    /// Registry cross-mounted the blob; no upload needed.
    Mounted,
    /// Upload session opened at this location.
    Upload(Url),
}

/// `POST /v2/<name>/blobs/uploads/`, optionally asking for a cross-repository
/// mount.
pub struct BlobPushInitEndpoint {
    repository: String,
    digest: Digest,
    mount_from: Option<String>,
}

impl BlobPushInitEndpoint {
    pub fn new(
        repository: impl Into<String>,
        digest: Digest,
        mount_from: Option<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            digest,
            mount_from,
        }
    }
}

#[async_trait]
impl Endpoint for BlobPushInitEndpoint {
    type Output = BlobUploadStart;

    fn name(&self) -> &'static str {
        "start blob upload"
    }

    fn method(&self) -> Method {
        Method::POST
    }

    fn url(&self, base: &str) -> Result<Url> {
        let mut url = parse_url(&format!("{}/v2/{}/blobs/uploads/", base, self.repository))?;
        if let Some(source) = &self.mount_from {
            url.query_pairs_mut()
                .append_pair("mount", &self.digest.to_string())
                .append_pair("from", source);
        }
        Ok(url)
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        match response.status() {
            reqwest::StatusCode::CREATED => Ok(BlobUploadStart::Mounted),
            reqwest::StatusCode::ACCEPTED => {
                Ok(BlobUploadStart::Upload(upload_location(&response)?))
            }
            _ => Err(unexpected_response(response).await),
        }
    }
}

/// `PATCH <location>` with the blob content.
pub struct BlobPushWriteEndpoint {
    location: Url,
    bytes: Vec<u8>,
}

impl BlobPushWriteEndpoint {
    pub fn new(location: Url, bytes: Vec<u8>) -> Self {
        Self { location, bytes }
    }
}

#[async_trait]
impl Endpoint for BlobPushWriteEndpoint {
    /// Location to commit at.
    type Output = Url;

    fn name(&self) -> &'static str {
        "write blob"
    }

    fn method(&self) -> Method {
        Method::PATCH
    }

    fn url(&self, _base: &str) -> Result<Url> {
        Ok(self.location.clone())
    }

    fn content_type(&self) -> Option<String> {
        Some("application/octet-stream".to_string())
    }

    fn request_body(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.bytes.clone()))
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        if !response.status().is_success() {
            return Err(unexpected_response(response).await);
        }
        // Registries may move the session; fall back to the current location.
        upload_location(&response).or_else(|_| Ok(self.location.clone()))
    }
}

/// `PUT <location>?digest=<digest>` finalizing the upload.
pub struct BlobPushCommitEndpoint {
    location: Url,
    digest: Digest,
}

impl BlobPushCommitEndpoint {
    pub fn new(location: Url, digest: Digest) -> Self {
        Self { location, digest }
    }
}

#[async_trait]
impl Endpoint for BlobPushCommitEndpoint {
    type Output = ();

    fn name(&self) -> &'static str {
        "commit blob"
    }

    fn method(&self) -> Method {
        Method::PUT
    }

    fn url(&self, _base: &str) -> Result<Url> {
        let mut url = self.location.clone();
        url.query_pairs_mut()
            .append_pair("digest", &self.digest.to_string());
        Ok(url)
    }

    async fn handle_response(&self, response: Response) -> Result<Self::Output> {
        if !response.status().is_success() {
            return Err(unexpected_response(response).await);
        }
        Ok(())
    }
}

fn upload_location(response: &Response) -> Result<Url> {
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            BuildError::Registry(format!(
                "blob upload response from {} carried no Location header",
                response.url()
            ))
        })?;
    response.url().join(location).map_err(|e| {
        BuildError::Registry(format!("unusable upload location '{}': {}", location, e))
    })
}
