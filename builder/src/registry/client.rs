//! High-level registry operations against one repository.

use std::io::Write;

use lateen_core::config::BehaviorFlags;
use lateen_core::error::{BuildError, Result};

use super::authenticator::{
    AccessScope, Authorization, Credential, RegistryAuthenticator,
};
use super::caller::RegistryCaller;
use super::endpoint::{
    ApiVersionEndpoint, BlobCheckEndpoint, BlobPullEndpoint, BlobPushCommitEndpoint,
    BlobPushInitEndpoint, BlobPushWriteEndpoint, BlobUploadStart, ManifestPullEndpoint,
    ManifestPushEndpoint,
};
use crate::blob::Blob;
use crate::digest::{BlobDescriptor, Digest, DigestWriter};
use crate::image::json::ManifestTemplate;

/// Client for one `registry/repository` pair.
///
/// Starts unauthenticated; [`RegistryClient::authenticate`] upgrades it after
/// probing the registry's challenge.
pub struct RegistryClient {
    caller: RegistryCaller,
    authorization: Option<Authorization>,
    token_client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(registry: &str, repository: &str, flags: &BehaviorFlags) -> Result<Self> {
        let token_client = reqwest::Client::builder()
            .timeout(flags.http_timeout)
            .build()
            .map_err(|e| BuildError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            caller: RegistryCaller::new(registry, repository, flags)?,
            authorization: None,
            token_client,
        })
    }

    pub fn registry(&self) -> &str {
        self.caller.registry()
    }

    pub fn repository(&self) -> &str {
        self.caller.repository()
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    pub fn set_authorization(&mut self, authorization: Option<Authorization>) {
        self.authorization = authorization;
    }

    /// Probe `/v2/` and resolve credentials into an authorization.
    ///
    /// No challenge means an open registry; a `Basic` challenge uses the
    /// credential directly; a `Bearer` challenge is exchanged for a token at
    /// the realm it names.
    pub async fn authenticate(
        &mut self,
        credential: Option<&Credential>,
        scope: AccessScope,
    ) -> Result<()> {
        let challenge = self.caller.call(None, &ApiVersionEndpoint).await?;

        let authorization = match challenge {
            None => {
                tracing::debug!(registry = %self.registry(), "Registry requires no authentication");
                None
            }
            Some(challenge) => {
                match RegistryAuthenticator::from_challenge(
                    &challenge,
                    self.registry(),
                    self.repository(),
                ) {
                    Some(authenticator) => Some(
                        authenticator
                            .authenticate(&self.token_client, credential, scope)
                            .await?,
                    ),
                    None => credential.map(Authorization::basic),
                }
            }
        };

        self.authorization = authorization;
        Ok(())
    }

    /// Pull and parse a manifest; returns it with its digest.
    pub async fn pull_manifest(&self, reference: &str) -> Result<(ManifestTemplate, Digest)> {
        let endpoint = ManifestPullEndpoint::new(self.repository(), reference);
        self.caller
            .call(self.authorization.as_ref(), &endpoint)
            .await
    }

    /// Push a manifest under `reference` (a tag or digest); returns the
    /// manifest digest.
    pub async fn push_manifest(
        &self,
        manifest: &ManifestTemplate,
        reference: &str,
    ) -> Result<Digest> {
        let bytes = manifest.to_bytes()?;
        let digest = Digest::of_bytes(&bytes);
        let endpoint = ManifestPushEndpoint::new(
            self.repository(),
            reference,
            manifest.media_type(),
            bytes,
        );
        let acknowledged = self
            .caller
            .call(self.authorization.as_ref(), &endpoint)
            .await?;

        if let Some(acknowledged) = acknowledged {
            if acknowledged != digest {
                return Err(BuildError::Registry(format!(
                    "pushed manifest {} but registry {} acknowledged {}",
                    digest,
                    self.registry(),
                    acknowledged
                )));
            }
        }
        tracing::debug!(
            registry = %self.registry(),
            repository = %self.repository(),
            reference = %reference,
            digest = %digest,
            "Pushed manifest"
        );
        Ok(digest)
    }

    /// Check whether a blob exists in the repository.
    pub async fn check_blob(&self, digest: &Digest) -> Result<Option<BlobDescriptor>> {
        let endpoint = BlobCheckEndpoint::new(self.repository(), digest.clone());
        self.caller
            .call(self.authorization.as_ref(), &endpoint)
            .await
    }

    /// Pull a blob into `writer`, verifying its digest and reporting byte
    /// progress through `on_progress`.
    pub async fn pull_blob<W, F>(
        &self,
        digest: &Digest,
        writer: &mut W,
        mut on_progress: F,
    ) -> Result<BlobDescriptor>
    where
        W: Write + Send,
        F: FnMut(u64) + Send,
    {
        let endpoint = BlobPullEndpoint::new(self.repository(), digest.clone());
        let mut response = self
            .caller
            .call(self.authorization.as_ref(), &endpoint)
            .await?;

        let mut digest_writer = DigestWriter::new(writer);
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            BuildError::Registry(format!("failed reading blob {}: {}", digest, e))
        })? {
            digest_writer.write_all(&chunk)?;
            on_progress(chunk.len() as u64);
        }
        let (_, descriptor) = digest_writer.finish();

        if &descriptor.digest != digest {
            return Err(BuildError::Registry(format!(
                "blob pulled from {} hashes to {} instead of {}",
                self.registry(),
                descriptor.digest,
                digest
            )));
        }
        Ok(descriptor)
    }

    /// Push a blob, skipping the upload when it already exists or can be
    /// cross-mounted from `mount_from`. Returns true when no bytes were sent.
    pub async fn push_blob(
        &self,
        blob: &Blob,
        digest: &Digest,
        mount_from: Option<&str>,
    ) -> Result<bool> {
        if self.check_blob(digest).await?.is_some() {
            tracing::debug!(
                registry = %self.registry(),
                digest = %digest,
                "Blob already exists; skipping push"
            );
            return Ok(true);
        }

        let init = BlobPushInitEndpoint::new(
            self.repository(),
            digest.clone(),
            mount_from.map(str::to_string),
        );
        let location = match self
            .caller
            .call(self.authorization.as_ref(), &init)
            .await?
        {
            BlobUploadStart::Mounted => {
                tracing::debug!(
                    registry = %self.registry(),
                    digest = %digest,
                    source = mount_from.unwrap_or_default(),
                    "Blob cross-mounted; skipping push"
                );
                return Ok(true);
            }
            BlobUploadStart::Upload(location) => location,
        };

        let bytes = blob.read_all()?;
        let write = BlobPushWriteEndpoint::new(location, bytes);
        let commit_location = self
            .caller
            .call(self.authorization.as_ref(), &write)
            .await?;

        let commit = BlobPushCommitEndpoint::new(commit_location, digest.clone());
        self.caller
            .call(self.authorization.as_ref(), &commit)
            .await?;
        tracing::debug!(
            registry = %self.registry(),
            digest = %digest,
            "Pushed blob"
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::json::{
        BuildableManifestTemplate, DescriptorTemplate, MEDIA_TYPE_OCI_CONFIG,
        MEDIA_TYPE_OCI_MANIFEST,
    };
    use httpmock::prelude::*;
    // The prelude stops at PUT.
    use httpmock::Method::HEAD;

    fn test_flags() -> BehaviorFlags {
        BehaviorFlags {
            allow_insecure_registries: true,
            send_credentials_over_http: true,
            ..Default::default()
        }
    }

    fn client_for(server: &MockServer) -> RegistryClient {
        RegistryClient::new(&server.address().to_string(), "lateen/app", &test_flags())
            .unwrap()
    }

    fn oci_manifest() -> ManifestTemplate {
        ManifestTemplate::Oci(BuildableManifestTemplate {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: DescriptorTemplate {
                media_type: MEDIA_TYPE_OCI_CONFIG.to_string(),
                size: 2,
                digest: Digest::of_bytes(b"{}"),
            },
            layers: vec![],
        })
    }

    #[tokio::test]
    async fn test_authenticate_against_open_registry() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/");
            then.status(200);
        });

        let mut client = client_for(&server);
        client.authenticate(None, AccessScope::Pull).await.unwrap();
        assert!(client.authorization().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_bearer_flow() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/");
            then.status(401).header(
                "www-authenticate",
                format!(r#"Bearer realm="{}/token",service="test""#, server.base_url()),
            );
        });
        server.mock(|when, then| {
            when.method(GET).path("/token");
            then.status(200)
                .json_body(serde_json::json!({"token": "tok-1"}));
        });

        let mut client = client_for(&server);
        client
            .authenticate(
                Some(&Credential::new("user", "pass")),
                AccessScope::PullPush,
            )
            .await
            .unwrap();
        assert_eq!(
            client.authorization().unwrap().header_value(),
            "Bearer tok-1"
        );
    }

    #[tokio::test]
    async fn test_authenticate_basic_challenge_uses_credential() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/");
            then.status(401)
                .header("www-authenticate", r#"Basic realm="registry""#);
        });

        let mut client = client_for(&server);
        client
            .authenticate(Some(&Credential::new("user", "pass")), AccessScope::Pull)
            .await
            .unwrap();
        assert!(!client.authorization().unwrap().is_bearer());
    }

    #[tokio::test]
    async fn test_push_manifest_returns_digest() {
        let server = MockServer::start();
        let manifest = oci_manifest();
        let expected = Digest::of_bytes(&manifest.to_bytes().unwrap());
        server.mock(|when, then| {
            when.method(PUT)
                .path("/v2/lateen/app/manifests/latest")
                .header("content-type", MEDIA_TYPE_OCI_MANIFEST);
            then.status(201)
                .header("docker-content-digest", expected.to_string());
        });

        let client = client_for(&server);
        let digest = client.push_manifest(&manifest, "latest").await.unwrap();
        assert_eq!(digest, expected);
    }

    #[tokio::test]
    async fn test_push_manifest_detects_acknowledgement_mismatch() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/v2/lateen/app/manifests/latest");
            then.status(201)
                .header("docker-content-digest", Digest::of_bytes(b"other").to_string());
        });

        let client = client_for(&server);
        let err = client
            .push_manifest(&oci_manifest(), "latest")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("acknowledged"));
    }

    #[tokio::test]
    async fn test_check_blob_found_and_missing() {
        let server = MockServer::start();
        let present = Digest::of_bytes(b"present");
        let absent = Digest::of_bytes(b"absent");
        server.mock(|when, then| {
            when.method(HEAD)
                .path(format!("/v2/lateen/app/blobs/{}", present));
            then.status(200).header("content-length", "7");
        });
        server.mock(|when, then| {
            when.method(HEAD)
                .path(format!("/v2/lateen/app/blobs/{}", absent));
            then.status(404);
        });

        let client = client_for(&server);
        let descriptor = client.check_blob(&present).await.unwrap().unwrap();
        assert_eq!(descriptor.size, 7);
        assert!(client.check_blob(&absent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_blob_verifies_digest() {
        let server = MockServer::start();
        let content = b"blob contents";
        let digest = Digest::of_bytes(content);
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/lateen/app/blobs/{}", digest));
            then.status(200).body(content);
        });

        let client = client_for(&server);
        let mut sink = Vec::new();
        let mut seen = 0u64;
        let descriptor = client
            .pull_blob(&digest, &mut sink, |n| seen += n)
            .await
            .unwrap();
        assert_eq!(sink, content);
        assert_eq!(descriptor.digest, digest);
        assert_eq!(seen, content.len() as u64);
    }

    #[tokio::test]
    async fn test_pull_blob_rejects_corrupt_content() {
        let server = MockServer::start();
        let digest = Digest::of_bytes(b"expected");
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/lateen/app/blobs/{}", digest));
            then.status(200).body("tampered");
        });

        let client = client_for(&server);
        let mut sink = Vec::new();
        let err = client
            .pull_blob(&digest, &mut sink, |_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hashes to"));
    }

    #[tokio::test]
    async fn test_push_blob_full_upload() {
        let server = MockServer::start();
        let content = b"new layer".to_vec();
        let digest = Digest::of_bytes(&content);
        server.mock(|when, then| {
            when.method(HEAD)
                .path(format!("/v2/lateen/app/blobs/{}", digest));
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(POST).path("/v2/lateen/app/blobs/uploads/");
            then.status(202)
                .header("location", "/v2/lateen/app/blobs/uploads/session-1");
        });
        server.mock(|when, then| {
            when.method("PATCH")
                .path("/v2/lateen/app/blobs/uploads/session-1")
                .body(std::str::from_utf8(&content).unwrap());
            then.status(202)
                .header("location", "/v2/lateen/app/blobs/uploads/session-1");
        });
        server.mock(|when, then| {
            when.method(PUT)
                .path("/v2/lateen/app/blobs/uploads/session-1")
                .query_param("digest", digest.to_string());
            then.status(201);
        });

        let client = client_for(&server);
        let skipped = client
            .push_blob(&Blob::from_bytes(content), &digest, None)
            .await
            .unwrap();
        assert!(!skipped);
    }

    #[tokio::test]
    async fn test_push_blob_skips_existing() {
        let server = MockServer::start();
        let digest = Digest::of_bytes(b"already there");
        server.mock(|when, then| {
            when.method(HEAD)
                .path(format!("/v2/lateen/app/blobs/{}", digest));
            then.status(200).header("content-length", "13");
        });

        let client = client_for(&server);
        let skipped = client
            .push_blob(&Blob::from_bytes(b"already there".to_vec()), &digest, None)
            .await
            .unwrap();
        assert!(skipped);
    }

    #[tokio::test]
    async fn test_push_blob_mounted() {
        let server = MockServer::start();
        let digest = Digest::of_bytes(b"base layer");
        server.mock(|when, then| {
            when.method(HEAD)
                .path(format!("/v2/lateen/app/blobs/{}", digest));
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/v2/lateen/app/blobs/uploads/")
                .query_param("mount", digest.to_string())
                .query_param("from", "lateen/base");
            then.status(201);
        });

        let client = client_for(&server);
        let skipped = client
            .push_blob(
                &Blob::from_bytes(b"base layer".to_vec()),
                &digest,
                Some("lateen/base"),
            )
            .await
            .unwrap();
        assert!(skipped);
    }
}
