//! HTTP dispatch with TLS fallback, redirects and auth interception.
//!
//! A call first tries HTTPS with certificate validation. When insecure
//! registries are allowed, failures walk down a ladder: HTTPS without
//! certificate validation, then plain HTTP. Redirects are followed manually
//! (up to [`MAX_REDIRECTS`]) so credentials can be withheld on insecure hops.

use lateen_core::config::BehaviorFlags;
use lateen_core::error::{BuildError, Result};
use reqwest::{header, redirect, Client, Response, Url};

use super::authenticator::Authorization;
use super::endpoint::Endpoint;

const MAX_REDIRECTS: usize = 5;

/// Per-registry request dispatcher.
pub struct RegistryCaller {
    registry: String,
    repository: String,
    flags: BehaviorFlags,
    verifying: Client,
    trusting: Client,
}

enum CallFailure {
    /// Transport-level failure; the fallback ladder may retry.
    Send(reqwest::Error),
    /// Definitive outcome; no retry.
    Fatal(BuildError),
}

impl RegistryCaller {
    pub fn new(registry: &str, repository: &str, flags: &BehaviorFlags) -> Result<Self> {
        let build = |trust_certificates: bool| {
            let mut builder = Client::builder()
                .redirect(redirect::Policy::none())
                .timeout(flags.http_timeout);
            if trust_certificates {
                builder = builder.danger_accept_invalid_certs(true);
            }
            builder
                .build()
                .map_err(|e| BuildError::Other(format!("failed to build HTTP client: {}", e)))
        };
        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            flags: flags.clone(),
            verifying: build(false)?,
            trusting: build(true)?,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Dispatch one endpoint call, walking the fallback ladder on transport
    /// failures.
    pub async fn call<E: Endpoint>(
        &self,
        authorization: Option<&Authorization>,
        endpoint: &E,
    ) -> Result<E::Output> {
        let mut scheme = "https";
        let mut trust_certificates = false;

        loop {
            let client = if trust_certificates {
                &self.trusting
            } else {
                &self.verifying
            };
            let base = format!("{}://{}", scheme, self.registry);
            let url = endpoint.url(&base)?;

            match self.dispatch(client, url, authorization, endpoint).await {
                Ok(output) => return Ok(output),
                Err(CallFailure::Fatal(err)) => return Err(err),
                Err(CallFailure::Send(err)) => {
                    if err.is_timeout() {
                        return Err(BuildError::RegistryNoResponse {
                            registry: self.registry.clone(),
                            message: "request timed out".to_string(),
                        });
                    }
                    if is_broken_pipe(&err) {
                        return Err(BuildError::RegistryBrokenPipe {
                            registry: self.registry.clone(),
                        });
                    }
                    if scheme == "https" {
                        let hop = next_fallback(
                            trust_certificates,
                            self.flags.allow_insecure_registries,
                            is_secure_channel_failure(&err),
                            is_connection_refused(&err),
                            self.registry.contains(':'),
                        );
                        match hop {
                            Some(Fallback::TrustCertificates) => {
                                tracing::warn!(
                                    registry = %self.registry,
                                    "HTTPS with certificate validation failed; retrying without validation"
                                );
                                trust_certificates = true;
                                continue;
                            }
                            Some(Fallback::PlainHttp) => {
                                tracing::warn!(
                                    registry = %self.registry,
                                    "HTTPS failed; falling back to plain HTTP"
                                );
                                scheme = "http";
                                continue;
                            }
                            None => {}
                        }
                        if is_certificate_error(&err)
                            && !self.flags.allow_insecure_registries
                        {
                            return Err(BuildError::InsecureRegistry {
                                registry: self.registry.clone(),
                            });
                        }
                    }
                    return Err(BuildError::RegistryNoResponse {
                        registry: self.registry.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    async fn dispatch<E: Endpoint>(
        &self,
        client: &Client,
        mut url: Url,
        authorization: Option<&Authorization>,
        endpoint: &E,
    ) -> std::result::Result<E::Output, CallFailure> {
        let body = endpoint.request_body().map_err(CallFailure::Fatal)?;

        for _ in 0..=MAX_REDIRECTS {
            let send_credentials =
                url.scheme() == "https" || self.flags.send_credentials_over_http;

            let mut request = client.request(endpoint.method(), url.clone());
            let accept = endpoint.accept();
            if !accept.is_empty() {
                request = request.header(header::ACCEPT, accept.join(","));
            }
            if let Some(content_type) = endpoint.content_type() {
                request = request.header(header::CONTENT_TYPE, content_type);
            }
            if self.flags.user_agent_enabled {
                request = request.header(
                    header::USER_AGENT,
                    format!("{}/{}", lateen_core::TOOL_NAME, lateen_core::VERSION),
                );
            }
            if let Some(authorization) = authorization {
                if send_credentials {
                    request =
                        request.header(header::AUTHORIZATION, authorization.header_value());
                }
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            tracing::debug!(
                method = %endpoint.method(),
                url = %url,
                endpoint = endpoint.name(),
                "Registry request"
            );
            let response = request.send().await.map_err(CallFailure::Send)?;
            let status = response.status();

            if status.is_redirection() {
                url = redirect_target(&url, &response).map_err(CallFailure::Fatal)?;
                // A redirect must not smuggle the request onto plain HTTP.
                self.require_secure_scheme(&url).map_err(CallFailure::Fatal)?;
                continue;
            }

            if (status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN)
                && !endpoint.accepts_unauthorized()
            {
                if authorization.is_some() && !send_credentials {
                    return Err(CallFailure::Fatal(BuildError::RegistryCredentialsNotSent {
                        registry: self.registry.clone(),
                    }));
                }
                return Err(CallFailure::Fatal(BuildError::RegistryUnauthorized {
                    registry: self.registry.clone(),
                    repository: self.repository.clone(),
                }));
            }

            return endpoint
                .handle_response(response)
                .await
                .map_err(CallFailure::Fatal);
        }

        Err(CallFailure::Fatal(BuildError::Registry(format!(
            "more than {} redirects from {} while calling {}",
            MAX_REDIRECTS,
            self.registry,
            endpoint.name()
        ))))
    }

    /// Reject non-HTTPS URLs unless insecure registries are allowed.
    fn require_secure_scheme(&self, url: &Url) -> Result<()> {
        if url.scheme() != "https" && !self.flags.allow_insecure_registries {
            return Err(BuildError::InsecureRegistry {
                registry: self.registry.clone(),
            });
        }
        Ok(())
    }
}

/// One rung of the insecure-registry fallback ladder.
#[derive(Debug, PartialEq, Eq)]
enum Fallback {
    TrustCertificates,
    PlainHttp,
}

/// Decide the next rung after an HTTPS transport failure, or `None` to
/// propagate the error. A failed secure channel walks certificate-trusting
/// first, then plain HTTP; a refused connection skips straight to HTTP, but
/// only when the registry carries no explicit port. Anything else (DNS,
/// resets, other transients) is not worth retrying insecurely.
fn next_fallback(
    trust_certificates: bool,
    allow_insecure: bool,
    secure_channel_failure: bool,
    connection_refused: bool,
    explicit_port: bool,
) -> Option<Fallback> {
    if !allow_insecure {
        return None;
    }
    if secure_channel_failure {
        return Some(if trust_certificates {
            Fallback::PlainHttp
        } else {
            Fallback::TrustCertificates
        });
    }
    if connection_refused && !explicit_port {
        return Some(Fallback::PlainHttp);
    }
    None
}

fn redirect_target(current: &Url, response: &Response) -> Result<Url> {
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            BuildError::Registry(format!(
                "redirect from {} without a Location header",
                current
            ))
        })?;
    current
        .join(location)
        .map_err(|e| BuildError::Registry(format!("unusable redirect location '{}': {}", location, e)))
}

fn is_broken_pipe(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::BrokenPipe {
                return true;
            }
        }
        source = e.source();
    }
    false
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = e.source();
    }
    false
}

fn is_certificate_error(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("handshake") {
            return true;
        }
        source = e.source();
    }
    false
}

/// The TCP connection worked (or failed mid-handshake) but no secure channel
/// came up. reqwest exposes no typed TLS error, so this classifies by the
/// error chain: named certificate/handshake failures, or any other
/// connect-phase error that is not a plain refusal.
fn is_secure_channel_failure(err: &reqwest::Error) -> bool {
    is_certificate_error(err) || (err.is_connect() && !is_connection_refused(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::endpoint::ManifestPullEndpoint;
    use httpmock::prelude::*;

    fn test_flags() -> BehaviorFlags {
        BehaviorFlags {
            allow_insecure_registries: true,
            send_credentials_over_http: true,
            ..Default::default()
        }
    }

    fn caller_for(server: &MockServer) -> RegistryCaller {
        RegistryCaller::new(&server.address().to_string(), "lateen/app", &test_flags()).unwrap()
    }

    #[tokio::test]
    async fn test_http_fallback_reaches_plain_server() {
        let server = MockServer::start();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "size": 2,
                "digest": crate::digest::Digest::of_bytes(b"{}").to_string(),
            },
            "layers": []
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/lateen/app/manifests/latest");
            then.status(200).json_body(manifest);
        });

        // The mock server only speaks HTTP, so this exercises the downgrade.
        let caller = caller_for(&server);
        let endpoint = ManifestPullEndpoint::new("lateen/app", "latest");
        let (parsed, _) = caller.call(None, &endpoint).await.unwrap();
        assert!(matches!(
            parsed,
            crate::image::json::ManifestTemplate::Oci(_)
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/lateen/app/manifests/latest");
            then.status(401);
        });

        let caller = caller_for(&server);
        let endpoint = ManifestPullEndpoint::new("lateen/app", "latest");
        let err = caller.call(None, &endpoint).await.unwrap_err();
        assert!(matches!(err, BuildError::RegistryUnauthorized { .. }));
    }

    #[tokio::test]
    async fn test_credentials_withheld_over_http() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/lateen/app/manifests/latest");
            then.status(401);
        });

        let mut flags = test_flags();
        flags.send_credentials_over_http = false;
        let caller =
            RegistryCaller::new(&server.address().to_string(), "lateen/app", &flags).unwrap();
        let authorization = Authorization::bearer("secret");
        let endpoint = ManifestPullEndpoint::new("lateen/app", "latest");
        let err = caller
            .call(Some(&authorization), &endpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::RegistryCredentialsNotSent { .. }));
    }

    #[tokio::test]
    async fn test_redirect_is_followed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/lateen/app/manifests/latest");
            then.status(307)
                .header("location", "/v2/lateen/app/manifests/moved");
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/lateen/app/manifests/moved");
            then.status(200).json_body(serde_json::json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {
                    "mediaType": "application/vnd.oci.image.config.v1+json",
                    "size": 2,
                    "digest": crate::digest::Digest::of_bytes(b"{}").to_string(),
                },
                "layers": []
            }));
        });

        let caller = caller_for(&server);
        let endpoint = ManifestPullEndpoint::new("lateen/app", "latest");
        assert!(caller.call(None, &endpoint).await.is_ok());
    }

    #[test]
    fn test_redirects_to_http_rejected_when_insecure_disallowed() {
        let caller =
            RegistryCaller::new("registry.example.com", "lateen/app", &BehaviorFlags::default())
                .unwrap();
        let err = caller
            .require_secure_scheme(&Url::parse("http://cdn.example.com/blob").unwrap())
            .unwrap_err();
        assert!(matches!(err, BuildError::InsecureRegistry { .. }));
        assert!(caller
            .require_secure_scheme(&Url::parse("https://cdn.example.com/blob").unwrap())
            .is_ok());
    }

    #[test]
    fn test_redirects_to_http_allowed_when_insecure_allowed() {
        let caller =
            RegistryCaller::new("registry.example.com", "lateen/app", &test_flags()).unwrap();
        assert!(caller
            .require_secure_scheme(&Url::parse("http://cdn.example.com/blob").unwrap())
            .is_ok());
    }

    #[test]
    fn test_fallback_ladder_walks_trust_then_http() {
        // First secure-channel failure drops certificate validation, the
        // second drops to plain HTTP.
        assert_eq!(
            next_fallback(false, true, true, false, true),
            Some(Fallback::TrustCertificates)
        );
        assert_eq!(
            next_fallback(true, true, true, false, true),
            Some(Fallback::PlainHttp)
        );
    }

    #[test]
    fn test_fallback_skipped_for_transient_errors() {
        // A failure that is neither a secure-channel problem nor a refused
        // connection is not retried insecurely, even when allowed.
        assert_eq!(next_fallback(false, true, false, false, false), None);
    }

    #[test]
    fn test_fallback_on_refusal_only_without_explicit_port() {
        assert_eq!(
            next_fallback(false, true, false, true, false),
            Some(Fallback::PlainHttp)
        );
        assert_eq!(next_fallback(false, true, false, true, true), None);
    }

    #[test]
    fn test_no_fallback_when_insecure_disallowed() {
        assert_eq!(next_fallback(false, false, true, false, false), None);
        assert_eq!(next_fallback(false, false, false, true, false), None);
    }

    #[tokio::test]
    async fn test_redirect_loop_is_bounded() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/lateen/app/manifests/latest");
            then.status(307)
                .header("location", "/v2/lateen/app/manifests/latest");
        });

        let caller = caller_for(&server);
        let endpoint = ManifestPullEndpoint::new("lateen/app", "latest");
        let err = caller.call(None, &endpoint).await.unwrap_err();
        assert!(err.to_string().contains("redirects"));
    }
}
