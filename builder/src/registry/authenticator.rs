//! Bearer-token authentication against a registry's auth realm.

use base64::Engine as _;
use lateen_core::error::{BuildError, Result};
use serde::Deserialize;

/// Username sentinel marking the password as an OAuth2 refresh token.
pub const TOKEN_USERNAME: &str = "<token>";

/// A username/password pair for a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// True when the password is a refresh token rather than a password.
    pub fn is_refresh_token(&self) -> bool {
        self.username == TOKEN_USERNAME
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A ready-to-send `Authorization` header value.
#[derive(Clone, PartialEq, Eq)]
pub struct Authorization(String);

impl Authorization {
    pub fn bearer(token: &str) -> Self {
        Self(format!("Bearer {}", token))
    }

    pub fn basic(credential: &Credential) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credential.username, credential.password));
        Self(format!("Basic {}", encoded))
    }

    pub fn header_value(&self) -> &str {
        &self.0
    }

    pub fn is_bearer(&self) -> bool {
        self.0.starts_with("Bearer ")
    }
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Authorization(<redacted>)")
    }
}

/// The access being requested from the auth realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessScope {
    Pull,
    PullPush,
}

impl AccessScope {
    fn actions(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::PullPush => "pull,push",
        }
    }
}

/// Exchanges credentials for a Bearer token at the realm a registry's
/// `WWW-Authenticate` challenge names.
#[derive(Debug, Clone)]
pub struct RegistryAuthenticator {
    realm: String,
    service: Option<String>,
    registry: String,
    repository: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl RegistryAuthenticator {
    /// Parse a `WWW-Authenticate` challenge.
    ///
    /// Returns `None` for non-Bearer schemes (a `Basic` challenge means the
    /// credential itself is the authorization).
    pub fn from_challenge(
        challenge: &str,
        registry: &str,
        repository: &str,
    ) -> Option<Self> {
        let (scheme, parameters) = challenge.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        for parameter in parameters.split(',') {
            if let Some((key, value)) = parameter.split_once('=') {
                let value = value.trim().trim_matches('"').to_string();
                match key.trim() {
                    "realm" => realm = Some(value),
                    "service" => service = Some(value),
                    _ => {}
                }
            }
        }

        Some(Self {
            realm: realm?,
            service,
            registry: registry.to_string(),
            repository: repository.to_string(),
        })
    }

    /// Fetch a Bearer token for the requested scope.
    pub async fn authenticate(
        &self,
        client: &reqwest::Client,
        credential: Option<&Credential>,
        scope: AccessScope,
    ) -> Result<Authorization> {
        let scope_param = format!("repository:{}:{}", self.repository, scope.actions());
        tracing::debug!(
            realm = %self.realm,
            registry = %self.registry,
            scope = %scope_param,
            "Requesting registry token"
        );

        // A challenge without a service parameter means the registry itself.
        let service = self.service.clone().unwrap_or_else(|| self.registry.clone());
        let request = match credential {
            Some(credential) if credential.is_refresh_token() => {
                // OAuth2 refresh-token grant, sent as a form POST.
                let form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", credential.password.clone()),
                    ("client_id", lateen_core::TOOL_NAME.to_string()),
                    ("service", service),
                    ("scope", scope_param),
                ];
                client.post(&self.realm).form(&form)
            }
            _ => {
                let query = vec![("service", service), ("scope", scope_param)];
                let mut request = client.get(&self.realm).query(&query);
                if let Some(credential) = credential {
                    request =
                        request.basic_auth(&credential.username, Some(&credential.password));
                }
                request
            }
        };

        let response = request.send().await.map_err(|e| {
            BuildError::AuthenticationFailed {
                realm: self.realm.clone(),
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BuildError::AuthenticationFailed {
                realm: self.realm.clone(),
                message: format!("token endpoint answered HTTP {}", status.as_u16()),
            });
        }

        let body: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| BuildError::AuthenticationFailed {
                    realm: self.realm.clone(),
                    message: format!("unreadable token response: {}", e),
                })?;

        // Realms answer with either field name.
        let token = body.token.or(body.access_token).ok_or_else(|| {
            BuildError::AuthenticationFailed {
                realm: self.realm.clone(),
                message: "token response carried neither 'token' nor 'access_token'"
                    .to_string(),
            }
        })?;

        Ok(Authorization::bearer(&token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let authenticator = RegistryAuthenticator::from_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com""#,
            "registry.example.com",
            "lateen/app",
        )
        .unwrap();
        assert_eq!(authenticator.realm, "https://auth.example.com/token");
        assert_eq!(
            authenticator.service.as_deref(),
            Some("registry.example.com")
        );
    }

    #[test]
    fn test_basic_challenge_is_not_bearer() {
        assert!(RegistryAuthenticator::from_challenge(
            r#"Basic realm="registry""#,
            "r.example.com",
            "lateen/app",
        )
        .is_none());
    }

    #[test]
    fn test_challenge_without_realm() {
        assert!(RegistryAuthenticator::from_challenge(
            r#"Bearer service="registry.example.com""#,
            "r.example.com",
            "lateen/app",
        )
        .is_none());
    }

    #[test]
    fn test_basic_authorization_encoding() {
        let authorization = Authorization::basic(&Credential::new("user", "pass"));
        assert_eq!(authorization.header_value(), "Basic dXNlcjpwYXNz");
        assert!(!authorization.is_bearer());
    }

    #[tokio::test]
    async fn test_authenticate_with_basic_credentials() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/token")
                .query_param("scope", "repository:lateen/app:pull")
                .query_param("service", "registry.example.com")
                .header("authorization", "Basic dXNlcjpwYXNz");
            then.status(200)
                .json_body(serde_json::json!({"token": "abc123"}));
        });

        let authenticator = RegistryAuthenticator::from_challenge(
            &format!(
                r#"Bearer realm="{}/token",service="registry.example.com""#,
                server.base_url()
            ),
            "registry.example.com",
            "lateen/app",
        )
        .unwrap();

        let authorization = authenticator
            .authenticate(
                &reqwest::Client::new(),
                Some(&Credential::new("user", "pass")),
                AccessScope::Pull,
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(authorization.header_value(), "Bearer abc123");
    }

    #[tokio::test]
    async fn test_authenticate_with_refresh_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=my-refresh-token");
            then.status(200)
                .json_body(serde_json::json!({"access_token": "via-oauth"}));
        });

        let authenticator = RegistryAuthenticator::from_challenge(
            &format!(r#"Bearer realm="{}/token""#, server.base_url()),
            "registry.example.com",
            "lateen/app",
        )
        .unwrap();

        let authorization = authenticator
            .authenticate(
                &reqwest::Client::new(),
                Some(&Credential::new(TOKEN_USERNAME, "my-refresh-token")),
                AccessScope::PullPush,
            )
            .await
            .unwrap();

        mock.assert();
        assert_eq!(authorization.header_value(), "Bearer via-oauth");
    }

    #[tokio::test]
    async fn test_authenticate_failure_names_realm() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/token");
            then.status(401);
        });

        let authenticator = RegistryAuthenticator::from_challenge(
            &format!(r#"Bearer realm="{}/token""#, server.base_url()),
            "registry.example.com",
            "lateen/app",
        )
        .unwrap();

        let err = authenticator
            .authenticate(&reqwest::Client::new(), None, AccessScope::Pull)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::AuthenticationFailed { .. }));
        assert!(err.to_string().contains("/token"));
    }
}
