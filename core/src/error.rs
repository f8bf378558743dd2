use std::sync::Arc;

use thiserror::Error;

/// Pointer appended to cache-corruption and registry-error messages.
pub const ISSUE_TRACKER: &str = "https://github.com/lateen-build/lateen/issues";

/// Lateen error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed digest string
    #[error("Invalid digest: {0}")]
    DigestFormat(String),

    /// On-disk cache is in a state the reader cannot trust
    #[error("Cache corrupted: {message}; consider deleting the cache directory ({path}) and rerunning; if the problem persists, please file an issue at {ISSUE_TRACKER}")]
    CacheCorrupted { path: String, message: String },

    /// Registry returned a structured JSON error body
    #[error("Registry error: {0}")]
    Registry(String),

    /// 401/403 from the registry
    #[error("Unauthorized for {registry}/{repository}")]
    RegistryUnauthorized {
        registry: String,
        repository: String,
    },

    /// Credentials were withheld because the channel was plain HTTP
    #[error("Credentials for {registry} were not sent over plain HTTP; retry with send-credentials-over-http enabled if the registry is trusted")]
    RegistryCredentialsNotSent { registry: String },

    /// Registry never answered within the configured timeout
    #[error("Registry {registry} did not respond: {message}")]
    RegistryNoResponse { registry: String, message: String },

    /// Connection torn down mid-request
    #[error("Connection to {registry} closed unexpectedly (broken pipe)")]
    RegistryBrokenPipe { registry: String },

    /// Non-HTTPS registry while insecure registries are disallowed
    #[error("Insecure connection to {registry} is not allowed; enable allow-insecure-registries to connect over HTTP or with an untrusted certificate")]
    InsecureRegistry { registry: String },

    /// Token exchange against the auth realm failed
    #[error("Authentication failed for {realm}: {message}")]
    AuthenticationFailed { realm: String, message: String },

    /// Manifest JSON had an unrecognized schemaVersion/mediaType combination
    #[error("Unknown manifest format: {0}")]
    UnknownManifestFormat(String),

    /// Container config JSON carried a value the translator cannot interpret
    #[error("Bad container configuration: {0}")]
    BadContainerConfigurationFormat(String),

    /// Manifest layer count disagrees with the config's diff_ids count
    #[error("Manifest lists {manifest_layers} layers but the container configuration lists {config_layers} diff_ids")]
    LayerCountMismatch {
        manifest_layers: usize,
        config_layers: usize,
    },

    /// A predecessor build step already failed
    #[error("{0}")]
    Upstream(Arc<BuildError>),

    /// Unexpected HTTP response
    #[error("Unexpected response from {url}: HTTP {status}")]
    Http { url: String, status: u16 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BuildError {
    /// Wrap a failed predecessor step's shared error.
    pub fn upstream(err: Arc<BuildError>) -> Self {
        match &*err {
            // Collapse chains so the terminal error names the original failure once.
            BuildError::Upstream(inner) => BuildError::Upstream(inner.clone()),
            _ => BuildError::Upstream(err),
        }
    }

    /// Root cause of an upstream chain, or self.
    pub fn root(&self) -> &BuildError {
        match self {
            BuildError::Upstream(inner) => inner.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for Lateen operations
pub type Result<T> = std::result::Result<T, BuildError>;
