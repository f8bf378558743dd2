use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Behavior flags consumed by the build pipeline.
///
/// These are passed in by the embedding application (CLI, plugin); the
/// pipeline never reads the process environment directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorFlags {
    /// Never touch the network; serve everything from the local cache.
    pub offline: bool,

    /// Allow plain-HTTP registries and registries with untrusted certificates.
    pub allow_insecure_registries: bool,

    /// Attach credentials even when the effective channel is plain HTTP.
    /// Only meaningful together with `allow_insecure_registries`.
    pub send_credentials_over_http: bool,

    /// Send a `User-Agent` header identifying this tool on registry calls.
    pub user_agent_enabled: bool,

    /// Per-request HTTP timeout.
    #[serde(with = "timeout_millis")]
    pub http_timeout: Duration,
}

impl Default for BehaviorFlags {
    fn default() -> Self {
        Self {
            offline: false,
            allow_insecure_registries: false,
            send_credentials_over_http: false,
            user_agent_enabled: true,
            http_timeout: Duration::from_secs(20),
        }
    }
}

mod timeout_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
