use std::path::PathBuf;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Process-wide configuration, loaded once at startup and passed by value
/// (wrapped in `Arc` where shared) into the components that need it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// NATS server URL(s), comma-separated.
    pub bus_url: String,

    /// Path to this decider's own NATS credentials file, if it authenticates
    /// to the bus with user credentials rather than anonymously.
    pub bus_credentials_file: Option<PathBuf>,

    /// Account public key placed in issued user tokens.
    pub bus_account: Option<String>,

    /// Subject the decider subscribes to for auth-callout requests.
    pub callout_subject: String,

    /// JWKS endpoint. Defaults to the in-cluster Kubernetes OIDC endpoint
    /// when `in_cluster` is set.
    pub jwks_url: Option<String>,

    /// Expected `iss` claim. Defaults to the in-cluster issuer when unset.
    pub jwt_issuer: Option<String>,

    /// Expected `aud` entry.
    pub jwt_audience: String,

    /// Select in-cluster Kubernetes client configuration over a kubeconfig file.
    pub in_cluster: bool,

    /// Observability only.
    pub log_level: String,

    /// Liveness and metrics listener port.
    pub http_port: u16,

    /// How often the JWKS cache refreshes on its background schedule.
    #[serde(with = "humantime_seconds")]
    pub jwks_refresh_interval: std::time::Duration,

    /// Minimum spacing between out-of-band JWKS refreshes triggered by an
    /// unknown key-id.
    #[serde(with = "humantime_seconds")]
    pub jwks_refresh_rate_limit: std::time::Duration,

    /// Allowed clock skew at token time-window boundaries.
    #[serde(with = "humantime_seconds")]
    pub clock_skew: std::time::Duration,

    /// Validity period of issued NATS user tokens.
    #[serde(with = "humantime_seconds")]
    pub user_token_ttl: std::time::Duration,

    /// Grace period for in-flight handlers to finish during shutdown.
    #[serde(with = "humantime_seconds")]
    pub drain_grace: std::time::Duration,

    /// Optional path to a durable NATS account signing key seed. When unset,
    /// a fresh key pair is generated at startup (test mode only).
    pub signing_key_file: Option<PathBuf>,

    /// Nkey-encoded public key trusted to sign inbound auth-callout requests.
    /// When unset, inbound request signatures are not verified; the decider
    /// still functions (the NATS server is itself a trusted bus member in
    /// most deployments) but this is logged loudly at startup.
    pub callout_issuer_public_key: Option<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("DECIDER_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.bus_url.trim().is_empty() {
            anyhow::bail!("DECIDER_BUS_URL must be set");
        }
        Ok(())
    }

    pub fn effective_jwks_url(&self) -> String {
        self.jwks_url.clone().unwrap_or_else(|| {
            "https://kubernetes.default.svc.cluster.local/openid/v1/jwks".to_string()
        })
    }

    pub fn effective_issuer(&self) -> String {
        self.jwt_issuer.clone().unwrap_or_else(|| {
            "https://kubernetes.default.svc.cluster.local".to_string()
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Intentionally no default: `validate()` rejects an empty
            // `bus_url` so an operator who forgets `DECIDER_BUS_URL` gets a
            // fatal startup error instead of a silent localhost connection.
            bus_url: String::new(),
            bus_credentials_file: None,
            bus_account: None,
            callout_subject: "$SYS.REQ.USER.AUTH".to_string(),
            jwks_url: None,
            jwt_issuer: None,
            jwt_audience: "nats".to_string(),
            in_cluster: true,
            log_level: "info".to_string(),
            http_port: 8080,
            jwks_refresh_interval: std::time::Duration::from_secs(60 * 60),
            jwks_refresh_rate_limit: std::time::Duration::from_secs(5 * 60),
            clock_skew: std::time::Duration::from_secs(1),
            user_token_ttl: std::time::Duration::from_secs(5 * 60),
            drain_grace: std::time::Duration::from_secs(5),
            signing_key_file: None,
            callout_issuer_public_key: None,
        }
    }
}

mod humantime_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}
