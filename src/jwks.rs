//! JWKS keystore.
//!
//! Fetches, caches, and rotates the JSON Web Key Set used to verify token
//! signatures. Only RSA keys advertising `alg: RS256` (or no `alg`, which we
//! treat as RS256 since `kty: RSA` keys in the Kubernetes JWKS rarely set it)
//! are retained; everything else is ignored per the JWKS surface contract.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use jsonwebtoken::{
    jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm},
    DecodingKey,
};
use tracing::{info, warn};

use crate::metrics::Metrics;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum JwksError {
    #[error("jwks fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("jwks document had no usable RSA keys")]
    NoUsableKeys,
}

/// Outcome of a [`Keystore::key_for`] lookup, matching the three-way result
/// the spec calls for: a usable key, a definitively unknown key-id, or a
/// transient failure that left the cache as it was.
pub enum KeyLookup {
    Found(DecodingKey),
    Unknown,
    Transient,
}

struct RefreshGate {
    last_attempt: Mutex<Option<Instant>>,
    rate_limit: Duration,
}

impl RefreshGate {
    fn new(rate_limit: Duration) -> Self {
        Self {
            last_attempt: Mutex::new(None),
            rate_limit,
        }
    }

    /// Returns true and marks the attempt if a refresh is currently allowed.
    fn try_acquire(&self) -> bool {
        let mut guard = self.last_attempt.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = *guard {
            if now.duration_since(last) < self.rate_limit {
                return false;
            }
        }
        *guard = Some(now);
        true
    }
}

/// Cluster-wide, shared-read keystore for RS256 verification keys.
pub struct Keystore {
    keys: ArcSwap<HashMap<String, DecodingKey>>,
    http: reqwest::Client,
    jwks_url: String,
    gate: RefreshGate,
    metrics: Metrics,
}

impl Keystore {
    /// Fetches the JWKS once. Failure here is fatal to process startup, per
    /// the spec's "initial load failure is fatal" failure semantics.
    pub async fn load(jwks_url: String, rate_limit: Duration, metrics: Metrics) -> Result<Self, JwksError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .expect("reqwest client builder never fails with only a timeout set");

        let keys = fetch_and_parse(&http, &jwks_url).await?;
        info!(key_count = keys.len(), "loaded initial jwks");

        Ok(Self {
            keys: ArcSwap::from_pointee(keys),
            http,
            jwks_url,
            gate: RefreshGate::new(rate_limit),
            metrics,
        })
    }

    /// Looks up a verification key by `kid`. Triggers an out-of-band refresh,
    /// rate-limited regardless of cause, when the key-id is not currently
    /// cached.
    pub async fn key_for(&self, kid: &str) -> KeyLookup {
        if let Some(key) = self.keys.load().get(kid) {
            return KeyLookup::Found(key.clone());
        }

        if !self.gate.try_acquire() {
            return KeyLookup::Unknown;
        }

        match self.refresh().await {
            Ok(()) => match self.keys.load().get(kid) {
                Some(key) => KeyLookup::Found(key.clone()),
                None => KeyLookup::Unknown,
            },
            Err(err) => {
                warn!(?err, "jwks refresh failed, serving from last good snapshot");
                KeyLookup::Transient
            }
        }
    }

    /// Runs the background refresh schedule until cancelled.
    pub async fn run_refresh_loop(&self, interval: Duration, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately; we already loaded on construction
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        warn!(?err, "scheduled jwks refresh failed");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn refresh(&self) -> Result<(), JwksError> {
        let result = fetch_and_parse(&self.http, &self.jwks_url).await;
        match &result {
            Ok(keys) => {
                info!(key_count = keys.len(), "refreshed jwks");
                self.metrics.jwks_refresh_total.with_label_values(&["success"]).inc();
            }
            Err(_) => {
                self.metrics.jwks_refresh_total.with_label_values(&["failure"]).inc();
            }
        }
        let keys = result?;
        self.keys.store(std::sync::Arc::new(keys));
        Ok(())
    }
}

async fn fetch_and_parse(
    http: &reqwest::Client,
    jwks_url: &str,
) -> Result<HashMap<String, DecodingKey>, JwksError> {
    let jwk_set: JwkSet = http
        .get(jwks_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let mut keys = HashMap::new();
    for jwk in jwk_set.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            continue;
        };
        if !is_usable_rs256_key(&jwk) {
            continue;
        }
        match DecodingKey::from_jwk(&jwk) {
            Ok(decoding_key) => {
                keys.insert(kid, decoding_key);
            }
            Err(err) => warn!(?err, kid, "skipping unparsable jwk"),
        }
    }

    if keys.is_empty() {
        return Err(JwksError::NoUsableKeys);
    }

    Ok(keys)
}

/// A key is usable for RS256 verification only if its `kty` is RSA and its
/// `alg`, when declared, is RS256. Kubernetes JWKS entries commonly omit
/// `alg` entirely, which we also accept; any other declared `alg` (RS384,
/// PS256, ...) is ignored even though the key material itself is RSA.
fn is_usable_rs256_key(jwk: &jsonwebtoken::jwk::Jwk) -> bool {
    if !matches!(jwk.algorithm, AlgorithmParameters::RSA(_)) {
        return false;
    }
    matches!(jwk.common.key_algorithm, None | Some(KeyAlgorithm::RS256))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn refresh_gate_rate_limits_regardless_of_cause() {
        let gate = RefreshGate::new(Duration::from_secs(300));
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
    }

    fn rsa_jwk(key_algorithm: Option<KeyAlgorithm>) -> jsonwebtoken::jwk::Jwk {
        use jsonwebtoken::jwk::{CommonParameters, Jwk, PublicKeyUse, RSAKeyParameters};

        Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_operations: None,
                key_algorithm,
                key_id: Some("kid".to_string()),
                x509_url: None,
                x509_chain: None,
                x509_sha1_fingerprint: None,
                x509_sha256_fingerprint: None,
            },
            algorithm: AlgorithmParameters::RSA(RSAKeyParameters {
                key_type: jsonwebtoken::jwk::RSAKeyType::RSA,
                n: "n".to_string(),
                e: "AQAB".to_string(),
            }),
        }
    }

    #[test]
    fn rsa_key_with_no_declared_alg_is_usable() {
        assert!(is_usable_rs256_key(&rsa_jwk(None)));
    }

    #[test]
    fn rsa_key_declaring_rs256_is_usable() {
        assert!(is_usable_rs256_key(&rsa_jwk(Some(KeyAlgorithm::RS256))));
    }

    #[test]
    fn rsa_key_declaring_a_different_alg_is_ignored() {
        assert!(!is_usable_rs256_key(&rsa_jwk(Some(KeyAlgorithm::RS384))));
        assert!(!is_usable_rs256_key(&rsa_jwk(Some(KeyAlgorithm::PS256))));
    }
}
