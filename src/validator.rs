//! Kubernetes service-account token validation.
//!
//! Pure with respect to the caller: its only I/O is delegating key lookups to
//! [`Keystore`]. Time is an explicit argument rather than a hidden
//! `SystemTime::now()` call so tests can pin the clock.

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::jwks::{KeyLookup, Keystore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub issuer: String,
    pub audience: Vec<String>,
    pub issued_at: OffsetDateTime,
    pub not_before: OffsetDateTime,
    pub expiry: OffsetDateTime,
    pub kubernetes_namespace: String,
    pub kubernetes_service_account_name: String,
}

/// Leaked to the decider only, never echoed back to the client.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("token expired or not yet valid")]
    ExpiredToken,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid claims")]
    InvalidClaims,
    #[error("missing kubernetes identity claims")]
    MissingKubernetesClaims,
    #[error("transient failure validating key material")]
    Transient,
}

#[derive(Deserialize, Debug)]
struct RawClaims {
    iss: String,
    aud: AudienceField,
    iat: i64,
    nbf: i64,
    exp: i64,
    #[serde(rename = "kubernetes.io")]
    kubernetes_io: Option<KubernetesIo>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum AudienceField {
    One(String),
    Many(Vec<String>),
}

impl AudienceField {
    fn into_vec(self) -> Vec<String> {
        match self {
            AudienceField::One(aud) => vec![aud],
            AudienceField::Many(auds) => auds,
        }
    }
}

#[derive(Deserialize, Debug)]
struct KubernetesIo {
    namespace: Option<String>,
    serviceaccount: Option<ServiceAccountRef>,
}

#[derive(Deserialize, Debug)]
struct ServiceAccountRef {
    name: Option<String>,
}

pub struct TokenValidator {
    keystore: Keystore,
    expected_issuer: String,
    expected_audience: String,
    clock_skew: Duration,
}

impl TokenValidator {
    pub fn new(
        keystore: Keystore,
        expected_issuer: String,
        expected_audience: String,
        clock_skew: Duration,
    ) -> Self {
        Self {
            keystore,
            expected_issuer,
            expected_audience,
            clock_skew,
        }
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// Runs the full validation algorithm from §4.2: header algorithm check,
    /// key lookup, signature verification, claim shape, and time-window
    /// checks against `now`.
    pub async fn validate(&self, token: &[u8], now: OffsetDateTime) -> Result<Claims, ValidationError> {
        let token_str = std::str::from_utf8(token).map_err(|_| ValidationError::InvalidClaims)?;

        let header =
            jsonwebtoken::decode_header(token_str).map_err(|_| ValidationError::InvalidSignature)?;

        // `none` and any non-RS256 algorithm are rejected outright, closing
        // the classic alg-downgrade attack before a key lookup even happens.
        if header.alg != Algorithm::RS256 {
            return Err(ValidationError::InvalidSignature);
        }

        let kid = header.kid.ok_or(ValidationError::InvalidSignature)?;

        let decoding_key = match self.keystore.key_for(&kid).await {
            KeyLookup::Found(key) => key,
            KeyLookup::Unknown => return Err(ValidationError::InvalidSignature),
            KeyLookup::Transient => return Err(ValidationError::Transient),
        };

        let raw = decode_claims(token_str, &decoding_key)?;

        let kubernetes_io = raw
            .kubernetes_io
            .ok_or(ValidationError::MissingKubernetesClaims)?;
        let namespace = kubernetes_io
            .namespace
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingKubernetesClaims)?;
        let service_account_name = kubernetes_io
            .serviceaccount
            .and_then(|sa| sa.name)
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::MissingKubernetesClaims)?;

        if raw.iss != self.expected_issuer {
            return Err(ValidationError::InvalidClaims);
        }
        if !raw.aud.clone().into_vec().iter().any(|aud| aud == &self.expected_audience) {
            return Err(ValidationError::InvalidClaims);
        }

        let skew = time::Duration::seconds(self.clock_skew.as_secs() as i64);
        let not_before = OffsetDateTime::from_unix_timestamp(raw.nbf)
            .map_err(|_| ValidationError::InvalidClaims)?;
        let expiry = OffsetDateTime::from_unix_timestamp(raw.exp)
            .map_err(|_| ValidationError::InvalidClaims)?;
        let issued_at = OffsetDateTime::from_unix_timestamp(raw.iat)
            .map_err(|_| ValidationError::InvalidClaims)?;

        if now < not_before - skew {
            return Err(ValidationError::ExpiredToken);
        }
        if now >= expiry {
            return Err(ValidationError::ExpiredToken);
        }
        if issued_at > now + skew {
            return Err(ValidationError::InvalidClaims);
        }

        Ok(Claims {
            issuer: raw.iss,
            audience: raw.aud.into_vec(),
            issued_at,
            not_before,
            expiry,
            kubernetes_namespace: namespace,
            kubernetes_service_account_name: service_account_name,
        })
    }
}

fn decode_claims(token_str: &str, decoding_key: &DecodingKey) -> Result<RawClaims, ValidationError> {
    let mut validation = Validation::new(Algorithm::RS256);
    // Time-window and audience checks are done by hand above so the clock can
    // be injected; jsonwebtoken's own clock-bound checks are disabled here.
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<RawClaims>(token_str, decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::Json(_) => ValidationError::InvalidClaims,
            _ => ValidationError::InvalidSignature,
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn audience_field_accepts_single_string_or_array() {
        assert_eq!(
            AudienceField::One("nats".to_string()).into_vec(),
            vec!["nats".to_string()]
        );
        assert_eq!(
            AudienceField::Many(vec!["nats".to_string(), "other".to_string()]).into_vec(),
            vec!["nats".to_string(), "other".to_string()]
        );
    }
}
