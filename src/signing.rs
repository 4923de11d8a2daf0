//! The decider's NATS account signing identity, and construction of the
//! signed NATS user claim handed back to the server.
//!
//! The account signing key is process-private and shared read-only after
//! startup. Loading it from a durable seed file is the production path;
//! generating a fresh one at startup is accepted only for test deployments,
//! mirroring this codebase's existing stance on ephemeral generated key
//! material (see the cluster CA / self-signed cert path elsewhere in this
//! tree) — loud, logged, and never the default in a configured environment.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::nats_jwt::{self, ClaimsBody};

pub struct SigningIdentity {
    key_pair: nkeys::KeyPair,
}

impl SigningIdentity {
    /// Loads a durable account signing key seed from `path`, or generates a
    /// fresh one when `path` is `None`. A freshly generated key is only
    /// meaningful when the NATS server's `issuer` trust anchor is configured
    /// against the public key this process prints on startup.
    pub fn load_or_generate(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let key_pair = match path {
            Some(path) => {
                let seed = std::fs::read_to_string(path)?;
                nkeys::KeyPair::from_seed(seed.trim())?
            }
            None => {
                warn!(
                    "no signing-key-file configured, generating an ephemeral account key pair; \
                     this is only valid when the NATS server's issuer trust anchor is configured \
                     against the public key logged below"
                );
                nkeys::KeyPair::new_account()
            }
        };
        Ok(Self { key_pair })
    }

    pub fn account_public_key(&self) -> String {
        self.key_pair.public_key()
    }

    /// Builds, signs, and encodes the NATS user claim described in §3 and
    /// §4.5: a short-lived signed object authorizing `user_public_key` to
    /// publish/subscribe on the given subject lists.
    pub fn issue_user_claim(
        &self,
        user_public_key: &str,
        publish: Vec<String>,
        subscribe: Vec<String>,
        ttl: std::time::Duration,
        account: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<String, nats_jwt::JwtError> {
        let expiry = now + time::Duration::seconds(ttl.as_secs() as i64);

        let payload = UserClaimPayload {
            jti: String::new(),
            iat: now.unix_timestamp(),
            exp: expiry.unix_timestamp(),
            iss: self.account_public_key(),
            sub: user_public_key.to_string(),
            nats: NatsUserPermissions {
                claim_type: "user",
                version: 2,
                issuer_account: account.map(str::to_string),
                publish: Permissions { allow: publish },
                subscribe: Permissions { allow: subscribe },
            },
        };

        nats_jwt::encode_and_sign(payload, &self.key_pair)
    }

    /// Builds, signs, and encodes the auth-callout response envelope that
    /// wraps either a successfully issued user claim or a refusal message.
    pub fn issue_callout_response(
        &self,
        request_server_id: &str,
        request_user_nkey: &str,
        outcome: Result<String, &str>,
        now: OffsetDateTime,
    ) -> Result<String, nats_jwt::JwtError> {
        let (jwt, error) = match outcome {
            Ok(jwt) => (Some(jwt), None),
            Err(message) => (None, Some(message.to_string())),
        };

        let payload = ResponseClaimPayload {
            jti: String::new(),
            iat: now.unix_timestamp(),
            iss: self.account_public_key(),
            sub: request_user_nkey.to_string(),
            aud: request_server_id.to_string(),
            nats: AuthorizationResponse { claim_type: "authorization_response", version: 2, jwt, error },
        };

        nats_jwt::encode_and_sign(payload, &self.key_pair)
    }
}

#[derive(Serialize)]
struct UserClaimPayload {
    jti: String,
    iat: i64,
    exp: i64,
    iss: String,
    sub: String,
    nats: NatsUserPermissions,
}

impl ClaimsBody for UserClaimPayload {
    fn set_jti(&mut self, jti: String) {
        self.jti = jti;
    }
}

#[derive(Serialize)]
struct NatsUserPermissions {
    #[serde(rename = "type")]
    claim_type: &'static str,
    version: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    issuer_account: Option<String>,
    #[serde(rename = "pub")]
    publish: Permissions,
    #[serde(rename = "sub")]
    subscribe: Permissions,
}

#[derive(Serialize)]
struct Permissions {
    allow: Vec<String>,
}

#[derive(Serialize)]
struct ResponseClaimPayload {
    jti: String,
    iat: i64,
    iss: String,
    sub: String,
    aud: String,
    nats: AuthorizationResponse,
}

impl ClaimsBody for ResponseClaimPayload {
    fn set_jti(&mut self, jti: String) {
        self.jti = jti;
    }
}

#[derive(Serialize)]
struct AuthorizationResponse {
    #[serde(rename = "type")]
    claim_type: &'static str,
    version: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
