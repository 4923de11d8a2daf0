//! Minimal codec for the NATS JWT envelope: three base64url segments
//! (header, payload, signature) signed with an Ed25519 nkey, the same shape
//! `nsc`/`nats-server` use for account, user, and auth-callout claims. There
//! is no general-purpose NATS JWT crate in the ecosystem; this module is the
//! narrow slice of that format the decider actually produces and consumes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

#[derive(thiserror::Error, Debug)]
pub enum JwtError {
    #[error("malformed token: expected 3 dot-separated segments")]
    Malformed,
    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("nkey error: {0}")]
    Nkey(#[from] nkeys::error::Error),
    #[error("signature verification failed")]
    BadSignature,
}

#[derive(Serialize)]
struct Header {
    typ: &'static str,
    alg: &'static str,
}

/// A claims body that carries its own `jti`, computed as the base32 hash of
/// the claims with `jti` blanked out, matching the NATS JWT convention of a
/// tamper-evident id independent of the outer signature.
pub trait ClaimsBody: Serialize {
    fn set_jti(&mut self, jti: String);
}

pub fn encode_and_sign<T: ClaimsBody>(mut payload: T, key_pair: &nkeys::KeyPair) -> Result<String, JwtError> {
    payload.set_jti(String::new());
    let digest = Sha256::digest(serde_json::to_vec(&payload)?);
    payload.set_jti(data_encoding::BASE32HEX_NOPAD.encode(&digest));

    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Header { typ: "JWT", alg: "ed25519-nkey" })?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let signature = key_pair.sign(signing_input.as_bytes())?;
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Decodes a NATS JWT's payload, optionally verifying its signature against
/// `trust_anchor` (an nkey-encoded public key). Passing `None` skips
/// verification, which this codebase only ever does when no trust anchor has
/// been configured for auth-callout requests (logged loudly elsewhere).
pub fn decode<T: DeserializeOwned>(token: &str, trust_anchor: Option<&str>) -> Result<T, JwtError> {
    let mut segments = token.split('.');
    let header_b64 = segments.next().ok_or(JwtError::Malformed)?;
    let payload_b64 = segments.next().ok_or(JwtError::Malformed)?;
    let signature_b64 = segments.next().ok_or(JwtError::Malformed)?;
    if segments.next().is_some() {
        return Err(JwtError::Malformed);
    }

    if let Some(trust_anchor) = trust_anchor {
        let verifying_key = nkeys::KeyPair::from_public_key(trust_anchor)?;
        let signature = URL_SAFE_NO_PAD.decode(signature_b64)?;
        let signing_input = format!("{header_b64}.{payload_b64}");
        verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| JwtError::BadSignature)?;
    }

    let payload_json = URL_SAFE_NO_PAD.decode(payload_b64)?;
    Ok(serde_json::from_slice(&payload_json)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Body {
        jti: String,
        value: u32,
    }

    impl ClaimsBody for Body {
        fn set_jti(&mut self, jti: String) {
            self.jti = jti;
        }
    }

    #[test]
    fn round_trips_through_encode_and_decode_with_verification() {
        let key_pair = nkeys::KeyPair::new_account();
        let token = encode_and_sign(Body { jti: String::new(), value: 42 }, &key_pair).unwrap();
        let decoded: Body = decode(&token, Some(&key_pair.public_key())).unwrap();
        assert_eq!(decoded.value, 42);
        assert!(!decoded.jti.is_empty());
    }

    #[test]
    fn rejects_tampered_signature() {
        let key_pair = nkeys::KeyPair::new_account();
        let other = nkeys::KeyPair::new_account();
        let token = encode_and_sign(Body { jti: String::new(), value: 1 }, &key_pair).unwrap();
        let result: Result<Body, JwtError> = decode(&token, Some(&other.public_key()));
        assert!(matches!(result, Err(JwtError::BadSignature)));
    }
}
