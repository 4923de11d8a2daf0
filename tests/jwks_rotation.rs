//! Scenario 6: key rotation. A token signed with `kid=K2` validates
//! successfully even though the initial JWKS fetch only returns `K1`,
//! because the key-id miss triggers a synchronous out-of-band refresh.

use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use nats_sa_decider::{jwks::Keystore, metrics::Metrics, validator::TokenValidator};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const ISSUER: &str = "https://kubernetes.default.svc.cluster.local";
const AUDIENCE: &str = "nats";

const K1_PEM: &[u8] = include_bytes!("fixtures/k1.pem");
const K2_PEM: &[u8] = include_bytes!("fixtures/k2.pem");

const K1_KID: &str = "k1";
const K2_KID: &str = "k2";

const K1_N: &str = "gnxWAXPBO-Tp0_VkvhiwUzdqZcVl5gMPUszmnwdPi5x4SwQkufJnf1sdpNomoYJZrXlreMO_WPSXfgL1ttKbQvVQQgH3y8PqjamgxKNJXyM0XZrLLBadBr34cTOeqH3DKMGUgD0whgYtWyub8MIF0ejiO8zDFXuCJhGH9GuoaloyfzgxpOiSxEbVsuLYYmMAYR3YWLyP_CfFbbZKZOBFiwSZKzrZqSbVVztVhNGUzOPcl4gxXMe1HQr2qPvah7TPvh7ewE5gHkWSAY8fpATCrp6BfWuJs1nqb-E1dEukkFmWCEcUGeI5tK3cAaUatZL5oOOR6SkjX71xfQ-ccfPJ7w";
const K2_N: &str = "3Y2zz_iPUi_wra7cZMoXuPd2HuYvuTQ-6wPdRNSDn9MREOFI4LErYkbCgth6hVjmku-m9MOcKOwjM_vP2LNUpD037MRvx4cx89zgzoxn5lPi7_G1Guy0apKzQEzQldC2dFJetG3G9eIo4nPYeGnK-EGn2g81C2T-FbeG25QOaVKrwmkwWit2SCvqbXNt8M3i-5kcgnUq8T_41HZoiSfWGqlUx0qAzAY1mOHk4wuIGXwSqTykaNAu3LcXM3tYmDgj7Sb-8_C20q-A6t4ZXyXuqSXk1AocN2gyzDql0bgNmD_E9Uv2LRvQFgvy95pR5oMHJ6IDsFEnPPrHF-7XBUGvfQ";

#[derive(Serialize)]
struct KubernetesClaims<'a> {
    iss: &'a str,
    aud: &'a str,
    iat: i64,
    nbf: i64,
    exp: i64,
    #[serde(rename = "kubernetes.io")]
    kubernetes_io: KubernetesIo<'a>,
}

#[derive(Serialize)]
struct KubernetesIo<'a> {
    namespace: &'a str,
    serviceaccount: ServiceAccountRef<'a>,
}

#[derive(Serialize)]
struct ServiceAccountRef<'a> {
    name: &'a str,
}

fn jwks_document(keys: &[(&str, &str)]) -> serde_json::Value {
    json!({
        "keys": keys.iter().map(|(kid, n)| json!({
            "use": "sig",
            "kty": "RSA",
            "kid": kid,
            "alg": "RS256",
            "n": n,
            "e": "AQAB",
        })).collect::<Vec<_>>()
    })
}

fn sign_token(kid: &str, pem: &[u8], now: OffsetDateTime) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());

    let claims = KubernetesClaims {
        iss: ISSUER,
        aud: AUDIENCE,
        iat: now.unix_timestamp(),
        nbf: now.unix_timestamp(),
        exp: (now + time::Duration::minutes(5)).unix_timestamp(),
        kubernetes_io: KubernetesIo {
            namespace: "prod",
            serviceaccount: ServiceAccountRef { name: "api" },
        },
    };

    jsonwebtoken::encode(&header, &claims, &EncodingKey::from_rsa_pem(pem).unwrap()).unwrap()
}

#[test_log::test(tokio::test)]
async fn key_rotation_refreshes_the_keystore_on_an_unknown_kid() {
    let server = MockServer::start().await;

    // The decider's initial load sees only K1.
    Mock::given(method("GET"))
        .and(path("/openid/v1/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_document(&[(K1_KID, K1_N)])))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    // Any subsequent fetch (triggered by the unknown-kid refresh) sees both.
    Mock::given(method("GET"))
        .and(path("/openid/v1/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_document(&[(K1_KID, K1_N), (K2_KID, K2_N)])))
        .mount(&server)
        .await;

    let jwks_url = format!("{}/openid/v1/jwks", server.uri());
    let metrics = Metrics::new_for_test();
    let keystore = Keystore::load(jwks_url, Duration::from_secs(300), metrics).await.unwrap();
    let validator = TokenValidator::new(keystore, ISSUER.to_string(), AUDIENCE.to_string(), Duration::from_secs(1));

    let now = OffsetDateTime::now_utc();
    let token = sign_token(K2_KID, K2_PEM, now);

    let claims = validator.validate(token.as_bytes(), now).await.unwrap();
    assert_eq!(claims.kubernetes_namespace, "prod");
    assert_eq!(claims.kubernetes_service_account_name, "api");

    // A token signed with K1 still validates against the now-rotated cache.
    let token_k1 = sign_token(K1_KID, K1_PEM, now);
    validator.validate(token_k1.as_bytes(), now).await.unwrap();
}
