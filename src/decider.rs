//! Authorization decider.
//!
//! Composes the validator and the index into a single yes/no outcome. The
//! two collaborators are consumed through narrow capability traits rather
//! than the concrete [`crate::validator::TokenValidator`] /
//! [`crate::sa_index::SaIndex`] types, so unit tests can supply hand-written
//! fakes without constructing a Kubernetes client or an HTTPS JWKS endpoint.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    metrics::Metrics,
    validator::{Claims, ValidationError},
};

#[async_trait]
pub trait Validate: Send + Sync {
    async fn validate(&self, token: &[u8], now: OffsetDateTime) -> Result<Claims, ValidationError>;
}

pub trait PermissionsSource: Send + Sync {
    fn permissions(&self, namespace: &str, service_account: &str) -> (Vec<String>, Vec<String>, bool);
}

#[async_trait]
impl Validate for crate::validator::TokenValidator {
    async fn validate(&self, token: &[u8], now: OffsetDateTime) -> Result<Claims, ValidationError> {
        crate::validator::TokenValidator::validate(self, token, now).await
    }
}

impl PermissionsSource for crate::sa_index::SaIndex {
    fn permissions(&self, namespace: &str, service_account: &str) -> (Vec<String>, Vec<String>, bool) {
        crate::sa_index::SaIndex::permissions(self, namespace, service_account)
    }
}

/// `Deny` carries no detail by design: the decider never reveals which step
/// failed to the caller. The failed step is still recorded through
/// `metrics`/`tracing` inside [`authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { publish: Vec<String>, subscribe: Vec<String> },
    Deny,
}

/// Runs the §4.4 algorithm. A pure function of `(token, index snapshot, key
/// snapshot, now)`: calling it twice with the same inputs yields the same
/// decision, since neither collaborator mutates anything on a read path.
pub async fn authorize(
    validator: &dyn Validate,
    index: &dyn PermissionsSource,
    metrics: &Metrics,
    token: &[u8],
    now: OffsetDateTime,
) -> Decision {
    if token.is_empty() {
        return Decision::Deny;
    }

    let claims = match validator.validate(token, now).await {
        Ok(claims) => claims,
        Err(err) => {
            record_validation_failure(metrics, err);
            return Decision::Deny;
        }
    };

    let (publish, subscribe, found) =
        index.permissions(&claims.kubernetes_namespace, &claims.kubernetes_service_account_name);

    if !found {
        metrics.unknown_service_account_total.inc();
        return Decision::Deny;
    }

    Decision::Allow { publish, subscribe }
}

fn record_validation_failure(metrics: &Metrics, err: ValidationError) {
    match err {
        ValidationError::ExpiredToken => metrics.expired_token_total.inc(),
        ValidationError::InvalidSignature => metrics.invalid_signature_total.inc(),
        ValidationError::InvalidClaims => metrics.invalid_claims_total.inc(),
        ValidationError::MissingKubernetesClaims => metrics.missing_kubernetes_claims_total.inc(),
        ValidationError::Transient => {}
    }
}
