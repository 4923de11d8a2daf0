//! Auth-callout endpoint.
//!
//! Subscribes to the NATS auth-callout request subject, decodes each signed
//! authorization request, invokes [`crate::decider::authorize`], and replies
//! with a signed user claim (allow) or a refusal (deny). Implements the
//! lifecycle `Initialising -> Serving -> Draining -> Stopped`.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::{FutureExt, StreamExt};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    decider::{self, Decision, PermissionsSource, Validate},
    metrics::Metrics,
    signing::SigningIdentity,
};

#[derive(Deserialize, Debug)]
struct AuthorizationRequestClaims {
    #[allow(dead_code)]
    iss: String,
    nats: AuthorizationRequest,
}

#[derive(Deserialize, Debug)]
struct AuthorizationRequest {
    server_id: ServerIdentity,
    user_nkey: String,
    connect_opts: ConnectOptions,
}

#[derive(Deserialize, Debug)]
struct ServerIdentity {
    id: String,
}

#[derive(Deserialize, Debug)]
struct ConnectOptions {
    jwt: Option<String>,
    token: Option<String>,
}

impl ConnectOptions {
    /// Extracts the client-supplied Kubernetes JWT: the `jwt` field, falling
    /// back to `token` when absent, per §4.5 step 2.
    fn kubernetes_jwt(&self) -> Option<&str> {
        self.jwt
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.token.as_deref().filter(|s| !s.is_empty()))
    }
}

pub struct CalloutEndpoint {
    nats: async_nats::Client,
    subject: String,
    callout_trust_anchor: Option<String>,
    signing_identity: Arc<SigningIdentity>,
    bus_account: Option<String>,
    user_token_ttl: Duration,
    drain_grace: Duration,
    metrics: Metrics,
}

impl CalloutEndpoint {
    pub fn new(
        nats: async_nats::Client,
        subject: String,
        callout_trust_anchor: Option<String>,
        signing_identity: Arc<SigningIdentity>,
        bus_account: Option<String>,
        user_token_ttl: Duration,
        drain_grace: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            nats,
            subject,
            callout_trust_anchor,
            signing_identity,
            bus_account,
            user_token_ttl,
            drain_grace,
            metrics,
        }
    }

    /// Runs `Serving` until `cancel` fires, then drains in-flight handlers
    /// for up to `drain_grace` before returning.
    pub async fn run(
        &self,
        validator: Arc<dyn Validate>,
        index: Arc<dyn PermissionsSource>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut subscriber = self.nats.subscribe(self.subject.clone()).await?;
        info!(subject = %self.subject, "callout endpoint serving");

        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                maybe_message = subscriber.next() => {
                    let Some(message) = maybe_message else {
                        warn!("callout subscription ended unexpectedly");
                        break;
                    };
                    let validator = validator.clone();
                    let index = index.clone();
                    let correlation_id = Uuid::new_v4();
                    let handler = HandlerCtx {
                        nats: self.nats.clone(),
                        callout_trust_anchor: self.callout_trust_anchor.clone(),
                        signing_identity: self.signing_identity.clone(),
                        bus_account: self.bus_account.clone(),
                        user_token_ttl: self.user_token_ttl,
                        metrics: self.metrics.clone(),
                    };
                    in_flight.spawn(async move {
                        handler.handle(message, validator.as_ref(), index.as_ref(), correlation_id).await;
                    });
                }
                _ = cancel.cancelled() => break,
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = finished {
                        error!(?err, "callout handler task panicked");
                    }
                }
            }
        }

        info!(grace = ?self.drain_grace, in_flight = in_flight.len(), "draining callout endpoint");
        let _ = tokio::time::timeout(self.drain_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        in_flight.shutdown().await;

        Ok(())
    }
}

struct HandlerCtx {
    nats: async_nats::Client,
    callout_trust_anchor: Option<String>,
    signing_identity: Arc<SigningIdentity>,
    bus_account: Option<String>,
    user_token_ttl: Duration,
    metrics: Metrics,
}

impl HandlerCtx {
    async fn handle(
        &self,
        message: async_nats::Message,
        validator: &dyn Validate,
        index: &dyn PermissionsSource,
        correlation_id: Uuid,
    ) {
        let Some(reply_subject) = message.reply.clone() else {
            warn!(%correlation_id, "authorization request had no reply subject, dropping");
            return;
        };

        let request: AuthorizationRequestClaims = match std::str::from_utf8(&message.payload)
            .ok()
            .and_then(|s| crate::nats_jwt::decode(s, self.callout_trust_anchor.as_deref()).ok())
        {
            Some(request) => request,
            None => {
                warn!(%correlation_id, "malformed or unverifiable authorization request");
                self.reply_deny(&reply_subject, "unknown", "unknown", correlation_id).await;
                return;
            }
        };

        let server_id = request.nats.server_id.id.clone();
        let user_nkey = request.nats.user_nkey.clone();

        let token = request
            .nats
            .connect_opts
            .kubernetes_jwt()
            .unwrap_or("")
            .as_bytes()
            .to_vec();

        let metrics = self.metrics.clone();

        // Any panic inside the decision path is converted to Deny rather
        // than propagated, per §4.5's failure semantics.
        let decision = AssertUnwindSafe(decider::authorize(validator, index, &metrics, &token, OffsetDateTime::now_utc()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!(%correlation_id, ?panic, "authorization handler panicked, denying");
                Decision::Deny
            });

        match decision {
            Decision::Allow { publish, subscribe } => {
                self.metrics.callout_requests_total.with_label_values(&["allow"]).inc();
                self.reply_allow(&reply_subject, &server_id, &user_nkey, publish, subscribe, correlation_id)
                    .await;
            }
            Decision::Deny => {
                self.metrics.callout_requests_total.with_label_values(&["deny"]).inc();
                self.reply_deny(&reply_subject, &server_id, &user_nkey, correlation_id).await;
            }
        }
    }

    async fn reply_allow(
        &self,
        reply_subject: &str,
        server_id: &str,
        user_nkey: &str,
        publish: Vec<String>,
        subscribe: Vec<String>,
        correlation_id: Uuid,
    ) {
        let now = OffsetDateTime::now_utc();
        let user_jwt = match self.signing_identity.issue_user_claim(
            user_nkey,
            publish,
            subscribe,
            self.user_token_ttl,
            self.bus_account.as_deref(),
            now,
        ) {
            Ok(jwt) => jwt,
            Err(err) => {
                error!(%correlation_id, ?err, "failed to sign user claim, denying instead");
                self.reply_deny(reply_subject, server_id, user_nkey, correlation_id).await;
                return;
            }
        };

        match self
            .signing_identity
            .issue_callout_response(server_id, user_nkey, Ok(user_jwt), now)
        {
            Ok(response) => self.publish_reply(reply_subject, response, correlation_id).await,
            Err(err) => error!(%correlation_id, ?err, "failed to sign callout response"),
        }
    }

    async fn reply_deny(&self, reply_subject: &str, server_id: &str, user_nkey: &str, correlation_id: Uuid) {
        let now = OffsetDateTime::now_utc();
        match self
            .signing_identity
            .issue_callout_response(server_id, user_nkey, Err("authorization denied"), now)
        {
            Ok(response) => self.publish_reply(reply_subject, response, correlation_id).await,
            Err(err) => error!(%correlation_id, ?err, "failed to sign callout refusal"),
        }
    }

    async fn publish_reply(&self, reply_subject: &str, payload: String, correlation_id: Uuid) {
        if let Err(err) = self.nats.publish(reply_subject.to_string(), payload.into()).await {
            error!(%correlation_id, ?err, "failed to publish callout reply");
        }
    }
}
