use std::sync::Mutex;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use k8s_openapi::api::core::v1::ServiceAccount;
use nats_sa_decider::{
    decider::{authorize, Decision, PermissionsSource, Validate},
    metrics::Metrics,
    sa_index::SaIndex,
    validator::{Claims, ValidationError},
};
use time::OffsetDateTime;

struct BenchValidator {
    claims: Claims,
}

#[async_trait]
impl Validate for BenchValidator {
    async fn validate(&self, _token: &[u8], _now: OffsetDateTime) -> Result<Claims, ValidationError> {
        Ok(self.claims.clone())
    }
}

struct BenchIndex {
    entries: Mutex<std::collections::HashMap<(String, String), (Vec<String>, Vec<String>)>>,
}

impl PermissionsSource for BenchIndex {
    fn permissions(&self, namespace: &str, service_account: &str) -> (Vec<String>, Vec<String>, bool) {
        match self.entries.lock().unwrap().get(&(namespace.to_string(), service_account.to_string())) {
            Some((pub_list, sub_list)) => (pub_list.clone(), sub_list.clone(), true),
            None => (Vec::new(), Vec::new(), false),
        }
    }
}

fn decider_benchmark(c: &mut Criterion) {
    let now = OffsetDateTime::now_utc();
    let claims = Claims {
        issuer: "https://kubernetes.default.svc.cluster.local".to_string(),
        audience: vec!["nats".to_string()],
        issued_at: now,
        not_before: now,
        expiry: now + time::Duration::minutes(5),
        kubernetes_namespace: "prod".to_string(),
        kubernetes_service_account_name: "api".to_string(),
    };
    let validator = BenchValidator { claims };
    let index = BenchIndex {
        entries: Mutex::new(std::collections::HashMap::from([(
            ("prod".to_string(), "api".to_string()),
            (vec!["prod.>".to_string()], vec!["prod.>".to_string()]),
        )])),
    };
    let metrics = Metrics::new_for_test();
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("authorize", |b| {
        b.iter(|| {
            let decision = runtime.block_on(authorize(&validator, &index, &metrics, b"token", now));
            assert!(matches!(decision, Decision::Allow { .. }));
        })
    });
}

fn annotation_composition_benchmark(c: &mut Criterion) {
    let index = SaIndex::new(Metrics::new_for_test());
    let mut sa = ServiceAccount::default();
    sa.metadata.namespace = Some("prod".to_string());
    sa.metadata.name = Some("api".to_string());
    sa.metadata.annotations = Some(std::collections::BTreeMap::from([
        ("nats.io/allowed-pub-subjects".to_string(), "shared.events.>, audit.>".to_string()),
        ("nats.io/allowed-sub-subjects".to_string(), "shared.cmd.*, _INBOX.>".to_string()),
    ]));

    c.bench_function("sa_index_upsert", |b| {
        b.iter(|| {
            index.handle(&sa);
        })
    });
}

criterion_group!(benches, decider_benchmark, annotation_composition_benchmark);
criterion_main!(benches);
