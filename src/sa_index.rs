//! ServiceAccount permission index.
//!
//! A cluster-wide, watch-driven in-memory index from `(namespace, name)` to a
//! precomputed `(publish-allow-list, subscribe-allow-list)` tuple. The whole
//! map is held behind an [`ArcSwap`] so reads never block a writer and a
//! writer never observes a half-updated entry: each write clones-then-swaps
//! the entire snapshot, the same pattern this codebase uses for its other
//! hot-swappable process-wide state.

use std::{collections::HashMap, sync::Mutex};

use arc_swap::ArcSwap;
use futures_util::TryStreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{
    runtime::watcher::{self, Event},
    Api, Client,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

const ANNOTATION_PUB: &str = "nats.io/allowed-pub-subjects";
const ANNOTATION_SUB: &str = "nats.io/allowed-sub-subjects";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PermissionEntry {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

/// Parses a comma-separated annotation value per §4.3's annotation grammar:
/// every element is trimmed, and empty elements (including the whole value
/// being empty or whitespace) are discarded. Never fails.
pub fn parse_annotation(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedup_preserve_order(default_first: &[String], extra: Vec<String>) -> Vec<String> {
    let mut out = default_first.to_vec();
    for item in extra {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Computes the permission tuple for a ServiceAccount, per §4.3's composition
/// rule: the namespace-isolation default always comes first, annotation
/// entries are appended and deduplicated against it.
fn compose_permissions(namespace: &str, sa: &ServiceAccount) -> PermissionEntry {
    let default_pattern = format!("{namespace}.>");
    let annotations = sa.metadata.annotations.as_ref();

    let pub_extra = annotations
        .and_then(|a| a.get(ANNOTATION_PUB))
        .map(|v| parse_annotation(v))
        .unwrap_or_default();
    let sub_extra = annotations
        .and_then(|a| a.get(ANNOTATION_SUB))
        .map(|v| parse_annotation(v))
        .unwrap_or_default();

    PermissionEntry {
        publish: dedup_preserve_order(&[default_pattern.clone()], pub_extra),
        subscribe: dedup_preserve_order(&[default_pattern], sub_extra),
    }
}

fn index_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

pub struct SaIndex {
    entries: ArcSwap<HashMap<String, PermissionEntry>>,
    write_lock: Mutex<()>,
    ready: Notify,
    became_ready: std::sync::atomic::AtomicBool,
    metrics: Metrics,
}

impl SaIndex {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            ready: Notify::new(),
            became_ready: std::sync::atomic::AtomicBool::new(false),
            metrics,
        }
    }

    /// Non-blocking read of the current permission tuple for a ServiceAccount.
    pub fn permissions(&self, namespace: &str, name: &str) -> (Vec<String>, Vec<String>, bool) {
        match self.entries.load().get(&index_key(namespace, name)) {
            Some(entry) => (entry.publish.clone(), entry.subscribe.clone(), true),
            None => (Vec::new(), Vec::new(), false),
        }
    }

    /// Blocks until the initial informer list has completed, or the given
    /// token is cancelled first.
    pub async fn await_ready(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if self.became_ready.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(());
        }
        tokio::select! {
            _ = self.ready.notified() => Ok(()),
            _ = cancel.cancelled() => Err(Cancelled),
        }
    }

    fn upsert(&self, namespace: &str, name: &str, entry: PermissionEntry) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = (**self.entries.load()).clone();
        next.insert(index_key(namespace, name), entry);
        self.metrics.service_account_index_size.set(next.len() as i64);
        self.entries.store(std::sync::Arc::new(next));
    }

    fn remove(&self, namespace: &str, name: &str) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = (**self.entries.load()).clone();
        next.remove(&index_key(namespace, name));
        self.metrics.service_account_index_size.set(next.len() as i64);
        self.entries.store(std::sync::Arc::new(next));
    }

    fn mark_ready(&self) {
        if !self.became_ready.swap(true, std::sync::atomic::Ordering::AcqRel) {
            info!("service account index initial list complete");
        }
        self.ready.notify_waiters();
    }

    /// Applies an ADD/UPDATE event for `sa`, recomputing its permission tuple.
    pub fn handle(&self, sa: &ServiceAccount) {
        let Some(namespace) = sa.metadata.namespace.as_deref() else {
            warn!("service account event with no namespace, ignoring");
            return;
        };
        let Some(name) = sa.metadata.name.as_deref() else {
            warn!("service account event with no name, ignoring");
            return;
        };
        let entry = compose_permissions(namespace, sa);
        debug!(namespace, name, ?entry, "service account permissions computed");
        self.upsert(namespace, name, entry);
    }

    fn handle_delete(&self, sa: &ServiceAccount) {
        let (Some(namespace), Some(name)) = (sa.metadata.namespace.as_deref(), sa.metadata.name.as_deref())
        else {
            return;
        };
        debug!(namespace, name, "service account removed");
        self.remove(namespace, name);
    }

    /// Runs the cluster-wide informer until `cancel` fires. Reconnects on
    /// watch failure are handled by the underlying watcher with backoff; this
    /// loop never surfaces watch errors through the read surface, only logs.
    pub async fn run(&self, client: Client, cancel: CancellationToken) {
        let api: Api<ServiceAccount> = Api::all(client);
        let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()));

        loop {
            let next = tokio::select! {
                item = stream.try_next() => item,
                _ = cancel.cancelled() => return,
            };

            match next {
                Ok(Some(Event::Apply(sa) | Event::InitApply(sa))) => self.handle(&sa),
                Ok(Some(Event::Delete(sa))) => self.handle_delete(&sa),
                Ok(Some(Event::Init)) => {}
                Ok(Some(Event::InitDone)) => self.mark_ready(),
                Ok(None) => return,
                Err(err) => {
                    warn!(?err, "service account watch error, informer will retry");
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct Cancelled;
