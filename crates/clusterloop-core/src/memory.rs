//! In-memory resource client
//!
//! Behaves like a small kcp server: objects are partitioned by logical
//! cluster, every write bumps a global resource version, updates are checked
//! for staleness, watches replay history after a resource version, and
//! deleting an owner cascades to its dependents. Every event is kept for the
//! life of the client, so it is meant for tests only.

use crate::client::{ClientError, ListFilter, Listing, ResourceClient, WatchStream};
use crate::cluster::{ClusterKey, LogicalCluster, CLUSTER_ANNOTATION};
use crate::patch::MergePatch;
use crate::resource::ClusterResource;
use crate::watch::{WatchEvent, WatchStatus};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Entry {
    type_key: String,
    cluster: LogicalCluster,
    namespace: Option<String>,
    name: String,
    object: Value,
}

impl Entry {
    fn uid(&self) -> Option<&str> {
        self.object["metadata"]["uid"].as_str()
    }

    fn owned_by(&self, uid: &str) -> bool {
        self.object["metadata"]["ownerReferences"]
            .as_array()
            .is_some_and(|refs| refs.iter().any(|r| r["uid"].as_str() == Some(uid)))
    }
}

#[derive(Clone, Debug)]
enum RawEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Error(WatchStatus),
}

#[derive(Clone, Debug)]
struct Recorded {
    revision: u64,
    entry: Entry,
    event: RawEvent,
}

struct Watcher {
    type_key: String,
    cluster: LogicalCluster,
    filter: ListFilter,
    tx: mpsc::UnboundedSender<RawEvent>,
}

impl Watcher {
    fn wants(&self, entry: &Entry) -> bool {
        self.type_key == entry.type_key
            && self.cluster.selects(&entry.cluster)
            && self.filter.matches(entry.namespace.as_deref(), &entry.name)
    }
}

#[derive(Default)]
struct Store {
    revision: u64,
    entries: Vec<Entry>,
    history: Vec<Recorded>,
    watchers: Vec<Watcher>,
}

impl Store {
    fn position(&self, type_key: &str, key: &ClusterKey) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.type_key == type_key
                && e.cluster == key.cluster
                && e.namespace.as_deref() == key.namespace()
                && e.name == key.name
        })
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, entry: Entry, event: RawEvent) {
        self.watchers.retain(|w| {
            if w.wants(&entry) {
                w.tx.send(event.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });
        self.history.push(Recorded {
            revision: self.revision,
            entry,
            event,
        });
    }

    /// Stamp identity and bookkeeping metadata onto a freshly stored object.
    fn stamp(&mut self, object: &mut Value, cluster: &LogicalCluster) {
        let uid = Uuid::new_v4().to_string();
        let revision = self.bump();
        if let Some(meta) = metadata_mut(object) {
            meta.insert("uid".to_string(), Value::String(uid));
        }
        set_resource_version(object, revision);
        tag_cluster(object, cluster);
    }

    fn delete_at(&mut self, index: usize) {
        let entry = self.entries.remove(index);
        let revision = self.bump();
        let mut object = entry.object.clone();
        set_resource_version(&mut object, revision);
        let uid = entry.uid().map(str::to_string);
        let cluster = entry.cluster.clone();
        self.record(entry, RawEvent::Deleted(object));

        // Garbage-collect dependents in the same logical cluster.
        if let Some(uid) = uid {
            while let Some(dependent) = self
                .entries
                .iter()
                .position(|e| e.cluster == cluster && e.owned_by(&uid))
            {
                self.delete_at(dependent);
            }
        }
    }
}

fn metadata_mut(object: &mut Value) -> Option<&mut Map<String, Value>> {
    object
        .as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| json!({}))
        .as_object_mut()
}

fn set_resource_version(object: &mut Value, revision: u64) {
    if let Some(meta) = metadata_mut(object) {
        meta.insert(
            "resourceVersion".to_string(),
            Value::String(revision.to_string()),
        );
    }
}

fn tag_cluster(object: &mut Value, cluster: &LogicalCluster) {
    let Some(meta) = metadata_mut(object) else {
        return;
    };
    if cluster.is_empty() {
        if let Some(Value::Object(annotations)) = meta.get_mut("annotations") {
            annotations.remove(CLUSTER_ANNOTATION);
        }
        return;
    }
    let annotations = meta
        .entry("annotations")
        .or_insert_with(|| json!({}));
    if !annotations.is_object() {
        *annotations = json!({});
    }
    annotations[CLUSTER_ANNOTATION] = Value::String(cluster.to_string());
}

fn identity(object: &Value) -> Result<(Option<String>, String), ClientError> {
    let meta = &object["metadata"];
    let name = meta["name"]
        .as_str()
        .filter(|n| !n.is_empty())
        .ok_or(ClientError::MissingName)?
        .to_string();
    let namespace = meta["namespace"]
        .as_str()
        .filter(|ns| !ns.is_empty())
        .map(str::to_string);
    Ok((namespace, name))
}

/// In-memory implementation of [`ResourceClient`] for every kind.
#[derive(Default)]
pub struct MemoryClient {
    store: Mutex<Store>,
    writes: AtomicUsize,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        // A panic while holding the lock leaves the store consistent enough for tests.
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of create, update and patch calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset_write_count(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }

    /// Current global resource version.
    pub fn resource_version(&self) -> String {
        self.store().revision.to_string()
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        let mut store = self.store();
        store.watchers.retain(|w| !w.tx.is_closed());
        store.watchers.len()
    }

    /// End every open watch stream, as an API server does on idle timeout.
    pub fn close_watches(&self) {
        self.store().watchers.clear();
    }

    /// Deliver an `Error` event to every open watch stream.
    pub fn emit_watch_error(&self, status: WatchStatus) {
        let store = self.store();
        for w in &store.watchers {
            let _ = w.tx.send(RawEvent::Error(status.clone()));
        }
    }

    /// Store `obj` in `cluster` without checking for an existing object with
    /// the same name, reproducing states only legacy servers can produce.
    pub fn seed_raw<K: ClusterResource>(
        &self,
        cluster: &LogicalCluster,
        obj: &K,
    ) -> Result<K, ClientError> {
        let mut object = serde_json::to_value(obj)?;
        let (namespace, name) = identity(&object)?;
        let mut store = self.store();
        store.stamp(&mut object, cluster);
        let entry = Entry {
            type_key: K::type_key(),
            cluster: cluster.clone(),
            namespace,
            name,
            object: object.clone(),
        };
        store.entries.push(entry.clone());
        store.record(entry, RawEvent::Added(object.clone()));
        Ok(serde_json::from_value(object)?)
    }

    /// Delete an object, cascading to objects that name it as owner.
    pub fn delete<K: ClusterResource>(&self, key: &ClusterKey) -> Result<(), ClientError> {
        let type_key = K::type_key();
        let mut store = self.store();
        let index = store
            .position(&type_key, key)
            .ok_or_else(|| not_found::<K>(key))?;
        store.delete_at(index);
        Ok(())
    }

    fn mutate<K: ClusterResource>(
        &self,
        key: &ClusterKey,
        change: impl FnOnce(&Value) -> Result<Value, ClientError>,
    ) -> Result<K, ClientError> {
        if key.cluster.is_wildcard() {
            return Err(ClientError::WildcardWrite);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let type_key = K::type_key();
        let mut store = self.store();
        let index = store
            .position(&type_key, key)
            .ok_or_else(|| not_found::<K>(key))?;
        let current = store.entries[index].object.clone();
        let mut next = change(&current)?;

        // Identity is owned by the server.
        if let Some(meta) = metadata_mut(&mut next) {
            let old_meta = &current["metadata"];
            for field in ["name", "namespace", "uid", "resourceVersion"] {
                match old_meta.get(field) {
                    Some(v) => meta.insert(field.to_string(), v.clone()),
                    None => meta.remove(field),
                };
            }
        }
        tag_cluster(&mut next, &key.cluster);

        if next == current {
            trace!(key = %key, "No-op write");
            return Ok(serde_json::from_value(current)?);
        }

        let revision = store.bump();
        set_resource_version(&mut next, revision);
        store.entries[index].object = next.clone();
        let entry = store.entries[index].clone();
        store.record(entry, RawEvent::Modified(next.clone()));
        Ok(serde_json::from_value(next)?)
    }
}

fn not_found<K: ClusterResource>(key: &ClusterKey) -> ClientError {
    ClientError::NotFound {
        kind: K::kind(&()).to_string(),
        key: key.to_string(),
    }
}

fn decode<K: ClusterResource>(event: RawEvent) -> Result<WatchEvent<K>, ClientError> {
    Ok(match event {
        RawEvent::Added(v) => WatchEvent::Added(serde_json::from_value(v)?),
        RawEvent::Modified(v) => WatchEvent::Modified(serde_json::from_value(v)?),
        RawEvent::Deleted(v) => WatchEvent::Deleted(serde_json::from_value(v)?),
        RawEvent::Error(status) => WatchEvent::Error(status),
    })
}

#[async_trait]
impl<K: ClusterResource> ResourceClient<K> for MemoryClient {
    async fn get(&self, key: &ClusterKey) -> Result<K, ClientError> {
        let store = self.store();
        let index = store
            .position(&K::type_key(), key)
            .ok_or_else(|| not_found::<K>(key))?;
        Ok(serde_json::from_value(store.entries[index].object.clone())?)
    }

    async fn list(
        &self,
        cluster: &LogicalCluster,
        filter: &ListFilter,
    ) -> Result<Listing<K>, ClientError> {
        let type_key = K::type_key();
        let store = self.store();
        let items = store
            .entries
            .iter()
            .filter(|e| {
                e.type_key == type_key
                    && cluster.selects(&e.cluster)
                    && filter.matches(e.namespace.as_deref(), &e.name)
            })
            .map(|e| serde_json::from_value(e.object.clone()))
            .collect::<Result<Vec<K>, _>>()?;
        Ok(Listing {
            items,
            resource_version: Some(store.revision.to_string()),
        })
    }

    async fn create(&self, cluster: &LogicalCluster, obj: &K) -> Result<K, ClientError> {
        if cluster.is_wildcard() {
            return Err(ClientError::WildcardWrite);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut object = serde_json::to_value(obj)?;
        let (namespace, name) = identity(&object)?;
        if K::NAMESPACED && namespace.is_none() {
            return Err(ClientError::MissingNamespace);
        }
        let key = ClusterKey::new(cluster.clone(), namespace.as_deref(), name.clone());
        let type_key = K::type_key();

        let mut store = self.store();
        if store.position(&type_key, &key).is_some() {
            return Err(ClientError::AlreadyExists {
                kind: K::kind(&()).to_string(),
                key: key.to_string(),
            });
        }
        if let Some(meta) = object["metadata"].as_object_mut() {
            meta.remove("resourceVersion");
        }
        if K::STATUS_SUBRESOURCE {
            if let Some(map) = object.as_object_mut() {
                map.remove("status");
            }
        }
        store.stamp(&mut object, cluster);
        let entry = Entry {
            type_key,
            cluster: cluster.clone(),
            namespace,
            name,
            object: object.clone(),
        };
        store.entries.push(entry.clone());
        store.record(entry, RawEvent::Added(object.clone()));
        Ok(serde_json::from_value(object)?)
    }

    async fn update(&self, cluster: &LogicalCluster, obj: &K) -> Result<K, ClientError> {
        let incoming = serde_json::to_value(obj)?;
        let (namespace, name) = identity(&incoming)?;
        let key = ClusterKey::new(cluster.clone(), namespace.as_deref(), name);
        self.mutate::<K>(&key, |current| {
            let expected = current["metadata"]["resourceVersion"].as_str();
            let given = incoming["metadata"]["resourceVersion"]
                .as_str()
                .filter(|rv| !rv.is_empty());
            if let Some(given) = given {
                if Some(given) != expected {
                    return Err(ClientError::Conflict {
                        kind: K::kind(&()).to_string(),
                        key: key.to_string(),
                        message: format!(
                            "the object has been modified; resource version {given} is stale"
                        ),
                    });
                }
            }
            let mut next = incoming.clone();
            if K::STATUS_SUBRESOURCE {
                if let Some(map) = next.as_object_mut() {
                    match current.get("status") {
                        Some(status) => map.insert("status".to_string(), status.clone()),
                        None => map.remove("status"),
                    };
                }
            }
            Ok(next)
        })
    }

    async fn patch(&self, key: &ClusterKey, patch: &MergePatch) -> Result<K, ClientError> {
        let patch = if K::STATUS_SUBRESOURCE {
            patch.without("status")
        } else {
            patch.clone()
        };
        self.mutate::<K>(key, |current| {
            let mut next = current.clone();
            patch.apply(&mut next);
            Ok(next)
        })
    }

    async fn patch_status(&self, key: &ClusterKey, patch: &MergePatch) -> Result<K, ClientError> {
        let patch = patch.only("status");
        self.mutate::<K>(key, |current| {
            let mut next = current.clone();
            patch.apply(&mut next);
            Ok(next)
        })
    }

    async fn watch(
        &self,
        cluster: &LogicalCluster,
        filter: &ListFilter,
        resource_version: Option<&str>,
    ) -> Result<WatchStream<K>, ClientError> {
        let type_key = K::type_key();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            type_key: type_key.clone(),
            cluster: cluster.clone(),
            filter: filter.clone(),
            tx,
        };

        {
            let mut store = self.store();
            match resource_version.and_then(|rv| rv.parse::<u64>().ok()) {
                Some(since) => {
                    for rec in store.history.iter().filter(|r| r.revision > since) {
                        if watcher.wants(&rec.entry) {
                            let _ = watcher.tx.send(rec.event.clone());
                        }
                    }
                }
                None => {
                    for entry in store.entries.iter().filter(|e| watcher.wants(e)) {
                        let _ = watcher.tx.send(RawEvent::Added(entry.object.clone()));
                    }
                }
            }
            store.watchers.push(watcher);
        }

        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).map(decode::<K>);
        Ok(stream.boxed())
    }
}
