//! Typed object access on top of the key/value [`StateStore`].
//!
//! Objects live under `/registry/<plural>/<namespace>/<name>` as JSON.
//! Writes are compare-and-set on `metadata.resourceVersion`; deletes cascade
//! to dependents through owner references.

use async_trait::async_trait;
use chrono::Utc;
use pkg_constants::state::{
    DEFAULT_REQUEST_TIMEOUT_SECS, GENERATED_NAME_ATTEMPTS, GENERATED_NAME_SUFFIX_LEN,
    REGISTRY_PREFIX,
};
use pkg_types::meta::{ObjectMeta, PartialObject, Resource};
use pkg_types::registry::{self, KindInfo};
use pkg_types::selector::LabelSelector;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::StateStore;
use crate::error::StoreError;

/// What happens to dependents when an owner is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationPolicy {
    /// Delete the owner now, collect dependents asynchronously.
    #[default]
    Background,
    /// Collect dependents before the owner delete returns.
    Foreground,
    /// Leave dependents in place, stripped of the owner reference.
    Orphan,
}

/// Untyped object store contract. Objects are JSON documents carrying a
/// `metadata` member shaped like [`ObjectMeta`].
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> Result<Vec<Value>, StoreError>;
    async fn get(&self, kind: &KindInfo, namespace: &str, name: &str) -> Result<Value, StoreError>;
    async fn create(&self, kind: &KindInfo, object: Value) -> Result<Value, StoreError>;
    async fn update(&self, kind: &KindInfo, object: Value) -> Result<Value, StoreError>;
    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), StoreError>;
}

fn object_key(kind: &KindInfo, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}/{}", REGISTRY_PREFIX, kind.plural, namespace, name)
}

fn kind_prefix(kind: &KindInfo, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{}/{}/{}/", REGISTRY_PREFIX, kind.plural, ns),
        None => format!("{}/{}/", REGISTRY_PREFIX, kind.plural),
    }
}

fn read_meta(object: &Value) -> Result<ObjectMeta, StoreError> {
    let partial: PartialObject = serde_json::from_value(object.clone())?;
    Ok(partial.metadata)
}

fn write_meta(object: &mut Value, meta: &ObjectMeta) -> Result<(), StoreError> {
    let meta = serde_json::to_value(meta)?;
    match object.as_object_mut() {
        Some(map) => {
            map.insert("metadata".to_string(), meta);
            Ok(())
        }
        None => Err(StoreError::Invalid("object is not a JSON map".to_string())),
    }
}

/// The object without `metadata` and `status`: what counts as a spec change.
fn desired_state(object: &Value) -> Value {
    let mut trimmed = object.clone();
    if let Some(map) = trimmed.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    trimmed
}

fn random_suffix() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(GENERATED_NAME_SUFFIX_LEN)
        .collect()
}

/// [`ObjectBackend`] persisting into a [`StateStore`].
///
/// Writes are serialized through one lock so the read-compare-write of a
/// single object cannot interleave with another writer in this process.
#[derive(Clone)]
pub struct StoreBackend {
    store: StateStore,
    write_lock: Arc<Mutex<()>>,
}

impl StoreBackend {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, object: &Value) -> Result<(), StoreError> {
        let data = serde_json::to_vec(object)?;
        self.store.put(key, &data).await?;
        Ok(())
    }

    /// Every stored object, of any kind, listing `owner_uid` as an owner.
    async fn dependents_of(
        &self,
        owner_uid: &str,
    ) -> Result<Vec<(&'static KindInfo, String, Value)>, StoreError> {
        let mut found = Vec::new();
        for kind in registry::KINDS {
            for (key, bytes) in self.store.list_prefix(&kind_prefix(kind, None)).await? {
                let Ok(object) = serde_json::from_slice::<Value>(&bytes) else {
                    continue;
                };
                if read_meta(&object)?.is_owned_by(owner_uid) {
                    found.push((kind, key, object));
                }
            }
        }
        Ok(found)
    }

    /// Delete every dependent of `owner_uid`, depth first.
    async fn collect_garbage(&self, owner_uid: String) -> Result<(), StoreError> {
        let mut pending = vec![owner_uid];
        while let Some(uid) = pending.pop() {
            for (kind, key, object) in self.dependents_of(&uid).await? {
                let meta = read_meta(&object)?;
                debug!(
                    "garbage collecting {} {} (owner {})",
                    kind.kind,
                    meta.key(),
                    uid
                );
                {
                    let _guard = self.write_lock.lock().await;
                    self.store.delete(&key).await?;
                }
                pending.push(meta.uid);
            }
        }
        Ok(())
    }

    async fn orphan_dependents(&self, owner_uid: &str) -> Result<(), StoreError> {
        for (_, key, mut object) in self.dependents_of(owner_uid).await? {
            let _guard = self.write_lock.lock().await;
            let mut meta = read_meta(&object)?;
            meta.remove_owner_ref(owner_uid);
            meta.resource_version += 1;
            write_meta(&mut object, &meta)?;
            self.write(&key, &object).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for StoreBackend {
    async fn list(&self, kind: &KindInfo, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        let entries = self.store.list_prefix(&kind_prefix(kind, namespace)).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            match serde_json::from_slice(&bytes) {
                Ok(object) => objects.push(object),
                Err(e) => warn!("skipping undecodable object at {}: {}", key, e),
            }
        }
        Ok(objects)
    }

    async fn get(&self, kind: &KindInfo, namespace: &str, name: &str) -> Result<Value, StoreError> {
        self.read(&object_key(kind, namespace, name))
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.kind.to_string(),
                name: format!("{}/{}", namespace, name),
            })
    }

    async fn create(&self, kind: &KindInfo, mut object: Value) -> Result<Value, StoreError> {
        let mut meta = read_meta(&object)?;
        if meta.namespace.is_empty() {
            return Err(StoreError::Invalid(format!(
                "{} without a namespace",
                kind.kind
            )));
        }

        let _guard = self.write_lock.lock().await;

        let key = if meta.name.is_empty() {
            if meta.generate_name.is_empty() {
                return Err(StoreError::Invalid(format!(
                    "{} needs a name or generateName",
                    kind.kind
                )));
            }
            let mut chosen = None;
            for _ in 0..GENERATED_NAME_ATTEMPTS {
                let candidate = format!("{}{}", meta.generate_name, random_suffix());
                let key = object_key(kind, &meta.namespace, &candidate);
                if self.store.get(&key).await?.is_none() {
                    chosen = Some((candidate, key));
                    break;
                }
            }
            let (name, key) = chosen.ok_or_else(|| StoreError::AlreadyExists {
                kind: kind.kind.to_string(),
                name: format!("{}/{}*", meta.namespace, meta.generate_name),
            })?;
            meta.name = name;
            key
        } else {
            let key = object_key(kind, &meta.namespace, &meta.name);
            if self.store.get(&key).await?.is_some() {
                return Err(StoreError::AlreadyExists {
                    kind: kind.kind.to_string(),
                    name: meta.key(),
                });
            }
            key
        };

        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = 1;
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        write_meta(&mut object, &meta)?;
        self.write(&key, &object).await?;
        Ok(object)
    }

    async fn update(&self, kind: &KindInfo, mut object: Value) -> Result<Value, StoreError> {
        let mut meta = read_meta(&object)?;
        let key = object_key(kind, &meta.namespace, &meta.name);

        let _guard = self.write_lock.lock().await;

        let stored = self.read(&key).await?.ok_or_else(|| StoreError::NotFound {
            kind: kind.kind.to_string(),
            name: meta.key(),
        })?;
        let stored_meta = read_meta(&stored)?;
        if stored_meta.resource_version != meta.resource_version {
            return Err(StoreError::Conflict {
                kind: kind.kind.to_string(),
                name: meta.key(),
                stored: stored_meta.resource_version,
                given: meta.resource_version,
            });
        }

        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.resource_version = stored_meta.resource_version + 1;
        meta.generation = if desired_state(&stored) == desired_state(&object) {
            stored_meta.generation
        } else {
            stored_meta.generation + 1
        };
        write_meta(&mut object, &meta)?;
        self.write(&key, &object).await?;
        Ok(object)
    }

    async fn delete(
        &self,
        kind: &KindInfo,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), StoreError> {
        let key = object_key(kind, namespace, name);
        let uid = {
            let _guard = self.write_lock.lock().await;
            let stored = self.read(&key).await?.ok_or_else(|| StoreError::NotFound {
                kind: kind.kind.to_string(),
                name: format!("{}/{}", namespace, name),
            })?;
            self.store.delete(&key).await?;
            read_meta(&stored)?.uid
        };

        match propagation {
            PropagationPolicy::Background => {
                let backend = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = backend.collect_garbage(uid.clone()).await {
                        warn!("garbage collection for owner {} failed: {}", uid, e);
                    }
                });
                Ok(())
            }
            PropagationPolicy::Foreground => self.collect_garbage(uid).await,
            PropagationPolicy::Orphan => self.orphan_dependents(&uid).await,
        }
    }
}

/// Typed client over an [`ObjectBackend`]. Every call is bounded by the
/// client's request deadline.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn ObjectBackend>,
    timeout: Duration,
}

impl Client {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Client over a fresh [`StoreBackend`] for `store`.
    pub fn for_store(store: StateStore) -> Self {
        Self::new(Arc::new(StoreBackend::new(store)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn deadline<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    /// All objects of kind `R`, in one namespace or across all of them.
    pub async fn list<R: Resource>(&self, namespace: Option<&str>) -> Result<Vec<R>, StoreError> {
        let kind = KindInfo::of::<R>();
        let raw = self.deadline(self.backend.list(&kind, namespace)).await?;
        raw.into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    /// Objects of kind `R` in `namespace` whose labels match `selector`.
    pub async fn list_selected<R: Resource>(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<R>, StoreError> {
        let all = self.list::<R>(Some(namespace)).await?;
        Ok(all
            .into_iter()
            .filter(|o| selector.matches(&o.metadata().labels))
            .collect())
    }

    pub async fn get<R: Resource>(&self, namespace: &str, name: &str) -> Result<R, StoreError> {
        let kind = KindInfo::of::<R>();
        let raw = self.deadline(self.backend.get(&kind, namespace, name)).await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Persist a new object; returns it with server-assigned metadata.
    pub async fn create<R: Resource>(&self, object: &R) -> Result<R, StoreError> {
        let kind = KindInfo::of::<R>();
        let raw = serde_json::to_value(object)?;
        let stored = self.deadline(self.backend.create(&kind, raw)).await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Replace an object; fails with `Conflict` when `object` is stale.
    pub async fn update<R: Resource>(&self, object: &R) -> Result<R, StoreError> {
        let kind = KindInfo::of::<R>();
        let raw = serde_json::to_value(object)?;
        let stored = self.deadline(self.backend.update(&kind, raw)).await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn delete<R: Resource>(
        &self,
        object: &R,
        propagation: PropagationPolicy,
    ) -> Result<(), StoreError> {
        let kind = KindInfo::of::<R>();
        self.deadline(
            self.backend
                .delete(&kind, object.namespace(), object.name(), propagation),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pod::Pod;
    use pkg_types::statefulset::StatefulSet;

    fn client() -> Client {
        Client::for_store(StateStore::in_memory())
    }

    fn set(name: &str) -> StatefulSet {
        let mut set = StatefulSet::default();
        set.metadata = ObjectMeta::new("default", name);
        set
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let client = client();
        let created = client.create(&set("web")).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.resource_version, 1);
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.creation_timestamp.is_some());

        let err = client.create(&set("web")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn generate_name_appends_suffix() {
        let client = client();
        let mut obj = set("");
        obj.metadata.generate_name = "web-edge-".to_string();
        let created = client.create(&obj).await.unwrap();
        assert!(created.metadata.name.starts_with("web-edge-"));
        assert_eq!(
            created.metadata.name.len(),
            "web-edge-".len() + GENERATED_NAME_SUFFIX_LEN
        );
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let client = client();
        let created = client.create(&set("web")).await.unwrap();

        let mut first = created.clone();
        first.spec.replicas = Some(2);
        let updated = client.update(&first).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);
        assert_eq!(updated.metadata.generation, 2);

        let mut stale = created;
        stale.spec.replicas = Some(3);
        assert!(client.update(&stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn status_only_update_keeps_generation() {
        let client = client();
        let created = client.create(&set("web")).await.unwrap();
        let mut obj = created;
        obj.status.ready_replicas = 3;
        let updated = client.update(&obj).await.unwrap();
        assert_eq!(updated.metadata.generation, 1);
        assert_eq!(updated.metadata.resource_version, 2);
    }

    #[tokio::test]
    async fn foreground_delete_collects_dependents() {
        let client = client();
        let owner = client.create(&set("web")).await.unwrap();

        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::new("default", "web-0");
        pod.metadata
            .set_controller_ref(owner.controller_owner_ref())
            .unwrap();
        client.create(&pod).await.unwrap();

        client
            .delete(&owner, PropagationPolicy::Foreground)
            .await
            .unwrap();
        assert!(client.list::<Pod>(Some("default")).await.unwrap().is_empty());
        assert!(
            client
                .get::<StatefulSet>("default", "web")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn orphan_delete_strips_owner_reference() {
        let client = client();
        let owner = client.create(&set("web")).await.unwrap();

        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::new("default", "web-0");
        pod.metadata
            .set_controller_ref(owner.controller_owner_ref())
            .unwrap();
        client.create(&pod).await.unwrap();

        client.delete(&owner, PropagationPolicy::Orphan).await.unwrap();
        let pod: Pod = client.get("default", "web-0").await.unwrap();
        assert!(pod.metadata.owner_references.is_empty());
    }

    #[tokio::test]
    async fn list_selected_filters_on_labels() {
        let client = client();
        let mut a = set("a");
        a.metadata.labels.insert("app".to_string(), "web".to_string());
        client.create(&a).await.unwrap();
        client.create(&set("b")).await.unwrap();

        let selector = LabelSelector::from_labels([("app", "web")]);
        let selected: Vec<StatefulSet> =
            client.list_selected("default", &selector).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name, "a");
    }
}
