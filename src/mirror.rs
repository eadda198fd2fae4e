//! The cluster side of one local resource.

use std::sync::{Arc, Weak};

use kubernetes::DynamicObject;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::identity::ResourceIdentity;
use crate::multiplexer::{Listener, Subscription, TaskSubscription, WatchMultiplexer};
use crate::remote::RemoteResourceClient;
use crate::{Error, Result};

/// Watch subscriptions shared between mirrors, keyed by the watched resource.
pub type Watches = WatchMultiplexer<ResourceIdentity, DynamicObject>;

#[derive(Default)]
struct Cache {
    remote: Option<DynamicObject>,
    deleted: bool,
    closed: bool,
}

/// Caches the remote value of one resource, pushes local changes to the
/// cluster and keeps the cache current while watched.
///
/// The identity is fixed at construction, every value passed in later must
/// carry it.
pub struct ClusterMirror {
    identity: ResourceIdentity,
    initial: DynamicObject,
    client: Arc<dyn RemoteResourceClient>,
    watches: Arc<Watches>,

    cache: Mutex<Cache>,
    listeners: Mutex<Vec<Arc<dyn Listener<DynamicObject>>>>,
}

impl ClusterMirror {
    pub fn new(resource: DynamicObject, client: Arc<dyn RemoteResourceClient>) -> Arc<Self> {
        Self::with_watches(resource, client, Arc::new(Watches::new()))
    }

    pub fn with_watches(
        resource: DynamicObject,
        client: Arc<dyn RemoteResourceClient>,
        watches: Arc<Watches>,
    ) -> Arc<Self> {
        Arc::new(ClusterMirror {
            identity: ResourceIdentity::of(&resource),
            initial: resource,
            client,
            watches,
            cache: Mutex::new(Cache::default()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// The value the mirror was created for.
    #[inline]
    pub fn initial_resource(&self) -> &DynamicObject {
        &self.initial
    }

    /// The remote value, `None` if it does not exist.
    ///
    /// Served from the cache unless `force` is set or nothing is cached.
    /// A forced pull that finds a cached resource gone marks it deleted.
    pub async fn pull(&self, force: bool) -> Result<Option<DynamicObject>> {
        if !force {
            let cached = self.cache.lock().remote.clone();
            if cached.is_some() {
                return Ok(cached);
            }
        }

        match self.client.get(&self.identity).await {
            Ok(remote) => {
                let mut cache = self.cache.lock();
                cache.remote = Some(remote.clone());
                cache.deleted = false;

                Ok(Some(remote))
            }
            Err(err) if err.is_not_found() => {
                let mut cache = self.cache.lock();
                if force && cache.remote.is_some() {
                    debug!(message = "resource deleted on cluster", identity = %self.identity);
                    cache.deleted = true;
                }
                cache.remote = None;

                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Create or replace `resource` on the cluster and cache what the server
    /// stored.
    pub async fn push(&self, resource: &DynamicObject) -> Result<DynamicObject> {
        if !self.identity.is_same_kind(resource) {
            return Err(Error::UnsupportedResource {
                identity: ResourceIdentity::of(resource),
                reason: format!(
                    "unsupported kind/version, expected {} in {}",
                    self.identity.kind, self.identity.api_version
                ),
            });
        }
        if !self.identity.is_same(resource) {
            return Err(Error::UnsupportedResource {
                identity: ResourceIdentity::of(resource),
                reason: format!("different resource than {}", self.identity),
            });
        }

        match self.client.replace(resource).await {
            Ok(stored) => {
                let mut cache = self.cache.lock();
                cache.remote = Some(stored.clone());
                cache.deleted = false;

                Ok(stored)
            }
            Err(Error::Transport { status, message }) => Err(Error::transport(
                status,
                format!("could not push {}: {message}", self.identity),
            )),
            Err(err) => Err(err),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.pull(false).await?.is_some())
    }

    /// Whether the remote version differs from `local_version`.
    ///
    /// Versions are opaque, only equality is meaningful. A version on one
    /// side only counts as different, a missing remote never does.
    pub async fn is_outdated_version(&self, local_version: Option<&str>) -> Result<bool> {
        Ok(match self.pull(false).await? {
            Some(remote) => remote.resource_version() != local_version,
            None => false,
        })
    }

    /// Whether `candidate` differs from the remote value.
    pub async fn is_modified(&self, candidate: &DynamicObject) -> Result<bool> {
        Ok(match self.pull(false).await? {
            Some(remote) => remote != *candidate,
            None => false,
        })
    }

    /// Whether pushing `candidate` would change anything.
    pub async fn can_push(&self, candidate: Option<&DynamicObject>) -> bool {
        let Some(candidate) = candidate else {
            return true;
        };

        match self.pull(false).await {
            Ok(None) => true,
            Ok(Some(remote)) => self.identity.is_same(candidate) && remote != *candidate,
            Err(err) => {
                warn!(message = "could not determine remote state", identity = %self.identity, %err);
                false
            }
        }
    }

    pub async fn is_supported(&self) -> Result<bool> {
        self.client.is_supported(&self.identity).await
    }

    pub fn is_deleted(&self) -> bool {
        self.cache.lock().deleted
    }

    pub fn is_closed(&self) -> bool {
        self.cache.lock().closed
    }

    pub fn is_watching(&self) -> bool {
        self.watches.is_watching(&self.identity)
    }

    /// Start watching the resource, a no-op if it is watched already.
    ///
    /// A cached value is fetched again first, and listeners are told about
    /// whatever changed while nobody was watching.
    pub async fn watch(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            debug!(message = "mirror closed, not watching", identity = %self.identity);
            return Ok(());
        }
        if self.is_watching() {
            return Ok(());
        }

        self.reconcile().await?;

        let client = Arc::clone(&self.client);
        let identity = self.identity.clone();
        let listener = Arc::new(MirrorListener(Arc::downgrade(self)));
        self.watches
            .watch(
                self.identity.clone(),
                |sink| async move {
                    let stream = client.watch(&identity).await?;
                    let subscription: Box<dyn Subscription> =
                        Box::new(TaskSubscription::spawn(stream, sink));

                    Ok(Some(subscription))
                },
                listener,
            )
            .await?;

        Ok(())
    }

    pub fn stop_watch(&self) {
        self.watches.stop_watch(&self.identity);
    }

    /// Stop watching and forget the cached state. Closing twice is a no-op.
    pub fn close(&self) {
        {
            let mut cache = self.cache.lock();
            if cache.closed {
                return;
            }

            cache.closed = true;
            cache.remote = None;
            cache.deleted = false;
        }

        self.stop_watch();
        self.listeners.lock().clear();
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener<DynamicObject>>) {
        self.listeners.lock().push(listener);
    }

    async fn reconcile(&self) -> Result<()> {
        let cached = self.cache.lock().remote.clone();
        let Some(cached) = cached else {
            return Ok(());
        };

        match self.client.get(&self.identity).await {
            Ok(fresh) => {
                if fresh != cached {
                    self.changed(&fresh, false);
                }
            }
            Err(err) if err.is_not_found() => self.removed(&cached),
            Err(err) => return Err(err),
        }

        Ok(())
    }

    fn changed(&self, resource: &DynamicObject, added: bool) {
        {
            let mut cache = self.cache.lock();
            if cache.closed || (!cache.deleted && cache.remote.as_ref() == Some(resource)) {
                return;
            }

            cache.remote = Some(resource.clone());
            cache.deleted = false;
        }

        for listener in self.snapshot() {
            if added {
                listener.added(resource);
            } else {
                listener.modified(resource);
            }
        }
    }

    fn removed(&self, resource: &DynamicObject) {
        {
            let mut cache = self.cache.lock();
            if cache.closed || (cache.deleted && cache.remote.is_none()) {
                return;
            }

            cache.remote = None;
            cache.deleted = true;
        }

        for listener in self.snapshot() {
            listener.removed(resource);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Listener<DynamicObject>>> {
        self.listeners.lock().clone()
    }
}

/// Feeds watch signals back into the mirror without keeping it alive.
struct MirrorListener(Weak<ClusterMirror>);

impl Listener<DynamicObject> for MirrorListener {
    fn added(&self, value: &DynamicObject) {
        if let Some(mirror) = self.0.upgrade() {
            mirror.changed(value, true);
        }
    }

    fn removed(&self, value: &DynamicObject) {
        if let Some(mirror) = self.0.upgrade() {
            mirror.removed(value);
        }
    }

    fn modified(&self, value: &DynamicObject) {
        if let Some(mirror) = self.0.upgrade() {
            mirror.changed(value, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryCluster;
    use crate::testing::{trace_init, wait_for};

    fn config_map(name: &str) -> DynamicObject {
        DynamicObject::new("v1", "ConfigMap")
            .with_name(name)
            .within("default")
            .with_field("data", json!({"key": "value"}))
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl Listener<DynamicObject> for Recorder {
        fn added(&self, value: &DynamicObject) {
            self.events
                .lock()
                .push(format!("added {}", value.resource_version().unwrap_or("")));
        }

        fn removed(&self, _value: &DynamicObject) {
            self.events.lock().push("removed".to_string());
        }

        fn modified(&self, value: &DynamicObject) {
            self.events
                .lock()
                .push(format!("modified {}", value.resource_version().unwrap_or("")));
        }
    }

    #[tokio::test]
    async fn pull_uses_cache() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.apply(&config_map("a"));
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        let first = mirror.pull(false).await.unwrap();
        let second = mirror.pull(false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cluster.gets(), 1);

        mirror.pull(true).await.unwrap();
        assert_eq!(cluster.gets(), 2);
    }

    #[tokio::test]
    async fn pull_not_found() {
        let cluster = Arc::new(MemoryCluster::new());
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        assert_eq!(mirror.pull(false).await.unwrap(), None);
        assert!(!mirror.exists().await.unwrap());
        // nothing was cached, so nothing was deleted
        assert!(!mirror.is_deleted());
    }

    #[tokio::test]
    async fn forced_pull_detects_deletion() {
        let cluster = Arc::new(MemoryCluster::new());
        let stored = cluster.apply(&config_map("a"));
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());
        assert!(mirror.exists().await.unwrap());

        cluster.delete(&ResourceIdentity::of(&stored));
        // cached value is still served
        assert!(mirror.exists().await.unwrap());

        assert_eq!(mirror.pull(true).await.unwrap(), None);
        assert!(mirror.is_deleted());

        cluster.apply(&config_map("a"));
        assert!(mirror.pull(true).await.unwrap().is_some());
        assert!(!mirror.is_deleted());
    }

    #[tokio::test]
    async fn outdated_version() {
        let cluster = Arc::new(MemoryCluster::new());
        let stored = cluster.apply(&config_map("a"));
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());
        let version = stored.resource_version();

        assert_eq!(version, Some("1"));
        assert!(!mirror.is_outdated_version(version).await.unwrap());
        assert!(mirror.is_outdated_version(Some("0")).await.unwrap());
        assert!(mirror.is_outdated_version(Some("2")).await.unwrap());
        assert!(mirror.is_outdated_version(None).await.unwrap());

        // nothing to be outdated against
        let missing = ClusterMirror::new(config_map("b"), cluster.clone());
        assert!(!missing.is_outdated_version(Some("1")).await.unwrap());
    }

    #[tokio::test]
    async fn push_caches_stored_value() {
        let cluster = Arc::new(MemoryCluster::new());
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        let stored = mirror.push(&config_map("a")).await.unwrap();
        assert_eq!(stored.resource_version(), Some("1"));
        assert_eq!(mirror.pull(false).await.unwrap(), Some(stored));
        assert_eq!(cluster.gets(), 0);
    }

    #[tokio::test]
    async fn push_rejects_other_resources() {
        let cluster = Arc::new(MemoryCluster::new());
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        let err = mirror.push(&config_map("b")).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedResource { .. }));

        let secret = DynamicObject::new("v1", "Secret").with_name("a").within("default");
        let err = mirror.push(&secret).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedResource { .. }));

        assert_eq!(cluster.replaces(), 0);
    }

    #[tokio::test]
    async fn push_failure_keeps_detail() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.fail_replaces_of("a");
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        let err = mirror.push(&config_map("a")).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not push ConfigMap default/a (v1): ConfigMap default/a (v1) is invalid"
        );
    }

    #[tokio::test]
    async fn can_push() {
        let cluster = Arc::new(MemoryCluster::new());
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        assert!(mirror.can_push(None).await);
        assert!(mirror.can_push(Some(&config_map("a"))).await);

        let stored = mirror.push(&config_map("a")).await.unwrap();
        assert!(!mirror.can_push(Some(&stored)).await);

        let changed = stored.clone().with_field("data", json!({"key": "other"}));
        assert!(mirror.can_push(Some(&changed)).await);
        assert!(mirror.is_modified(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn watch_reconciles_cached_value() {
        trace_init();

        let cluster = Arc::new(MemoryCluster::new());
        cluster.apply(&config_map("a"));
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());
        let recorder = Arc::new(Recorder::default());
        mirror.add_listener(recorder.clone());

        // cache v1, then let someone else write v2
        mirror.pull(false).await.unwrap();
        cluster.apply(&config_map("a").with_field("data", json!({"key": "v2"})));

        mirror.watch().await.unwrap();
        assert_eq!(recorder.events(), vec!["modified 2"]);
        assert_eq!(
            mirror.pull(false).await.unwrap().unwrap().resource_version(),
            Some("2")
        );

        cluster.delete(mirror.identity());
        wait_for(|| recorder.events().len() == 2).await;
        assert_eq!(recorder.events(), vec!["modified 2", "removed"]);
        assert!(mirror.is_deleted());
    }

    #[tokio::test]
    async fn watch_reconciles_deletion() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.apply(&config_map("a"));
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());
        let recorder = Arc::new(Recorder::default());
        mirror.add_listener(recorder.clone());

        mirror.pull(false).await.unwrap();
        cluster.delete(mirror.identity());

        // reported by the watch call itself, before any live event
        mirror.watch().await.unwrap();
        assert_eq!(recorder.events(), vec!["removed"]);
        assert!(mirror.is_deleted());
        assert_eq!(mirror.pull(false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pull_server_error() {
        let cluster = Arc::new(MemoryCluster::new());
        let stored = cluster.apply(&config_map("a"));
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());
        mirror.pull(false).await.unwrap();

        cluster.fail_next_gets(1);
        let err = mirror.pull(true).await.unwrap_err();
        assert!(matches!(err, Error::Transport { status: Some(500), .. }));

        // the cache survives a failed refresh
        assert!(!mirror.is_deleted());
        assert_eq!(mirror.pull(false).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn watch_delivers_remote_changes() {
        let cluster = Arc::new(MemoryCluster::new());
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());
        let recorder = Arc::new(Recorder::default());
        mirror.add_listener(recorder.clone());

        mirror.watch().await.unwrap();
        cluster.apply(&config_map("a"));
        cluster.apply(&config_map("a").with_field("data", json!({"key": "v2"})));

        wait_for(|| recorder.events().len() == 2).await;
        assert_eq!(recorder.events(), vec!["added 1", "modified 2"]);
        assert_eq!(mirror.pull(false).await.unwrap().unwrap().resource_version(), Some("2"));
    }

    #[tokio::test]
    async fn watch_is_idempotent() {
        let cluster = Arc::new(MemoryCluster::new());
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        mirror.watch().await.unwrap();
        mirror.watch().await.unwrap();
        assert_eq!(cluster.watches(), 1);
        assert!(mirror.is_watching());

        mirror.stop_watch();
        mirror.stop_watch();
        assert!(!mirror.is_watching());
        wait_for(|| cluster.active_watches() == 0).await;
    }

    #[tokio::test]
    async fn watch_failure() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.set_unreachable(true);
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());

        assert!(mirror.watch().await.is_err());
        assert!(!mirror.is_watching());
    }

    #[tokio::test]
    async fn close() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.apply(&config_map("a"));
        let mirror = ClusterMirror::new(config_map("a"), cluster.clone());
        mirror.watch().await.unwrap();
        mirror.pull(false).await.unwrap();

        mirror.close();
        mirror.close();
        assert!(mirror.is_closed());
        assert!(!mirror.is_watching());

        // watching a closed mirror does nothing
        mirror.watch().await.unwrap();
        assert_eq!(cluster.watches(), 1);
    }
}
