//! An in-process cluster.
//!
//! Stores resources in memory, assigns resource versions and uids, expands
//! `generateName` and broadcasts watch events, like an API server would.
//! Faults can be injected to exercise failure handling.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kubernetes::DynamicObject;
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::identity::ResourceIdentity;
use crate::multiplexer::Signal;
use crate::remote::{RemoteEvent, RemoteResourceClient};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    objects: HashMap<ResourceIdentity, DynamicObject>,
    version: u64,
    uid: u64,
    watchers: Vec<(ResourceIdentity, UnboundedSender<RemoteEvent>)>,

    unreachable: bool,
    unauthorized: bool,
    unsupported: HashSet<(String, String)>,
    failing_gets: usize,
    failing_replaces: HashSet<String>,

    gets: usize,
    replaces: usize,
    watches: usize,
}

impl Inner {
    fn check(&self, identity: &ResourceIdentity) -> Result<()> {
        if self.unreachable {
            return Err(Error::transport(None, "connection refused"));
        }
        if self.unauthorized {
            return Err(Error::Unauthorized(format!("{identity} is forbidden")));
        }
        if self
            .unsupported
            .contains(&(identity.kind.clone(), identity.api_version.clone()))
        {
            return Err(Error::UnsupportedResource {
                identity: identity.clone(),
                reason: format!(
                    "the server doesn't have a resource type {} in {}",
                    identity.kind, identity.api_version
                ),
            });
        }

        Ok(())
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn broadcast(&mut self, identity: &ResourceIdentity, event: RemoteEvent) {
        self.watchers.retain(|(watched, sender)| {
            if watched != identity {
                return !sender.is_closed();
            }

            sender.send(event.clone()).is_ok()
        });
    }

    fn store(&mut self, resource: &DynamicObject) -> DynamicObject {
        let mut stored = resource.clone();
        if stored.metadata.name.is_none() {
            if let Some(prefix) = &stored.metadata.generate_name {
                self.uid += 1;
                stored.metadata.name = Some(format!("{prefix}{:05x}", self.uid));
            }
        }

        let identity = ResourceIdentity::of(&stored);
        let previous = self.objects.get(&identity);
        stored.metadata.uid = match previous {
            Some(previous) => previous.metadata.uid.clone(),
            None => {
                self.uid += 1;
                Some(format!("uid-{}", self.uid))
            }
        };
        let existed = previous.is_some();
        stored.metadata.resource_version = Some(self.next_version());

        self.objects.insert(identity.clone(), stored.clone());

        let event = if existed {
            Signal::Modified(stored.clone())
        } else {
            Signal::Added(stored.clone())
        };
        self.broadcast(&identity, event);

        stored
    }
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `resource` as if another client changed it, bypassing faults.
    pub fn apply(&self, resource: &DynamicObject) -> DynamicObject {
        self.inner.lock().store(resource)
    }

    /// Delete the resource as if another client removed it.
    pub fn delete(&self, identity: &ResourceIdentity) -> Option<DynamicObject> {
        let mut inner = self.inner.lock();
        let removed = inner.objects.remove(identity)?;
        inner.broadcast(identity, Signal::Deleted(removed.clone()));

        Some(removed)
    }

    pub fn current(&self, identity: &ResourceIdentity) -> Option<DynamicObject> {
        self.inner.lock().objects.get(identity).cloned()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.inner.lock().unauthorized = unauthorized;
    }

    /// Pretend the cluster does not serve `kind` in `api_version`.
    pub fn unsupport(&self, kind: &str, api_version: &str) {
        self.inner
            .lock()
            .unsupported
            .insert((kind.to_string(), api_version.to_string()));
    }

    /// Fail the next `count` gets with a server error.
    pub fn fail_next_gets(&self, count: usize) {
        self.inner.lock().failing_gets = count;
    }

    /// Fail every replace of resources named `name` until cleared.
    pub fn fail_replaces_of(&self, name: &str) {
        self.inner.lock().failing_replaces.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.unreachable = false;
        inner.unauthorized = false;
        inner.unsupported.clear();
        inner.failing_gets = 0;
        inner.failing_replaces.clear();
    }

    /// Number of `get` calls that reached the cluster.
    pub fn gets(&self) -> usize {
        self.inner.lock().gets
    }

    pub fn replaces(&self) -> usize {
        self.inner.lock().replaces
    }

    /// Number of watch subscriptions ever opened.
    pub fn watches(&self) -> usize {
        self.inner.lock().watches
    }

    /// Number of subscriptions still consumed by someone.
    pub fn active_watches(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|(_, sender)| !sender.is_closed());
        inner.watchers.len()
    }
}

#[async_trait]
impl RemoteResourceClient for MemoryCluster {
    async fn get(&self, identity: &ResourceIdentity) -> Result<DynamicObject> {
        let mut inner = self.inner.lock();
        inner.check(identity)?;
        inner.gets += 1;

        if inner.failing_gets > 0 {
            inner.failing_gets -= 1;
            return Err(Error::transport(Some(500), "Message: internal error"));
        }

        inner
            .objects
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::NotFound(identity.clone()))
    }

    async fn replace(&self, resource: &DynamicObject) -> Result<DynamicObject> {
        let identity = ResourceIdentity::of(resource);
        let mut inner = self.inner.lock();
        inner.check(&identity)?;
        inner.replaces += 1;

        if let Some(name) = identity.handle() {
            if inner.failing_replaces.contains(name) {
                return Err(Error::transport(
                    Some(422),
                    format!("Failure executing: PUT. Message: {identity} is invalid"),
                ));
            }
        }

        Ok(inner.store(resource))
    }

    async fn watch(&self, identity: &ResourceIdentity) -> Result<BoxStream<'static, RemoteEvent>> {
        let mut inner = self.inner.lock();
        inner.check(identity)?;
        inner.watches += 1;

        let (tx, rx) = unbounded_channel();
        inner.watchers.push((identity.clone(), tx));

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    async fn is_supported(&self, identity: &ResourceIdentity) -> Result<bool> {
        let inner = self.inner.lock();
        if inner.unreachable {
            return Err(Error::transport(None, "connection refused"));
        }

        Ok(!inner
            .unsupported
            .contains(&(identity.kind.clone(), identity.api_version.clone())))
    }
}
