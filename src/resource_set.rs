//! Local resources bound to their cluster mirrors.

use std::sync::Arc;

use indexmap::IndexMap;
use kubernetes::DynamicObject;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::identity::ResourceIdentity;
use crate::mirror::{ClusterMirror, Watches};
use crate::multiplexer::Listener;
use crate::remote::RemoteResourceClient;
use crate::state::{Observation, ReconciliationState, classify};
use crate::{Error, Result};

/// Selects entries for [`ResourceSet::push_all`] and [`ResourceSet::pull_all`]
/// by their local value and last evaluated state.
pub trait Predicate: Fn(&DynamicObject, Option<&ReconciliationState>) -> bool {}

impl<F> Predicate for F where F: Fn(&DynamicObject, Option<&ReconciliationState>) -> bool {}

pub fn all(_local: &DynamicObject, _state: Option<&ReconciliationState>) -> bool {
    true
}

/// Modified or deleted on the cluster, but not merely outdated.
pub fn needs_push(_local: &DynamicObject, state: Option<&ReconciliationState>) -> bool {
    state.is_some_and(ReconciliationState::is_push_worthy)
}

pub fn errored(_local: &DynamicObject, state: Option<&ReconciliationState>) -> bool {
    state.is_some_and(ReconciliationState::is_error)
}

pub fn pushed(_local: &DynamicObject, state: Option<&ReconciliationState>) -> bool {
    state.is_some_and(ReconciliationState::is_pushed)
}

struct Tracked {
    local: DynamicObject,
    /// The last value pulled or pushed, compared against `local`.
    baseline: DynamicObject,
    state: Option<ReconciliationState>,
    /// Bumped on every change of the fields above, an evaluation started
    /// before a bump is stale.
    generation: u64,
}

struct Entry {
    mirror: Arc<ClusterMirror>,
    tracked: Mutex<Tracked>,
}

impl Entry {
    fn local(&self) -> DynamicObject {
        self.tracked.lock().local.clone()
    }

    fn update_local(&self, resource: DynamicObject) {
        let mut tracked = self.tracked.lock();
        if tracked.local != resource {
            tracked.local = resource;
            tracked.state = None;
            tracked.generation += 1;
        }
    }

    /// Record a failed pull or push, the current local value becomes the
    /// baseline.
    fn fail(&self, err: &Error) -> ReconciliationState {
        self.record_failure(ReconciliationState::from(err))
    }

    fn record_failure(&self, state: ReconciliationState) -> ReconciliationState {
        let mut tracked = self.tracked.lock();
        tracked.baseline = tracked.local.clone();
        tracked.state = Some(state.clone());
        tracked.generation += 1;

        state
    }
}

/// The set of resources being edited, each with one [`ClusterMirror`] and
/// its last evaluated [`ReconciliationState`].
///
/// Entries are kept in the order they were first seen.
pub struct ResourceSet {
    client: Arc<dyn RemoteResourceClient>,
    watches: Arc<Watches>,
    entries: Mutex<IndexMap<ResourceIdentity, Arc<Entry>>>,
    listeners: Mutex<Vec<Arc<dyn Listener<DynamicObject>>>>,
}

impl ResourceSet {
    pub fn new(client: Arc<dyn RemoteResourceClient>) -> Self {
        ResourceSet {
            client,
            watches: Arc::new(Watches::new()),
            entries: Mutex::new(IndexMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn identities(&self) -> Vec<ResourceIdentity> {
        self.entries.lock().keys().cloned().collect()
    }

    /// The current local value.
    pub fn get(&self, identity: &ResourceIdentity) -> Option<DynamicObject> {
        self.entries.lock().get(identity).map(|entry| entry.local())
    }

    /// Register `listener` on every current and future mirror.
    pub fn add_listener(&self, listener: Arc<dyn Listener<DynamicObject>>) {
        self.listeners.lock().push(Arc::clone(&listener));

        for entry in self.entries.lock().values() {
            entry.mirror.add_listener(Arc::clone(&listener));
        }
    }

    /// Make the set match `resources`.
    ///
    /// Entries missing from `resources`, or whose mirror was closed, are
    /// disposed. New identities get an entry and a watch. Known identities
    /// take the new value if it changed, keeping their last state.
    pub async fn set_resources(&self, resources: Vec<DynamicObject>) {
        let wanted = resources
            .into_iter()
            .map(|resource| (ResourceIdentity::of(&resource), resource))
            .collect::<IndexMap<_, _>>();

        let mut disposed = Vec::new();
        let mut created = Vec::new();
        {
            let mut entries = self.entries.lock();
            entries.retain(|identity, entry| {
                let keep = wanted.contains_key(identity) && !entry.mirror.is_closed();
                if !keep {
                    disposed.push(Arc::clone(entry));
                }

                keep
            });

            for (identity, resource) in wanted {
                match entries.get(&identity) {
                    Some(entry) => entry.update_local(resource),
                    None => {
                        let entry = self.create_entry(resource);
                        entries.insert(identity, Arc::clone(&entry));
                        created.push(entry);
                    }
                }
            }
        }

        for entry in disposed {
            debug!(message = "resource disposed", identity = %entry.mirror.identity());
            entry.mirror.close();
        }

        for entry in created {
            if let Err(err) = entry.mirror.watch().await {
                warn!(message = "watch resource failed", identity = %entry.mirror.identity(), %err);
                entry.fail(&err);
            }
        }
    }

    /// Evaluate and store the state of `identity`.
    pub async fn get_state(&self, identity: &ResourceIdentity) -> Result<ReconciliationState> {
        let entry = self.entry(identity)?;
        let (local, baseline, prior, generation) = {
            let tracked = entry.tracked.lock();
            (
                tracked.local.clone(),
                tracked.baseline.clone(),
                tracked.state.clone(),
                tracked.generation,
            )
        };

        let observation = Observation::gather(&local, &baseline, &entry.mirror).await;
        let state = classify(&observation, prior.as_ref());

        let mut tracked = entry.tracked.lock();
        if tracked.generation != generation {
            debug!(message = "discarded stale state", %identity, %state);
            return Ok(tracked.state.clone().unwrap_or(state));
        }

        tracked.state = Some(state.clone());
        Ok(state)
    }

    /// Push the local value to the cluster.
    ///
    /// On success the local value adopts the resource version the server
    /// assigned. Failures are recorded as the entry's state and returned.
    pub async fn push(&self, identity: &ResourceIdentity) -> Result<ReconciliationState> {
        let entry = self.entry(identity)?;
        let local = entry.local();

        let existed = match entry.mirror.exists().await {
            Ok(existed) => existed,
            Err(err) => {
                warn!(message = "push resource failed", %identity, %err);
                entry.fail(&err);
                return Err(err);
            }
        };

        let stored = match entry.mirror.push(&local).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(message = "push resource failed", %identity, %err);
                entry.record_failure(ReconciliationState::push_failed(&err));
                return Err(err);
            }
        };

        let mut sent = local.clone();
        sent.metadata.resource_version = stored.metadata.resource_version;
        let state = if existed {
            ReconciliationState::Updated
        } else {
            ReconciliationState::Created
        };

        let mut tracked = entry.tracked.lock();
        // an edit made while pushing stays
        if tracked.local == local {
            tracked.local = sent.clone();
        }
        tracked.baseline = sent;
        tracked.state = Some(state.clone());
        tracked.generation += 1;

        Ok(state)
    }

    /// Replace the local value with the current remote one.
    pub async fn pull(&self, identity: &ResourceIdentity) -> Result<ReconciliationState> {
        let entry = self.entry(identity)?;

        let remote = match entry.mirror.pull(true).await {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                let err = Error::NotFound(identity.clone());
                entry.fail(&err);
                return Err(err);
            }
            Err(err) => {
                warn!(message = "pull resource failed", %identity, %err);
                entry.fail(&err);
                return Err(err);
            }
        };

        let mut tracked = entry.tracked.lock();
        tracked.local = remote.clone();
        tracked.baseline = remote;
        tracked.state = Some(ReconciliationState::Pulled);
        tracked.generation += 1;

        Ok(ReconciliationState::Pulled)
    }

    /// Push every entry matching `predicate`, one after the other in set
    /// order. A failure is recorded on its entry and does not stop the rest.
    pub async fn push_all<P: Predicate>(
        &self,
        predicate: P,
    ) -> Vec<(ResourceIdentity, Result<ReconciliationState>)> {
        let mut results = Vec::new();
        for identity in self.select(predicate) {
            let result = self.push(&identity).await;
            results.push((identity, result));
        }

        results
    }

    /// Pull every entry matching `predicate`, like [`ResourceSet::push_all`].
    pub async fn pull_all<P: Predicate>(
        &self,
        predicate: P,
    ) -> Vec<(ResourceIdentity, Result<ReconciliationState>)> {
        let mut results = Vec::new();
        for identity in self.select(predicate) {
            let result = self.pull(&identity).await;
            results.push((identity, result));
        }

        results
    }

    pub async fn watch(&self, identity: &ResourceIdentity) -> Result<()> {
        let entry = self.entry(identity)?;
        entry.mirror.watch().await.inspect_err(|err| {
            entry.fail(err);
        })
    }

    pub fn stop_watch(&self, identity: &ResourceIdentity) -> Result<()> {
        self.entry(identity)?.mirror.stop_watch();
        Ok(())
    }

    /// Watch every entry, failures are recorded on their entry.
    pub async fn watch_all(&self) {
        let entries = self.entries.lock().values().cloned().collect::<Vec<_>>();

        for entry in entries {
            if let Err(err) = entry.mirror.watch().await {
                warn!(message = "watch resource failed", identity = %entry.mirror.identity(), %err);
                entry.fail(&err);
            }
        }
    }

    pub fn stop_watch_all(&self) {
        let identities = self.identities();
        self.watches.stop_watch_all(&identities);
    }

    /// Remove `identity` from the set and close its mirror. Returns whether
    /// it was part of the set.
    pub fn dispose(&self, identity: &ResourceIdentity) -> bool {
        let removed = self.entries.lock().shift_remove(identity);

        match removed {
            Some(entry) => {
                entry.mirror.close();
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());

        for entry in entries.into_values() {
            entry.mirror.close();
        }
        self.watches.close();
    }

    fn entry(&self, identity: &ResourceIdentity) -> Result<Arc<Entry>> {
        self.entries
            .lock()
            .get(identity)
            .cloned()
            .ok_or_else(|| Error::UnknownResource(identity.clone()))
    }

    fn create_entry(&self, resource: DynamicObject) -> Arc<Entry> {
        let mirror = ClusterMirror::with_watches(
            resource.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.watches),
        );
        for listener in self.listeners.lock().iter() {
            mirror.add_listener(Arc::clone(listener));
        }

        Arc::new(Entry {
            mirror,
            tracked: Mutex::new(Tracked {
                local: resource.clone(),
                baseline: resource,
                state: None,
                generation: 0,
            }),
        })
    }

    fn select<P: Predicate>(&self, predicate: P) -> Vec<ResourceIdentity> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| {
                let tracked = entry.tracked.lock();
                predicate(&tracked.local, tracked.state.as_ref())
            })
            .map(|(identity, _)| identity.clone())
            .collect()
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
