//! Keeps locally edited Kubernetes resources in sync with a cluster.
//!
//! Every local resource is bound to a [`ClusterMirror`] caching its remote
//! value and watching it for changes. A [`ResourceSet`] tracks the local
//! values, what was last pulled or pushed, and classifies each resource into
//! a [`ReconciliationState`].

pub mod cluster;
pub mod config;
mod error;
pub mod identity;
pub mod memory;
pub mod mirror;
pub mod multiplexer;
pub mod remote;
pub mod resource_set;
pub mod state;

#[cfg(test)]
mod testing;

pub use error::{Error, Result, detail_message};
pub use identity::{ResourceIdentity, same_resource};
pub use kubernetes::DynamicObject;
pub use mirror::ClusterMirror;
pub use multiplexer::{Listener, Signal, WatchMultiplexer};
pub use remote::{RemoteEvent, RemoteResourceClient};
pub use resource_set::ResourceSet;
pub use state::ReconciliationState;
