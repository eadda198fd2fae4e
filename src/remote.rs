use async_trait::async_trait;
use futures::stream::BoxStream;
use kubernetes::DynamicObject;

use crate::Result;
use crate::identity::ResourceIdentity;
use crate::multiplexer::Signal;

/// A change notification delivered by a remote watch.
pub type RemoteEvent = Signal<DynamicObject>;

/// The operations the reconciliation engine needs from a cluster.
///
/// Implementations enforce their own timeouts, the engine only tells apart
/// success, [`Error::NotFound`](crate::Error::NotFound) and other failures.
#[async_trait]
pub trait RemoteResourceClient: Send + Sync {
    /// Fetch the current remote value, `Error::NotFound` if it does not exist.
    async fn get(&self, identity: &ResourceIdentity) -> Result<DynamicObject>;

    /// Create the resource if it does not exist, replace it otherwise.
    /// Returns the value stored by the server.
    async fn replace(&self, resource: &DynamicObject) -> Result<DynamicObject>;

    /// Subscribe to changes of one resource. Failing to subscribe is reported
    /// here, failures after that arrive as [`Signal::Error`].
    async fn watch(&self, identity: &ResourceIdentity) -> Result<BoxStream<'static, RemoteEvent>>;

    /// Whether the cluster serves the kind and api version of `identity`.
    async fn is_supported(&self, _identity: &ResourceIdentity) -> Result<bool> {
        Ok(true)
    }
}
