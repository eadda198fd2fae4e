//! [`RemoteResourceClient`] backed by a Kubernetes API server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kubernetes::{ApiResource, ApiResourceList, Client, DynamicObject, Event, WatchConfig};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::detail_message;
use crate::identity::ResourceIdentity;
use crate::multiplexer::Signal;
use crate::remote::{RemoteEvent, RemoteResourceClient};
use crate::{Error, Result};

const NOT_FOUND: u16 = 404;
const UNAUTHORIZED: u16 = 401;
const FORBIDDEN: u16 = 403;

pub struct KubernetesClient {
    client: Client,
    namespace: String,
    watch: WatchConfig,

    /// Discovery documents by api version, fetched once per session.
    discovery: Mutex<HashMap<String, Arc<ApiResourceList>>>,
}

impl KubernetesClient {
    pub fn new(client: Client, config: &Config) -> Self {
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());

        KubernetesClient {
            client,
            namespace,
            watch: watch_config(config),
            discovery: Mutex::new(HashMap::new()),
        }
    }

    /// Connect with the current kubeconfig context, or the in-cluster
    /// service account.
    pub fn infer(config: &Config) -> Result<Self> {
        config.validate()?;
        let client = Client::infer().map_err(|err| Error::Config(err.to_string()))?;

        Ok(Self::new(client, config))
    }

    fn namespace<'a>(&'a self, identity: &'a ResourceIdentity) -> &'a str {
        identity.namespace.as_deref().unwrap_or(&self.namespace)
    }

    async fn api_resource(&self, identity: &ResourceIdentity) -> Result<ApiResource> {
        let list = self.discover(identity).await?;

        list.find(&identity.kind)
            .ok_or_else(|| Error::UnsupportedResource {
                identity: identity.clone(),
                reason: format!(
                    "the server doesn't have a resource type {} in {}",
                    identity.kind, identity.api_version
                ),
            })
    }

    async fn discover(&self, identity: &ResourceIdentity) -> Result<Arc<ApiResourceList>> {
        let cached = self.discovery.lock().get(&identity.api_version).cloned();
        if let Some(list) = cached {
            return Ok(list);
        }

        let list = match self.client.discover(&identity.api_version).await {
            Ok(list) => Arc::new(list),
            Err(err) if err.code() == Some(NOT_FOUND) => {
                return Err(Error::UnsupportedResource {
                    identity: identity.clone(),
                    reason: format!("api version {} is not served", identity.api_version),
                });
            }
            Err(err) => return Err(map_error(identity, err)),
        };

        debug!(
            message = "discovered api resources",
            api_version = %identity.api_version,
            resources = list.resources.len()
        );

        self.discovery
            .lock()
            .insert(identity.api_version.clone(), Arc::clone(&list));

        Ok(list)
    }

    async fn create(
        &self,
        identity: &ResourceIdentity,
        resource: &ApiResource,
        mut body: DynamicObject,
    ) -> Result<DynamicObject> {
        body.metadata.resource_version = None;

        self.client
            .create(resource, Some(self.namespace(identity)), &body)
            .await
            .map_err(|err| map_error(identity, err))
    }
}

fn watch_config(config: &Config) -> WatchConfig {
    WatchConfig {
        timeout: Some(config.watch.timeout_secs),
        bookmarks: config.watch.bookmarks,
        min_backoff: config.watch.min_backoff(),
        max_backoff: config.watch.max_backoff(),
    }
}

/// Translate an API client error into the domain error for `identity`.
fn map_error(identity: &ResourceIdentity, err: kubernetes::Error) -> Error {
    match err.code() {
        Some(NOT_FOUND) => Error::NotFound(identity.clone()),
        Some(UNAUTHORIZED | FORBIDDEN) => {
            Error::Unauthorized(detail_message(&err.to_string()).to_string())
        }
        code => Error::transport(code, err.to_string()),
    }
}

fn to_signal(result: std::result::Result<Event, kubernetes::Error>) -> RemoteEvent {
    match result {
        Ok(Event::Added(obj)) => Signal::Added(obj),
        Ok(Event::Modified(obj)) => Signal::Modified(obj),
        Ok(Event::Deleted(obj)) => Signal::Deleted(obj),
        Err(err) => Signal::Error(err.to_string()),
    }
}

#[async_trait]
impl RemoteResourceClient for KubernetesClient {
    async fn get(&self, identity: &ResourceIdentity) -> Result<DynamicObject> {
        // only generateName, the server has not named it yet
        let Some(name) = identity.name.as_deref() else {
            return Err(Error::NotFound(identity.clone()));
        };
        let resource = self.api_resource(identity).await?;

        self.client
            .get(&resource, Some(self.namespace(identity)), name)
            .await
            .map_err(|err| map_error(identity, err))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let identity = ResourceIdentity::of(obj);
        let resource = self.api_resource(&identity).await?;
        let namespace = self.namespace(&identity);

        let mut body = obj.clone();
        if resource.namespaced && body.metadata.namespace.is_none() {
            body.metadata.namespace = Some(namespace.to_string());
        }

        let Some(name) = identity.name.as_deref() else {
            return self.create(&identity, &resource, body).await;
        };

        // replace unconditionally, on top of whatever the server holds now
        match self.client.get(&resource, Some(namespace), name).await {
            Ok(current) => {
                body.metadata.resource_version = current.metadata.resource_version;
                self.client
                    .replace(&resource, Some(namespace), name, &body)
                    .await
                    .map_err(|err| map_error(&identity, err))
            }
            Err(err) if err.code() == Some(NOT_FOUND) => {
                self.create(&identity, &resource, body).await
            }
            Err(err) => Err(map_error(&identity, err)),
        }
    }

    async fn watch(&self, identity: &ResourceIdentity) -> Result<BoxStream<'static, RemoteEvent>> {
        let Some(name) = identity.name.as_deref() else {
            debug!(message = "nothing to watch before the server names the resource", %identity);
            return Ok(futures::stream::pending().boxed());
        };
        let resource = self.api_resource(identity).await?;

        let stream = kubernetes::watch_object(
            self.client.clone(),
            resource,
            Some(self.namespace(identity).to_string()),
            name,
            self.watch.clone(),
        )
        .await
        .map_err(|err| map_error(identity, err))?;

        Ok(stream.map(to_signal).boxed())
    }

    async fn is_supported(&self, identity: &ResourceIdentity) -> Result<bool> {
        match self.api_resource(identity).await {
            Ok(_) => Ok(true),
            Err(Error::UnsupportedResource { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
