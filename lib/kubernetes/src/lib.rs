//! A small Kubernetes API client: dynamic objects, API discovery,
//! get/create/replace and a resuming single object watch.

mod client;
mod config;
mod resource;
mod watch;

pub use client::{Client, Error, ErrorResponse, WatchEvent, WatchParams};
pub use config::{Auth, Config, Error as ConfigError};
pub use resource::{
    ApiResource, ApiResourceInfo, ApiResourceList, DynamicObject, ObjectMeta, discovery_path,
};
pub use watch::{Config as WatchConfig, Event, watch_object};
