use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The API server closes watches after about five minutes, requests asking
/// for longer are rejected.
const MAX_WATCH_TIMEOUT_SECS: u32 = 295;

const fn default_timeout_secs() -> u32 {
    290
}

const fn default_bookmarks() -> bool {
    true
}

const fn default_min_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_secs() -> u64 {
    30
}

/// How single resource watches talk to the cluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// Server side timeout of one watch request, the watch resumes
    /// transparently after it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,

    /// Ask for bookmark events, which keep the resume point fresh on quiet
    /// resources.
    #[serde(default = "default_bookmarks")]
    pub bookmarks: bool,

    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            timeout_secs: default_timeout_secs(),
            bookmarks: default_bookmarks(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl WatchConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

/// Settings of a cluster session.
///
/// ```yaml
/// namespace: staging
/// watch:
///   timeout_secs: 120
///   bookmarks: false
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Namespace of resources that do not name one. Defaults to the
    /// namespace of the current kubeconfig context.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub watch: WatchConfig,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Config> {
        let config = serde_yaml::from_str::<Config>(text)
            .map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("read {:?} failed, {err}", path)))?;

        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let watch = &self.watch;
        if watch.timeout_secs == 0 || watch.timeout_secs >= MAX_WATCH_TIMEOUT_SECS {
            return Err(Error::Config(format!(
                "watch.timeout_secs must be between 1 and {}",
                MAX_WATCH_TIMEOUT_SECS - 1
            )));
        }

        if watch.min_backoff() > watch.max_backoff() {
            return Err(Error::Config(
                "watch.min_backoff_ms must not exceed watch.max_backoff_secs".to_string(),
            ));
        }

        if let Some(namespace) = &self.namespace {
            if namespace.is_empty() {
                return Err(Error::Config("namespace must not be empty".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_yaml("{}").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.watch.timeout_secs, 290);
        assert!(config.watch.bookmarks);
        assert_eq!(config.watch.min_backoff(), Duration::from_millis(500));
        assert_eq!(config.watch.max_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn parse() {
        let config = Config::from_yaml(
            r#"
namespace: staging
watch:
  timeout_secs: 120
  bookmarks: false
"#,
        )
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("staging"));
        assert_eq!(config.watch.timeout_secs, 120);
        assert!(!config.watch.bookmarks);
        assert_eq!(config.watch.max_backoff_secs, 30);
    }

    #[test]
    fn invalid() {
        for text in [
            "watch:\n  timeout_secs: 295",
            "watch:\n  timeout_secs: 0",
            "watch:\n  min_backoff_ms: 60000\n  max_backoff_secs: 1",
            "namespace: ''",
            "unknown: true",
        ] {
            let err = Config::from_yaml(text).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{text}: {err}");
        }
    }
}
