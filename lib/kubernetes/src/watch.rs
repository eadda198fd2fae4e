use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::client::{Client, Error, WatchEvent, WatchParams};
use super::resource::{ApiResource, DynamicObject};

/// HTTP GONE, the requested resource version is too old to resume from.
const GONE: u16 = 410;

pub enum Event {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Server side timeout of one watch request, in seconds.
    pub timeout: Option<u32>,
    pub bookmarks: bool,
    /// First delay before re-opening a failed watch.
    pub min_backoff: Duration,
    /// Upper bound of the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: None,
            bookmarks: true,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Doubling delay between reconnect attempts, capped at `max`.
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max,
            current: min,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

enum State {
    Connecting {
        resource_version: String,
        retry: bool,
    },
    Watching {
        resource_version: String,
        stream: BoxStream<'static, Result<WatchEvent<DynamicObject>, Error>>,
    },
}

struct Watcher {
    client: Client,
    resource: ApiResource,
    namespace: Option<String>,
    params: WatchParams,
    backoff: Backoff,
}

/// Watch one named object continuously.
///
/// The first request is made before returning so that failures to subscribe
/// (unknown resource, forbidden, unreachable) surface to the caller. After
/// that, the stream never ends: timeouts resume from the last seen resource
/// version, failures are yielded and retried with back-off, and an expired
/// resource version restarts the watch from the current state.
pub async fn watch_object(
    client: Client,
    resource: ApiResource,
    namespace: Option<String>,
    name: &str,
    config: Config,
) -> Result<impl Stream<Item = Result<Event, Error>> + Send + 'static, Error> {
    let params = WatchParams {
        timeout: config.timeout,
        bookmarks: config.bookmarks,
        ..WatchParams::object(name)
    };

    let stream = client
        .watch(&resource, namespace.as_deref(), &params, "")
        .await?;
    let watcher = Watcher {
        client,
        resource,
        namespace,
        params,
        backoff: Backoff::new(config.min_backoff, config.max_backoff),
    };
    let state = State::Watching {
        resource_version: String::new(),
        stream,
    };

    Ok(futures::stream::unfold(
        (watcher, state),
        |(mut watcher, mut state)| async move {
            loop {
                let (result, next) = watcher.step(state).await;
                state = next;

                if let Some(result) = result {
                    return Some((result, (watcher, state)));
                }
            }
        },
    ))
}

impl Watcher {
    async fn step(&mut self, state: State) -> (Option<Result<Event, Error>>, State) {
        match state {
            State::Connecting {
                resource_version,
                retry,
            } => {
                if retry {
                    tokio::time::sleep(self.backoff.next()).await;
                }

                match self
                    .client
                    .watch(
                        &self.resource,
                        self.namespace.as_deref(),
                        &self.params,
                        &resource_version,
                    )
                    .await
                {
                    Ok(stream) => (
                        None,
                        State::Watching {
                            resource_version,
                            stream,
                        },
                    ),
                    Err(err) => {
                        let resource_version = if err.code() == Some(GONE) {
                            String::new()
                        } else {
                            resource_version
                        };

                        warn!(message = "re-open watch failed", ?err);

                        (
                            Some(Err(err)),
                            State::Connecting {
                                resource_version,
                                retry: true,
                            },
                        )
                    }
                }
            }
            State::Watching {
                resource_version,
                mut stream,
            } => match stream.next().await {
                Some(Ok(event)) => {
                    let (event, resource_version) = match event {
                        WatchEvent::Added(obj) => {
                            let version = latest(&obj, resource_version);
                            (Event::Added(obj), version)
                        }
                        WatchEvent::Modified(obj) => {
                            let version = latest(&obj, resource_version);
                            (Event::Modified(obj), version)
                        }
                        WatchEvent::Deleted(obj) => {
                            let version = latest(&obj, resource_version);
                            (Event::Deleted(obj), version)
                        }
                        WatchEvent::Bookmark(bookmark) => {
                            return (
                                None,
                                State::Watching {
                                    resource_version: bookmark.metadata.resource_version,
                                    stream,
                                },
                            );
                        }
                        WatchEvent::Error(resp) => {
                            // desynced, start over from the current state
                            let next = if resp.code == GONE {
                                State::Connecting {
                                    resource_version: String::new(),
                                    retry: false,
                                }
                            } else {
                                State::Watching {
                                    resource_version,
                                    stream,
                                }
                            };

                            debug!(message = "watch event error", code = resp.code, reason = %resp.reason);

                            return (Some(Err(Error::Api(resp))), next);
                        }
                    };

                    self.backoff.reset();

                    (
                        Some(Ok(event)),
                        State::Watching {
                            resource_version,
                            stream,
                        },
                    )
                }
                Some(Err(err)) => (
                    Some(Err(err)),
                    State::Connecting {
                        resource_version,
                        retry: true,
                    },
                ),
                None => {
                    debug!(message = "watch stream timeout, resuming", resource_version);

                    (
                        None,
                        State::Connecting {
                            resource_version,
                            retry: false,
                        },
                    )
                }
            },
        }
    }
}

fn latest(obj: &DynamicObject, previous: String) -> String {
    obj.resource_version()
        .map(ToString::to_string)
        .unwrap_or(previous)
}
