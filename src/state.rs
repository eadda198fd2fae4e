//! Classifies a local resource against its cluster counterpart.

use std::fmt::{Display, Formatter};

use kubernetes::DynamicObject;

use crate::Error;
use crate::identity::ResourceIdentity;
use crate::mirror::ClusterMirror;

const UNREACHABLE: &str = "Error contacting cluster";
const UNSUPPORTED: &str = "Unsupported resource kind";
const UNAUTHORIZED: &str = "Unauthorized";
const UNNAMED: &str = "Resource has no name";
const PUSH_FAILED: &str = "Could not push";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconciliationState {
    /// Local equals the last pulled or pushed value.
    Identical,
    /// Local differs from the last pulled or pushed value.
    Modified { exists: bool, outdated: bool },
    /// Local differs, and the cluster confirmed the resource is gone.
    DeletedOnCluster,
    /// Local is unchanged, but the cluster holds a different version.
    Outdated,
    Pulled,
    Created,
    Updated,
    Error {
        title: String,
        message: Option<String>,
    },
}

impl ReconciliationState {
    pub fn error(title: impl Into<String>, message: Option<String>) -> Self {
        ReconciliationState::Error {
            title: title.into(),
            message,
        }
    }

    /// The state recorded when the cluster rejects or fails a push.
    pub fn push_failed(err: &Error) -> Self {
        match err {
            Error::Transport { .. } => {
                ReconciliationState::error(PUSH_FAILED, Some(err.to_string()))
            }
            err => ReconciliationState::from(err),
        }
    }

    /// Local and remote disagree.
    pub fn is_different(&self) -> bool {
        matches!(
            self,
            ReconciliationState::Modified { .. }
                | ReconciliationState::DeletedOnCluster
                | ReconciliationState::Outdated
        )
    }

    /// The disagreement is one pushing resolves.
    pub fn is_push_worthy(&self) -> bool {
        matches!(
            self,
            ReconciliationState::Modified { .. } | ReconciliationState::DeletedOnCluster
        )
    }

    pub fn is_pushed(&self) -> bool {
        matches!(
            self,
            ReconciliationState::Created | ReconciliationState::Updated
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReconciliationState::Error { .. })
    }

    /// States that survive re-evaluation until the next local edit.
    fn is_sticky_confirmation(&self) -> bool {
        matches!(
            self,
            ReconciliationState::Pulled
                | ReconciliationState::Created
                | ReconciliationState::Updated
        )
    }
}

impl From<&Error> for ReconciliationState {
    fn from(err: &Error) -> Self {
        ReconciliationState::error(err.title(), Some(err.to_string()))
    }
}

impl Display for ReconciliationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationState::Identical => f.write_str("identical"),
            ReconciliationState::Modified { exists, outdated } => {
                f.write_str("modified")?;
                if !exists {
                    f.write_str(", not on cluster")?;
                }
                if *outdated {
                    f.write_str(", outdated")?;
                }
                Ok(())
            }
            ReconciliationState::DeletedOnCluster => f.write_str("deleted on cluster"),
            ReconciliationState::Outdated => f.write_str("outdated"),
            ReconciliationState::Pulled => f.write_str("pulled"),
            ReconciliationState::Created => f.write_str("created"),
            ReconciliationState::Updated => f.write_str("updated"),
            ReconciliationState::Error { title, message } => match message {
                Some(message) => write!(f, "{title}: {message}"),
                None => f.write_str(title),
            },
        }
    }
}

/// Everything classification looks at, gathered up front so the rules
/// themselves never touch the network and never fail.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observation {
    /// Why the cluster could not be asked, if it could not.
    pub unreachable: Option<String>,
    pub unsupported: Option<String>,
    pub unauthorized: Option<String>,

    pub has_name: bool,
    pub deleted: bool,
    /// Local content differs from the baseline.
    pub modified: bool,
    pub exists: bool,
    pub outdated: bool,
}

impl Observation {
    /// Compare `local` with `baseline` and ask `mirror` about the cluster.
    ///
    /// Remote values come from the mirror's cache when it has one.
    pub async fn gather(
        local: &DynamicObject,
        baseline: &DynamicObject,
        mirror: &ClusterMirror,
    ) -> Observation {
        let mut observation = Observation {
            has_name: ResourceIdentity::of(local).has_name(),
            modified: !local.same_content(baseline),
            ..Default::default()
        };

        if mirror.is_closed() {
            observation.unreachable = Some("not connected to a cluster".to_string());
            return observation;
        }

        match mirror.is_supported().await {
            Ok(true) => {}
            Ok(false) => {
                observation.unsupported = Some(format!(
                    "{} in {} is not served by the cluster",
                    local.kind, local.api_version
                ));
                return observation;
            }
            Err(err) => {
                observation.record(err);
                return observation;
            }
        }

        if !observation.has_name {
            return observation;
        }

        observation.deleted = mirror.is_deleted();
        match mirror.pull(false).await {
            Ok(remote) => {
                observation.exists = remote.is_some();
                observation.outdated = remote
                    .is_some_and(|remote| remote.resource_version() != local.resource_version());
            }
            Err(err) => observation.record(err),
        }

        observation
    }

    fn record(&mut self, err: Error) {
        match err {
            Error::NotFound(_) => {}
            Error::Unauthorized(_) => self.unauthorized = Some(err.to_string()),
            Error::UnsupportedResource { .. } => self.unsupported = Some(err.to_string()),
            err => self.unreachable = Some(err.to_string()),
        }
    }
}

type Prior<'a> = Option<&'a ReconciliationState>;

struct Rule {
    name: &'static str,
    applies: fn(&Observation, Prior) -> bool,
    build: fn(&Observation, Prior) -> ReconciliationState,
}

fn keep_prior(observation: &Observation, prior: Prior) -> ReconciliationState {
    prior.cloned().unwrap_or(ReconciliationState::Modified {
        exists: observation.exists,
        outdated: observation.outdated,
    })
}

fn modified(observation: &Observation, _prior: Prior) -> ReconciliationState {
    ReconciliationState::Modified {
        exists: observation.exists,
        outdated: observation.outdated,
    }
}

/// First match wins. Cluster problems mask everything, a local edit beats
/// stale errors and confirmations, and an outdated version only shows when
/// nothing was edited.
static RULES: &[Rule] = &[
    Rule {
        name: "unreachable",
        applies: |o, _| o.unreachable.is_some(),
        build: |o, _| ReconciliationState::error(UNREACHABLE, o.unreachable.clone()),
    },
    Rule {
        name: "unsupported",
        applies: |o, _| o.unsupported.is_some(),
        build: |o, _| ReconciliationState::error(UNSUPPORTED, o.unsupported.clone()),
    },
    Rule {
        name: "unauthorized",
        applies: |o, _| o.unauthorized.is_some(),
        build: |o, _| ReconciliationState::error(UNAUTHORIZED, o.unauthorized.clone()),
    },
    Rule {
        name: "unnamed",
        applies: |o, _| !o.has_name,
        build: |_, _| {
            ReconciliationState::error(
                UNNAMED,
                Some("metadata.name or metadata.generateName is required".to_string()),
            )
        },
    },
    Rule {
        name: "deleted",
        applies: |o, _| o.deleted,
        build: |_, _| ReconciliationState::DeletedOnCluster,
    },
    Rule {
        name: "modified",
        applies: |o, _| o.modified,
        build: modified,
    },
    Rule {
        name: "sticky error",
        applies: |_, prior| prior.is_some_and(ReconciliationState::is_error),
        build: keep_prior,
    },
    Rule {
        name: "outdated",
        applies: |o, _| o.outdated,
        build: |_, _| ReconciliationState::Outdated,
    },
    Rule {
        name: "sticky confirmation",
        applies: |_, prior| prior.is_some_and(ReconciliationState::is_sticky_confirmation),
        build: keep_prior,
    },
    Rule {
        name: "missing",
        applies: |o, _| !o.exists,
        build: |o, _| ReconciliationState::Modified {
            exists: false,
            outdated: o.outdated,
        },
    },
    Rule {
        name: "identical",
        applies: |_, _| true,
        build: |_, _| ReconciliationState::Identical,
    },
];

/// The state of a resource given what was observed and its previous state.
pub fn classify(observation: &Observation, prior: Option<&ReconciliationState>) -> ReconciliationState {
    RULES
        .iter()
        .find(|rule| (rule.applies)(observation, prior))
        .map(|rule| {
            tracing::trace!(message = "classified", rule = rule.name);
            (rule.build)(observation, prior)
        })
        .unwrap_or(ReconciliationState::Identical)
}
