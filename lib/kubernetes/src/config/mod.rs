mod incluster;
mod kubeconfig;
mod tls;

use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use headers::{Authorization, HeaderMapExt};
use http::Request;

/// How long a token read from a file is trusted before the file is read again.
/// Projected service account tokens are rotated by the kubelet.
const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    InCluster(#[from] incluster::Error),

    #[error(transparent)]
    KubeConfig(#[from] kubeconfig::Error),

    #[error(transparent)]
    Tls(#[from] tls::Error),
}

struct Cached {
    token: String,
    expire_at: Instant,
}

/// A bearer token backed by a file, re-read once it is older than
/// [`TOKEN_REFRESH_INTERVAL`].
#[derive(Clone)]
pub struct RefreshableToken {
    path: PathBuf,
    cached: Arc<Mutex<Cached>>,
}

impl Debug for RefreshableToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshableToken")
            .field("path", &self.path)
            .finish()
    }
}

impl RefreshableToken {
    pub(crate) fn new(path: PathBuf) -> std::io::Result<Self> {
        let token = read_token(&path)?;

        Ok(RefreshableToken {
            path,
            cached: Arc::new(Mutex::new(Cached {
                token,
                expire_at: Instant::now() + TOKEN_REFRESH_INTERVAL,
            })),
        })
    }

    pub fn token(&self) -> std::io::Result<String> {
        let now = Instant::now();
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| std::io::Error::other("token cache poisoned"))?;

        if now > cached.expire_at {
            cached.token = read_token(&self.path)?;
            cached.expire_at = now + TOKEN_REFRESH_INTERVAL;
        }

        Ok(cached.token.clone())
    }
}

fn read_token(path: &PathBuf) -> std::io::Result<String> {
    std::fs::read_to_string(path).map(|token| token.trim().to_string())
}

#[derive(Clone, Debug)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
    RefreshableToken(RefreshableToken),
}

impl Auth {
    pub fn apply<T>(&self, req: &mut Request<T>) -> std::io::Result<()> {
        let token = match self {
            Auth::None => return Ok(()),
            Auth::Basic { username, password } => {
                req.headers_mut()
                    .typed_insert(Authorization::basic(username, password));
                return Ok(());
            }
            Auth::Bearer { token } => token.clone(),
            Auth::RefreshableToken(refreshable) => refreshable.token()?,
        };

        let header = Authorization::bearer(&token)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid token"))?;
        req.headers_mut().typed_insert(header);

        Ok(())
    }
}

/// Everything the [`Client`](crate::Client) needs to talk to one API server.
pub struct Config {
    /// The API server url, e.g. `https://10.0.0.1:6443`
    pub cluster_url: http::Uri,

    /// Namespace used for namespaced resources that do not carry one.
    pub default_namespace: String,

    /// Stores information to tell the cluster who you are.
    pub auth: Auth,

    pub tls: rustls::ClientConfig,
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("cluster_url", &self.cluster_url)
            .field("default_namespace", &self.default_namespace)
            .field("auth", &self.auth)
            .finish()
    }
}

impl Config {
    /// Load the kubeconfig pointed to by `KUBECONFIG` (first entry) or
    /// `~/.kube/config`, and fall back to the in-cluster service account.
    pub fn load() -> Result<Config, Error> {
        let path = std::env::var_os("KUBECONFIG")
            .and_then(|paths| std::env::split_paths(&paths).next())
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube/config"))
            });

        if let Some(path) = path {
            if path.exists() {
                return kubeconfig::load(&path).map_err(Into::into);
            }
        }

        incluster::load().map_err(Into::into)
    }

    /// Connect to `cluster_url` with a static bearer token, trusting the
    /// platform's native root certificates.
    pub fn with_token(cluster_url: http::Uri, token: impl Into<String>) -> Result<Config, Error> {
        let tls = tls::client_config(None, None)?;

        Ok(Config {
            cluster_url,
            default_namespace: String::from("default"),
            auth: Auth::Bearer {
                token: token.into(),
            },
            tls,
        })
    }
}
