use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::tls;
use super::{Auth, Config, RefreshableToken};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error("failed to parse kubeconfig: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("current-context is not set")]
    CurrentContextNotSet,

    #[error("context {0} not found")]
    ContextNotFound(String),

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("cluster server url is missing")]
    MissingClusterUrl,

    #[error("failed to parse cluster url: {0}")]
    ParseClusterUri(#[source] http::uri::InvalidUri),

    #[error("failed to decode base64 {0}: {1}")]
    DecodeBase64(&'static str, #[source] base64::DecodeError),

    #[error("insecure-skip-tls-verify is not supported")]
    InsecureSkipTlsVerify,

    #[error(transparent)]
    Tls(#[from] tls::Error),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct User {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct Context {
    cluster: String,
    user: String,
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    value: Option<T>,
}

/// Only the fields needed to build a [`Config`] are decoded.
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeConfig {
    #[serde(default)]
    clusters: Vec<Named<Cluster>>,
    #[serde(default)]
    contexts: Vec<Named<Context>>,
    #[serde(default)]
    users: Vec<Named<User>>,
    current_context: Option<String>,
}

fn find<T: Clone>(items: &[Named<T>], name: &str) -> Option<T> {
    items
        .iter()
        .find(|item| item.name == name)
        .and_then(|item| item.value.clone())
}

pub fn load(path: &Path) -> Result<Config, Error> {
    let data = std::fs::read(path).map_err(|err| Error::ReadFile(err, path.into()))?;
    let kubeconfig = serde_yaml::from_slice::<KubeConfig>(&data).map_err(Error::Parse)?;

    build(kubeconfig)
}

fn build(kubeconfig: KubeConfig) -> Result<Config, Error> {
    let context_name = kubeconfig
        .current_context
        .ok_or(Error::CurrentContextNotSet)?;
    let context = find(&kubeconfig.contexts, &context_name)
        .ok_or(Error::ContextNotFound(context_name))?;
    let cluster = find(&kubeconfig.clusters, &context.cluster)
        .ok_or_else(|| Error::ClusterNotFound(context.cluster.clone()))?;
    // a context may legitimately reference a user with no credentials
    let user = find(&kubeconfig.users, &context.user).unwrap_or_default();

    if cluster.insecure_skip_tls_verify {
        return Err(Error::InsecureSkipTlsVerify);
    }

    let cluster_url = cluster
        .server
        .as_deref()
        .ok_or(Error::MissingClusterUrl)?
        .parse::<http::Uri>()
        .map_err(Error::ParseClusterUri)?;

    let ca = load_data(
        "certificate-authority-data",
        cluster.certificate_authority_data.as_deref(),
        cluster.certificate_authority.as_deref(),
    )?;
    let cert = load_data(
        "client-certificate-data",
        user.client_certificate_data.as_deref(),
        user.client_certificate.as_deref(),
    )?;
    let key = load_data(
        "client-key-data",
        user.client_key_data.as_deref(),
        user.client_key.as_deref(),
    )?;
    let identity = match (&cert, &key) {
        (Some(cert), Some(key)) => Some((cert.as_slice(), key.as_slice())),
        _ => None,
    };
    let tls = tls::client_config(ca.as_deref(), identity)?;

    let auth = if let (Some(username), Some(password)) = (user.username, user.password) {
        Auth::Basic { username, password }
    } else if let Some(path) = user.token_file {
        let token = RefreshableToken::new(path.clone()).map_err(|err| Error::ReadFile(err, path))?;
        Auth::RefreshableToken(token)
    } else if let Some(token) = user.token {
        Auth::Bearer { token }
    } else {
        Auth::None
    };

    Ok(Config {
        cluster_url,
        default_namespace: context.namespace.unwrap_or_else(|| String::from("default")),
        auth,
        tls,
    })
}

// Inline `*-data` fields are base64 and win over file paths, files hold raw PEM.
fn load_data(
    field: &'static str,
    data: Option<&str>,
    path: Option<&Path>,
) -> Result<Option<Vec<u8>>, Error> {
    use base64::Engine;

    if let Some(data) = data {
        return base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map(Some)
            .map_err(|err| Error::DecodeBase64(field, err));
    }

    match path {
        Some(path) => std::fs::read(path)
            .map(Some)
            .map_err(|err| Error::ReadFile(err, path.into())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIND: &str = r#"
apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTiBDRVJ
    server: https://127.0.0.1:34139
  name: kind-kind
contexts:
- context:
    cluster: kind-kind
    user: kind-kind
    namespace: dev
  name: kind-kind
current-context: kind-kind
kind: Config
preferences: {}
users:
- name: kind-kind
  user:
    token: abcdef
"#;

    #[test]
    fn deserialize() {
        let config = serde_yaml::from_str::<KubeConfig>(KIND).unwrap();

        assert_eq!(config.current_context.as_deref(), Some("kind-kind"));

        let cluster = find(&config.clusters, "kind-kind").unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://127.0.0.1:34139"));
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some("LS0tLS1CRUdJTiBDRVJ")
        );

        let context = find(&config.contexts, "kind-kind").unwrap();
        assert_eq!(context.user, "kind-kind");
        assert_eq!(context.namespace.as_deref(), Some("dev"));

        let user = find(&config.users, "kind-kind").unwrap();
        assert_eq!(user.token.as_deref(), Some("abcdef"));
    }

    #[test]
    fn missing_context() {
        let mut config = serde_yaml::from_str::<KubeConfig>(KIND).unwrap();
        config.current_context = Some("other".into());

        assert!(matches!(build(config), Err(Error::ContextNotFound(name)) if name == "other"));
    }

    #[test]
    fn insecure_rejected() {
        let data = KIND.replace(
            "certificate-authority-data: LS0tLS1CRUdJTiBDRVJ",
            "insecure-skip-tls-verify: true",
        );
        let config = serde_yaml::from_str::<KubeConfig>(&data).unwrap();

        assert!(matches!(build(config), Err(Error::InsecureSkipTlsVerify)));
    }
}
