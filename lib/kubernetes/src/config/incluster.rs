use std::env;
use std::path::PathBuf;

use super::tls;
use super::{Auth, Config, RefreshableToken};

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read the in-cluster environment variable {0}, {1}")]
    ReadEnvironmentVariable(&'static str, #[source] env::VarError),

    #[error("failed to parse cluster port: {0}")]
    ParseClusterPort(#[source] std::num::ParseIntError),

    #[error("failed to parse cluster uri: {0}")]
    ParseClusterUri(#[source] http::uri::InvalidUri),

    #[error("failed to read '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error(transparent)]
    Tls(#[from] tls::Error),
}

/// Build a [`Config`] from the service account mounted into every pod.
pub fn load() -> Result<Config, Error> {
    let dir = PathBuf::from(SERVICE_ACCOUNT_DIR);

    let cluster_url = cluster_url()?;

    let namespace_path = dir.join("namespace");
    let default_namespace = std::fs::read_to_string(&namespace_path)
        .map_err(|err| Error::ReadFile(err, namespace_path))?
        .trim()
        .to_string();

    let ca_path = dir.join("ca.crt");
    let ca = std::fs::read(&ca_path).map_err(|err| Error::ReadFile(err, ca_path))?;
    let tls = tls::client_config(Some(&ca), None)?;

    let token_path = dir.join("token");
    let token = RefreshableToken::new(token_path.clone())
        .map_err(|err| Error::ReadFile(err, token_path))?;

    Ok(Config {
        cluster_url,
        default_namespace,
        auth: Auth::RefreshableToken(token),
        tls,
    })
}

fn cluster_url() -> Result<http::Uri, Error> {
    let host = env::var(SERVICE_HOST_ENV)
        .map_err(|err| Error::ReadEnvironmentVariable(SERVICE_HOST_ENV, err))?;
    let port = env::var(SERVICE_PORT_ENV)
        .map_err(|err| Error::ReadEnvironmentVariable(SERVICE_PORT_ENV, err))?
        .parse::<u16>()
        .map_err(Error::ParseClusterPort)?;

    format_url(&host, port)
        .parse()
        .map_err(Error::ParseClusterUri)
}

// IPv6 hosts must be bracketed, and the port is omitted when it is 443.
fn format_url(host: &str, port: u16) -> String {
    let host = match host.parse::<std::net::IpAddr>() {
        Ok(ip) if ip.is_ipv6() => format!("[{ip}]"),
        _ => host.to_string(),
    };

    if port == 443 {
        format!("https://{host}")
    } else {
        format!("https://{host}:{port}")
    }
}
