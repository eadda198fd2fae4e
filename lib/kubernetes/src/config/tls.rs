use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::CertificateResult;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse PEM-encoded data: {0}")]
    ParsePem(#[source] pem::PemError),

    #[error("failed to add a root certificate: {0}")]
    AddRootCertificate(#[source] rustls::Error),

    #[error("no valid native root CA certificates found")]
    NoNativeRootCertificates,

    #[error("client identity PEM is missing certificate")]
    MissingCertificate,

    #[error("client identity PEM is missing a private key, the key must be PKCS8, PKCS1 or SEC1")]
    MissingPrivateKey,

    #[error("invalid client certificate or key: {0}")]
    InvalidClientAuth(#[source] rustls::Error),
}

/// Build a rustls client config.
///
/// `ca` is PEM data of the cluster certificate authority, the platform's
/// native roots are used when it is absent. `identity` is a PEM encoded
/// `(certificate chain, private key)` pair for client certificate auth.
pub fn client_config(
    ca: Option<&[u8]>,
    identity: Option<(&[u8], &[u8])>,
) -> Result<ClientConfig, Error> {
    let roots = match ca {
        Some(data) => root_store(data)?,
        None => native_root_store()?,
    };

    let builder = ClientConfig::builder().with_root_certificates(roots);

    match identity {
        Some((cert, key)) => {
            let chain = certificates(cert)?;
            if chain.is_empty() {
                return Err(Error::MissingCertificate);
            }

            builder
                .with_client_auth_cert(chain, private_key(key)?)
                .map_err(Error::InvalidClientAuth)
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

fn certificates(data: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = pem::parse_many(data)
        .map_err(Error::ParsePem)?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();

    Ok(certs)
}

fn private_key(data: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    for p in pem::parse_many(data).map_err(Error::ParsePem)? {
        let key = match p.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(p.into_contents())),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(p.into_contents())),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(p.into_contents())),
            _ => continue,
        };

        return Ok(key);
    }

    Err(Error::MissingPrivateKey)
}

fn root_store(data: &[u8]) -> Result<RootCertStore, Error> {
    let mut store = RootCertStore::empty();
    for cert in certificates(data)? {
        store.add(cert).map_err(Error::AddRootCertificate)?;
    }

    Ok(store)
}

fn native_root_store() -> Result<RootCertStore, Error> {
    let CertificateResult { certs, errors, .. } = rustls_native_certs::load_native_certs();
    for err in errors {
        debug!(message = "load native certificate failed", %err);
    }

    let mut store = RootCertStore::empty();
    for cert in certs {
        if let Err(err) = store.add(cert) {
            debug!(message = "native certificate parse failed", %err);
        }
    }

    if store.is_empty() {
        return Err(Error::NoNativeRootCertificates);
    }

    Ok(store)
}
