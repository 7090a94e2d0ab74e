//! Mutual TLS termination.
//!
//! Builds a rustls server configuration that requires a client certificate
//! chained to the configured CA, and wraps the TLS acceptor so the verified
//! peer's subject (CN and OUs) is injected into every request as a
//! [`PeerIdentity`] extension. Requests without a usable client certificate
//! never reach a handler.

use std::{io, path::Path, sync::Arc};

use anyhow::{Context, bail};
use axum::{Extension, middleware::AddExtension};
use axum_server::{
    accept::Accept,
    tls_rustls::{RustlsAcceptor, RustlsConfig},
};
use futures_util::future::BoxFuture;
use kekgate_core::PeerIdentity;
use rustls::{
    RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::debug;
use x509_parser::prelude::*;

pub async fn build_acceptor(tls: &kekgate_core::config::TlsConfig) -> anyhow::Result<PeerTlsAcceptor> {
    let certs = load_certs(&tls.cert_path)
        .with_context(|| format!("reading server certificate {}", tls.cert_path.display()))?;
    let key = load_key(&tls.key_path)
        .with_context(|| format!("reading server key {}", tls.key_path.display()))?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&tls.ca_path)
        .with_context(|| format!("reading client CA bundle {}", tls.ca_path.display()))?
    {
        roots.add(cert).context("adding client CA certificate")?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("building client certificate verifier")?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("assembling TLS configuration")?;

    Ok(PeerTlsAcceptor {
        inner: RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config))),
    })
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// TLS acceptor that resolves the verified peer certificate into a
/// [`PeerIdentity`] request extension.
#[derive(Clone)]
pub struct PeerTlsAcceptor {
    inner: RustlsAcceptor,
}

impl<I, S> Accept<I, S> for PeerTlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerIdentity>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let peer = {
                let (_, connection) = stream.get_ref();
                connection
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "client certificate required")
                    })
                    .and_then(|der| {
                        peer_identity(der.as_ref())
                            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
                    })?
            };
            debug!(cn = %peer.common_name, "mTLS peer accepted");
            Ok((stream, Extension(peer).layer(service)))
        })
    }
}

/// Extract CN and OUs from the verified leaf certificate.
fn peer_identity(der: &[u8]) -> Result<PeerIdentity, String> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|err| err.to_string())?;
    let subject = cert.subject();
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string();
    if common_name.is_empty() {
        return Err("client certificate has no common name".into());
    }
    let organizational_units = subject
        .iter_organizational_unit()
        .filter_map(|attr| attr.as_str().ok().map(str::to_string))
        .collect();
    Ok(PeerIdentity {
        common_name,
        organizational_units,
    })
}
