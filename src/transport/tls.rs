//! Inbound TLS acceptor construction for DoT/DoH listeners. Grounded on the
//! teacher's `transport/tls.rs`, trimmed to the single-cert, no-mTLS surface
//! this proxy's inbound config exposes (`inbound.tls`/`inbound.https`).

use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::info;

use crate::error::{AppError, Result};
use crate::transport::cert_gen;

/// Builds a TLS acceptor for `cert`/`key` (PEM file paths); generates and
/// persists a self-signed pair alongside them if either is missing or blank.
pub async fn build_acceptor(cert: &str, key: &str, server_name: &str) -> Result<TlsAcceptor> {
    let (cert_pem, key_pem) = if cert.is_empty() || key.is_empty() {
        cert_gen::generate_self_signed_cert(server_name)
            .map(|(c, k)| (c.into_bytes(), k.into_bytes()))?
    } else {
        cert_gen::load_or_generate_cert(Path::new(cert), Path::new(key), server_name).await?
    };

    let certs = parse_certs(&cert_pem)?;
    let key = parse_key(&key_pem)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::config(format!("tls server config error: {e}")))?;

    info!(server_name, "tls acceptor ready");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut cursor).collect();
    let certs = certs.map_err(|e| AppError::config(format!("invalid certificate pem: {e}")))?;
    if certs.is_empty() {
        return Err(AppError::config("no certificate found in pem"));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    let keys: std::result::Result<Vec<_>, _> =
        rustls_pemfile::pkcs8_private_keys(&mut cursor).collect();
    let keys = keys.map_err(|e| AppError::config(format!("invalid pkcs8 key pem: {e}")))?;
    if let Some(k) = keys.into_iter().next() {
        return Ok(PrivateKeyDer::Pkcs8(k));
    }

    cursor.set_position(0);
    let keys: std::result::Result<Vec<_>, _> =
        rustls_pemfile::rsa_private_keys(&mut cursor).collect();
    let keys = keys.map_err(|e| AppError::config(format!("invalid rsa key pem: {e}")))?;
    keys.into_iter()
        .next()
        .map(PrivateKeyDer::Pkcs1)
        .ok_or_else(|| AppError::config("no private key found in pem"))
}
