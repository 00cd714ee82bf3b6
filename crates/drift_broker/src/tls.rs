//! TLS listener: a rustls acceptor over PEM files, each connection served
//! through hyper.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, warn};

pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path).with_context(|| format!("open {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates in {}", cert_path.display()))?;

    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("open {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("parse {}", key_path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", key_path.display()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build TLS server config")
}

/// Accept loop: TLS handshake per connection, then hand the stream to
/// hyper with the peer address attached for the router's `ConnectInfo`.
pub async fn serve(listener: TcpListener, tls: Arc<ServerConfig>, app: Router) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    loop {
        let (tcp, peer_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let tower_service = make_service
            .call(peer_addr)
            .await
            .unwrap_or_else(|infallible| match infallible {});

        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(stream) => {
                    let hyper_service = TowerToHyperService::new(tower_service);
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), hyper_service)
                        .await
                    {
                        debug!("connection from {peer_addr} ended: {e}");
                    }
                }
                Err(e) => warn!("TLS handshake with {peer_addr} failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = load_server_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert!(err.to_string().contains("open"));
    }

    #[test]
    fn pem_without_a_key_is_an_error() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        // Not a certificate at all; the PEM parser yields nothing.
        writeln!(cert, "just some text").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "also not a key").unwrap();

        let err = load_server_config(cert.path(), key.path()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }
}
