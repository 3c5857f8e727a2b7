//! TCP and TLS outbound: fresh connection per exchange, TCP framing, 10s
//! deadline, close. Grounded on the reference's
//! `internal/transport/tcp/outbound.go`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::dns::codec::{read_tcp_framed, write_tcp_framed};
use crate::dns::Message;
use crate::error::{AppError, Result};

use super::Outbound;

const TCP_DEADLINE: Duration = Duration::from_secs(10);

pub struct TcpOutbound {
    tag: String,
    addr: SocketAddr,
    tls_server_name: Option<String>,
}

impl TcpOutbound {
    pub fn new(tag: String, addr: SocketAddr, _reserved: bool) -> Self {
        TcpOutbound {
            tag,
            addr,
            tls_server_name: None,
        }
    }

    pub fn new_tls(tag: String, addr: SocketAddr, server_name: String) -> Self {
        TcpOutbound {
            tag,
            addr,
            tls_server_name: Some(server_name),
        }
    }

    fn tls_connector() -> TlsConnector {
        let root_store = tokio_rustls::rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
        };
        let config = tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    async fn exchange_inner(&self, request: &Message) -> Result<Message> {
        let stream = TcpStream::connect(self.addr).await?;

        if let Some(server_name) = &self.tls_server_name {
            let connector = Self::tls_connector();
            let dns_name = ServerName::try_from(server_name.clone())
                .map_err(|_| AppError::config(format!("invalid TLS server name: {server_name}")))?;
            let mut tls_stream = connector.connect(dns_name, stream).await?;
            write_tcp_framed(&mut tls_stream, request).await?;
            let mut response = read_tcp_framed(&mut tls_stream).await?;
            response.header.id = request.header.id;
            Ok(response)
        } else {
            let mut stream = stream;
            write_tcp_framed(&mut stream, request).await?;
            let mut response = read_tcp_framed(&mut stream).await?;
            response.header.id = request.header.id;
            Ok(response)
        }
    }
}

#[async_trait]
impl Outbound for TcpOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn exchange(&self, request: &Message) -> Result<(Message, Duration)> {
        let started = Instant::now();
        match timeout(TCP_DEADLINE, self.exchange_inner(request)).await {
            Ok(Ok(msg)) => Ok((msg, started.elapsed())),
            Ok(Err(e)) => Err(AppError::upstream(self.tag.clone(), e)),
            Err(_) => Err(AppError::upstream(
                self.tag.clone(),
                AppError::Timeout(TCP_DEADLINE),
            )),
        }
    }

    async fn close(&self) {}
}
