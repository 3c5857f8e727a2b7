//! TCP and TLS inbound: accept loop, one task per connection, 3-minute idle
//! deadline refreshed on each request. Grounded on the reference's
//! `internal/transport/tcp/inbound.go`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::dns::codec::{read_tcp_framed, write_tcp_framed};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::shutdown::GracefulShutdown;
use crate::transport::tls;

const CONNECTION_IDLE_DEADLINE: Duration = Duration::from_secs(180);

pub struct TcpInbound {
    addr: SocketAddr,
}

impl TcpInbound {
    pub fn new(addr: SocketAddr) -> TcpInbound {
        TcpInbound { addr }
    }

    pub async fn start(
        &self,
        pipeline: Arc<Pipeline>,
        shutdown: &GracefulShutdown,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "tcp inbound listening");
        let mut shutdown_rx = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let pipeline = pipeline.clone();
                                tokio::spawn(async move {
                                    serve_connection(stream, peer, pipeline).await;
                                });
                            }
                            Err(e) if crate::inbound::is_transient_io_error(&e) => {
                                warn!(error = %e, "tcp inbound accept error, continuing");
                            }
                            Err(e) => {
                                warn!(error = %e, "tcp inbound accept error, terminating accept loop");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("tcp inbound shutting down");
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

pub struct TlsInbound {
    addr: SocketAddr,
    cert: String,
    key: String,
}

impl TlsInbound {
    pub fn new(addr: SocketAddr, cert: String, key: String) -> TlsInbound {
        TlsInbound { addr, cert, key }
    }

    pub async fn start(
        &self,
        pipeline: Arc<Pipeline>,
        shutdown: &GracefulShutdown,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let server_name = self.addr.ip().to_string();
        let acceptor = tls::build_acceptor(&self.cert, &self.key, &server_name).await?;
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "tls inbound listening");
        let mut shutdown_rx = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let pipeline = pipeline.clone();
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => serve_connection(tls_stream, peer, pipeline).await,
                                        Err(e) => warn!(peer = %peer, error = %e, "tls handshake failed"),
                                    }
                                });
                            }
                            Err(e) if crate::inbound::is_transient_io_error(&e) => {
                                warn!(error = %e, "tls inbound accept error, continuing");
                            }
                            Err(e) => {
                                warn!(error = %e, "tls inbound accept error, terminating accept loop");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("tls inbound shutting down");
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

async fn serve_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
) {
    loop {
        let request = match timeout(CONNECTION_IDLE_DEADLINE, read_tcp_framed(&mut stream)).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                if !is_clean_eof(&e) {
                    warn!(peer = %peer, error = %e, "tcp connection decode error, closing");
                }
                return;
            }
            Err(_) => {
                info!(peer = %peer, "tcp connection idle deadline reached, closing");
                return;
            }
        };

        let response = pipeline.exchange(&request, "tcp", &peer.ip().to_string()).await;
        if let Err(e) = write_tcp_framed(&mut stream, &response).await {
            warn!(peer = %peer, error = %e, "tcp connection write error, closing");
            return;
        }
    }
}

fn is_clean_eof(e: &crate::error::AppError) -> bool {
    matches!(e, crate::error::AppError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}
