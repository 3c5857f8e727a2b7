//! STCP inbound: plain TCP listener, per-connection handshake, then framed
//! AEAD-sealed DNS messages. A zero-length decrypted frame is a keepalive
//! ping and is answered with silence rather than routed through the
//! pipeline (§4.8).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

use crate::dns::Message;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::shutdown::GracefulShutdown;
use crate::transport::stcp_proto::{StcpSession, decode_base64_key};

const CONNECTION_IDLE_DEADLINE: Duration = Duration::from_secs(180);

pub struct StcpInbound {
    addr: SocketAddr,
    server_static: StaticSecret,
}

impl StcpInbound {
    pub fn new(addr: SocketAddr, server_key_b64: &str) -> Result<StcpInbound> {
        let bytes = decode_base64_key(server_key_b64)?;
        Ok(StcpInbound {
            addr,
            server_static: StaticSecret::from(bytes),
        })
    }

    pub async fn start(
        &self,
        pipeline: Arc<Pipeline>,
        shutdown: &GracefulShutdown,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "stcp inbound listening");
        let mut shutdown_rx = shutdown.subscribe();
        let server_static = self.server_static.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let pipeline = pipeline.clone();
                                let server_static = server_static.clone();
                                tokio::spawn(async move {
                                    serve_connection(stream, peer, server_static, pipeline).await;
                                });
                            }
                            Err(e) if crate::inbound::is_transient_io_error(&e) => {
                                warn!(error = %e, "stcp inbound accept error, continuing")
                            }
                            Err(e) => {
                                warn!(error = %e, "stcp inbound accept error, terminating accept loop");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("stcp inbound shutting down");
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    server_static: StaticSecret,
    pipeline: Arc<Pipeline>,
) {
    let mut session = match StcpSession::server_handshake(&mut stream, &server_static).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %peer, error = %e, "stcp handshake failed, closing");
            return;
        }
    };

    loop {
        let plaintext = match timeout(CONNECTION_IDLE_DEADLINE, recv_sealed(&mut stream, &mut session)).await {
            Ok(Ok(Some(p))) => p,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                if !is_clean_eof(&e) {
                    warn!(peer = %peer, error = %e, "stcp connection error, closing");
                }
                return;
            }
            Err(_) => {
                info!(peer = %peer, "stcp connection idle deadline reached, closing");
                return;
            }
        };

        if plaintext.is_empty() {
            // Keepalive ping: no response, loop continues.
            continue;
        }

        let request = match Message::decode(&plaintext) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer, error = %e, "stcp connection failed to decode query, closing");
                return;
            }
        };

        let response = pipeline.exchange(&request, "stcp", &peer.ip().to_string()).await;
        let Ok(encoded) = response.encode() else {
            warn!(peer = %peer, "stcp connection failed to encode response, closing");
            return;
        };
        if let Err(e) = send_sealed(&mut stream, &mut session, &encoded).await {
            warn!(peer = %peer, error = %e, "stcp connection write error, closing");
            return;
        }
    }
}

async fn recv_sealed(stream: &mut TcpStream, session: &mut StcpSession) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(session.open(&body)?))
}

async fn send_sealed(stream: &mut TcpStream, session: &mut StcpSession, plaintext: &[u8]) -> Result<()> {
    let sealed = session.seal(plaintext)?;
    stream.write_all(&(sealed.len() as u16).to_be_bytes()).await?;
    stream.write_all(&sealed).await?;
    Ok(())
}

fn is_clean_eof(e: &crate::error::AppError) -> bool {
    matches!(e, crate::error::AppError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}
