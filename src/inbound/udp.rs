//! UDP inbound: one socket, one spawned task per datagram. Grounded on the
//! reference's `internal/transport/udp/inbound.go`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::dns::Message;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::shutdown::GracefulShutdown;

const UDP_READ_BUF: usize = 4096;

pub struct UdpInbound {
    addr: SocketAddr,
}

impl UdpInbound {
    pub fn new(addr: SocketAddr) -> UdpInbound {
        UdpInbound { addr }
    }

    pub async fn start(
        &self,
        pipeline: Arc<Pipeline>,
        shutdown: &GracefulShutdown,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let socket = Arc::new(UdpSocket::bind(self.addr).await?);
        info!(addr = %self.addr, "udp inbound listening");

        let mut shutdown_rx = shutdown.subscribe();
        let accept_socket = socket.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_READ_BUF];
            loop {
                tokio::select! {
                    result = accept_socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, peer)) => {
                                let datagram = buf[..n].to_vec();
                                let socket = accept_socket.clone();
                                let pipeline = pipeline.clone();
                                tokio::spawn(async move {
                                    handle_datagram(socket, peer, datagram, pipeline).await;
                                });
                            }
                            Err(e) if crate::inbound::is_transient_io_error(&e) => {
                                warn!(error = %e, "udp inbound recv error, continuing");
                            }
                            Err(e) => {
                                warn!(error = %e, "udp inbound recv error, terminating accept loop");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("udp inbound shutting down");
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    datagram: Vec<u8>,
    pipeline: Arc<Pipeline>,
) {
    let request = match Message::decode(&datagram) {
        Ok(m) => m,
        Err(e) => {
            warn!(peer = %peer, error = %e, "udp inbound failed to decode query");
            return;
        }
    };

    let response = pipeline
        .exchange(&request, "udp", &peer.ip().to_string())
        .await;

    match response.encode() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                warn!(peer = %peer, error = %e, "udp inbound failed to send response");
            }
        }
        Err(e) => warn!(peer = %peer, error = %e, "udp inbound failed to encode response"),
    }
}
