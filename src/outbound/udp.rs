//! UDP outbound: one-shot dial, write, read, decode. Grounded on the
//! reference's `internal/transport/udp/outbound.go`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::dns::Message;
use crate::error::{AppError, Result};

use super::Outbound;

const UDP_DEADLINE: Duration = Duration::from_secs(3);
const UDP_READ_BUF: usize = 4096;

pub struct UdpOutbound {
    tag: String,
    addr: SocketAddr,
}

impl UdpOutbound {
    pub fn new(tag: String, addr: SocketAddr) -> Self {
        UdpOutbound { tag, addr }
    }
}

#[async_trait]
impl Outbound for UdpOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn exchange(&self, request: &Message) -> Result<(Message, Duration)> {
        let started = Instant::now();
        let result: Result<Message> = async {
            let bind_addr = if self.addr.is_ipv4() {
                "0.0.0.0:0"
            } else {
                "[::]:0"
            };
            let sock = UdpSocket::bind(bind_addr).await?;
            sock.connect(self.addr).await?;

            let body = request.encode()?;
            timeout(UDP_DEADLINE, sock.send(&body))
                .await
                .map_err(|_| AppError::Timeout(UDP_DEADLINE))??;

            let mut buf = vec![0u8; UDP_READ_BUF];
            let n = timeout(UDP_DEADLINE, sock.recv(&mut buf))
                .await
                .map_err(|_| AppError::Timeout(UDP_DEADLINE))??;

            let mut response = Message::decode(&buf[..n])?;
            response.header.id = request.header.id;
            Ok(response)
        }
        .await;

        match result {
            Ok(msg) => Ok((msg, started.elapsed())),
            Err(e) => Err(AppError::upstream(self.tag.clone(), e)),
        }
    }

    async fn close(&self) {}
}
