//! STCP outbound: one-shot by default, or a keep-alive mode that serializes
//! all callers through a single long-lived connection via a dedicated
//! serializer task (§4.3, §9 "ownership of long-lived connections").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use url::Url;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::dns::Message;
use crate::error::{AppError, Result};
use crate::transport::stcp_proto::{StcpSession, decode_base64_key};

use super::Outbound;

const STCP_ONESHOT_DEADLINE: Duration = Duration::from_secs(10);
const STCP_SERVER_DEADLINE: Duration = Duration::from_secs(120);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const REQUEST_QUEUE_DEPTH: usize = 128;

struct PendingRequest {
    message: Message,
    respond_to: oneshot::Sender<Result<Message>>,
}

pub struct StcpOutbound {
    tag: String,
    addr: SocketAddr,
    client_static: StaticSecret,
    server_pub: PublicKey,
    keep_alive_tx: Mutex<Option<mpsc::Sender<PendingRequest>>>,
    serializer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StcpOutbound {
    pub fn from_url(tag: String, url: &Url, addr: SocketAddr) -> Result<Arc<StcpOutbound>> {
        let private_b64 = url.username();
        if private_b64.is_empty() {
            return Err(AppError::config("stcp url missing private key userinfo"));
        }
        let private_bytes = decode_base64_key(private_b64)?;
        let client_static = StaticSecret::from(private_bytes);

        let server_pub_b64 = url
            .query_pairs()
            .find(|(k, _)| k == "serverPub")
            .map(|(_, v)| v.to_string())
            .ok_or_else(|| AppError::config("stcp url missing serverPub query param"))?;
        let server_pub_bytes = decode_base64_key(&server_pub_b64)?;
        let server_pub = PublicKey::from(server_pub_bytes);

        let keep_alive = url
            .query_pairs()
            .any(|(k, v)| k == "keepAlive" && v == "true");

        let outbound = Arc::new(StcpOutbound {
            tag,
            addr,
            client_static,
            server_pub,
            keep_alive_tx: Mutex::new(None),
            serializer_handle: Mutex::new(None),
        });

        if keep_alive {
            let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
            *outbound.keep_alive_tx.lock() = Some(tx);
            let serializer_outbound = outbound.clone();
            let handle = tokio::spawn(async move {
                serializer_outbound.run_serializer(rx).await;
            });
            *outbound.serializer_handle.lock() = Some(handle);
        }

        Ok(outbound)
    }

    async fn dial_and_handshake(&self) -> Result<(TcpStream, StcpSession)> {
        let mut stream = TcpStream::connect(self.addr).await?;
        let session =
            StcpSession::client_handshake(&mut stream, &self.client_static, &self.server_pub)
                .await?;
        Ok((stream, session))
    }

    async fn one_shot_exchange(&self, request: &Message) -> Result<Message> {
        let (mut stream, mut session) = self.dial_and_handshake().await?;
        send_framed_sealed(&mut stream, &mut session, request).await?;
        let mut response = recv_framed_sealed(&mut stream, &mut session).await?;
        response.header.id = request.header.id;
        Ok(response)
    }

    /// Owns the single long-lived connection: reconnects on failure, pings
    /// every minute, serializes caller requests strictly FIFO.
    async fn run_serializer(&self, mut rx: mpsc::Receiver<PendingRequest>) {
        let mut conn: Option<(TcpStream, StcpSession)> = None;
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                maybe_req = rx.recv() => {
                    let Some(req) = maybe_req else { break };
                    if conn.is_none() {
                        conn = self.dial_and_handshake().await.ok();
                    }
                    let result = match &mut conn {
                        Some((stream, session)) => {
                            match send_framed_sealed(stream, session, &req.message).await {
                                Ok(()) => recv_framed_sealed(stream, session).await,
                                Err(e) => Err(e),
                            }
                        }
                        None => Err(AppError::upstream(self.tag.clone(), AppError::decode("stcp keep-alive dial failed"))),
                    };
                    if result.is_err() {
                        conn = None;
                    }
                    let result = result.map(|mut m| { m.header.id = req.message.header.id; m });
                    let _ = req.respond_to.send(result);
                }
                _ = ping_interval.tick() => {
                    if let Some((stream, session)) = &mut conn {
                        if send_ping(stream, session).await.is_err() {
                            warn!(tag = %self.tag, "stcp keep-alive ping failed, reconnecting");
                            conn = None;
                        }
                    }
                }
            }
        }
        info!(tag = %self.tag, "stcp keep-alive serializer shutting down");
    }
}

async fn send_ping(stream: &mut TcpStream, session: &mut StcpSession) -> Result<()> {
    let sealed = session.seal(&[])?;
    stream.write_all(&(sealed.len() as u16).to_be_bytes()).await?;
    stream.write_all(&sealed).await?;
    Ok(())
}

async fn send_framed_sealed(
    stream: &mut TcpStream,
    session: &mut StcpSession,
    msg: &Message,
) -> Result<()> {
    let plaintext = msg.encode()?;
    let sealed = session.seal(&plaintext)?;
    if sealed.len() > u16::MAX as usize {
        return Err(AppError::decode("stcp frame too large"));
    }
    stream.write_all(&(sealed.len() as u16).to_be_bytes()).await?;
    stream.write_all(&sealed).await?;
    Ok(())
}

async fn recv_framed_sealed(stream: &mut TcpStream, session: &mut StcpSession) -> Result<Message> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let plaintext = session.open(&body)?;
    if plaintext.is_empty() {
        return Err(AppError::decode("unexpected stcp ping in exchange response"));
    }
    Message::decode(&plaintext)
}

#[async_trait]
impl Outbound for StcpOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn exchange(&self, request: &Message) -> Result<(Message, Duration)> {
        let started = Instant::now();
        let keep_alive_tx = self.keep_alive_tx.lock().clone();
        if let Some(tx) = keep_alive_tx {
            let (respond_to, response_rx) = oneshot::channel();
            tx.send(PendingRequest {
                message: request.clone(),
                respond_to,
            })
            .await
            .map_err(|_| AppError::upstream(self.tag.clone(), AppError::decode("stcp serializer gone")))?;
            let response = timeout(STCP_SERVER_DEADLINE, response_rx)
                .await
                .map_err(|_| AppError::upstream(self.tag.clone(), AppError::Timeout(STCP_SERVER_DEADLINE)))?
                .map_err(|_| AppError::upstream(self.tag.clone(), AppError::decode("stcp serializer dropped response")))??;
            Ok((response, started.elapsed()))
        } else {
            match timeout(STCP_ONESHOT_DEADLINE, self.one_shot_exchange(request)).await {
                Ok(Ok(msg)) => Ok((msg, started.elapsed())),
                Ok(Err(e)) => Err(AppError::upstream(self.tag.clone(), e)),
                Err(_) => Err(AppError::upstream(
                    self.tag.clone(),
                    AppError::Timeout(STCP_ONESHOT_DEADLINE),
                )),
            }
        }
    }

    /// Signals the keep-alive serializer to stop (by dropping its request
    /// sender, which ends its `rx.recv()` loop) and waits for it to drain.
    /// A no-op for one-shot outbounds, which hold no long-lived connection.
    async fn close(&self) {
        self.keep_alive_tx.lock().take();
        let handle = self.serializer_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(tag = %self.tag, error = %e, "stcp keep-alive serializer task panicked during close");
            }
        }
    }
}
