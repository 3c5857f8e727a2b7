//! DoH inbound: axum router serving `POST /dns-query` (wire body) and
//! `GET /dns-query?dns=...` (base64url query param), per RFC 8484. The
//! `https` listener hands axum a [`TlsAcceptorListener`] so TLS is
//! terminated per-connection the same way the plain TCP/TLS inbounds do,
//! without pulling in a dedicated TLS-serving crate.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::dns::codec::decode_doh_get;
use crate::dns::Message;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::shutdown::GracefulShutdown;
use crate::transport::tls;

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

#[derive(Clone)]
struct DohState {
    pipeline: Arc<Pipeline>,
}

pub struct DohInbound {
    addr: SocketAddr,
}

impl DohInbound {
    pub fn new(addr: SocketAddr) -> DohInbound {
        DohInbound { addr }
    }

    pub async fn start(
        &self,
        pipeline: Arc<Pipeline>,
        shutdown: &GracefulShutdown,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let app = build_router(pipeline);
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "doh inbound listening (http)");
        let mut shutdown_rx = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
            let shutdown_signal = async move {
                let _ = shutdown_rx.recv().await;
                info!("doh inbound (http) shutting down");
            };
            if let Err(e) = serve.with_graceful_shutdown(shutdown_signal).await {
                warn!(error = %e, "doh inbound (http) server error");
            }
        });
        Ok(handle)
    }
}

pub struct DohTlsInbound {
    addr: SocketAddr,
    cert: String,
    key: String,
}

impl DohTlsInbound {
    pub fn new(addr: SocketAddr, cert: String, key: String) -> DohTlsInbound {
        DohTlsInbound { addr, cert, key }
    }

    pub async fn start(
        &self,
        pipeline: Arc<Pipeline>,
        shutdown: &GracefulShutdown,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let server_name = self.addr.ip().to_string();
        let acceptor = tls::build_acceptor(&self.cert, &self.key, &server_name).await?;
        let listener = TcpAcceptorListener {
            listener: TcpListener::bind(self.addr).await?,
            acceptor,
        };
        info!(addr = %self.addr, "doh inbound listening (https)");
        let app = build_router(pipeline);
        let mut shutdown_rx = shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
            let shutdown_signal = async move {
                let _ = shutdown_rx.recv().await;
                info!("doh inbound (https) shutting down");
            };
            if let Err(e) = serve.with_graceful_shutdown(shutdown_signal).await {
                warn!(error = %e, "doh inbound (https) server error");
            }
        });
        Ok(handle)
    }
}

/// Bridges a plain [`TcpListener`] plus a [`TlsAcceptor`] to axum's
/// [`axum::serve::Listener`] so the HTTPS inbound can run under
/// `axum::serve` without an external TLS-serving crate. A failed handshake
/// is logged and the connection dropped; the accept loop itself never
/// returns an error so one bad peer cannot take the listener down.
struct TcpAcceptorListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl axum::serve::Listener for TcpAcceptorListener {
    type Io = TlsStream<tokio::net::TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) if crate::inbound::is_transient_io_error(&e) => {
                    warn!(error = %e, "doh https accept error, retrying");
                    continue;
                }
                Err(e) => {
                    // `axum::serve::Listener::accept` has no error-return path, so
                    // a non-transient listener error is handled by parking this
                    // loop forever instead of producing a connection — new
                    // connections stop the same way a `break` would terminate the
                    // plain-loop accept loops used by the other transports.
                    warn!(error = %e, "doh https accept error, halting new connections");
                    std::future::pending::<()>().await;
                    unreachable!("accept loop parked after fatal listener error");
                }
            };
            match self.acceptor.accept(stream).await {
                Ok(tls_stream) => return (tls_stream, peer),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "doh https handshake failed, continuing");
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}

fn build_router(pipeline: Arc<Pipeline>) -> Router {
    let state = DohState { pipeline };
    Router::new()
        .route("/dns-query", get(handle_get).post(handle_post))
        .with_state(state)
}

#[derive(Deserialize)]
struct DohGetParams {
    dns: Option<String>,
}

async fn handle_get(
    State(state): State<DohState>,
    Query(params): Query<DohGetParams>,
    headers: HeaderMap,
    axum::extract::ConnectInfo(remote): axum::extract::ConnectInfo<SocketAddr>,
) -> Response {
    let Some(encoded) = params.dns else {
        return (StatusCode::BAD_REQUEST, "missing dns query parameter").into_response();
    };
    let request = match decode_doh_get(&encoded) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "doh get failed to decode query");
            return (StatusCode::BAD_REQUEST, "invalid dns parameter").into_response();
        }
    };
    exchange_and_respond(&state, request, &headers, remote).await
}

async fn handle_post(
    State(state): State<DohState>,
    headers: HeaderMap,
    axum::extract::ConnectInfo(remote): axum::extract::ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    match headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        Some(ct) if ct.eq_ignore_ascii_case(DNS_MESSAGE_CONTENT_TYPE) => {}
        _ => {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "expected application/dns-message",
            )
                .into_response();
        }
    }

    let request = match Message::decode(&body) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "doh post failed to decode query");
            return (StatusCode::BAD_REQUEST, "invalid dns message").into_response();
        }
    };
    exchange_and_respond(&state, request, &headers, remote).await
}

async fn exchange_and_respond(
    state: &DohState,
    request: Message,
    headers: &HeaderMap,
    remote: SocketAddr,
) -> Response {
    let client_ip = client_ip_from_headers(headers).unwrap_or_else(|| remote.ip().to_string());
    let response = state.pipeline.exchange(&request, "doh", &client_ip).await;
    match response.encode() {
        Ok(bytes) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "doh failed to encode response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// First match wins, in the priority order used by most CDN/reverse-proxy
/// fronted deployments; falls back to the transport remote address.
fn client_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in ["Cf-Connecting-Ip", "True-Client-Ip", "X-Real-Ip"] {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    if let Some(v) = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = v.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_from(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn prefers_cf_connecting_ip_over_everything_else() {
        let headers = headers_from(&[
            ("Cf-Connecting-Ip", "1.1.1.1"),
            ("X-Real-Ip", "2.2.2.2"),
            ("X-Forwarded-For", "3.3.3.3, 4.4.4.4"),
        ]);
        assert_eq!(client_ip_from_headers(&headers).as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn falls_back_to_first_x_forwarded_for_entry() {
        let headers = headers_from(&[("X-Forwarded-For", " 3.3.3.3 , 4.4.4.4")]);
        assert_eq!(client_ip_from_headers(&headers).as_deref(), Some("3.3.3.3"));
    }

    #[test]
    fn returns_none_when_no_header_present() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip_from_headers(&headers), None);
    }

    #[test]
    fn blank_header_value_is_skipped_in_favor_of_lower_priority_header() {
        let headers = headers_from(&[("True-Client-Ip", "  "), ("X-Real-Ip", "5.5.5.5")]);
        assert_eq!(client_ip_from_headers(&headers).as_deref(), Some("5.5.5.5"));
    }
}
