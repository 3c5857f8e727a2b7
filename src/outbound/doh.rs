//! DoH outbound: POSTs the wire-format request with pinned server name and a
//! connection forced to the bootstrap-resolved IP. Grounded on the
//! reference's `internal/transport/http/outbound.go`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::dns::Message;
use crate::error::{AppError, Result};

use super::Outbound;

const DOH_DEADLINE: Duration = Duration::from_secs(10);

pub struct DohOutbound {
    tag: String,
    url: Url,
    client: Client,
}

impl DohOutbound {
    pub fn new(tag: String, url: Url, addr: SocketAddr) -> Result<DohOutbound> {
        let host = url
            .host_str()
            .ok_or_else(|| AppError::config("doh url missing host"))?
            .to_string();

        // Forces the TCP connection to the bootstrap-resolved IP while
        // keeping the original hostname for the Host header / TLS SNI, per
        // the reference's `DialContext` override.
        let client = Client::builder()
            .resolve(&host, addr)
            .timeout(DOH_DEADLINE)
            .build()
            .map_err(|e| AppError::config(format!("failed to build doh client: {e}")))?;

        Ok(DohOutbound { tag, url, client })
    }
}

#[async_trait]
impl Outbound for DohOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn exchange(&self, request: &Message) -> Result<(Message, Duration)> {
        let started = Instant::now();

        // RFC 8484 cacheability: the outgoing id is masked to 0; the codec
        // restores the caller's id on the decoded response.
        let mut outgoing = request.clone();
        outgoing.header.id = 0;
        let body = outgoing
            .encode()
            .map_err(|e| AppError::upstream(self.tag.clone(), e))?;

        let result = async {
            let resp = self
                .client
                .post(self.url.clone())
                .header("Content-Type", "application/dns-message")
                .header("Accept", "application/dns-message")
                .body(body)
                .send()
                .await
                .map_err(|e| AppError::decode(format!("doh request failed: {e}")))?;

            if resp.status() != reqwest::StatusCode::OK {
                return Err(AppError::decode(format!(
                    "doh upstream returned status {}",
                    resp.status()
                )));
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| AppError::decode(format!("doh body read failed: {e}")))?;
            let mut response = Message::decode(&bytes)?;
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
