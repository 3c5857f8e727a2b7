pub mod doh;
pub mod stcp;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};
use url::Url;

use crate::bootstrap::Bootstrap;
use crate::dns::Message;
use crate::error::{AppError, Result};

/// Common outbound contract: a single request→response exchange plus
/// lifecycle management. `exchange` must preserve the caller's DNS id.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;
    async fn exchange(&self, request: &Message) -> Result<(Message, Duration)>;
    async fn close(&self);
}

pub struct OutboundRegistry {
    outbounds: RwLock<HashMap<String, Arc<dyn Outbound>>>,
    bootstrap: Arc<Bootstrap>,
}

impl OutboundRegistry {
    pub fn new(bootstrap: Arc<Bootstrap>) -> Arc<OutboundRegistry> {
        Arc::new(OutboundRegistry {
            outbounds: RwLock::new(HashMap::new()),
            bootstrap,
        })
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.outbounds.read().get(tag).cloned()
    }

    /// Registers an already-constructed outbound directly, bypassing URL
    /// parsing/bootstrap resolution. Used to wire test doubles.
    pub fn insert(&self, tag: &str, outbound: Arc<dyn Outbound>) {
        self.outbounds.write().insert(tag.to_string(), outbound);
    }

    pub fn remove(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.outbounds.write().remove(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        self.outbounds.read().keys().cloned().collect()
    }

    /// Parses `raw_url` and constructs the matching outbound implementation.
    /// A bare `host[:port]` (no `scheme://`) is treated as `udp://`.
    pub async fn add(&self, tag: &str, raw_url: &str) -> Result<()> {
        let normalized = if raw_url.contains("://") {
            raw_url.to_string()
        } else {
            format!("udp://{raw_url}")
        };
        let url = Url::parse(&normalized)
            .map_err(|e| AppError::config(format!("invalid outbound url for {tag}: {e}")))?;

        let outbound: Arc<dyn Outbound> = match url.scheme() {
            "udp" => {
                let addr = self.resolve_host_port(&url, 53).await?;
                Arc::new(udp::UdpOutbound::new(tag.to_string(), addr))
            }
            "tcp" => {
                let addr = self.resolve_host_port(&url, 53).await?;
                Arc::new(tcp::TcpOutbound::new(tag.to_string(), addr, false))
            }
            "tls" => {
                let addr = self.resolve_host_port(&url, 853).await?;
                let server_name = url.host_str().unwrap_or("").to_string();
                Arc::new(tcp::TcpOutbound::new_tls(tag.to_string(), addr, server_name))
            }
            "stcp" => {
                let addr = self.resolve_host_port(&url, 553).await?;
                Arc::new(stcp::StcpOutbound::from_url(tag.to_string(), &url, addr)?)
            }
            "http" => {
                let addr = self.resolve_host_port(&url, 80).await?;
                Arc::new(doh::DohOutbound::new(tag.to_string(), url.clone(), addr)?)
            }
            "https" => {
                let addr = self.resolve_host_port(&url, 443).await?;
                Arc::new(doh::DohOutbound::new(tag.to_string(), url.clone(), addr)?)
            }
            other => {
                warn!(scheme = other, tag, "unsupported outbound scheme, skipping");
                return Ok(());
            }
        };

        info!(tag, scheme = url.scheme(), "outbound constructed");
        self.outbounds.write().insert(tag.to_string(), outbound);
        Ok(())
    }

    async fn resolve_host_port(
        &self,
        url: &Url,
        default_port: u16,
    ) -> Result<std::net::SocketAddr> {
        let host = url
            .host_str()
            .ok_or_else(|| AppError::config("outbound url missing host"))?;
        let port = url.port().unwrap_or(default_port);
        let ip = self.bootstrap.cache_resolve(host).await?;
        Ok(std::net::SocketAddr::new(ip, port))
    }

    pub async fn close_all(&self) {
        let outbounds: Vec<_> = self.outbounds.write().drain().map(|(_, v)| v).collect();
        for ob in outbounds {
            ob.close().await;
        }
    }
}
