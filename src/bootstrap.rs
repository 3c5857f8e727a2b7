//! Bootstrap resolver: turns upstream hostnames into IPs using a fixed list
//! of plain-DNS seeds, independent of the proxy's own outbound machinery.
//! Grounded on the reference's `pkg/bootstrap/bootstrap.go` + `cache.go`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::dns::{Message, Name, RData, RecordType};
use crate::error::{AppError, Result};

const SEED_TIMEOUT: Duration = Duration::from_secs(1);
const MEMO_TTL: Duration = Duration::from_secs(600);

#[derive(Clone)]
struct MemoEntry {
    ip: IpAddr,
    expires_at: Instant,
}

pub struct Bootstrap {
    seeds: RwLock<Vec<SocketAddr>>,
    memo: RwLock<std::collections::HashMap<String, MemoEntry>>,
}

impl Bootstrap {
    pub fn new() -> Arc<Bootstrap> {
        Arc::new(Bootstrap {
            seeds: RwLock::new(Vec::new()),
            memo: RwLock::new(std::collections::HashMap::new()),
        })
    }

    /// Validates and installs the seed list. Each entry must be a literal IP
    /// with an optional `:port` (default 53); empty list or any invalid entry
    /// is a configuration error.
    pub fn set_seeds(&self, seeds: &[String]) -> Result<()> {
        if seeds.is_empty() {
            return Err(AppError::config("bootstrap-dns seed list is empty"));
        }
        let mut parsed = Vec::with_capacity(seeds.len());
        for s in seeds {
            let addr = parse_seed(s)?;
            parsed.push(addr);
        }
        *self.seeds.write() = parsed;
        Ok(())
    }

    /// Resolves `hostname` via the seed list, 1s timeout per seed, first A
    /// answer wins. A literal IP address short-circuits without a query.
    pub async fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(ip);
        }

        let seeds = self.seeds.read().clone();
        if seeds.is_empty() {
            return Err(AppError::config("no bootstrap seeds configured"));
        }

        let name = Name::parse(hostname);
        for seed in &seeds {
            match query_seed(*seed, &name).await {
                Ok(ip) => return Ok(ip),
                Err(e) => {
                    debug!(seed = %seed, error = %e, "bootstrap seed failed");
                    continue;
                }
            }
        }
        Err(AppError::config(format!(
            "all bootstrap seeds failed to resolve {hostname}"
        )))
    }

    /// `resolve` with a 10-minute memoization window.
    pub async fn cache_resolve(&self, hostname: &str) -> Result<IpAddr> {
        let now = Instant::now();
        if let Some(entry) = self.memo.read().get(hostname) {
            if entry.expires_at > now {
                return Ok(entry.ip);
            }
        }
        let ip = self.resolve(hostname).await?;
        self.memo.write().insert(
            hostname.to_string(),
            MemoEntry {
                ip,
                expires_at: now + MEMO_TTL,
            },
        );
        Ok(ip)
    }
}

fn parse_seed(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(AppError::config(format!(
        "invalid bootstrap seed (must be a literal IP[:port]): {s}"
    )))
}

async fn query_seed(seed: SocketAddr, name: &Name) -> Result<IpAddr> {
    let bind_addr = if seed.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let sock = UdpSocket::bind(bind_addr).await?;
    sock.connect(seed).await?;

    let query = Message::new_query(rand::random::<u16>(), name, RecordType::A);
    let bytes = query.encode()?;

    timeout(SEED_TIMEOUT, sock.send(&bytes)).await.map_err(|_| {
        AppError::Timeout(SEED_TIMEOUT)
    })??;

    let mut buf = vec![0u8; 512];
    let n = timeout(SEED_TIMEOUT, sock.recv(&mut buf))
        .await
        .map_err(|_| AppError::Timeout(SEED_TIMEOUT))??;

    let response = Message::decode(&buf[..n])?;
    for answer in &response.answers {
        if let RData::A(ip) = answer.rdata {
            return Ok(IpAddr::V4(ip));
        }
    }
    warn!(seed = %seed, "bootstrap seed returned no A record");
    Err(AppError::decode("no A record in bootstrap response"))
}
