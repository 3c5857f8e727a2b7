//! Exercises the full stack over a real UDP socket: inbound -> pipeline ->
//! mocked outbound -> wire response, and a cached second query that never
//! reaches the outbound.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use pylon::bootstrap::Bootstrap;
use pylon::cache::Cache;
use pylon::config::CacheConfig;
use pylon::dns::{Header, Message, Name, RData, Record, RecordClass, RecordType, Rcode};
use pylon::inbound::udp::UdpInbound;
use pylon::outbound::{Outbound, OutboundRegistry};
use pylon::pipeline::Pipeline;
use pylon::rewrite::Rewriter;
use pylon::router::Router;
use pylon::shutdown::GracefulShutdown;

struct CountingOutbound {
    calls: AtomicUsize,
}

#[async_trait]
impl Outbound for CountingOutbound {
    fn tag(&self) -> &str {
        "u1"
    }

    async fn exchange(&self, request: &Message) -> pylon::error::Result<(Message, Duration)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = request.clone();
        response.header.qr = true;
        response.header.rcode = Rcode::NoError;
        response.answers.push(Record {
            name: request.questions[0].name.clone(),
            rclass: RecordClass::In,
            ttl: 120,
            rdata: RData::A(Ipv4Addr::new(93, 184, 216, 34)),
        });
        Ok((response, Duration::from_millis(1)))
    }

    async fn close(&self) {}
}

fn build_query(id: u16, name: &str) -> Message {
    Message {
        header: Header {
            id,
            rd: true,
            ..Header::default()
        },
        questions: vec![pylon::dns::Question {
            name: Name::parse(name),
            qtype: RecordType::A,
            qclass: RecordClass::In,
        }],
        answers: Vec::new(),
        authorities: Vec::new(),
        additionals: Vec::new(),
    }
}

#[tokio::test]
async fn udp_query_is_answered_and_cached() {
    let mock = Arc::new(CountingOutbound {
        calls: AtomicUsize::new(0),
    });
    let registry = OutboundRegistry::new(Bootstrap::new());
    registry.insert("u1", mock.clone() as Arc<dyn Outbound>);
    let router = Arc::new(Router::new(&[], Some("u1"), false, registry).unwrap());
    let rewriter = Arc::new(Rewriter::new(&[], 0, 0));
    let cache = Cache::new(&CacheConfig {
        max_counters: 10_000,
        max_cost: 1_000,
        buffer_items: 64,
        ttl_secs: 60,
        refresh_ttl_secs: 30,
        threads: 1,
    });
    let pipeline = Pipeline::new(router, rewriter, cache.clone());
    cache.set_query(pipeline.clone());

    let server_addr: SocketAddr = "127.0.0.1:28553".parse().unwrap();
    let shutdown = GracefulShutdown::new();
    let inbound = UdpInbound::new(server_addr);
    let handle = inbound.start(pipeline, &shutdown).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = build_query(42, "example.com.");
    let bytes = query.encode().unwrap();

    client.send_to(&bytes, server_addr).await.unwrap();
    let mut buf = vec![0u8; 512];
    let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("response within deadline")
        .unwrap();
    let response = Message::decode(&buf[..n]).unwrap();
    assert_eq!(response.header.id, 42);
    assert_eq!(response.answers.len(), 1);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

    // Second identical query must be served from cache, not the outbound.
    client.send_to(&bytes, server_addr).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("response within deadline")
        .unwrap();
    let response = Message::decode(&buf[..n]).unwrap();
    assert_eq!(response.answers.len(), 1);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

    shutdown.shutdown().await;
    handle.abort();
}
