//! Query pipeline (`Exchange`): the sole mediator between inbounds and
//! outbounds. Grounded on the reference's `internal/route/router.go`
//! (`Exchange`/`Resolve`), restructured around the tagged `ResponseSource`
//! provenance marker described in the design notes rather than branching on
//! source at each call site.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::{Cache, QueryResolver};
use crate::dns::{Message, Name, RecordType};
use crate::error::Result;
use crate::rewrite::Rewriter;
use crate::router::Router;

/// Provenance of a reply, driving uniform post-processing and logging.
#[derive(Debug, Clone)]
pub enum ResponseSource {
    Validator,
    Rewrite,
    Cache,
    Upstream(String),
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseSource::Validator => write!(f, "validator"),
            ResponseSource::Rewrite => write!(f, "rewrite"),
            ResponseSource::Cache => write!(f, "cache"),
            ResponseSource::Upstream(tag) => write!(f, "upstream:{tag}"),
        }
    }
}

pub struct Pipeline {
    router: Arc<Router>,
    rewriter: Arc<Rewriter>,
    cache: Arc<Cache>,
}

impl Pipeline {
    pub fn new(router: Arc<Router>, rewriter: Arc<Rewriter>, cache: Arc<Cache>) -> Arc<Pipeline> {
        Arc::new(Pipeline {
            router,
            rewriter,
            cache,
        })
    }

    /// Runs the full 10-step algorithm for one inbound request. Never
    /// returns an error: every failure is translated into a DNS response.
    pub async fn exchange(
        &self,
        request: &Message,
        inbound_tag: &str,
        client_ip: &str,
    ) -> Message {
        // Step 1: validation.
        if let Some(response) = self.router.validate(request) {
            self.log_exchange(request, &ResponseSource::Validator, &response, None);
            return response;
        }

        let question = &request.questions[0];

        // Step 2: rewrite.
        if let Some(mut response) = self.rewriter.rewrite(&question.name, question.qtype) {
            response.set_reply(request);
            self.log_exchange(request, &ResponseSource::Rewrite, &response, None);
            return response;
        }

        // Step 3: cache.
        if let Some(entry) = self
            .cache
            .get_and_update(&question.name, question.qtype)
        {
            let mut response = entry.message.clone();
            response.set_reply(request);
            self.log_exchange(request, &ResponseSource::Cache, &response, None);
            return response;
        }

        // Step 4: route.
        let outbound = match self.router.route(&question.name) {
            Some(ob) => ob,
            None => {
                let response = Message::servfail(request);
                warn!(
                    name = %question.name,
                    qtype = %question.qtype,
                    "no outbound resolved for query, no default configured"
                );
                return response;
            }
        };
        let tag = outbound.tag().to_string();

        // Step 5: fresh upstream request.
        let upstream_request = Message::new_query(request.header.id, &question.name, question.qtype);

        // Step 6: exchange.
        let (mut upstream_response, rtt) = match outbound.exchange(&upstream_request).await {
            Ok((msg, rtt)) => (msg, Some(rtt)),
            Err(e) => {
                warn!(tag = %tag, name = %question.name, qtype = %question.qtype, error = %e, "upstream exchange failed");
                let response = Message::servfail(request);
                self.log_exchange(request, &ResponseSource::Upstream(tag), &response, None);
                return response;
            }
        };

        // Step 7: filter AAAA if blocking is enabled.
        if self.router.blocks_aaaa() {
            upstream_response
                .answers
                .retain(|r| r.rtype() != RecordType::AAAA);
        }

        // Step 8: reply shaping.
        upstream_response.set_reply(request);
        self.rewriter.clamp_ttls(&mut upstream_response);

        // Step 9: cache on success only.
        if upstream_response.header.rcode == crate::dns::Rcode::NoError {
            self.cache
                .set(&question.name, question.qtype, upstream_response.clone());
        }

        self.log_exchange(
            request,
            &ResponseSource::Upstream(tag),
            &upstream_response,
            rtt,
        );
        let _ = client_ip;
        upstream_response
    }

    fn log_exchange(
        &self,
        request: &Message,
        source: &ResponseSource,
        response: &Message,
        rtt: Option<std::time::Duration>,
    ) {
        let name = request
            .questions
            .first()
            .map(|q| q.name.to_lowercase_fqdn())
            .unwrap_or_default();
        let qtype = request
            .questions
            .first()
            .map(|q| q.qtype)
            .unwrap_or(RecordType::A);
        info!(
            name = %name,
            qtype = %qtype,
            source = %source,
            rcode = %response.header.rcode,
            rtt_ms = rtt.map(|d| d.as_millis() as u64),
            "exchange complete"
        );
    }
}

/// The cache's refresh workers call back into the pipeline's router/outbound
/// path to fetch a fresh answer for a stale key, per the "pipeline→cache→
/// pipeline back-reference" design note. Deliberately bypasses validate/
/// rewrite/cache steps — those only make sense for a fresh inbound request.
#[async_trait]
impl QueryResolver for Pipeline {
    async fn resolve(&self, name: &Name, qtype: RecordType) -> Result<Message> {
        let outbound = self.router.route(name).ok_or_else(|| {
            crate::error::AppError::config(format!("no outbound available to refresh {name}"))
        })?;
        let request = Message::new_query(rand::random(), name, qtype);
        let (mut response, _rtt) = outbound.exchange(&request).await?;
        self.rewriter.clamp_ttls(&mut response);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::bootstrap::Bootstrap;
    use crate::cache::Cache;
    use crate::config::{CacheConfig, RewriteRuleConfig};
    use crate::dns::{Header, Question, RData, Record, RecordClass};
    use crate::outbound::{Outbound, OutboundRegistry};

    use super::*;

    struct MockOutbound {
        tag: String,
        calls: AtomicUsize,
        answer: Ipv4Addr,
        answer_ttl: u32,
        fail: bool,
    }

    #[async_trait]
    impl Outbound for MockOutbound {
        fn tag(&self) -> &str {
            &self.tag
        }

        async fn exchange(&self, request: &Message) -> Result<(Message, Duration)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::AppError::decode("mock upstream failure"));
            }
            let question = &request.questions[0];
            let mut response = request.clone();
            response.header.qr = true;
            response.header.rcode = crate::dns::Rcode::NoError;
            response.answers.push(Record {
                name: question.name.clone(),
                rclass: RecordClass::In,
                ttl: self.answer_ttl,
                rdata: RData::A(self.answer),
            });
            Ok((response, Duration::from_millis(1)))
        }

        async fn close(&self) {}
    }

    fn query(name: &str, qtype: RecordType) -> Message {
        Message {
            header: Header {
                id: 7,
                rd: true,
                ..Header::default()
            },
            questions: vec![Question {
                name: Name::parse(name),
                qtype,
                qclass: RecordClass::In,
            }],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    fn test_cache(ttl_secs: u64, refresh_ttl_secs: u64) -> Arc<Cache> {
        Cache::new(&CacheConfig {
            max_counters: 10_000,
            max_cost: 1_000,
            buffer_items: 64,
            ttl_secs,
            refresh_ttl_secs,
            threads: 1,
        })
    }

    async fn single_upstream_harness(
        mock: Arc<MockOutbound>,
        block_aaaa: bool,
        ttl_secs: u64,
        refresh_ttl_secs: u64,
    ) -> (Arc<Pipeline>, Arc<Cache>) {
        let registry = OutboundRegistry::new(Bootstrap::new());
        registry.insert("u1", mock.clone() as Arc<dyn Outbound>);
        let router = Arc::new(
            Router::new(&[], Some("u1"), block_aaaa, registry).expect("router builds"),
        );
        let rewriter = Arc::new(Rewriter::new(&[], 0, 0));
        let cache = test_cache(ttl_secs, refresh_ttl_secs);
        let pipeline = Pipeline::new(router, rewriter, cache.clone());
        cache.set_query(pipeline.clone());
        (pipeline, cache)
    }

    #[tokio::test]
    async fn cache_roundtrip_avoids_second_upstream_call() {
        let mock = Arc::new(MockOutbound {
            tag: "u1".to_string(),
            calls: AtomicUsize::new(0),
            answer: Ipv4Addr::new(93, 184, 216, 34),
            answer_ttl: 120,
            fail: false,
        });
        let (pipeline, _cache) = single_upstream_harness(mock.clone(), false, 60, 30).await;

        let first = pipeline
            .exchange(&query("example.com.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(first.header.rcode, crate::dns::Rcode::NoError);
        assert_eq!(first.answers.len(), 1);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

        let second = pipeline
            .exchange(&query("example.com.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(second.answers.len(), 1);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rewrite_shadows_upstream_and_is_type_specific() {
        let mock = Arc::new(MockOutbound {
            tag: "u1".to_string(),
            calls: AtomicUsize::new(0),
            answer: Ipv4Addr::new(1, 2, 3, 4),
            answer_ttl: 60,
            fail: false,
        });
        let registry = OutboundRegistry::new(Bootstrap::new());
        registry.insert("u1", mock.clone() as Arc<dyn Outbound>);
        let router = Arc::new(Router::new(&[], Some("u1"), false, registry).unwrap());
        let rewriter = Arc::new(Rewriter::new(
            &[RewriteRuleConfig {
                domain: "test.local".to_string(),
                rtype: "A".to_string(),
                value: "10.0.0.1".to_string(),
                ttl: 60,
            }],
            0,
            0,
        ));
        let cache = test_cache(60, 30);
        let pipeline = Pipeline::new(router, rewriter, cache.clone());
        cache.set_query(pipeline.clone());

        let response = pipeline
            .exchange(&query("test.local.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert!(response.header.aa);
        assert_eq!(response.answers.len(), 1);
        assert!(matches!(response.answers[0].rdata, RData::A(ip) if ip == Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

        let aaaa = pipeline
            .exchange(&query("test.local.", RecordType::AAAA), "udp", "127.0.0.1")
            .await;
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        let _ = aaaa;
    }

    #[tokio::test]
    async fn aaaa_blocking_drops_aaaa_from_mixed_response() {
        struct MixedOutbound;
        #[async_trait]
        impl Outbound for MixedOutbound {
            fn tag(&self) -> &str {
                "u1"
            }
            async fn exchange(&self, request: &Message) -> Result<(Message, Duration)> {
                let mut response = request.clone();
                response.header.qr = true;
                response.header.rcode = crate::dns::Rcode::NoError;
                response.answers.push(Record {
                    name: request.questions[0].name.clone(),
                    rclass: RecordClass::In,
                    ttl: 60,
                    rdata: RData::A(Ipv4Addr::new(5, 6, 7, 8)),
                });
                response.answers.push(Record {
                    name: request.questions[0].name.clone(),
                    rclass: RecordClass::In,
                    ttl: 60,
                    rdata: RData::Aaaa(std::net::Ipv6Addr::LOCALHOST),
                });
                Ok((response, Duration::from_millis(1)))
            }
            async fn close(&self) {}
        }

        let registry = OutboundRegistry::new(Bootstrap::new());
        registry.insert("u1", Arc::new(MixedOutbound) as Arc<dyn Outbound>);
        let router = Arc::new(Router::new(&[], Some("u1"), true, registry).unwrap());
        let rewriter = Arc::new(Rewriter::new(&[], 0, 0));
        let cache = test_cache(60, 30);
        let pipeline = Pipeline::new(router, rewriter, cache.clone());
        cache.set_query(pipeline.clone());

        // AAAA queries are rejected by validation before reaching the outbound.
        let aaaa_response = pipeline
            .exchange(&query("example.com.", RecordType::AAAA), "udp", "127.0.0.1")
            .await;
        assert_eq!(aaaa_response.header.rcode, crate::dns::Rcode::NxDomain);

        let a_response = pipeline
            .exchange(&query("example.com.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(a_response.answers.len(), 1);
        assert_eq!(a_response.answers[0].rtype(), RecordType::A);
    }

    #[tokio::test]
    async fn upstream_failure_yields_servfail_and_is_never_cached() {
        let mock = Arc::new(MockOutbound {
            tag: "u1".to_string(),
            calls: AtomicUsize::new(0),
            answer: Ipv4Addr::new(9, 9, 9, 9),
            answer_ttl: 60,
            fail: true,
        });
        let (pipeline, _cache) = single_upstream_harness(mock.clone(), false, 60, 30).await;

        let first = pipeline
            .exchange(&query("foo.example.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(first.header.rcode, crate::dns::Rcode::ServFail);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);

        let second = pipeline
            .exchange(&query("foo.example.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(second.header.rcode, crate::dns::Rcode::ServFail);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_entry_is_served_and_triggers_background_refresh() {
        let mock = Arc::new(MockOutbound {
            tag: "u1".to_string(),
            calls: AtomicUsize::new(0),
            answer: Ipv4Addr::new(2, 2, 2, 2),
            answer_ttl: 60,
            fail: false,
        });
        let (pipeline, cache) = single_upstream_harness(mock.clone(), false, 60, 1).await;
        cache.start();

        let first = pipeline
            .exchange(&query("stale.example.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.answers.len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let second = pipeline
            .exchange(&query("stale.example.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(second.answers.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mock.calls.load(Ordering::SeqCst) >= 2);

        cache.close().await;
    }

    #[tokio::test]
    async fn rule_routing_picks_matching_outbound_over_default() {
        let cn = Arc::new(MockOutbound {
            tag: "cn".to_string(),
            calls: AtomicUsize::new(0),
            answer: Ipv4Addr::new(1, 1, 1, 1),
            answer_ttl: 60,
            fail: false,
        });
        let intl = Arc::new(MockOutbound {
            tag: "intl".to_string(),
            calls: AtomicUsize::new(0),
            answer: Ipv4Addr::new(2, 2, 2, 2),
            answer_ttl: 60,
            fail: false,
        });
        let registry = OutboundRegistry::new(Bootstrap::new());
        registry.insert("cn", cn.clone() as Arc<dyn Outbound>);
        registry.insert("intl", intl.clone() as Arc<dyn Outbound>);
        let router = Arc::new(
            Router::new(
                &["geosite:weibo.com->cn".to_string()],
                Some("intl"),
                false,
                registry,
            )
            .unwrap(),
        );
        let rewriter = Arc::new(Rewriter::new(&[], 0, 0));
        let cache = test_cache(60, 30);
        let pipeline = Pipeline::new(router, rewriter, cache.clone());
        cache.set_query(pipeline.clone());

        let matched = pipeline
            .exchange(&query("weibo.com.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(matched.answers.len(), 1);
        assert_eq!(cn.calls.load(Ordering::SeqCst), 1);
        assert_eq!(intl.calls.load(Ordering::SeqCst), 0);

        let fallthrough = pipeline
            .exchange(&query("github.com.", RecordType::A), "udp", "127.0.0.1")
            .await;
        assert_eq!(fallthrough.answers.len(), 1);
        assert_eq!(cn.calls.load(Ordering::SeqCst), 1);
        assert_eq!(intl.calls.load(Ordering::SeqCst), 1);
    }
}
