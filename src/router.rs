//! Router: ordered rule evaluation, request validation, default fallback.
//! Grounded on the reference's `internal/route/router.go`
//! (`validateRequest`, `isForbiddenARPA`, `shouldRecurse`, `Route`).

use std::sync::Arc;

use crate::dns::{Message, Name, RecordType};
use crate::error::{AppError, Result};
use crate::geosite::DomainMatcher;
use crate::outbound::{Outbound, OutboundRegistry};

struct Rule {
    matcher: Box<dyn DomainMatcher>,
    outbound_tag: String,
}

pub struct Router {
    rules: Vec<Rule>,
    default_tag: String,
    registry: Arc<OutboundRegistry>,
    block_aaaa: bool,
}

/// Parses a `route.rules` entry of the shape `geosite:<category>->tag` or
/// `domain:<name>->tag` into (matcher, outbound tag). The geosite category
/// name is treated as a literal single-domain matcher per the out-of-scope
/// note on the geosite file format (§1, §4.5).
fn parse_rule(raw: &str) -> Result<(Box<dyn DomainMatcher>, String)> {
    let (selector, tag) = raw
        .split_once("->")
        .ok_or_else(|| AppError::config(format!("malformed route rule: {raw}")))?;
    let tag = tag.trim().to_string();
    let selector = selector.trim();

    if let Some(category) = selector.strip_prefix("geosite:") {
        Ok((
            Box::new(crate::geosite::SetDomainMatcher::from_category_placeholder(
                category,
            )),
            tag,
        ))
    } else if let Some(domain) = selector.strip_prefix("domain:") {
        Ok((Box::new(crate::geosite::ExactDomainMatcher::new(domain)), tag))
    } else {
        Err(AppError::config(format!(
            "unrecognized route rule selector: {selector}"
        )))
    }
}

impl Router {
    pub fn new(
        rule_strings: &[String],
        default_tag: Option<&str>,
        block_aaaa: bool,
        registry: Arc<OutboundRegistry>,
    ) -> Result<Router> {
        let mut rules = Vec::with_capacity(rule_strings.len());
        for raw in rule_strings {
            let (matcher, outbound_tag) = parse_rule(raw)?;
            if registry.get(&outbound_tag).is_none() {
                return Err(AppError::config(format!(
                    "route rule references unknown outbound: {outbound_tag}"
                )));
            }
            rules.push(Rule {
                matcher,
                outbound_tag,
            });
        }

        let default_tag = match default_tag {
            Some(tag) => tag.to_string(),
            None => rules
                .first()
                .map(|r| r.outbound_tag.clone())
                .ok_or_else(|| {
                    AppError::config("no route.default configured and no rules to infer one from")
                })?,
        };

        if registry.get(&default_tag).is_none() {
            return Err(AppError::config(format!(
                "route default references unknown outbound: {default_tag}"
            )));
        }

        Ok(Router {
            rules,
            default_tag,
            registry,
            block_aaaa,
        })
    }

    pub fn blocks_aaaa(&self) -> bool {
        self.block_aaaa
    }

    /// First matching rule's outbound, else the default. Returns `None` only
    /// if the registry has lost the outbound since construction.
    pub fn route(&self, name: &Name) -> Option<Arc<dyn Outbound>> {
        let lowered = name.to_lowercase_fqdn();
        for rule in &self.rules {
            if rule.matcher.matches(&lowered) {
                return self.registry.get(&rule.outbound_tag);
            }
        }
        self.registry.get(&self.default_tag)
    }

    /// Pre-baked replies for malformed/forbidden requests, per the policy
    /// table in §4.5. Returns `None` when the request should proceed.
    pub fn validate(&self, request: &Message) -> Option<Message> {
        if request.questions.is_empty() {
            return Some(Message::nxdomain(request));
        }
        if request.questions.len() > 1 {
            return Some(Message::servfail(request));
        }
        let q = &request.questions[0];
        if q.qtype == RecordType::Any {
            return Some(Message::not_implemented(request));
        }
        if q.qtype == RecordType::AAAA && self.block_aaaa {
            return Some(Message::nxdomain(request));
        }
        if q.qtype == RecordType::PTR {
            return Some(Message::nxdomain(request));
        }
        None
    }

    /// True when no answer matches `qtype` but a CNAME is present.
    /// Diagnostics only; not acted on by the pipeline.
    pub fn should_recurse(response: &Message, qtype: RecordType) -> bool {
        let has_qtype = response.answers.iter().any(|r| r.rtype() == qtype);
        let has_cname = response
            .answers
            .iter()
            .any(|r| r.rtype() == RecordType::CNAME);
        !has_qtype && has_cname
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrap;
    use crate::dns::{Header, Question, RecordClass};

    fn empty_request(qtype: RecordType, n_questions: usize) -> Message {
        Message {
            header: Header {
                id: 42,
                rd: true,
                ..Header::default()
            },
            questions: (0..n_questions)
                .map(|_| Question {
                    name: Name::parse("example.com."),
                    qtype,
                    qclass: RecordClass::In,
                })
                .collect(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    fn router_with(block_aaaa: bool) -> Router {
        let registry = OutboundRegistry::new(Bootstrap::new());
        // Registry needs at least an entry for validation to pass; construct
        // without calling `add` (no network needed) by faking a default tag
        // through an empty rule list and a manual registry insert bypass is
        // not exposed, so these tests only exercise `validate`, which never
        // touches the registry.
        Router {
            rules: Vec::new(),
            default_tag: "u1".to_string(),
            registry,
            block_aaaa,
        }
    }

    #[test]
    fn zero_questions_is_nxdomain() {
        let router = router_with(false);
        let req = empty_request(RecordType::A, 0);
        let resp = router.validate(&req).unwrap();
        assert_eq!(resp.header.rcode, crate::dns::Rcode::NxDomain);
    }

    #[test]
    fn multi_question_is_servfail() {
        let router = router_with(false);
        let req = empty_request(RecordType::A, 2);
        let resp = router.validate(&req).unwrap();
        assert_eq!(resp.header.rcode, crate::dns::Rcode::ServFail);
    }

    #[test]
    fn any_qtype_is_notimplemented_with_edns() {
        let router = router_with(false);
        let req = empty_request(RecordType::Any, 1);
        let resp = router.validate(&req).unwrap();
        assert_eq!(resp.header.rcode, crate::dns::Rcode::NotImp);
        assert_eq!(resp.additionals.len(), 1);
    }

    #[test]
    fn ptr_is_always_nxdomain() {
        let router = router_with(false);
        let req = empty_request(RecordType::PTR, 1);
        let resp = router.validate(&req).unwrap();
        assert_eq!(resp.header.rcode, crate::dns::Rcode::NxDomain);
    }

    #[test]
    fn aaaa_blocked_only_when_enabled() {
        let blocking = router_with(true);
        let not_blocking = router_with(false);
        let req = empty_request(RecordType::AAAA, 1);
        assert!(blocking.validate(&req).is_some());
        assert!(not_blocking.validate(&req).is_none());
    }

    #[test]
    fn should_recurse_detects_cname_without_matching_answer() {
        use crate::dns::{RData, Record, RecordClass};
        let msg = Message {
            header: Header::default(),
            questions: Vec::new(),
            answers: vec![Record {
                name: Name::parse("example.com."),
                rclass: RecordClass::In,
                ttl: 60,
                rdata: RData::Cname(Name::parse("alias.example.com.")),
            }],
            authorities: Vec::new(),
            additionals: Vec::new(),
        };
        assert!(Router::should_recurse(&msg, RecordType::A));
        assert!(!Router::should_recurse(&msg, RecordType::CNAME));
    }
}
