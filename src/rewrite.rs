//! Rewriter: local overrides that synthesize authoritative answers, plus the
//! TTL clamp applied uniformly to every outgoing response. Grounded on the
//! reference's `internal/rewrite/rewrite.go`.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use tracing::warn;

use crate::config::RewriteRuleConfig;
use crate::dns::{Header, Message, Name, RData, Record, RecordClass, RecordType};
use crate::geosite::DomainMatcher;

struct CompiledRule {
    matcher: Box<dyn DomainMatcher>,
    rtype: RecordType,
    value: String,
    ttl: u32,
}

pub struct Rewriter {
    rules: Vec<CompiledRule>,
    min_ttl: u32,
    max_ttl: u32,
}

fn parse_rtype(s: &str) -> Option<RecordType> {
    match s.to_uppercase().as_str() {
        "A" => Some(RecordType::A),
        "AAAA" => Some(RecordType::AAAA),
        "TXT" => Some(RecordType::TXT),
        "CNAME" => Some(RecordType::CNAME),
        _ => None,
    }
}

impl Rewriter {
    pub fn new(rules: &[RewriteRuleConfig], min_ttl: u32, max_ttl: u32) -> Rewriter {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match parse_rtype(&rule.rtype) {
                Some(rtype) => {
                    compiled.push(CompiledRule {
                        matcher: Box::new(crate::geosite::ExactDomainMatcher::new(&rule.domain)),
                        rtype,
                        value: rule.value.clone(),
                        ttl: rule.ttl,
                    });
                }
                None => {
                    warn!(domain = %rule.domain, rtype = %rule.rtype, "unknown rewrite record type, skipping rule");
                }
            }
        }
        Rewriter {
            rules: compiled,
            min_ttl,
            max_ttl,
        }
    }

    /// Lowercases/trims the name, walks rules in order, synthesizes a
    /// single-answer reply on the first name+type match.
    pub fn rewrite(&self, name: &Name, qtype: RecordType) -> Option<Message> {
        let lowered = name.to_lowercase_fqdn();
        for rule in &self.rules {
            if rule.rtype != qtype || !rule.matcher.matches(&lowered) {
                continue;
            }
            let rdata = match build_rdata(rule.rtype, &rule.value) {
                Some(r) => r,
                None => {
                    warn!(domain = %lowered, value = %rule.value, "rewrite value failed to parse, skipping rule");
                    continue;
                }
            };
            return Some(Message {
                header: Header::default(),
                questions: vec![crate::dns::Question {
                    name: name.clone(),
                    qtype,
                    qclass: RecordClass::In,
                }],
                answers: vec![Record {
                    name: name.clone(),
                    rclass: RecordClass::In,
                    ttl: rule.ttl,
                    rdata,
                }],
                authorities: Vec::new(),
                additionals: Vec::new(),
            });
        }
        None
    }

    /// Raises every record's TTL to `min`, caps at `max`. `0` disables a side.
    pub fn clamp_ttls(&self, msg: &mut Message) {
        clamp_ttls(msg, self.min_ttl, self.max_ttl);
    }
}

pub fn clamp_ttls(msg: &mut Message, min: u32, max: u32) {
    for record in msg
        .answers
        .iter_mut()
        .chain(msg.authorities.iter_mut())
        .chain(msg.additionals.iter_mut())
    {
        if min > 0 && record.ttl < min {
            record.ttl = min;
        }
        if max > 0 && record.ttl > max {
            record.ttl = max;
        }
    }
}

fn build_rdata(rtype: RecordType, value: &str) -> Option<RData> {
    match rtype {
        RecordType::A => Ipv4Addr::from_str(value).ok().map(RData::A),
        RecordType::AAAA => Ipv6Addr::from_str(value).ok().map(RData::Aaaa),
        RecordType::TXT => Some(RData::Txt(vec![value.to_string()])),
        RecordType::CNAME => Some(RData::Cname(Name::parse(value))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_matches_name_and_type() {
        let rules = vec![RewriteRuleConfig {
            domain: "test.local".to_string(),
            rtype: "A".to_string(),
            value: "10.0.0.1".to_string(),
            ttl: 60,
        }];
        let rw = Rewriter::new(&rules, 0, 0);
        let name = Name::parse("test.local.");
        let hit = rw.rewrite(&name, RecordType::A).expect("should rewrite");
        assert_eq!(hit.answers.len(), 1);
        assert_eq!(hit.answers[0].rdata, RData::A(Ipv4Addr::new(10, 0, 0, 1)));

        assert!(rw.rewrite(&name, RecordType::AAAA).is_none());
    }

    #[test]
    fn clamp_ttls_raises_and_caps() {
        let mut msg = Message {
            header: Header::default(),
            questions: Vec::new(),
            answers: vec![
                Record {
                    name: Name::root(),
                    rclass: RecordClass::In,
                    ttl: 1,
                    rdata: RData::A(Ipv4Addr::new(1, 1, 1, 1)),
                },
                Record {
                    name: Name::root(),
                    rclass: RecordClass::In,
                    ttl: 10_000,
                    rdata: RData::A(Ipv4Addr::new(1, 1, 1, 1)),
                },
            ],
            authorities: Vec::new(),
            additionals: Vec::new(),
        };
        clamp_ttls(&mut msg, 30, 3600);
        assert_eq!(msg.answers[0].ttl, 30);
        assert_eq!(msg.answers[1].ttl, 3600);
    }
}
