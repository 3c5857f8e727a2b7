//! Domain matcher abstraction. The real geosite database format and its
//! matcher are treated as an external collaborator (§1) — this module
//! supplies the trait the router depends on plus one production-shaped
//! implementation (suffix/exact matching over a fixed domain set), which is
//! what a geosite category matcher reduces to at query time per the
//! reference's own suffix-boundary comparison.

use std::collections::HashSet;

/// A compiled domain predicate used by routing and rewrite rules.
pub trait DomainMatcher: Send + Sync {
    fn matches(&self, name: &str) -> bool;
}

/// Matches a single domain exactly (already lowercased, no trailing dot).
pub struct ExactDomainMatcher {
    domain: String,
}

impl ExactDomainMatcher {
    pub fn new(domain: &str) -> Self {
        ExactDomainMatcher {
            domain: domain.trim_end_matches('.').to_lowercase(),
        }
    }
}

impl DomainMatcher for ExactDomainMatcher {
    fn matches(&self, name: &str) -> bool {
        name == self.domain
    }
}

/// Matches a name that is exactly one of a fixed set of domains, or a strict
/// subdomain of one of them (`weibo.com` matches `s.weibo.com` but
/// `evilweibo.com` does not — suffix matching always anchors on the label
/// boundary).
pub struct SetDomainMatcher {
    domains: HashSet<String>,
}

impl SetDomainMatcher {
    pub fn new(domains: impl IntoIterator<Item = String>) -> Self {
        SetDomainMatcher {
            domains: domains
                .into_iter()
                .map(|d| d.trim_end_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// Loads from a `geosite:<category>` rule string's category name. The
    /// real geosite `.dat` format is out of scope; this placeholder treats
    /// the category name itself as a literal domain (so `geosite:example.com`
    /// works as a single-domain rule, and real category data can later be
    /// substituted behind the same trait).
    pub fn from_category_placeholder(category: &str) -> Self {
        SetDomainMatcher::new(std::iter::once(category.to_string()))
    }
}

impl DomainMatcher for SetDomainMatcher {
    fn matches(&self, name: &str) -> bool {
        if self.domains.contains(name) {
            return true;
        }
        self.domains
            .iter()
            .any(|d| name.ends_with(d) && name.as_bytes()[name.len() - d.len() - 1] == b'.')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_matcher_matches_subdomains_on_label_boundary() {
        let m = SetDomainMatcher::new(["weibo.com".to_string()]);
        assert!(m.matches("weibo.com"));
        assert!(m.matches("s.weibo.com"));
        assert!(!m.matches("evilweibo.com"));
        assert!(!m.matches("github.com"));
    }
}
