//! Domain names and the question section.

use super::enums::{RecordClass, RecordType};

/// A domain name as a sequence of labels, root-relative (no trailing empty
/// label stored). `example.com.` becomes `["example", "com"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Name(pub Vec<String>);

impl Name {
    pub fn root() -> Self {
        Name(Vec::new())
    }

    /// Parses a dotted name, trimming one trailing dot if present and
    /// dropping any other empty labels a caller might accidentally pass.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.strip_suffix('.').unwrap_or(s);
        if trimmed.is_empty() {
            return Name::root();
        }
        Name(trimmed.split('.').map(|l| l.to_string()).collect())
    }

    /// FQDN form used as the cache/router matching key: lowercased, no
    /// trailing dot.
    pub fn to_lowercase_fqdn(&self) -> String {
        self.0.join(".").to_lowercase()
    }

    /// Wire/display form with the trailing dot DNS convention expects.
    pub fn to_dotted(&self) -> String {
        if self.0.is_empty() {
            ".".to_string()
        } else {
            let mut s = self.0.join(".");
            s.push('.');
            s
        }
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_dotted())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}
