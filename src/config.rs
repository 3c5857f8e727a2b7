//! Configuration document: YAML-deserialized, defaults-then-overlay, validated
//! once after load. Shape follows the teacher's `config.rs` (a `Default` impl
//! holding every built-in default, plus a `validate()` pass), adapted from
//! env-var-driven to YAML-file-driven per the configuration surface.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub address: String,
    pub enabled: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            address: String::new(),
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsListenConfig {
    pub address: String,
    pub enabled: bool,
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StcpListenConfig {
    pub address: String,
    pub enabled: bool,
    /// Base64-encoded server static private key. Generated next to the
    /// config file if absent and `key` is empty.
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct InboundConfig {
    pub udp: ListenConfig,
    pub tcp: ListenConfig,
    pub tls: TlsListenConfig,
    pub stcp: StcpListenConfig,
    pub http: ListenConfig,
    pub https: TlsListenConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub rules: Vec<String>,
    pub default: Option<String>,
    pub block_aaaa: bool,
}

impl Default for RouteConfig {
    fn default() -> Self {
        RouteConfig {
            rules: Vec::new(),
            default: None,
            block_aaaa: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRuleConfig {
    pub domain: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub value: String,
    #[serde(default)]
    pub ttl: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    pub rules: Vec<RewriteRuleConfig>,
    pub min_ttl: u32,
    pub max_ttl: u32,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        RewriteConfig {
            rules: Vec::new(),
            min_ttl: 0,
            max_ttl: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_counters: u64,
    pub max_cost: u64,
    pub buffer_items: u64,
    pub ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub threads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_counters: 1_000_000,
            max_cost: 100_000,
            buffer_items: 64,
            ttl_secs: 3600,
            refresh_ttl_secs: 1800,
            threads: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub bootstrap_dns: Vec<String>,
    pub geosite: Option<String>,
    pub inbound: InboundConfig,
    pub outbound: HashMap<String, String>,
    pub route: RouteConfig,
    pub rewrite: RewriteConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            bootstrap_dns: vec!["223.5.5.5:53".to_string(), "8.8.8.8:53".to_string()],
            geosite: None,
            inbound: InboundConfig::default(),
            outbound: HashMap::new(),
            route: RouteConfig::default(),
            rewrite: RewriteConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Loads from a YAML file; missing fields fall back to `Default::default`
    /// via `#[serde(default)]` on every field in the tree, so deserializing
    /// directly into `Config` already performs the "defaults then overlay"
    /// merge described in §9 without a separate pass.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let any_inbound = self.inbound.udp.enabled
            || self.inbound.tcp.enabled
            || self.inbound.tls.enabled
            || self.inbound.stcp.enabled
            || self.inbound.http.enabled
            || self.inbound.https.enabled;
        if !any_inbound {
            return Err(AppError::config("at least one inbound must be enabled"));
        }
        if self.outbound.is_empty() {
            return Err(AppError::config("at least one outbound must be configured"));
        }
        if self.route.default.is_none() && self.route.rules.is_empty() {
            return Err(AppError::config(
                "route.default must be set, or route.rules must be non-empty",
            ));
        }
        if !matches!(
            self.log_level.as_str(),
            "debug" | "info" | "warn" | "error"
        ) {
            return Err(AppError::config(format!(
                "invalid log-level: {}",
                self.log_level
            )));
        }
        if self.cache.threads == 0 {
            return Err(AppError::config("cache.threads must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_valid() -> Config {
        let mut c = Config::default();
        c.inbound.udp.enabled = true;
        c.inbound.udp.address = "127.0.0.1:5353".to_string();
        c.outbound.insert("u1".to_string(), "udp://8.8.8.8:53".to_string());
        c.route.default = Some("u1".to_string());
        c
    }

    #[test]
    fn default_config_needs_inbound_and_outbound() {
        let c = Config::default();
        assert!(c.validate().is_err());
    }

    #[test]
    fn minimal_config_is_valid() {
        assert!(minimal_valid().validate().is_ok());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut c = minimal_valid();
        c.log_level = "verbose".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn zero_cache_threads_rejected() {
        let mut c = minimal_valid();
        c.cache.threads = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn route_default_or_rules_required() {
        let mut c = minimal_valid();
        c.route.default = None;
        assert!(c.validate().is_err());
        c.route.rules.push("geosite:cn->u1".to_string());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
inbound:
  udp:
    enabled: true
    address: "127.0.0.1:5353"
outbound:
  u1: "udp://8.8.8.8:53"
route:
  default: u1
"#;
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(c.validate().is_ok());
        assert_eq!(c.cache.ttl_secs, 3600);
    }
}
