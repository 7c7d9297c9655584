//! Configuration surface: named, validated options only.
//!
//! Every field has a default so a partial TOML file is enough:
//!
//! ```toml
//! [policy]
//! default_mode = "hardened"
//!
//! [tor]
//! guard_rotation_threshold = 3
//! transport_preference = ["obfs4", "snowflake"]
//! ```

use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogLevel;
use crate::policy::EgressMode;
use crate::tor::PluggableTransport;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    pub policy: PolicySettings,
    pub tor: TorSettings,
    pub dns: DnsSettings,
    pub leak: LeakSettings,
    pub logging: LoggingSettings,
}

impl EgressConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EgressConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()?;
        self.tor.validate()?;
        self.dns.validate()?;
        self.leak.validate()
    }
}

/// Egress Policy Engine and Connection Broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub default_mode: EgressMode,
    /// Rewrite plaintext port 80 to 443 in Standard mode. Always on otherwise.
    pub https_upgrade: bool,
    /// Refuse Hardened-mode requests from containers without a proxy.
    pub require_proxy_in_hardened: bool,
    /// How long a request may wait for Tor bootstrap before `EgressUnavailable`.
    pub admission_timeout_ms: u64,
    pub max_queued_requests: usize,
    pub connect_timeout_ms: u64,
    pub webrtc: WebRtcSettings,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            default_mode: EgressMode::Standard,
            https_upgrade: true,
            require_proxy_in_hardened: false,
            admission_timeout_ms: 30_000,
            max_queued_requests: 256,
            connect_timeout_ms: 15_000,
            webrtc: WebRtcSettings::default(),
        }
    }
}

impl PolicySettings {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.admission_timeout_ms == 0 {
            return Err(invalid("policy.admission_timeout_ms", "must be > 0"));
        }
        if self.max_queued_requests == 0 {
            return Err(invalid("policy.max_queued_requests", "must be > 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("policy.connect_timeout_ms", "must be > 0"));
        }
        self.webrtc.validate()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IcePolicy {
    /// Only TURN relay candidates; the local address never reaches a peer.
    #[default]
    RelayOnly,
    /// STUN server-reflexive gathering is also allowed, against the STUN allowlist.
    All,
}

/// WebRTC hygiene for protected modes. Entries are ICE server URLs such as
/// `turn:turn.example.org:3478` or `stun:stun.example.org`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    pub ice_policy: IcePolicy,
    /// Hide host candidates behind mDNS names.
    pub mdns_enabled: bool,
    pub stun_allowlist: Vec<String>,
    pub turn_allowlist: Vec<String>,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            ice_policy: IcePolicy::RelayOnly,
            mdns_enabled: true,
            stun_allowlist: Vec::new(),
            turn_allowlist: Vec::new(),
        }
    }
}

impl WebRtcSettings {
    pub fn candidate_allowed(&self, url: &str) -> bool {
        self.stun_allowlist.iter().chain(&self.turn_allowlist).any(|entry| entry == url)
    }

    /// Whether `host:port` is an allowlisted TURN relay.
    pub fn relay_allowed(&self, host: &str, port: u16) -> bool {
        self.turn_allowlist
            .iter()
            .filter_map(|entry| ice_server(entry))
            .any(|(h, p)| h.eq_ignore_ascii_case(host) && p == port)
    }

    /// Whether `host:port` may be used for server-reflexive gathering.
    pub fn stun_allowed(&self, host: &str, port: u16) -> bool {
        self.stun_allowlist
            .iter()
            .filter_map(|entry| ice_server(entry))
            .any(|(h, p)| h.eq_ignore_ascii_case(host) && p == port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.stun_allowlist {
            match ice_server(entry) {
                Some(_) if entry.starts_with("stun") => {}
                _ => return Err(invalid("policy.webrtc.stun_allowlist", format!("`{entry}` is not a stun: URL"))),
            }
        }
        for entry in &self.turn_allowlist {
            match ice_server(entry) {
                Some(_) if entry.starts_with("turn") => {}
                _ => return Err(invalid("policy.webrtc.turn_allowlist", format!("`{entry}` is not a turn: URL"))),
            }
        }
        Ok(())
    }
}

/// `scheme:host[:port][?transport=..]` to `(host, port)`, RFC 7064/7065 defaults.
fn ice_server(url: &str) -> Option<(&str, u16)> {
    let (scheme, rest) = url.split_once(':')?;
    let default_port = match scheme {
        "stun" | "turn" => 3478,
        "stuns" | "turns" => 5349,
        _ => return None,
    };
    let authority = rest.split('?').next().unwrap_or(rest);
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Tor Circuit Controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorSettings {
    pub bootstrap_timeout_secs: u64,
    /// Fingerprintable errors within the window that force a guard rotation.
    pub guard_rotation_threshold: u32,
    pub fingerprint_window_secs: u64,
    pub circuit_idle_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub build_max_attempts: u32,
    pub build_backoff_base_ms: u64,
    pub build_backoff_max_ms: u64,
    /// Tried in order; an empty list bootstraps without a pluggable transport.
    pub transport_preference: Vec<PluggableTransport>,
    pub maintenance_interval_secs: u64,
}

impl Default for TorSettings {
    fn default() -> Self {
        Self {
            bootstrap_timeout_secs: 120,
            guard_rotation_threshold: 3,
            fingerprint_window_secs: 600,
            circuit_idle_timeout_secs: 600,
            build_timeout_secs: 60,
            build_max_attempts: 4,
            build_backoff_base_ms: 250,
            build_backoff_max_ms: 8_000,
            transport_preference: vec![PluggableTransport::Obfs4, PluggableTransport::Snowflake],
            maintenance_interval_secs: 30,
        }
    }
}

impl TorSettings {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn fingerprint_window(&self) -> Duration {
        Duration::from_secs(self.fingerprint_window_secs)
    }

    pub fn circuit_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_idle_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .build_backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.build_backoff_max_ms);
        Duration::from_millis(delay)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.guard_rotation_threshold == 0 {
            return Err(invalid("tor.guard_rotation_threshold", "must be >= 1"));
        }
        if self.build_max_attempts == 0 {
            return Err(invalid("tor.build_max_attempts", "must be >= 1"));
        }
        for (field, value) in [
            ("tor.bootstrap_timeout_secs", self.bootstrap_timeout_secs),
            ("tor.fingerprint_window_secs", self.fingerprint_window_secs),
            ("tor.circuit_idle_timeout_secs", self.circuit_idle_timeout_secs),
            ("tor.build_timeout_secs", self.build_timeout_secs),
            ("tor.maintenance_interval_secs", self.maintenance_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be > 0"));
            }
        }
        if self.build_backoff_max_ms < self.build_backoff_base_ms {
            return Err(invalid(
                "tor.build_backoff_max_ms",
                "must be >= tor.build_backoff_base_ms",
            ));
        }
        let mut seen = HashSet::new();
        for transport in &self.transport_preference {
            if !seen.insert(transport) {
                return Err(invalid(
                    "tor.transport_preference",
                    format!("`{transport}` listed twice"),
                ));
            }
        }
        Ok(())
    }
}

/// DNS Resolution Layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub doh_endpoint: String,
    /// `host:port` of the DoT resolver; empty disables DoT fallback.
    pub dot_endpoint: String,
    pub dot_tls_name: String,
    pub ech_enabled: bool,
    /// DoH endpoints known to accept ECH without probing.
    pub ech_endpoints: Vec<String>,
    /// Addresses the encrypted resolvers live on; the leak harness expects them.
    pub resolver_addresses: Vec<IpAddr>,
    pub query_timeout_ms: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            doh_endpoint: "https://1.1.1.1/dns-query".to_string(),
            dot_endpoint: "1.1.1.1:853".to_string(),
            dot_tls_name: "cloudflare-dns.com".to_string(),
            ech_enabled: true,
            ech_endpoints: Vec::new(),
            resolver_addresses: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
            ],
            query_timeout_ms: 5_000,
        }
    }
}

impl DnsSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.doh_endpoint.starts_with("https://") {
            return Err(invalid("dns.doh_endpoint", "must be an https:// URL"));
        }
        let url = reqwest::Url::parse(&self.doh_endpoint).map_err(|e| invalid("dns.doh_endpoint", e.to_string()))?;
        let named_host = url
            .host_str()
            .is_some_and(|host| host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_err());
        if named_host && self.resolver_addresses.is_empty() {
            return Err(invalid(
                "dns.doh_endpoint",
                "a hostname endpoint needs dns.resolver_addresses to pin it",
            ));
        }
        if !self.dot_endpoint.is_empty() && self.dot_tls_name.is_empty() {
            return Err(invalid("dns.dot_tls_name", "required when dns.dot_endpoint is set"));
        }
        if self.query_timeout_ms == 0 {
            return Err(invalid("dns.query_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// Leak Detection Harness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakSettings {
    pub sample_interval_secs: u64,
    pub sample_window_secs: u64,
    /// How long a broker-issued destination stays on the expected-path ledger.
    pub expected_path_ttl_secs: u64,
}

impl Default for LeakSettings {
    fn default() -> Self {
        Self {
            sample_interval_secs: 60,
            sample_window_secs: 10,
            expected_path_ttl_secs: 900,
        }
    }
}

impl LeakSettings {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_secs(self.sample_window_secs)
    }

    pub fn expected_path_ttl(&self) -> Duration {
        Duration::from_secs(self.expected_path_ttl_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_secs == 0 || self.sample_window_secs == 0 {
            return Err(invalid("leak.sample_interval_secs", "sampling interval and window must be > 0"));
        }
        if self.sample_window_secs > self.sample_interval_secs {
            return Err(invalid(
                "leak.sample_window_secs",
                "window must not exceed the sampling interval",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub json: bool,
}
