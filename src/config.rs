//! Transfer engine configuration.
//!
//! The embedding provider hands options through as string pairs keyed like
//! `ist.recv_addr`; deployments that use a config file get the same fields
//! as a TOML table. Address resolution implements the documented fallback
//! chain: an unset receive address falls back to the node's base host, a
//! missing scheme to `tcp://` (`ssl://` once a TLS key is configured), and
//! a missing port to the group transport port plus one.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tls::{self, TlsIdentity, TlsSetupError};

/// String key for the advertised receive address.
pub const RECV_ADDR_KEY: &str = "ist.recv_addr";
/// String key for the local bind address.
pub const RECV_BIND_KEY: &str = "ist.recv_bind";
/// String key for retaining key annotations in streamed write-sets.
pub const KEEP_KEYS_KEY: &str = "ist.keep_keys";

const DEFAULT_BASE_PORT: u16 = 4567;
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub const RECV_ADDR_ENV: &str = "CATCHUP_RECV_ADDR";
pub const RECV_BIND_ENV: &str = "CATCHUP_RECV_BIND";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine receive address: '{RECV_ADDR_KEY}' not set")]
    AddrNotSet,
    #[error("unsupported scheme '{0}'")]
    BadScheme(String),
    #[error("malformed address '{0}'")]
    BadAddress(String),
    #[error("malformed port in '{0}'")]
    BadPort(String),
    #[error("invalid value '{value}' for {key}")]
    BadValue { key: String, value: String },
    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),
    #[error("tls requested but no certificate/key configured")]
    TlsIdentityMissing,
    #[error("failed to load tls identity: {0}")]
    TlsIdentity(#[from] TlsSetupError),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Tcp,
    Ssl,
}

impl Scheme {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "tcp" => Ok(Scheme::Tcp),
            "ssl" => Ok(Scheme::Ssl),
            other => Err(ConfigError::BadScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Tcp => f.write_str("tcp"),
            Scheme::Ssl => f.write_str("ssl"),
        }
    }
}

/// A resolved `scheme://host:port` endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `[scheme://]host[:port]`. IPv6 hosts use brackets. A missing
    /// scheme falls back to `default_scheme`; a missing port to
    /// `default_port` when given, otherwise the address is rejected.
    pub fn parse(
        raw: &str,
        default_scheme: Scheme,
        default_port: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (Scheme::parse(scheme)?, rest),
            None => (default_scheme, raw),
        };

        let (host, port_str) = if let Some(v6) = rest.strip_prefix('[') {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| ConfigError::BadAddress(raw.to_string()))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(ConfigError::BadAddress(raw.to_string())),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(ConfigError::BadAddress(raw.to_string()));
        }

        let port = match port_str {
            Some(raw_port) => raw_port
                .parse::<u16>()
                .map_err(|_| ConfigError::BadPort(raw.to_string()))?,
            None => default_port.ok_or_else(|| ConfigError::BadAddress(raw.to_string()))?,
        };

        Ok(Endpoint {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, bracketing IPv6 hosts, suitable for socket calls.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Ssl
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public address the joiner advertises, `[scheme://]host[:port]`.
    pub recv_addr: Option<String>,
    /// Local bind address; defaults to `recv_addr`.
    pub recv_bind: Option<String>,
    /// Whether streamed write-sets retain their key annotations.
    pub keep_keys: bool,
    /// Node host used when `recv_addr` is not set.
    pub base_host: Option<String>,
    /// Group transport port; the transfer listener defaults to this plus
    /// one.
    pub base_port: u16,
    /// Upper bound for a single wire frame.
    pub max_frame_bytes: usize,
    /// PEM certificate chain path; enables the `ssl://` scheme default.
    pub ssl_cert: Option<PathBuf>,
    /// PEM private key path.
    pub ssl_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            recv_addr: None,
            recv_bind: None,
            keep_keys: true,
            base_host: None,
            base_port: DEFAULT_BASE_PORT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            ssl_cert: None,
            ssl_key: None,
        }
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Set an option by its provider-facing string key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            RECV_ADDR_KEY => self.recv_addr = Some(value.to_string()),
            RECV_BIND_KEY => self.recv_bind = Some(value.to_string()),
            KEEP_KEYS_KEY => {
                self.keep_keys = value.parse().map_err(|_| ConfigError::BadValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Read an option by its provider-facing string key.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            RECV_ADDR_KEY => self.recv_addr.clone(),
            RECV_BIND_KEY => self.recv_bind.clone(),
            KEEP_KEYS_KEY => Some(self.keep_keys.to_string()),
            _ => None,
        }
    }

    /// Let the environment override the receive addresses.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(RECV_ADDR_ENV) {
            self.recv_addr = Some(addr);
        }
        if let Ok(bind) = std::env::var(RECV_BIND_ENV) {
            self.recv_bind = Some(bind);
        }
    }

    /// Scheme used when an address carries none.
    pub fn default_scheme(&self) -> Scheme {
        if self.ssl_key.is_some() {
            Scheme::Ssl
        } else {
            Scheme::Tcp
        }
    }

    /// Port used when an address carries none.
    pub fn default_recv_port(&self) -> u16 {
        self.base_port.wrapping_add(1)
    }

    /// The address the receiver advertises to the donor.
    pub fn resolve_recv_addr(&self) -> Result<Endpoint, ConfigError> {
        let raw = self
            .recv_addr
            .as_deref()
            .or(self.base_host.as_deref())
            .ok_or(ConfigError::AddrNotSet)?;
        Endpoint::parse(raw, self.default_scheme(), Some(self.default_recv_port()))
    }

    /// The address the receiver binds; falls back to the advertised one.
    pub fn resolve_recv_bind(&self) -> Result<Endpoint, ConfigError> {
        match self.recv_bind.as_deref() {
            Some(raw) => {
                Endpoint::parse(raw, self.default_scheme(), Some(self.default_recv_port()))
            }
            None => self.resolve_recv_addr(),
        }
    }

    /// Load the configured TLS identity, if any.
    pub fn tls_identity(&self) -> Result<Option<TlsIdentity>, ConfigError> {
        match (&self.ssl_cert, &self.ssl_key) {
            (Some(cert), Some(key)) => Ok(Some(tls::load_identity(cert, key)?)),
            (None, None) => Ok(None),
            _ => Err(ConfigError::TlsIdentityMissing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_variants() {
        let ep = Endpoint::parse("tcp://node1:10200", Scheme::Tcp, None).unwrap();
        assert_eq!(ep.scheme, Scheme::Tcp);
        assert_eq!(ep.host, "node1");
        assert_eq!(ep.port, 10200);

        let ep = Endpoint::parse("node1", Scheme::Ssl, Some(4568)).unwrap();
        assert_eq!(ep.scheme, Scheme::Ssl);
        assert_eq!(ep.port, 4568);

        let ep = Endpoint::parse("[::1]:7777", Scheme::Tcp, None).unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.authority(), "[::1]:7777");

        assert!(matches!(
            Endpoint::parse("http://node1:1", Scheme::Tcp, None),
            Err(ConfigError::BadScheme(_))
        ));
        assert!(matches!(
            Endpoint::parse("node1:notaport", Scheme::Tcp, None),
            Err(ConfigError::BadPort(_))
        ));
        assert!(matches!(
            Endpoint::parse("node1", Scheme::Tcp, None),
            Err(ConfigError::BadAddress(_))
        ));
    }

    #[test]
    fn recv_addr_falls_back_to_base_host_and_port() {
        let mut config = Config::default();
        assert!(matches!(
            config.resolve_recv_addr(),
            Err(ConfigError::AddrNotSet)
        ));

        config.base_host = Some("10.0.0.2".to_string());
        let ep = config.resolve_recv_addr().unwrap();
        assert_eq!(ep.scheme, Scheme::Tcp);
        assert_eq!(ep.host, "10.0.0.2");
        assert_eq!(ep.port, DEFAULT_BASE_PORT + 1);

        config.recv_addr = Some("node3:9999".to_string());
        let ep = config.resolve_recv_addr().unwrap();
        assert_eq!(ep.host, "node3");
        assert_eq!(ep.port, 9999);
    }

    #[test]
    fn bind_falls_back_to_recv_addr() {
        let mut config = Config {
            recv_addr: Some("tcp://pub-host".to_string()),
            ..Config::default()
        };
        assert_eq!(config.resolve_recv_bind().unwrap().host, "pub-host");

        config.recv_bind = Some("0.0.0.0".to_string());
        let bind = config.resolve_recv_bind().unwrap();
        assert_eq!(bind.host, "0.0.0.0");
        assert_eq!(bind.port, config.default_recv_port());
    }

    #[test]
    fn ssl_key_flips_default_scheme() {
        let mut config = Config {
            recv_addr: Some("node1".to_string()),
            ..Config::default()
        };
        assert_eq!(config.resolve_recv_addr().unwrap().scheme, Scheme::Tcp);
        config.ssl_cert = Some("cert.pem".into());
        config.ssl_key = Some("key.pem".into());
        assert_eq!(config.resolve_recv_addr().unwrap().scheme, Scheme::Ssl);
        // an explicit scheme always wins
        config.recv_addr = Some("tcp://node1".to_string());
        assert_eq!(config.resolve_recv_addr().unwrap().scheme, Scheme::Tcp);
    }

    #[test]
    fn string_keys_roundtrip() {
        let mut config = Config::default();
        config.set(RECV_ADDR_KEY, "tcp://node5:1111").unwrap();
        config.set(KEEP_KEYS_KEY, "false").unwrap();
        assert_eq!(
            config.get(RECV_ADDR_KEY).as_deref(),
            Some("tcp://node5:1111")
        );
        assert!(!config.keep_keys);
        assert!(matches!(
            config.set("ist.bogus", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            config.set(KEEP_KEYS_KEY, "maybe"),
            Err(ConfigError::BadValue { .. })
        ));
    }

    #[test]
    fn toml_roundtrip_with_defaults() {
        let config = Config::from_toml(
            r#"
            recv_addr = "node1:10200"
            keep_keys = false
            "#,
        )
        .unwrap();
        assert_eq!(config.recv_addr.as_deref(), Some("node1:10200"));
        assert!(!config.keep_keys);
        assert_eq!(config.base_port, DEFAULT_BASE_PORT);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn half_configured_tls_identity_is_an_error() {
        let config = Config {
            ssl_key: Some("key.pem".into()),
            ..Config::default()
        };
        assert!(matches!(
            config.tls_identity(),
            Err(ConfigError::TlsIdentityMissing)
        ));
    }
}
