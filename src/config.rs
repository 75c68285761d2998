//! Configuration lookup for the transport.
//!
//! Keys are looked up as `{name}.{key}` first and then as `{key}`, so several
//! transports in one process can share a configuration file and override only
//! what differs.
//!
//! ```toml
//! poll_timeout_ms = 100
//! tls_enabled = true
//! tls_cert = "/etc/kvmlink/cert.pem"
//! tls_key = "/etc/kvmlink/key.pem"
//! trust_store = "/var/lib/kvmlink/trusted.toml"
//!
//! [server]
//! trust_policy = "confirm"
//! ```

use crate::error::Error;
use crate::secure::{Fingerprint, TrustPolicy};
use ::config::Config;
use std::path::PathBuf;
use std::time::Duration;

pub(crate) const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
pub(crate) const DEFAULT_POLL_CAPACITY: usize = 256;
pub(crate) const DEFAULT_MAX_READ_SIZE: usize = 64 * 1024;
pub(crate) const DEFAULT_SEND_BUFFER_LIMIT: usize = 64 * 1024;
pub(crate) const DEFAULT_RECV_BUFFER_LIMIT: usize = 1024 * 1024;

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

// Missing keys fall back to the default, malformed values are errors.
fn optional<T>(result: Result<T, config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Settings for sockets and the multiplexer, collected from a [`Config`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on one wait of the poll loop.
    pub poll_timeout: Duration,
    /// Number of readiness events fetched per poll.
    pub poll_capacity: usize,
    /// Bytes read from the OS per data-job invocation.
    pub max_read_size: usize,
    /// Plaintext bytes a socket buffers for sending before `write` accepts less.
    pub send_buffer_limit: usize,
    /// Received bytes a socket buffers before it stops reading.
    pub recv_buffer_limit: usize,
    /// Whether the factory creates secure sockets.
    pub tls_enabled: bool,
    /// PEM certificate presented to peers.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key matching `tls_cert`.
    pub tls_key: Option<PathBuf>,
    /// Generate a self-signed certificate when the files do not exist yet.
    pub tls_generate_cert: bool,
    /// Whether servers insist on a client certificate.
    pub tls_require_client_cert: bool,
    /// Trust store file. `None` keeps fingerprints in memory only.
    pub trust_store: Option<PathBuf>,
    /// How unknown and known peer fingerprints are judged.
    pub trust_policy: TrustPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            poll_capacity: DEFAULT_POLL_CAPACITY,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            send_buffer_limit: DEFAULT_SEND_BUFFER_LIMIT,
            recv_buffer_limit: DEFAULT_RECV_BUFFER_LIMIT,
            tls_enabled: false,
            tls_cert: None,
            tls_key: None,
            tls_generate_cert: true,
            tls_require_client_cert: true,
            trust_store: None,
            trust_policy: TrustPolicy::TrustOnFirstUse,
        }
    }
}

impl TransportConfig {
    /// Reads the transport settings from `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads the transport settings from `config`, preferring keys under
    /// `name`.
    ///
    /// # Errors
    ///
    /// Returns an error when a key is present but has the wrong type, when
    /// `trust_policy` is not `tofu` or `confirm`, or when `trust_pinned` is
    /// not a valid fingerprint.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let poll_timeout = optional(get_namespaced_u64(config, name, "poll_timeout_ms"))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_timeout);

        let trust_policy = match optional(get_namespaced_string(config, name, "trust_pinned"))? {
            Some(pinned) => TrustPolicy::Pinned(pinned.parse::<Fingerprint>()?),
            None => match optional(get_namespaced_string(config, name, "trust_policy"))? {
                Some(policy) => policy.parse()?,
                None => defaults.trust_policy,
            },
        };

        Ok(Self {
            poll_timeout,
            poll_capacity: nonzero_usize(config, name, "poll_capacity")?
                .unwrap_or(defaults.poll_capacity),
            max_read_size: nonzero_usize(config, name, "max_read_size")?
                .unwrap_or(defaults.max_read_size),
            send_buffer_limit: nonzero_usize(config, name, "send_buffer_limit")?
                .unwrap_or(defaults.send_buffer_limit),
            recv_buffer_limit: nonzero_usize(config, name, "recv_buffer_limit")?
                .unwrap_or(defaults.recv_buffer_limit),
            tls_enabled: optional(get_namespaced_bool(config, name, "tls_enabled"))?
                .unwrap_or(defaults.tls_enabled),
            tls_cert: optional(get_namespaced_string(config, name, "tls_cert"))?.map(PathBuf::from),
            tls_key: optional(get_namespaced_string(config, name, "tls_key"))?.map(PathBuf::from),
            tls_generate_cert: optional(get_namespaced_bool(config, name, "tls_generate_cert"))?
                .unwrap_or(defaults.tls_generate_cert),
            tls_require_client_cert: optional(get_namespaced_bool(
                config,
                name,
                "tls_require_client_cert",
            ))?
            .unwrap_or(defaults.tls_require_client_cert),
            trust_store: optional(get_namespaced_string(config, name, "trust_store"))?
                .map(PathBuf::from),
            trust_policy,
        })
    }
}

/// Sizes and capacities must be at least 1.
fn nonzero_usize(config: &Config, name: &str, key: &str) -> Result<Option<usize>, Error> {
    match optional(get_namespaced_usize(config, name, key))? {
        Some(0) => Err(Error::Config(config::ConfigError::Message(format!(
            "{} must be greater than zero",
            key
        )))),
        value => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_config_is_empty() {
        let config = TransportConfig::from_config(&Config::default()).unwrap();
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert!(!config.tls_enabled);
        assert_eq!(config.trust_policy, TrustPolicy::TrustOnFirstUse);
    }

    #[test]
    fn namespaced_key_wins_over_global() {
        let config = Config::builder()
            .set_default("poll_timeout_ms", 50)
            .unwrap()
            .set_default("server.poll_timeout_ms", 20)
            .unwrap()
            .set_default("trust_policy", "confirm")
            .unwrap()
            .build()
            .unwrap();

        let server = TransportConfig::from_config_named(&config, "server").unwrap();
        assert_eq!(server.poll_timeout, Duration::from_millis(20));
        assert_eq!(server.trust_policy, TrustPolicy::Confirm);

        let client = TransportConfig::from_config_named(&config, "client").unwrap();
        assert_eq!(client.poll_timeout, Duration::from_millis(50));
    }

    #[test]
    fn unknown_trust_policy_is_rejected() {
        let config = Config::builder()
            .set_default("trust_policy", "ca")
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(
            TransportConfig::from_config(&config),
            Err(Error::InvalidTrustPolicy { .. })
        ));
    }

    #[test]
    fn pinned_fingerprint_overrides_policy() {
        let pinned = ["AB"; 32].join(":");
        let config = Config::builder()
            .set_default("trust_pinned", pinned.as_str())
            .unwrap()
            .build()
            .unwrap();
        let parsed = TransportConfig::from_config(&config).unwrap();
        assert!(matches!(parsed.trust_policy, TrustPolicy::Pinned(_)));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for key in ["poll_capacity", "max_read_size", "send_buffer_limit", "recv_buffer_limit"] {
            let config = Config::builder().set_default(key, 0).unwrap().build().unwrap();
            let err = TransportConfig::from_config(&config).unwrap_err();
            assert!(
                matches!(&err, Error::Config(_)) && err.to_string().contains(key),
                "{}: {}",
                key,
                err
            );
        }

        let config = Config::builder()
            .set_default("max_read_size", 1)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(TransportConfig::from_config(&config).unwrap().max_read_size, 1);
    }
}
