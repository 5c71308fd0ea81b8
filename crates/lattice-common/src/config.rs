//! Environment configuration for the federation engine
//!
//! Provides trait-based access to environment variables, enabling
//! dependency injection and mocking for tests.

use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Prefix shared by every federation environment variable
pub const ENV_PREFIX: &str = "LATTICE_FEDERATION_";

/// Default field manager for server-side writes
pub const DEFAULT_FIELD_MANAGER: &str = "lattice-federation";

/// Default name of the cross-domain (system) query scope
pub const DEFAULT_CROSS_DOMAIN_SCOPE: &str = "system";

/// Trait for reading environment configuration
///
/// This abstracts reading from environment variables, enabling
/// proper unit testing without manipulating global state.
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of the given variable, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// Default implementation that reads from process environment variables
#[derive(Clone, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// What Detach does with the provisioned remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetachPolicy {
    /// Only the join record is removed; the remote resource is left in place
    #[default]
    Orphan,
    /// The remote resource is deleted after the join record is removed
    Delete,
}

impl FromStr for DetachPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "orphan" => Ok(Self::Orphan),
            "delete" => Ok(Self::Delete),
            other => Err(Error::validation_for_field(
                "federation-config",
                format!("{}DETACH_POLICY", ENV_PREFIX),
                format!("expected orphan or delete, got {:?}", other),
            )),
        }
    }
}

/// Runtime settings of the federation engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationConfig {
    /// How long to wait for an object lock before giving up
    pub lock_timeout: Duration,
    /// How long a namespaced attach waits for the cluster namespace to become Active
    pub namespace_ready_timeout: Duration,
    /// Interval between namespace readiness checks
    pub namespace_poll_interval: Duration,
    /// Field manager recorded on created/updated cluster objects
    pub field_manager: String,
    /// Detach behavior for provisioned resources
    pub detach_policy: DetachPolicy,
    /// Scope name that disables domain filtering in fan-out queries
    pub cross_domain_scope_name: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            namespace_ready_timeout: Duration::from_secs(5),
            namespace_poll_interval: Duration::from_secs(1),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            detach_policy: DetachPolicy::Orphan,
            cross_domain_scope_name: DEFAULT_CROSS_DOMAIN_SCOPE.to_string(),
        }
    }
}

impl FederationConfig {
    /// Load configuration from the process environment
    pub fn from_os_env() -> Result<Self> {
        Self::from_env(&OsEnv)
    }

    /// Load configuration from an environment source
    ///
    /// Unset variables keep their defaults. Durations are given in
    /// milliseconds (`*_MS`).
    pub fn from_env(env: &dyn EnvSource) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = read_millis(env, "LOCK_TIMEOUT_MS")? {
            config.lock_timeout = ms;
        }
        if let Some(ms) = read_millis(env, "NAMESPACE_READY_TIMEOUT_MS")? {
            config.namespace_ready_timeout = ms;
        }
        if let Some(ms) = read_millis(env, "NAMESPACE_POLL_INTERVAL_MS")? {
            config.namespace_poll_interval = ms;
        }
        if let Some(fm) = env.var(&key("FIELD_MANAGER")) {
            if fm.trim().is_empty() {
                return Err(invalid("FIELD_MANAGER", "must not be empty"));
            }
            config.field_manager = fm;
        }
        if let Some(policy) = env.var(&key("DETACH_POLICY")) {
            config.detach_policy = policy.parse()?;
        }
        if let Some(scope) = env.var(&key("CROSS_DOMAIN_SCOPE")) {
            config.cross_domain_scope_name = scope;
        }

        if config.namespace_poll_interval.is_zero() {
            return Err(invalid("NAMESPACE_POLL_INTERVAL_MS", "must be positive"));
        }
        Ok(config)
    }
}

fn key(suffix: &str) -> String {
    format!("{}{}", ENV_PREFIX, suffix)
}

fn invalid(suffix: &str, msg: impl Into<String>) -> Error {
    Error::validation_for_field("federation-config", key(suffix), msg)
}

fn read_millis(env: &dyn EnvSource, suffix: &str) -> Result<Option<Duration>> {
    match env.var(&key(suffix)) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| invalid(suffix, format!("{:?} is not a number of milliseconds: {}", raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(pairs: &'static [(&'static str, &'static str)]) -> MockEnvSource {
        let mut mock = MockEnvSource::new();
        mock.expect_var().returning(move |k| {
            pairs
                .iter()
                .find(|(name, _)| *name == k)
                .map(|(_, v)| v.to_string())
        });
        mock
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = FederationConfig::from_env(&env_with(&[])).unwrap();
        assert_eq!(config, FederationConfig::default());
        assert_eq!(config.detach_policy, DetachPolicy::Orphan);
        assert_eq!(config.field_manager, DEFAULT_FIELD_MANAGER);
    }

    #[test]
    fn overrides_are_applied() {
        let env = env_with(&[
            ("LATTICE_FEDERATION_LOCK_TIMEOUT_MS", "250"),
            ("LATTICE_FEDERATION_NAMESPACE_READY_TIMEOUT_MS", "3000"),
            ("LATTICE_FEDERATION_NAMESPACE_POLL_INTERVAL_MS", "100"),
            ("LATTICE_FEDERATION_FIELD_MANAGER", "fed-test"),
            ("LATTICE_FEDERATION_DETACH_POLICY", "Delete"),
            ("LATTICE_FEDERATION_CROSS_DOMAIN_SCOPE", "admin"),
        ]);
        let config = FederationConfig::from_env(&env).unwrap();
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.namespace_ready_timeout, Duration::from_secs(3));
        assert_eq!(config.namespace_poll_interval, Duration::from_millis(100));
        assert_eq!(config.field_manager, "fed-test");
        assert_eq!(config.detach_policy, DetachPolicy::Delete);
        assert_eq!(config.cross_domain_scope_name, "admin");
    }

    #[test]
    fn invalid_duration_names_the_variable() {
        let env = env_with(&[("LATTICE_FEDERATION_LOCK_TIMEOUT_MS", "soon")]);
        let err = FederationConfig::from_env(&env).unwrap_err();
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("LATTICE_FEDERATION_LOCK_TIMEOUT_MS"))
            }
            other => panic!("Expected Validation, got {:?}", other),
        }
    }

    #[test]
    fn unknown_detach_policy_is_rejected() {
        let env = env_with(&[("LATTICE_FEDERATION_DETACH_POLICY", "cascade")]);
        assert!(FederationConfig::from_env(&env).is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let env = env_with(&[("LATTICE_FEDERATION_NAMESPACE_POLL_INTERVAL_MS", "0")]);
        assert!(FederationConfig::from_env(&env).is_err());
    }
}
