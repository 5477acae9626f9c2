//! Agent Configuration
//!
//! Pool definitions and tuning knobs read once at startup from a YAML or
//! JSON file. A configuration that fails to parse or validate is fatal.
//!
//! ```yaml
//! resourcePrefix: devices.example.com
//! pools:
//!   - name: serial
//!     access: exclusive
//!     selector:
//!       subsystem: tty
//!       vendorId: "0403"
//!   - name: coral
//!     access: 4
//!     selector:
//!       subsystem: usb
//!       attributes:
//!         ID_VENDOR_ID: "1a6e"
//! ```

use crate::domain::Access;
use crate::error::{Error, Result};
use crate::hardware::classification::Selector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Default resource name prefix advertised to the kubelet
pub const DEFAULT_RESOURCE_PREFIX: &str = "devices.udev.io";

/// Default prefix of the per-pool socket file names
pub const DEFAULT_SOCKET_PREFIX: &str = "udev";

// =============================================================================
// File Format
// =============================================================================

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ConfigFormat {
    /// Pick by file extension, YAML otherwise
    #[default]
    Auto,
    Json,
    Yaml,
}

impl ConfigFormat {
    fn resolve(self, path: Option<&Path>) -> ConfigFormat {
        match self {
            ConfigFormat::Auto => match path.and_then(|p| p.extension()).and_then(|e| e.to_str()) {
                Some("json") => ConfigFormat::Json,
                _ => ConfigFormat::Yaml,
            },
            other => other,
        }
    }
}

// =============================================================================
// Pool Configuration
// =============================================================================

/// Attribute selector of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SelectorConfig {
    /// Glob matched against `SUBSYSTEM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    /// Glob matched against `ID_VENDOR_ID`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    /// Glob matched against `ID_MODEL_ID`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    /// Required prefix of `DEVPATH`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devpath_prefix: Option<String>,
    /// Attribute name to glob; all must match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    /// Set-based requirements; all must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<MatchExpression>,
}

/// Set-based attribute requirement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MatchExpression {
    pub key: String,
    pub operator: MatchOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Operator of a [`MatchExpression`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Extra bind mount handed to every container granted a device of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MountConfig {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A named pool of devices advertised as one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfig {
    /// Pool name, the last segment of the resource name
    pub name: String,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub access: Access,
    /// Cgroup permissions of the device node inside the container
    #[serde(default = "default_permissions")]
    pub permissions: String,
    /// Device nodes are exposed under this prefix instead of their host path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path_prefix: Option<String>,
    /// Name of the environment variable listing granted device nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountConfig>,
}

impl PoolConfig {
    /// Environment variable carrying the granted device nodes
    pub fn env_var(&self) -> String {
        self.env_var.clone().unwrap_or_else(|| {
            format!(
                "UDEV_{}_DEVICES",
                self.name.to_ascii_uppercase().replace('-', "_")
            )
        })
    }
}

fn default_permissions() -> String {
    "rw".to_string()
}

// =============================================================================
// Health Check / Reconcile / Registration
// =============================================================================

/// How device health is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// Periodically stat each device node
    #[default]
    Devnode,
    /// Health only follows device bus events
    None,
}

/// Device liveness probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub mode: HealthCheckMode,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

fn default_health_interval() -> u64 {
    10
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            mode: HealthCheckMode::Devnode,
            interval_secs: default_health_interval(),
        }
    }
}

/// Reservation reconciliation against kubelet pod resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReconcileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Reservations younger than this are never released
    #[serde(default = "default_reconcile_grace")]
    pub grace_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_reconcile_grace() -> u64 {
    60
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reconcile_interval(),
            grace_secs: default_reconcile_grace(),
        }
    }
}

/// Backoff bounds for kubelet registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegistrationConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Give up after this long without a successful registration
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_elapsed_secs() -> u64 {
    300
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl RegistrationConfig {
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.max_backoff_ms))
            .with_max_elapsed_time(Some(Duration::from_secs(self.max_elapsed_secs)))
            .build()
    }
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,
    #[serde(default = "default_socket_prefix")]
    pub socket_prefix: String,
    /// Pools in classification order; the first matching pool wins
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    /// Upper bound on waiting for the registry lock during Allocate
    #[serde(default = "default_allocate_timeout_ms")]
    pub allocate_timeout_ms: u64,
    /// Capacity of the device event channel
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

fn default_resource_prefix() -> String {
    DEFAULT_RESOURCE_PREFIX.to_string()
}

fn default_socket_prefix() -> String {
    DEFAULT_SOCKET_PREFIX.to_string()
}

fn default_allocate_timeout_ms() -> u64 {
    2_000
}

fn default_event_buffer_size() -> usize {
    1024
}

impl AgentConfig {
    /// Read, parse and validate a configuration file
    pub fn load(path: &Path, format: ConfigFormat) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&text, format.resolve(Some(path)))
    }

    /// Parse and validate configuration text
    pub fn parse(text: &str, format: ConfigFormat) -> Result<Self> {
        let config: AgentConfig = match format.resolve(None) {
            ConfigFormat::Json => serde_json::from_str(text)?,
            _ => serde_yaml::from_str(text)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check everything serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(Error::Configuration("at least one pool is required".into()));
        }
        if !is_dns_subdomain(&self.resource_prefix) {
            return Err(Error::Configuration(format!(
                "resourcePrefix {:?} is not a DNS subdomain",
                self.resource_prefix
            )));
        }
        if !is_dns_label(&self.socket_prefix) {
            return Err(Error::Configuration(format!(
                "socketPrefix {:?} is not a DNS label",
                self.socket_prefix
            )));
        }
        if self.health_check.interval_secs == 0 {
            return Err(Error::Configuration("healthCheck.intervalSecs must be > 0".into()));
        }
        if self.reconcile.enabled && self.reconcile.interval_secs == 0 {
            return Err(Error::Configuration("reconcile.intervalSecs must be > 0".into()));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::Configuration("eventBufferSize must be > 0".into()));
        }

        let mut names = HashSet::new();
        for pool in &self.pools {
            if !is_dns_label(&pool.name) {
                return Err(Error::Configuration(format!(
                    "pool name {:?} is not a DNS label",
                    pool.name
                )));
            }
            if !names.insert(pool.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate pool name {:?}",
                    pool.name
                )));
            }
            if !is_valid_permissions(&pool.permissions) {
                return Err(Error::Configuration(format!(
                    "pool {}: permissions {:?} must be a combination of r, w and m",
                    pool.name, pool.permissions
                )));
            }
            Selector::compile(&pool.selector)?;
        }
        Ok(())
    }

    /// Fully qualified resource name of a pool
    pub fn resource_name(&self, pool: &str) -> String {
        format!("{}/{}", self.resource_prefix, pool)
    }

    /// Socket file name of a pool, relative to the plugin directory
    pub fn socket_name(&self, pool: &str) -> String {
        format!("{}-{}.sock", self.socket_prefix, pool)
    }

    pub fn pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn allocate_timeout(&self) -> Duration {
        Duration::from_millis(self.allocate_timeout_ms)
    }
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn is_dns_subdomain(s: &str) -> bool {
    s.len() <= 253 && s.split('.').all(is_dns_label)
}

fn is_valid_permissions(s: &str) -> bool {
    let mut seen = HashSet::new();
    !s.is_empty() && s.chars().all(|c| matches!(c, 'r' | 'w' | 'm') && seen.insert(c))
}
