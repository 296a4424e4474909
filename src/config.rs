//! Reconciler configuration
//!
//! Built from command-line flags or loaded from a YAML file.

use crate::domain::naming::DEFAULT_INSTANCE_PREFIX;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

/// Default maximum number of shares hosted by one instance
pub const DEFAULT_MAX_SHARES_PER_INSTANCE: usize = 10;

/// Default minimum instance size
pub const DEFAULT_MIN_INSTANCE_BYTES: u64 = TIB;

/// Default maximum instance size
pub const DEFAULT_MAX_INSTANCE_BYTES: u64 = 10 * TIB;

/// Default pass interval
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Configuration for the reconciler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    /// Cloud project hosting the instances
    pub project: String,
    /// Name of the cluster owning the shares
    pub cluster_name: String,
    /// Cluster location (zone or region)
    pub cluster_location: String,
    /// Whether the cluster is regional; instances are then tagged with the region
    pub regional: bool,
    /// Seconds between passes
    pub interval_secs: u64,
    /// Maximum shares placed on one instance
    pub max_shares_per_instance: usize,
    /// Lower bound of an instance's capacity
    pub min_instance_bytes: u64,
    /// Upper bound of an instance's capacity
    pub max_instance_bytes: u64,
    /// Name prefix for instances created by placement
    pub instance_prefix: String,
    /// Label selector (`k=v,...`) restricting which records are reconciled
    pub record_selector: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            cluster_name: String::new(),
            cluster_location: String::new(),
            regional: false,
            interval_secs: DEFAULT_INTERVAL_SECS,
            max_shares_per_instance: DEFAULT_MAX_SHARES_PER_INSTANCE,
            min_instance_bytes: DEFAULT_MIN_INSTANCE_BYTES,
            max_instance_bytes: DEFAULT_MAX_INSTANCE_BYTES,
            instance_prefix: DEFAULT_INSTANCE_PREFIX.to_string(),
            record_selector: String::new(),
        }
    }
}

impl ReconcilerConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(Error::Configuration("project must be set".into()));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::Configuration("cluster name must be set".into()));
        }
        if self.cluster_location.is_empty() {
            return Err(Error::Configuration("cluster location must be set".into()));
        }
        if self.interval_secs == 0 {
            return Err(Error::Configuration("interval must be positive".into()));
        }
        if self.max_shares_per_instance == 0 {
            return Err(Error::Configuration(
                "max shares per instance must be at least 1".into(),
            ));
        }
        if self.min_instance_bytes == 0 || self.min_instance_bytes > self.max_instance_bytes {
            return Err(Error::Configuration(format!(
                "invalid instance size bounds [{}, {}]",
                self.min_instance_bytes, self.max_instance_bytes
            )));
        }
        self.selector()?;
        Ok(())
    }

    /// Pass interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Parsed record selector
    pub fn selector(&self) -> Result<crate::domain::Selector> {
        let mut selector = crate::domain::Selector::everything();
        for term in self.record_selector.split(',').filter(|t| !t.trim().is_empty()) {
            let (k, v) = term.split_once('=').ok_or_else(|| {
                Error::Configuration(format!("invalid selector term {:?}", term))
            })?;
            selector.0.insert(k.trim().to_string(), v.trim().to_string());
        }
        Ok(selector)
    }
}

/// Render bytes as GiB for logs
pub(crate) fn gib(bytes: u64) -> String {
    format!("{:.1}GiB", bytes as f64 / GIB as f64)
}
