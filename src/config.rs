//! Configuration for the datasource.
//!
//! # Example
//!
//! ```
//! use multichannel_store::DatasourceConfig;
//!
//! // Minimal config (uses defaults)
//! let config = DatasourceConfig::default();
//! assert!(!config.sync_checking.enabled);
//! assert_eq!(config.sync_checking.interval_ms, 60_000);
//!
//! // Flat properties, as found in CMS configuration files
//! let config = DatasourceConfig::from_properties([
//!     ("cache.attribute.body.enabled", "false"),
//!     ("cache.attribute.name.region", "names"),
//!     ("cache.region.names.max_entries", "500"),
//!     ("cache.syncchecking.enabled", "true"),
//!     ("cache.syncchecking.interval", "1000"),
//!     ("prefetch.threshold.count", "10"),
//!     ("attribute.path", "/var/lib/content/files"),
//! ])
//! .unwrap();
//! assert!(!config.attribute_cache("body").enabled);
//! assert_eq!(config.region_max_entries("names"), Some(500));
//! assert_eq!(config.prefetch.count, Some(10));
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

use crate::error::{DatasourceError, Result};
use crate::query::Expression;

/// Attribute region used when an attribute names none.
pub const SHARED_REGION: &str = "shared";

/// Caching of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttributeCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for AttributeCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            region: default_region(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RegionConfig {
    /// Oldest entries are evicted beyond this count. `None` is unbounded.
    #[serde(default)]
    pub max_entries: Option<usize>,
}

/// Background sync checker and warming.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
    /// Invalidate only changed objects instead of flushing everything.
    #[serde(default = "default_true")]
    pub differential: bool,
    #[serde(default)]
    pub warm_attributes: Vec<String>,
    /// Objects matching this filter are warmed; no filter disables warming.
    #[serde(default)]
    pub warm_filter: Option<Expression>,
}

impl Default for SyncCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_sync_interval_ms(),
            differential: true,
            warm_attributes: Vec::new(),
            warm_filter: None,
        }
    }
}

/// Prefetch triggers. Any threshold that holds triggers a batch load;
/// none configured means lazy per-object loading.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PrefetchThresholds {
    /// Number of objects
    #[serde(default)]
    pub count: Option<usize>,
    /// Number of objects missing the attribute in cache
    #[serde(default)]
    pub misses: Option<usize>,
    /// Percentage (0-100) of objects missing the attribute in cache
    #[serde(default)]
    pub miss_percent: Option<f64>,
}

/// Configuration for a [`Datasource`](crate::Datasource).
#[derive(Debug, Clone, Deserialize)]
pub struct DatasourceConfig {
    /// Per-attribute caching; unlisted attributes are cached in the shared region
    #[serde(default)]
    pub attributes: HashMap<String, AttributeCacheConfig>,

    /// Bounds per region name
    #[serde(default)]
    pub regions: HashMap<String, RegionConfig>,

    #[serde(default)]
    pub sync_checking: SyncCheckConfig,

    #[serde(default)]
    pub prefetch: PrefetchThresholds,

    /// Root directory of filesystem attribute values
    #[serde(default)]
    pub filesystem_root: Option<PathBuf>,

    /// File remover interval in milliseconds
    #[serde(default = "default_file_remove_interval_ms")]
    pub file_remove_interval_ms: u64,

    /// Default bound of the query-result and query-count regions
    #[serde(default = "default_query_max_entries")]
    pub query_max_entries: usize,
}

fn default_true() -> bool { true }
fn default_region() -> String { SHARED_REGION.to_string() }
fn default_sync_interval_ms() -> u64 { 60_000 }
fn default_file_remove_interval_ms() -> u64 { 10_000 }
fn default_query_max_entries() -> usize { 10_000 }

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            attributes: HashMap::new(),
            regions: HashMap::new(),
            sync_checking: SyncCheckConfig::default(),
            prefetch: PrefetchThresholds::default(),
            filesystem_root: None,
            file_remove_interval_ms: default_file_remove_interval_ms(),
            query_max_entries: default_query_max_entries(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DatasourceError::Config(format!("{key} = '{value}': {e}")))
}

impl DatasourceConfig {
    /// Parse flat `key = value` properties.
    ///
    /// Unknown keys are logged and ignored; malformed values fail.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            config.apply_property(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    fn apply_property(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["cache", "attribute", name, "enabled"] => {
                self.attributes.entry(name.to_string()).or_default().enabled = parse(key, value)?;
            }
            ["cache", "attribute", name, "region"] => {
                self.attributes.entry(name.to_string()).or_default().region = value.trim().to_string();
            }
            ["cache", "region", name, "max_entries"] => {
                self.regions.entry(name.to_string()).or_default().max_entries = Some(parse(key, value)?);
            }
            ["cache", "syncchecking", "enabled"] => self.sync_checking.enabled = parse(key, value)?,
            ["cache", "syncchecking", "interval"] => self.sync_checking.interval_ms = parse(key, value)?,
            ["cache", "syncchecking", "differential"] => {
                self.sync_checking.differential = parse(key, value)?;
            }
            ["cache", "warming", "attributes"] => {
                self.sync_checking.warm_attributes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            ["cache", "warming", "filter"] => {
                let filter = serde_json::from_str(value)
                    .map_err(|e| DatasourceError::Config(format!("{key}: {e}")))?;
                self.sync_checking.warm_filter = Some(filter);
            }
            ["prefetch", "threshold", "count"] => self.prefetch.count = Some(parse(key, value)?),
            ["prefetch", "threshold", "misses"] => self.prefetch.misses = Some(parse(key, value)?),
            ["prefetch", "threshold", "percent"] => {
                let percent: f64 = parse(key, value)?;
                if !(0.0..=100.0).contains(&percent) {
                    return Err(DatasourceError::Config(format!("{key} must be within 0..=100")));
                }
                self.prefetch.miss_percent = Some(percent);
            }
            ["attribute", "path"] => self.filesystem_root = Some(PathBuf::from(value.trim())),
            ["file", "remove", "interval"] => self.file_remove_interval_ms = parse(key, value)?,
            _ => warn!(key, "Ignoring unknown datasource property"),
        }
        Ok(())
    }

    /// Effective caching of one attribute.
    pub fn attribute_cache(&self, name: &str) -> AttributeCacheConfig {
        self.attributes.get(name).cloned().unwrap_or_default()
    }

    pub fn region_max_entries(&self, region: &str) -> Option<usize> {
        self.regions.get(region).and_then(|r| r.max_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Operand;

    #[test]
    fn test_defaults() {
        let config = DatasourceConfig::default();
        assert!(config.attributes.is_empty());
        assert_eq!(config.attribute_cache("anything"), AttributeCacheConfig::default());
        assert!(config.sync_checking.differential);
        assert_eq!(config.prefetch, PrefetchThresholds::default());
        assert_eq!(config.query_max_entries, 10_000);
    }

    #[test]
    fn test_serde_defaults_match_default_impl() {
        let config: DatasourceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.file_remove_interval_ms, DatasourceConfig::default().file_remove_interval_ms);
        assert_eq!(config.sync_checking, SyncCheckConfig::default());

        let config: DatasourceConfig =
            serde_json::from_str(r#"{"attributes": {"body": {"enabled": false}}}"#).unwrap();
        assert_eq!(config.attribute_cache("body").region, SHARED_REGION);
        assert!(!config.attribute_cache("body").enabled);
    }

    #[test]
    fn test_warming_properties() {
        let config = DatasourceConfig::from_properties([
            ("cache.warming.attributes", "name, int ,,text"),
            (
                "cache.warming.filter",
                r#"{"compare": {"operand": {"field": "obj_type"}, "op": "eq", "value": {"Long": 10007}}}"#,
            ),
            ("cache.syncchecking.differential", "false"),
        ])
        .unwrap();
        assert_eq!(config.sync_checking.warm_attributes, vec!["name", "int", "text"]);
        assert!(!config.sync_checking.differential);
        assert!(matches!(
            config.sync_checking.warm_filter,
            Some(Expression::Compare { operand: Operand::Field(_), .. })
        ));
    }

    #[test]
    fn test_malformed_values_fail() {
        assert!(DatasourceConfig::from_properties([("prefetch.threshold.count", "many")]).is_err());
        assert!(DatasourceConfig::from_properties([("prefetch.threshold.percent", "150")]).is_err());
        assert!(DatasourceConfig::from_properties([("cache.warming.filter", "{")]).is_err());
        assert!(DatasourceConfig::from_properties([("cache.syncchecking.enabled", "yes")]).is_err());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = DatasourceConfig::from_properties([("cache.unknown.key", "1")]).unwrap();
        assert!(config.regions.is_empty());
    }

    #[test]
    fn test_thresholds_and_paths() {
        let config = DatasourceConfig::from_properties(vec![
            ("prefetch.threshold.misses".to_string(), "3".to_string()),
            ("prefetch.threshold.percent".to_string(), "50".to_string()),
            ("file.remove.interval".to_string(), "250".to_string()),
        ])
        .unwrap();
        assert_eq!(config.prefetch.misses, Some(3));
        assert_eq!(config.prefetch.miss_percent, Some(50.0));
        assert_eq!(config.file_remove_interval_ms, 250);
    }
}
