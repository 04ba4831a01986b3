//! Tenant configuration schema.
//!
//! Keys follow `SPEC_FULL.md` §6 exactly. Unrecognized keys are
//! ignored by `serde_json` by default, which is all the forward
//! compatibility requirement asks for — no extra plumbing needed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default wall-clock budget for a single VM run, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: f64 = 2.0;
/// Default cap on concurrently reserved ephemeral VMs per tenant.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
/// Default cap on chain length (§4.6).
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 8;
/// Default per-VM memory ceiling.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// One tenant's configuration, as parsed from JSON (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Binary fetch URL or file path for the guest image.
    pub uri: String,

    /// Logical grouping label; purely informational.
    #[serde(default)]
    pub group: Option<String>,

    /// argv for future template builds.
    #[serde(default)]
    pub main_arguments: Vec<String>,

    /// Additional JSON merged at `configure` time; kept opaque here
    /// since the guest interprets it, not the runtime.
    #[serde(default)]
    pub extra: serde_json::Value,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: f64,

    #[serde(default = "default_max_chain_length")]
    pub max_chain_length: usize,

    #[serde(default)]
    pub storage_enabled: bool,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_max_memory_bytes() -> u64 {
    DEFAULT_MAX_MEMORY_BYTES
}
fn default_request_timeout_seconds() -> f64 {
    DEFAULT_REQUEST_TIMEOUT_SECONDS
}
fn default_max_chain_length() -> usize {
    DEFAULT_MAX_CHAIN_LENGTH
}

impl TenantConfig {
    /// Merges `patch` over `self`, field by field. `uri` and
    /// `main_arguments` are replaced wholesale when present in the
    /// patch; `extra` is deep-merged as a JSON object when both sides
    /// are objects, otherwise replaced.
    pub fn merge(&mut self, patch: serde_json::Value) -> Result<(), ConfigError> {
        let patch: TenantConfigPatch = serde_json::from_value(patch)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if let Some(uri) = patch.uri {
            self.uri = uri;
        }
        if let Some(group) = patch.group {
            self.group = Some(group);
        }
        if let Some(args) = patch.main_arguments {
            self.main_arguments = args;
        }
        if let Some(v) = patch.max_concurrency {
            self.max_concurrency = v;
        }
        if let Some(v) = patch.max_memory_bytes {
            self.max_memory_bytes = v;
        }
        if let Some(v) = patch.request_timeout_seconds {
            self.request_timeout_seconds = v;
        }
        if let Some(v) = patch.max_chain_length {
            self.max_chain_length = v;
        }
        if let Some(v) = patch.storage_enabled {
            self.storage_enabled = v;
        }
        if let Some(extra) = patch.extra {
            merge_json(&mut self.extra, extra);
        }
        Ok(())
    }
}

/// Same shape as `TenantConfig` but every field optional, used to
/// decode a partial `configure()` patch.
#[derive(Debug, Default, Deserialize)]
struct TenantConfigPatch {
    uri: Option<String>,
    group: Option<String>,
    main_arguments: Option<Vec<String>>,
    extra: Option<serde_json::Value>,
    max_concurrency: Option<usize>,
    max_memory_bytes: Option<u64>,
    request_timeout_seconds: Option<f64>,
    max_chain_length: Option<usize>,
    storage_enabled: Option<bool>,
}

fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value;
        }
    }
}

/// A manifest of tenants, as fetched via `library(uri)` or supplied as
/// a JSON literal at init time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantManifest {
    pub tenants: std::collections::BTreeMap<String, TenantConfig>,
}

impl TenantManifest {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid tenant configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_in_missing_keys() {
        let cfg: TenantConfig =
            serde_json::from_value(json!({ "uri": "file:///bin/basic" })).unwrap();
        assert_eq!(cfg.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(cfg.max_chain_length, DEFAULT_MAX_CHAIN_LENGTH);
        assert!(!cfg.storage_enabled);
    }

    #[test]
    fn unrecognized_keys_are_ignored() {
        let cfg: Result<TenantConfig, _> = serde_json::from_value(json!({
            "uri": "file:///bin/basic",
            "totally_unknown_future_field": 42,
        }));
        assert!(cfg.is_ok());
    }

    #[test]
    fn merge_overrides_only_present_fields() {
        let mut cfg: TenantConfig =
            serde_json::from_value(json!({ "uri": "file:///bin/basic", "max_concurrency": 4 }))
                .unwrap();
        cfg.merge(json!({ "max_concurrency": 16 })).unwrap();
        assert_eq!(cfg.max_concurrency, 16);
        assert_eq!(cfg.uri, "file:///bin/basic");
    }

    #[test]
    fn merge_deep_merges_extra_object() {
        let mut cfg: TenantConfig = serde_json::from_value(json!({
            "uri": "file:///bin/basic",
            "extra": { "a": 1, "nested": { "x": 1 } },
        }))
        .unwrap();
        cfg.merge(json!({ "extra": { "nested": { "y": 2 } } }))
            .unwrap();
        assert_eq!(cfg.extra["a"], 1);
        assert_eq!(cfg.extra["nested"]["x"], 1);
        assert_eq!(cfg.extra["nested"]["y"], 2);
    }

    #[test]
    fn manifest_parses_multiple_tenants() {
        let manifest = TenantManifest::from_json(
            r#"{"tenants": {"basic": {"uri": "file:///bin/basic"}, "chainer": {"uri": "file:///bin/chainer"}}}"#,
        )
        .unwrap();
        assert_eq!(manifest.tenants.len(), 2);
        assert!(manifest.tenants.contains_key("basic"));
    }
}
