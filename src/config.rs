//! Service configuration.
//!
//! Defaults, then an optional JSON file named by `CORNSTAND_CONFIG`, then `CORNSTAND_*`
//! environment overrides. [`Config::validate`] runs last.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const ENV_CONFIG_FILE: &str = "CORNSTAND_CONFIG";

/// How the charged unit price is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePolicy {
    /// Charge the price the caller sent (falling back to the default unit price).
    #[default]
    TrustCaller,
    /// Always charge the configured unit price; the caller's price is only recorded.
    Catalog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the HTTP server.
    pub bind: String,
    /// Admission window in seconds.
    pub window_secs: u64,
    /// Tokens per principal. 1 gives one purchase per window.
    pub bucket_capacity: u32,
    /// Inclusive upper bound on quantity per purchase.
    pub max_quantity: i64,
    /// Default (and catalog) unit price.
    pub unit_price: f64,
    pub price_policy: PricePolicy,
    /// Deadline for identity, limiter and store calls.
    pub stage_timeout_ms: u64,
    /// Enable the in-process fast-path deny cache.
    pub local_cache: bool,
    /// Shown in success messages.
    pub product_name: String,
    /// Largest `POST /purchase` body read; anything longer is recorded and rejected.
    pub max_body_bytes: usize,
    /// Bearer token -> principal, for the bundled static identity provider.
    pub tokens: BTreeMap<String, String>,
    pub log_format: LogFormat,
    /// Append admission events as JSON lines to this file.
    pub events_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            window_secs: 60,
            bucket_capacity: 1,
            max_quantity: 10,
            unit_price: 5.0,
            price_policy: PricePolicy::TrustCaller,
            stage_timeout_ms: 2_000,
            local_cache: true,
            product_name: "corn".to_string(),
            max_body_bytes: 64 * 1024,
            tokens: BTreeMap::new(),
            log_format: LogFormat::Pretty,
            events_path: None,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for environment variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = match lookup(ENV_CONFIG_FILE) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        let cfg = base.with_env_overrides(&lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse { path: path.to_string(), source })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn with_env_overrides<F>(mut self, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CORNSTAND_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("CORNSTAND_WINDOW_SECS") {
            self.window_secs = parse_env("window_secs", &v)?;
        }
        if let Some(v) = lookup("CORNSTAND_BUCKET_CAPACITY") {
            self.bucket_capacity = parse_env("bucket_capacity", &v)?;
        }
        if let Some(v) = lookup("CORNSTAND_MAX_QUANTITY") {
            self.max_quantity = parse_env("max_quantity", &v)?;
        }
        if let Some(v) = lookup("CORNSTAND_UNIT_PRICE") {
            self.unit_price = parse_env("unit_price", &v)?;
        }
        if let Some(v) = lookup("CORNSTAND_PRICE_POLICY") {
            self.price_policy = match v.trim() {
                "trust_caller" => PricePolicy::TrustCaller,
                "catalog" => PricePolicy::Catalog,
                other => {
                    return Err(ConfigError::invalid(
                        "price_policy",
                        format!("expected trust_caller or catalog, got {:?}", other),
                    ))
                }
            };
        }
        if let Some(v) = lookup("CORNSTAND_STAGE_TIMEOUT_MS") {
            self.stage_timeout_ms = parse_env("stage_timeout_ms", &v)?;
        }
        if let Some(v) = lookup("CORNSTAND_LOCAL_CACHE") {
            self.local_cache = parse_env("local_cache", &v)?;
        }
        if let Some(v) = lookup("CORNSTAND_PRODUCT_NAME") {
            self.product_name = v;
        }
        if let Some(v) = lookup("CORNSTAND_MAX_BODY_BYTES") {
            self.max_body_bytes = parse_env("max_body_bytes", &v)?;
        }
        if let Some(v) = lookup("CORNSTAND_TOKENS") {
            self.tokens.extend(parse_tokens(&v)?);
        }
        if let Some(v) = lookup("CORNSTAND_LOG_FORMAT") {
            self.log_format = match v.trim() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(ConfigError::invalid(
                        "log_format",
                        format!("expected json or pretty, got {:?}", other),
                    ))
                }
            };
        }
        if let Some(v) = lookup("CORNSTAND_EVENTS_PATH") {
            self.events_path = Some(v).filter(|p| !p.trim().is_empty());
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs == 0 {
            return Err(ConfigError::invalid("window_secs", "must be > 0"));
        }
        if self.bucket_capacity == 0 {
            return Err(ConfigError::invalid("bucket_capacity", "must be > 0"));
        }
        if self.max_quantity < 1 {
            return Err(ConfigError::invalid("max_quantity", "must be >= 1"));
        }
        if !self.unit_price.is_finite() || self.unit_price <= 0.0 {
            return Err(ConfigError::invalid("unit_price", "must be a finite number > 0"));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::invalid("max_body_bytes", "must be > 0"));
        }
        if self.stage_timeout_ms == 0 {
            return Err(ConfigError::invalid("stage_timeout_ms", "must be > 0"));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

fn parse_env<T>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::invalid(field, format!("{:?}: {}", raw, e)))
}

/// Parse `token=principal,token2=principal2`.
fn parse_tokens(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (token, principal) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::invalid("tokens", format!("missing '=' in {:?}", pair)))?;
            let (token, principal) = (token.trim(), principal.trim());
            if token.is_empty() || principal.is_empty() {
                return Err(ConfigError::invalid("tokens", format!("empty side in {:?}", pair)));
            }
            Ok((token.to_string(), principal.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.window(), Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = Config::from_lookup(lookup(&[
            ("CORNSTAND_WINDOW_SECS", "30"),
            ("CORNSTAND_PRICE_POLICY", "catalog"),
            ("CORNSTAND_TOKENS", "t1=alice, t2=bob"),
            ("CORNSTAND_LOCAL_CACHE", "false"),
            ("CORNSTAND_LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(cfg.window_secs, 30);
        assert_eq!(cfg.price_policy, PricePolicy::Catalog);
        assert_eq!(cfg.tokens.get("t2").map(String::as_str), Some("bob"));
        assert!(!cfg.local_cache);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for vars in [
            [("CORNSTAND_WINDOW_SECS", "0")],
            [("CORNSTAND_WINDOW_SECS", "soon")],
            [("CORNSTAND_UNIT_PRICE", "-1")],
            [("CORNSTAND_PRICE_POLICY", "free")],
            [("CORNSTAND_TOKENS", "no-separator")],
            [("CORNSTAND_MAX_BODY_BYTES", "0")],
        ] {
            assert!(Config::from_lookup(lookup(&vars)).is_err(), "{:?}", vars);
        }
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = Config::from_json(r#"{"window_secs": 5, "price_policy": "catalog"}"#).unwrap();
        assert_eq!(cfg.window_secs, 5);
        assert_eq!(cfg.price_policy, PricePolicy::Catalog);
        assert_eq!(cfg.max_quantity, 10);
    }
}
