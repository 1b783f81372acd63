//! Channel options and the service-config JSON blob.
//!
//! Options are uniquely-named string or integer pairs; duplicates are
//! rejected. The `lariat.service_config` option carries a JSON document
//! whose `methodConfig[].retryPolicy` maps onto the retry engine's policy
//! per (service, method).

use std::time::Duration;

use serde::Deserialize;

use crate::error::UsageError;
use crate::retry::RetryPolicy;
use crate::status::StatusCode;

/// Well-known channel option names.
pub mod names {
    /// Overrides the user-agent header attached to every call.
    pub const USER_AGENT: &str = "lariat.user_agent";
    /// Overrides the target name checked during TLS verification.
    pub const SSL_TARGET_NAME_OVERRIDE: &str = "lariat.ssl_target_name_override";
    /// Enables SO_REUSEPORT on listening sockets.
    pub const SO_REUSEPORT: &str = "lariat.so_reuseport";
    /// JSON service config with per-method retry policies.
    pub const SERVICE_CONFIG: &str = "lariat.service_config";
}

/// A channel option value: string or integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOptionValue {
    /// String-valued option.
    Str(String),
    /// Integer-valued option.
    Int(i64),
}

/// A uniquely-named set of channel options.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    entries: Vec<(String, ChannelOptionValue)>,
}

impl ChannelOptions {
    /// Empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        name: &str,
        value: ChannelOptionValue,
    ) -> std::result::Result<(), UsageError> {
        if self.entries.iter().any(|(n, _)| n == name) {
            return Err(UsageError::DuplicateChannelOption(name.to_string()));
        }
        self.entries.push((name.to_string(), value));
        Ok(())
    }

    /// Adds a string option. Rejects duplicate names.
    pub fn add_str(
        &mut self,
        name: &str,
        value: impl Into<String>,
    ) -> std::result::Result<(), UsageError> {
        self.insert(name, ChannelOptionValue::Str(value.into()))
    }

    /// Adds an integer option. Rejects duplicate names.
    pub fn add_int(&mut self, name: &str, value: i64) -> std::result::Result<(), UsageError> {
        self.insert(name, ChannelOptionValue::Int(value))
    }

    /// Looks up a string option.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.entries.iter().find_map(|(n, v)| match v {
            ChannelOptionValue::Str(s) if n == name => Some(s.as_str()),
            _ => None,
        })
    }

    /// Looks up an integer option.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.entries.iter().find_map(|(n, v)| match v {
            ChannelOptionValue::Int(i) if n == name => Some(*i),
            _ => None,
        })
    }

    /// Number of options set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no options are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    #[serde(default)]
    method_config: Vec<RawMethodConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodConfig {
    #[serde(default)]
    name: Vec<RawMethodName>,
    retry_policy: Option<RawRetryPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodName {
    #[serde(default)]
    service: String,
    #[serde(default)]
    method: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    max_attempts: u32,
    initial_backoff: String,
    max_backoff: String,
    backoff_multiplier: f64,
    retryable_status_codes: Vec<String>,
}

/// Parses a proto-JSON duration like `"0.1s"`.
fn parse_duration(raw: &str) -> std::result::Result<Duration, UsageError> {
    let seconds = raw
        .strip_suffix('s')
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| UsageError::InvalidServiceConfig(format!("bad duration {raw:?}")))?;
    Ok(Duration::from_secs_f64(seconds))
}

/// Per-method retry policies parsed from the service config JSON.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    entries: Vec<(String, String, RetryPolicy)>,
}

impl ServiceConfig {
    /// Parses the `lariat.service_config` JSON document.
    pub fn from_json(json: &str) -> std::result::Result<Self, UsageError> {
        let raw: RawServiceConfig = serde_json::from_str(json)
            .map_err(|e| UsageError::InvalidServiceConfig(e.to_string()))?;
        let mut entries = Vec::new();
        for method_config in raw.method_config {
            let Some(raw_policy) = method_config.retry_policy else {
                continue;
            };
            let mut retryable_codes = Vec::new();
            for name in &raw_policy.retryable_status_codes {
                let code = StatusCode::from_name(name).ok_or_else(|| {
                    UsageError::InvalidServiceConfig(format!("unknown status code {name:?}"))
                })?;
                retryable_codes.push(code);
            }
            let policy = RetryPolicy {
                max_attempts: raw_policy.max_attempts,
                initial_backoff: parse_duration(&raw_policy.initial_backoff)?,
                max_backoff: parse_duration(&raw_policy.max_backoff)?,
                backoff_multiplier: raw_policy.backoff_multiplier,
                retryable_codes,
            };
            policy
                .validate()
                .map_err(|e| UsageError::InvalidServiceConfig(e.to_string()))?;
            for name in method_config.name {
                entries.push((name.service.clone(), name.method.clone(), policy.clone()));
            }
        }
        Ok(ServiceConfig { entries })
    }

    /// The retry policy for `(service, method)`: an exact match wins,
    /// otherwise a service-wide entry with an empty method name applies.
    pub fn retry_policy(&self, service: &str, method: &str) -> Option<&RetryPolicy> {
        self.entries
            .iter()
            .find(|(s, m, _)| s == service && m == method)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(s, m, _)| s == service && m.is_empty())
            })
            .map(|(_, _, policy)| policy)
    }

    /// Policy lookup from a full `/service/method` name.
    pub fn retry_policy_for_full_name(&self, full_name: &str) -> Option<&RetryPolicy> {
        let (service, method) = split_method_name(full_name)?;
        self.retry_policy(service, method)
    }
}

/// Splits `/pkg.Service/Method` into its service and method parts.
pub fn split_method_name(full_name: &str) -> Option<(&str, &str)> {
    let rest = full_name.strip_prefix('/')?;
    let (service, method) = rest.split_once('/')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}
