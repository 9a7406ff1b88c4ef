use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthenticationRecord, AuthorityHost};
use crate::error::{ServiceError, ServiceResult};

pub const ENV_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const ENV_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";
pub const ENV_ONLY_USE_BROKER: &str = "AZURE_MCP_ONLY_USE_BROKER_CREDENTIAL";
pub const ENV_CLIENT_ID: &str = "AZURE_MCP_CLIENT_ID";
pub const ENV_INCLUDE_PRODUCTION: &str = "AZURE_MCP_INCLUDE_PRODUCTION_CREDENTIALS";
pub const ENV_AUTHENTICATION_RECORD: &str = "AZURE_MCP_AUTHENTICATION_RECORD";
pub const ENV_BROWSER_TIMEOUT: &str = "AZURE_MCP_BROWSER_AUTH_TIMEOUT_SECONDS";
pub const ENV_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
pub const ENV_CLIENT_CACHE_TTL: &str = "AZURE_MCP_CLIENT_CACHE_TTL_SECONDS";
pub const ENV_LIST_CACHE_TTL: &str = "AZURE_MCP_LIST_CACHE_TTL_SECONDS";

pub const DEFAULT_BROWSER_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CLIENT_CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_LIST_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Environment lookup. Production code reads the process environment; tests
/// pass a closure over a map so nothing global is mutated.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn process_env() -> EnvLookup {
    Arc::new(|name: &str| env::var(name).ok())
}

/// Read a variable, treating an empty or whitespace-only value as unset.
fn var(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a boolean-ish flag (`true/1/yes/on`, `false/0/no/off`).
pub fn parse_flag(name: &str, value: &str) -> ServiceResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ServiceError::validation(format!(
            "{name} must be a boolean (true/false), got '{other}'"
        ))),
    }
}

fn parse_seconds(name: &str, value: &str) -> ServiceResult<Duration> {
    let secs: u64 = value.trim().parse().map_err(|_| {
        ServiceError::validation(format!(
            "{name} must be a whole number of seconds, got '{value}'"
        ))
    })?;
    if secs == 0 {
        return Err(ServiceError::validation(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Settings that shape the credential chain.
///
/// Read from the environment when a credential is resolved (and once at
/// startup to fail fast):
/// - `AZURE_TENANT_ID`: scope tokens to one directory.
/// - `AZURE_AUTHORITY_HOST`: `AzurePublicCloud`, `AzureGovernment` or
///   `AzureChina` (or the matching authority URI).
/// - `AZURE_MCP_ONLY_USE_BROKER_CREDENTIAL`: skip the default chain.
/// - `AZURE_MCP_CLIENT_ID`: application id for interactive sign-in.
/// - `AZURE_MCP_INCLUDE_PRODUCTION_CREDENTIALS`: add workload and managed
///   identity to the chain.
/// - `AZURE_MCP_AUTHENTICATION_RECORD`: serialized record of a previous
///   interactive sign-in.
/// - `AZURE_MCP_BROWSER_AUTH_TIMEOUT_SECONDS`: interactive flow deadline
///   (default 300).
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialOptions {
    pub tenant_id: Option<String>,
    pub authority_host: AuthorityHost,
    pub only_use_broker: bool,
    pub client_id: Option<String>,
    pub include_production_credentials: bool,
    pub authentication_record: Option<AuthenticationRecord>,
    pub browser_timeout: Duration,
}

impl Default for CredentialOptions {
    fn default() -> Self {
        Self {
            tenant_id: None,
            authority_host: AuthorityHost::default(),
            only_use_broker: false,
            client_id: None,
            include_production_credentials: false,
            authentication_record: None,
            browser_timeout: DEFAULT_BROWSER_TIMEOUT,
        }
    }
}

impl CredentialOptions {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> ServiceResult<Self> {
        let authority_host = match var(lookup, ENV_AUTHORITY_HOST) {
            Some(host) => AuthorityHost::parse(&host)?,
            None => AuthorityHost::default(),
        };
        let only_use_broker = var(lookup, ENV_ONLY_USE_BROKER)
            .map(|v| parse_flag(ENV_ONLY_USE_BROKER, &v))
            .transpose()?
            .unwrap_or(false);
        let include_production_credentials = var(lookup, ENV_INCLUDE_PRODUCTION)
            .map(|v| parse_flag(ENV_INCLUDE_PRODUCTION, &v))
            .transpose()?
            .unwrap_or(false);
        let browser_timeout = var(lookup, ENV_BROWSER_TIMEOUT)
            .map(|v| parse_seconds(ENV_BROWSER_TIMEOUT, &v))
            .transpose()?
            .unwrap_or(DEFAULT_BROWSER_TIMEOUT);
        let authentication_record = var(lookup, ENV_AUTHENTICATION_RECORD)
            .map(|v| AuthenticationRecord::parse(&v))
            .transpose()?;

        Ok(Self {
            tenant_id: var(lookup, ENV_TENANT_ID),
            authority_host,
            only_use_broker,
            client_id: var(lookup, ENV_CLIENT_ID),
            include_production_credentials,
            authentication_record,
            browser_timeout,
        })
    }
}

/// Lifetimes of cached connection handles and cached list results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub client_ttl: Duration,
    pub list_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            client_ttl: DEFAULT_CLIENT_CACHE_TTL,
            list_ttl: DEFAULT_LIST_CACHE_TTL,
        }
    }
}

/// Top-level server configuration assembled from environment variables at startup.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub credential: CredentialOptions,
    pub cache: CacheConfig,
    /// Used when a tool call omits `subscription`.
    pub default_subscription: Option<String>,
}

impl Config {
    /// Build configuration from the current process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name: &str| env::var(name).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let credential =
            CredentialOptions::from_lookup(lookup).context("Invalid credential configuration")?;

        let mut cache = CacheConfig::default();
        if let Some(v) = var(lookup, ENV_CLIENT_CACHE_TTL) {
            cache.client_ttl = parse_seconds(ENV_CLIENT_CACHE_TTL, &v)?;
        }
        if let Some(v) = var(lookup, ENV_LIST_CACHE_TTL) {
            cache.list_ttl = parse_seconds(ENV_LIST_CACHE_TTL, &v)?;
        }

        let default_subscription = var(lookup, ENV_SUBSCRIPTION_ID);
        if default_subscription.is_none() {
            tracing::info!(
                "{ENV_SUBSCRIPTION_ID} is not set; tools that enumerate resources \
                 will require an explicit `subscription` parameter"
            );
        }

        tracing::info!(
            authority_host = %credential.authority_host,
            only_use_broker = credential.only_use_broker,
            include_production_credentials = credential.include_production_credentials,
            authentication_record = credential.authentication_record.is_some(),
            "credential configuration loaded"
        );

        Ok(Config {
            credential,
            cache,
            default_subscription,
        })
    }

    /// Convenience: the explicit subscription, else the configured default.
    pub fn require_subscription<'a>(&'a self, explicit: Option<&'a str>) -> ServiceResult<&'a str> {
        explicit
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or(self.default_subscription.as_deref())
            .ok_or_else(|| {
                ServiceError::validation(format!(
                    "subscription parameter is required when {ENV_SUBSCRIPTION_ID} is not set"
                ))
            })
    }
}
