//! Token credentials and the fallback credential resolver.
//!
//! A [`CredentialResolver`] builds one credential chain per tenant the
//! first time it is asked and hands out the same object afterwards. The chain
//! starts with the interactive browser credential and, unless broker-only
//! mode is configured, continues with the developer/production sources.

mod bridge;
pub mod browser;
mod chain;
mod fallback;
mod sources;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;

use crate::error::{ServiceError, ServiceResult};

pub use bridge::AzureCoreCredential;
pub use browser::{AuthenticationRecord, InteractiveBrowserCredential};
pub use chain::CredentialResolver;
pub use fallback::with_key_fallback;
pub use sources::{
    AzureCliCredential, EnvironmentCredential, ManagedIdentityCredential,
    WorkloadIdentityCredential,
};

/// Tokens are refreshed this many minutes before they actually expire.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Bearer token plus its expiry.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// True while the token has more than the refresh margin left.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::minutes(EXPIRY_MARGIN_MINUTES) < self.expires_on
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Anything that can produce a bearer token for a scope such as
/// `https://management.azure.com/.default`.
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Short name used in logs and aggregated chain errors.
    fn name(&self) -> &'static str;

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken>;
}

/// The three sovereign clouds whose authority hosts are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthorityHost {
    #[default]
    AzurePublicCloud,
    AzureGovernment,
    AzureChina,
}

impl AuthorityHost {
    pub const ALL: [AuthorityHost; 3] = [
        AuthorityHost::AzurePublicCloud,
        AuthorityHost::AzureGovernment,
        AuthorityHost::AzureChina,
    ];

    /// Accepts the cloud name (case-insensitive) or its exact authority URI.
    /// Anything else is a validation error.
    pub fn parse(value: &str) -> ServiceResult<Self> {
        let trimmed = value.trim();
        let as_uri = trimmed.trim_end_matches('/').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|host| {
                host.name().eq_ignore_ascii_case(trimmed)
                    || host.authority_uri().trim_end_matches('/') == as_uri
            })
            .ok_or_else(|| {
                ServiceError::validation(format!(
                    "unsupported authority host '{value}'; expected one of \
                     AzurePublicCloud, AzureGovernment, AzureChina"
                ))
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthorityHost::AzurePublicCloud => "AzurePublicCloud",
            AuthorityHost::AzureGovernment => "AzureGovernment",
            AuthorityHost::AzureChina => "AzureChina",
        }
    }

    /// Identity provider base URI, always ending in `/`.
    pub fn authority_uri(self) -> &'static str {
        match self {
            AuthorityHost::AzurePublicCloud => "https://login.microsoftonline.com/",
            AuthorityHost::AzureGovernment => "https://login.microsoftonline.us/",
            AuthorityHost::AzureChina => "https://login.chinacloudapi.cn/",
        }
    }

    pub fn resource_manager_endpoint(self) -> &'static str {
        match self {
            AuthorityHost::AzurePublicCloud => "https://management.azure.com",
            AuthorityHost::AzureGovernment => "https://management.usgovcloudapi.net",
            AuthorityHost::AzureChina => "https://management.chinacloudapi.cn",
        }
    }

    pub fn key_vault_suffix(self) -> &'static str {
        match self {
            AuthorityHost::AzurePublicCloud => "vault.azure.net",
            AuthorityHost::AzureGovernment => "vault.usgovcloudapi.net",
            AuthorityHost::AzureChina => "vault.azure.cn",
        }
    }
}

impl fmt::Display for AuthorityHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `https://host/.default` style scope for a resource URI.
pub fn default_scope(resource: &str) -> String {
    format!("{}/.default", resource.trim_end_matches('/'))
}

/// Wraps a credential and reuses its tokens per scope until they are close to
/// expiry.
pub struct Memoized<C> {
    inner: C,
    tokens: DashMap<String, AccessToken>,
}

impl<C> Memoized<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            tokens: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: TokenCredential> TokenCredential for Memoized<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken> {
        let cached = self.tokens.get(scope).map(|t| t.value().clone());
        if let Some(token) = cached.filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token);
        }
        let token = self.inner.get_token(scope).await?;
        self.tokens.insert(scope.to_string(), token.clone());
        Ok(token)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Credential returning a fixed token and counting calls.
    pub struct StaticCredential {
        pub token: String,
        pub lifetime: ChronoDuration,
        pub calls: AtomicUsize,
    }

    impl StaticCredential {
        pub fn new(token: &str) -> Self {
            Self {
                token: token.to_string(),
                lifetime: ChronoDuration::hours(1),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenCredential for StaticCredential {
        fn name(&self) -> &'static str {
            "StaticCredential"
        }

        async fn get_token(&self, _scope: &str) -> ServiceResult<AccessToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken::new(&self.token, Utc::now() + self.lifetime))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticCredential;
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn authority_host_accepts_names_and_uris() {
        assert_eq!(
            AuthorityHost::parse("AzurePublicCloud").unwrap().authority_uri(),
            "https://login.microsoftonline.com/"
        );
        assert_eq!(
            AuthorityHost::parse("azuregovernment").unwrap(),
            AuthorityHost::AzureGovernment
        );
        assert_eq!(
            AuthorityHost::parse("https://login.chinacloudapi.cn").unwrap(),
            AuthorityHost::AzureChina
        );
    }

    #[test]
    fn authority_host_rejects_unknown_values() {
        for bad in ["AzureGermany", "https://login.example.com/", ""] {
            let err = AuthorityHost::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{bad}");
        }
    }

    #[test]
    fn default_scope_appends_suffix_once() {
        assert_eq!(
            default_scope("https://c1.kusto.windows.net/"),
            "https://c1.kusto.windows.net/.default"
        );
    }

    #[test]
    fn token_freshness_honours_margin() {
        let now = Utc::now();
        assert!(AccessToken::new("t", now + ChronoDuration::minutes(30)).is_fresh(now));
        assert!(!AccessToken::new("t", now + ChronoDuration::minutes(2)).is_fresh(now));
    }

    #[tokio::test]
    async fn memoized_reuses_fresh_tokens_per_scope() {
        let memo = Memoized::new(StaticCredential::new("abc"));
        memo.get_token("scope-a").await.unwrap();
        memo.get_token("scope-a").await.unwrap();
        memo.get_token("scope-b").await.unwrap();
        assert_eq!(memo.inner().calls(), 2);
    }

    #[tokio::test]
    async fn memoized_refetches_tokens_inside_margin() {
        let mut inner = StaticCredential::new("abc");
        inner.lifetime = ChronoDuration::minutes(1);
        let memo = Memoized::new(inner);
        memo.get_token("scope").await.unwrap();
        memo.get_token("scope").await.unwrap();
        assert_eq!(memo.inner().calls(), 2);
    }
}
