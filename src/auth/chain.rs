use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use super::{
    AccessToken, AuthorityHost, AzureCliCredential, EnvironmentCredential,
    InteractiveBrowserCredential, ManagedIdentityCredential, Memoized, TokenCredential,
    WorkloadIdentityCredential,
};
use crate::config::{CredentialOptions, EnvLookup};
use crate::error::{ErrorKind, ServiceError, ServiceResult};

/// Ordered list of token sources; the first source that yields a token for
/// the requested scope wins.
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl ChainedCredential {
    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    fn name(&self) -> &'static str {
        "ChainedCredential"
    }

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken> {
        let mut failures = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.get_token(scope).await {
                Ok(token) => {
                    tracing::debug!(source = source.name(), scope, "token acquired");
                    return Ok(token);
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "token source failed");
                    failures.push(format!("{}: {}", source.name(), e));
                }
            }
        }
        Err(ServiceError::new(
            ErrorKind::Unauthorized,
            format!(
                "no credential in the chain could acquire a token for '{scope}' ({})",
                failures.join("; ")
            ),
        ))
    }
}

/// Assemble the chain for `options` without touching the network.
///
/// Broker-only mode yields just the interactive credential. Otherwise the
/// interactive credential comes first, then environment secrets, then (only
/// when production sources are enabled) workload and managed identity, then
/// the Azure CLI session.
pub fn build_chain(
    options: &CredentialOptions,
    tenant: Option<&str>,
    http: &reqwest::Client,
    env: &EnvLookup,
) -> ChainedCredential {
    let authority = options.authority_host.authority_uri();
    let tenant = tenant.or(options.tenant_id.as_deref());

    let browser = InteractiveBrowserCredential::new(
        http.clone(),
        authority,
        tenant,
        options.client_id.as_deref(),
        options.authentication_record.as_ref(),
        options.browser_timeout,
    );
    let mut sources: Vec<Arc<dyn TokenCredential>> = Vec::with_capacity(5);
    sources.push(Arc::new(Memoized::new(browser)));

    if options.only_use_broker {
        return ChainedCredential::new(sources);
    }

    sources.push(Arc::new(Memoized::new(EnvironmentCredential::new(
        http.clone(),
        authority,
        env,
    ))));
    if options.include_production_credentials {
        sources.push(Arc::new(Memoized::new(WorkloadIdentityCredential::new(
            http.clone(),
            authority,
            env,
        ))));
        sources.push(Arc::new(Memoized::new(ManagedIdentityCredential::new(
            http.clone(),
            env,
        ))));
    }
    sources.push(Arc::new(Memoized::new(AzureCliCredential::new(tenant))));
    ChainedCredential::new(sources)
}

/// A ready credential together with the cloud it authenticates against.
pub struct ResolvedCredential {
    authority: AuthorityHost,
    credential: Arc<dyn TokenCredential>,
}

impl ResolvedCredential {
    pub fn new(authority: AuthorityHost, credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            authority,
            credential,
        }
    }

    pub fn authority(&self) -> AuthorityHost {
        self.authority
    }

    pub fn credential(&self) -> Arc<dyn TokenCredential> {
        Arc::clone(&self.credential)
    }

}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("authority", &self.authority)
            .field("credential", &self.credential.name())
            .finish()
    }
}

/// Builds the credential chain once per tenant and hands out the same object
/// for the rest of the process.
///
/// Each tenant moves `Uninitialized → Resolving → Ready`. Options are read
/// from the environment while resolving; a resolution that fails validation
/// leaves the tenant `Uninitialized` so a corrected environment can succeed
/// later.
pub struct CredentialResolver {
    env: EnvLookup,
    http: reqwest::Client,
    resolved: DashMap<String, Arc<OnceCell<Arc<ResolvedCredential>>>>,
    fixed: Option<Arc<ResolvedCredential>>,
}

impl CredentialResolver {
    pub fn new(env: EnvLookup, http: reqwest::Client) -> Self {
        Self {
            env,
            http,
            resolved: DashMap::new(),
            fixed: None,
        }
    }

    /// Resolver that skips chain construction and is `Ready` for every tenant
    /// with a caller-supplied credential.
    pub fn with_credential(authority: AuthorityHost, credential: Arc<dyn TokenCredential>) -> Self {
        let mut resolver = Self::new(Arc::new(|_: &str| -> Option<String> { None }), reqwest::Client::new());
        resolver.fixed = Some(Arc::new(ResolvedCredential::new(authority, credential)));
        resolver
    }

    fn slot(&self, tenant: Option<&str>) -> Arc<OnceCell<Arc<ResolvedCredential>>> {
        let key = tenant.unwrap_or_default();
        if let Some(cell) = self.resolved.get(key) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.resolved.entry(key.to_string()).or_default().value())
    }

    pub fn is_ready(&self, tenant: Option<&str>) -> bool {
        if self.fixed.is_some() {
            return true;
        }
        self.resolved
            .get(tenant.unwrap_or_default())
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Return the ready credential for `tenant`, building it on first use.
    pub async fn resolve(&self, tenant: Option<&str>) -> ServiceResult<Arc<ResolvedCredential>> {
        if let Some(fixed) = &self.fixed {
            return Ok(Arc::clone(fixed));
        }
        let cell = self.slot(tenant);
        let resolved = cell
            .get_or_try_init(|| async {
                let options = CredentialOptions::from_lookup(&*self.env)?;
                let chain = build_chain(&options, tenant, &self.http, &self.env);
                tracing::info!(
                    tenant = tenant.or(options.tenant_id.as_deref()).unwrap_or("default"),
                    authority_host = %options.authority_host,
                    sources = ?chain.source_names(),
                    "credential chain ready"
                );
                let credential: Arc<dyn TokenCredential> = Arc::new(chain);
                Ok::<_, ServiceError>(Arc::new(ResolvedCredential::new(
                    options.authority_host,
                    credential,
                )))
            })
            .await
            .map_err(|e| e.context("resolve credential"))?;
        Ok(Arc::clone(resolved))
    }
}
