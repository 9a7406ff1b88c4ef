use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use azure_core::credentials::Secret;
use azure_core::error::ErrorKind as CoreErrorKind;
use azure_data_cosmos::{CosmosClient, PartitionKey, Query};
use futures::TryStreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::arm::{ResourceInfo, ResourceKind};
use crate::auth::{with_key_fallback, AzureCoreCredential, CredentialResolver, TokenCredential};
use crate::cache::{CacheGroup, CacheKey, TtlCache};
use crate::config::CacheConfig;
use crate::error::{cancellable, require, ErrorKind, ResultExt, ServiceError, ServiceResult};
use crate::subscription::SubscriptionService;

/// Default item cap for `cosmos_query_items`.
pub const DEFAULT_MAX_ITEMS: usize = 100;
/// Hard upper bound on returned items.
pub const HARD_MAX_ITEMS: usize = 5_000;
pub const DEFAULT_QUERY: &str = "SELECT * FROM c";

/// Map an SDK error onto the service taxonomy using the HTTP status it
/// carries, if any. Errors raised by our own credential chain keep the kind
/// they had before crossing the SDK.
fn sdk_error(err: azure_core::Error) -> ServiceError {
    let bridged = std::iter::successors(std::error::Error::source(&err), |e| e.source())
        .find_map(|e| e.downcast_ref::<ServiceError>())
        .map(ServiceError::kind);
    let kind = match (bridged, err.kind()) {
        (Some(kind), _) => kind,
        (None, CoreErrorKind::Credential) => ErrorKind::Unauthorized,
        _ => ErrorKind::Transient,
    };
    let status = err.http_status().map(u16::from);
    let base = ServiceError::new(kind, err.to_string());
    let base = match status {
        Some(status) => base.with_status(status),
        None => base,
    };
    base.with_source(err)
}

/// The Cosmos DB data-plane operations the service needs.
#[async_trait]
pub trait CosmosDataPlane: Send + Sync {
    async fn list_databases(&self) -> ServiceResult<Vec<String>>;

    async fn list_containers(&self, database: &str) -> ServiceResult<Vec<String>>;

    /// `partition_key: None` runs a cross-partition query.
    async fn query_items(
        &self,
        database: &str,
        container: &str,
        query: &str,
        partition_key: Option<&str>,
        max_items: usize,
    ) -> ServiceResult<Vec<Value>>;
}

/// Builds data-plane clients for an account endpoint.
pub trait CosmosConnector: Send + Sync {
    fn with_credential(
        &self,
        endpoint: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> ServiceResult<Arc<dyn CosmosDataPlane>>;

    fn with_key(&self, endpoint: &str, key: String) -> ServiceResult<Arc<dyn CosmosDataPlane>>;
}

/// [`CosmosConnector`] backed by `azure_data_cosmos`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SdkCosmosConnector;

impl CosmosConnector for SdkCosmosConnector {
    fn with_credential(
        &self,
        endpoint: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> ServiceResult<Arc<dyn CosmosDataPlane>> {
        let client = CosmosClient::new(endpoint, AzureCoreCredential::new(credential), None)
            .map_err(sdk_error)
            .context("create Cosmos DB client")?;
        Ok(Arc::new(SdkCosmosClient { client }))
    }

    fn with_key(&self, endpoint: &str, key: String) -> ServiceResult<Arc<dyn CosmosDataPlane>> {
        let client = CosmosClient::with_key(endpoint, Secret::from(key), None)
            .map_err(sdk_error)
            .context("create Cosmos DB client with account key")?;
        Ok(Arc::new(SdkCosmosClient { client }))
    }
}

struct SdkCosmosClient {
    client: CosmosClient,
}

#[async_trait]
impl CosmosDataPlane for SdkCosmosClient {
    async fn list_databases(&self) -> ServiceResult<Vec<String>> {
        let mut pager = self
            .client
            .query_databases(Query::from(DEFAULT_QUERY), None)
            .map_err(sdk_error)?;

        let mut names = Vec::new();
        while let Some(db) = pager.try_next().await.map_err(sdk_error)? {
            names.push(db.id.clone());
        }
        Ok(names)
    }

    async fn list_containers(&self, database: &str) -> ServiceResult<Vec<String>> {
        let mut pager = self
            .client
            .database_client(database)
            .query_containers(Query::from(DEFAULT_QUERY), None)
            .map_err(sdk_error)?;

        let mut names = Vec::new();
        while let Some(container) = pager.try_next().await.map_err(sdk_error)? {
            names.push(container.id.to_string());
        }
        Ok(names)
    }

    async fn query_items(
        &self,
        database: &str,
        container: &str,
        query: &str,
        partition_key: Option<&str>,
        max_items: usize,
    ) -> ServiceResult<Vec<Value>> {
        let container_client = self
            .client
            .database_client(database)
            .container_client(container);

        let pk = match partition_key {
            Some(key) => PartitionKey::from(key.to_string()),
            None => PartitionKey::EMPTY,
        };

        let mut pager = container_client
            .query_items::<Value>(query, pk, None)
            .map_err(sdk_error)?;

        let mut items = Vec::new();
        while let Some(item) = pager.try_next().await.map_err(sdk_error)? {
            items.push(item);
            if items.len() >= max_items {
                break;
            }
        }
        Ok(items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CosmosAuth {
    AzureAd,
    AccountKey,
}

/// Cached per-account handle. Refuses work once closed.
pub struct CosmosConnection {
    endpoint: String,
    auth: CosmosAuth,
    client: Arc<dyn CosmosDataPlane>,
    closed: AtomicBool,
}

impl CosmosConnection {
    fn new(endpoint: &str, auth: CosmosAuth, client: Arc<dyn CosmosDataPlane>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            auth,
            client,
            closed: AtomicBool::new(false),
        }
    }

    pub fn auth(&self) -> CosmosAuth {
        self.auth
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn client(&self) -> ServiceResult<&dyn CosmosDataPlane> {
        if self.is_closed() {
            return Err(ServiceError::new(
                ErrorKind::Other,
                format!("connection to {} is closed", self.endpoint),
            ));
        }
        Ok(self.client.as_ref())
    }
}

#[derive(Clone)]
pub struct CosmosService {
    subscriptions: SubscriptionService,
    resolver: Arc<CredentialResolver>,
    connector: Arc<dyn CosmosConnector>,
    cache: TtlCache,
    ttl: CacheConfig,
}

impl CosmosService {
    pub fn new(
        subscriptions: SubscriptionService,
        resolver: Arc<CredentialResolver>,
        connector: Arc<dyn CosmosConnector>,
        cache: TtlCache,
        ttl: CacheConfig,
    ) -> Self {
        Self {
            subscriptions,
            resolver,
            connector,
            cache,
            ttl,
        }
    }

    pub async fn list_accounts(
        &self,
        subscription: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Arc<Vec<ResourceInfo>>> {
        cancellable(
            cancel,
            self.subscriptions
                .list_resources(subscription, ResourceKind::CosmosAccount, tenant),
        )
        .await
    }

    /// Connect with Azure AD first; fall back to the account's primary key
    /// when the account rejects the token.
    async fn connect(
        &self,
        account: &ResourceInfo,
        tenant: Option<&str>,
    ) -> ServiceResult<CosmosConnection> {
        let endpoint = account.endpoint.as_str();
        let target = format!("Cosmos DB account '{}'", account.name);
        with_key_fallback(
            &target,
            || async {
                let resolved = self.resolver.resolve(tenant).await?;
                let client = self.connector.with_credential(endpoint, resolved.credential())?;
                client.list_databases().await?;
                Ok::<_, ServiceError>(CosmosConnection::new(endpoint, CosmosAuth::AzureAd, client))
            },
            || async {
                let key = self
                    .subscriptions
                    .enumerator()
                    .list_account_keys(&account.id, tenant)
                    .await?;
                let client = self.connector.with_key(endpoint, key)?;
                client.list_databases().await?;
                Ok::<_, ServiceError>(CosmosConnection::new(endpoint, CosmosAuth::AccountKey, client))
            },
        )
        .await
    }

    async fn connection(
        &self,
        account: &str,
        subscription: &str,
        tenant: Option<&str>,
    ) -> ServiceResult<(Arc<CosmosConnection>, String)> {
        let info = self
            .subscriptions
            .find_resource(subscription, ResourceKind::CosmosAccount, account, tenant)
            .await?;
        if info.endpoint.is_empty() {
            return Err(ServiceError::not_found(format!(
                "Cosmos DB account '{account}' has no document endpoint"
            )));
        }
        let key = CacheKey::endpoint(&info.endpoint).with_tenant(tenant);
        let conn = self
            .cache
            .get_or_try_insert_with(&CacheGroup::COSMOS, key, self.ttl.client_ttl, || async {
                let conn = self.connect(&info, tenant).await?;
                tracing::info!(
                    account = %info.name,
                    auth = ?conn.auth(),
                    "cosmos connection established"
                );
                Ok::<_, ServiceError>(conn)
            })
            .await?;
        Ok((conn, info.endpoint.clone()))
    }

    pub async fn list_databases(
        &self,
        account: &str,
        subscription: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Arc<Vec<String>>> {
        require("account", account)?;
        cancellable(cancel, async {
            let (conn, endpoint) = self.connection(account, subscription, tenant).await?;
            let key = CacheKey::endpoint(&endpoint)
                .with_tenant(tenant)
                .with_facet("databases");
            self.cache
                .get_or_try_insert_with(&CacheGroup::COSMOS, key, self.ttl.list_ttl, || async {
                    conn.client()?
                        .list_databases()
                        .await
                        .with_context(|| format!("list databases of account '{account}'"))
                })
                .await
        })
        .await
    }

    pub async fn list_containers(
        &self,
        account: &str,
        database: &str,
        subscription: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Arc<Vec<String>>> {
        require("account", account)?;
        require("database", database)?;
        cancellable(cancel, async {
            let (conn, endpoint) = self.connection(account, subscription, tenant).await?;
            let key = CacheKey::endpoint(&endpoint)
                .with_database(database)
                .with_tenant(tenant)
                .with_facet("containers");
            self.cache
                .get_or_try_insert_with(&CacheGroup::COSMOS, key, self.ttl.list_ttl, || async {
                    conn.client()?
                        .list_containers(database)
                        .await
                        .with_context(|| {
                            format!("list containers in database '{database}' of account '{account}'")
                        })
                })
                .await
        })
        .await
    }

    /// Run a SQL-API query, returning at most `max_items` documents (clamped
    /// to [`HARD_MAX_ITEMS`]).
    #[allow(clippy::too_many_arguments)]
    pub async fn query_items(
        &self,
        account: &str,
        database: &str,
        container: &str,
        query: Option<&str>,
        partition_key: Option<&str>,
        max_items: Option<usize>,
        subscription: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<Value>> {
        require("account", account)?;
        require("database", database)?;
        require("container", container)?;
        let query = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or(DEFAULT_QUERY);
        let max_items = max_items.unwrap_or(DEFAULT_MAX_ITEMS).clamp(1, HARD_MAX_ITEMS);
        cancellable(cancel, async {
            let (conn, _) = self.connection(account, subscription, tenant).await?;
            conn.client()?
                .query_items(database, container, query, partition_key, max_items)
                .await
                .with_context(|| format!("query container '{container}' in database '{database}'"))
        })
        .await
    }

    /// Close and drop every cached Cosmos connection and list.
    pub fn dispose(&self) -> usize {
        self.cache
            .dispose_group::<CosmosConnection, _>(&CacheGroup::COSMOS, |_, conn| conn.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::StaticCredential;
    use crate::auth::AuthorityHost;
    use crate::subscription::testing::FakeArm;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SUB: &str = "6f0c2a52-5a3b-4b8e-9a84-5b2b2f1d1e11";
    const ENDPOINT: &str = "https://acct.documents.azure.com:443/";

    #[test]
    fn sdk_errors_keep_credential_chain_kind() {
        let cancelled = azure_core::Error::new(
            CoreErrorKind::Credential,
            ServiceError::new(ErrorKind::Cancelled, "sign-in cancelled"),
        );
        assert_eq!(sdk_error(cancelled).kind(), ErrorKind::Cancelled);

        let opaque = azure_core::Error::new(
            CoreErrorKind::Credential,
            std::io::Error::other("no token"),
        );
        assert_eq!(sdk_error(opaque).kind(), ErrorKind::Unauthorized);

        let io = azure_core::Error::new(CoreErrorKind::Io, std::io::Error::other("reset"));
        assert_eq!(sdk_error(io).kind(), ErrorKind::Transient);
    }

    #[derive(Default)]
    struct FakeAccount {
        aad_status: Option<u16>,
        key_status: Option<u16>,
        aad_connects: AtomicUsize,
        key_connects: AtomicUsize,
        database_lists: AtomicUsize,
    }

    struct FakeClient {
        account: Arc<FakeAccount>,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl CosmosDataPlane for FakeClient {
        async fn list_databases(&self) -> ServiceResult<Vec<String>> {
            if let Some(status) = self.fail_with {
                return Err(ServiceError::from_status(status, ""));
            }
            self.account.database_lists.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["orders".to_string()])
        }

        async fn list_containers(&self, database: &str) -> ServiceResult<Vec<String>> {
            Ok(vec![format!("{database}-items")])
        }

        async fn query_items(
            &self,
            _database: &str,
            _container: &str,
            query: &str,
            _partition_key: Option<&str>,
            max_items: usize,
        ) -> ServiceResult<Vec<Value>> {
            Ok((0..10_000)
                .map(|i| serde_json::json!({"id": i, "q": query}))
                .take(max_items)
                .collect())
        }
    }

    impl CosmosConnector for Arc<FakeAccount> {
        fn with_credential(
            &self,
            _endpoint: &str,
            _credential: Arc<dyn TokenCredential>,
        ) -> ServiceResult<Arc<dyn CosmosDataPlane>> {
            self.aad_connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeClient {
                account: Arc::clone(self),
                fail_with: self.aad_status,
            }))
        }

        fn with_key(&self, _endpoint: &str, key: String) -> ServiceResult<Arc<dyn CosmosDataPlane>> {
            assert_eq!(key, "primary-key");
            self.key_connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeClient {
                account: Arc::clone(self),
                fail_with: self.key_status,
            }))
        }
    }

    fn service(account: Arc<FakeAccount>, key: Option<&str>) -> (CosmosService, Arc<FakeArm>) {
        let mut arm = FakeArm::default().with_resource(ResourceKind::CosmosAccount, "acct", ENDPOINT);
        arm.account_key = key.map(str::to_string);
        let arm = Arc::new(arm);
        let cache = TtlCache::new();
        let ttl = CacheConfig {
            client_ttl: Duration::from_secs(600),
            list_ttl: Duration::from_secs(60),
        };
        let resolver = Arc::new(CredentialResolver::with_credential(
            AuthorityHost::AzurePublicCloud,
            Arc::new(StaticCredential::new("tok")),
        ));
        let svc = CosmosService::new(
            SubscriptionService::new(arm.clone(), cache.clone(), ttl.list_ttl),
            resolver,
            Arc::new(account),
            cache,
            ttl,
        );
        (svc, arm)
    }

    #[tokio::test]
    async fn aad_success_never_fetches_keys() {
        let account = Arc::new(FakeAccount::default());
        let (svc, arm) = service(account.clone(), Some("primary-key"));
        let cancel = CancellationToken::new();
        let dbs = svc.list_databases("acct", SUB, None, &cancel).await.unwrap();
        assert_eq!(*dbs, vec!["orders".to_string()]);
        assert_eq!(arm.key_calls.load(Ordering::SeqCst), 0);
        assert_eq!(account.key_connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unauthorized_aad_falls_back_to_account_key_once() {
        let account = Arc::new(FakeAccount {
            aad_status: Some(401),
            ..Default::default()
        });
        let (svc, arm) = service(account.clone(), Some("primary-key"));
        let cancel = CancellationToken::new();

        svc.list_databases("acct", SUB, None, &cancel).await.unwrap();
        svc.list_containers("acct", "orders", SUB, None, &cancel)
            .await
            .unwrap();

        assert_eq!(account.aad_connects.load(Ordering::SeqCst), 1);
        assert_eq!(account.key_connects.load(Ordering::SeqCst), 1);
        assert_eq!(arm.key_calls.load(Ordering::SeqCst), 1);
        let (conn, _) = svc.connection("acct", SUB, None).await.unwrap();
        assert_eq!(conn.auth(), CosmosAuth::AccountKey);
    }

    #[tokio::test]
    async fn transient_aad_failure_is_not_retried_with_key() {
        let account = Arc::new(FakeAccount {
            aad_status: Some(503),
            ..Default::default()
        });
        let (svc, arm) = service(account.clone(), Some("primary-key"));
        let err = svc
            .list_databases("acct", SUB, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(arm.key_calls.load(Ordering::SeqCst), 0);
        assert!(svc.cache.list_keys(&CacheGroup::COSMOS).is_empty());
    }

    #[tokio::test]
    async fn both_attempts_failing_reports_both() {
        let account = Arc::new(FakeAccount {
            aad_status: Some(403),
            ..Default::default()
        });
        // No key available: listKeys is rejected.
        let (svc, _) = service(account, None);
        let err = svc
            .list_databases("acct", SUB, None, &CancellationToken::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Azure AD credential"), "{msg}");
        assert!(msg.contains("shared key"), "{msg}");
    }

    #[tokio::test]
    async fn query_defaults_and_caps() {
        let (svc, _) = service(Arc::new(FakeAccount::default()), None);
        let cancel = CancellationToken::new();
        let items = svc
            .query_items("acct", "orders", "items", None, None, None, SUB, None, &cancel)
            .await
            .unwrap();
        assert_eq!(items.len(), DEFAULT_MAX_ITEMS);
        assert_eq!(items[0]["q"], DEFAULT_QUERY);

        let items = svc
            .query_items(
                "acct",
                "orders",
                "items",
                Some("SELECT c.id FROM c"),
                None,
                Some(9_999),
                SUB,
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(items.len(), HARD_MAX_ITEMS);
    }

    #[tokio::test]
    async fn blank_container_is_rejected() {
        let account = Arc::new(FakeAccount::default());
        let (svc, _) = service(account.clone(), None);
        let err = svc
            .query_items("acct", "orders", " ", None, None, None, SUB, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(account.aad_connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispose_closes_cached_connection() {
        let (svc, _) = service(Arc::new(FakeAccount::default()), None);
        let (conn, _) = svc.connection("acct", SUB, None).await.unwrap();
        assert_eq!(svc.dispose(), 1);
        assert!(conn.is_closed());
        assert!(conn.client().is_err());
    }
}
