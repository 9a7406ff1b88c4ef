use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::arm::{ArmClient, ResourceEnumerator};
use crate::auth::CredentialResolver;
use crate::cache::TtlCache;
use crate::config::Config;
use crate::cosmos::{CosmosService, SdkCosmosConnector};
use crate::error::{ServiceError, ServiceResult};
use crate::keyvault::KeyVaultService;
use crate::kusto::{ClusterRef, KustoService, RestKustoConnector};
use crate::subscription::SubscriptionService;

// ---------------------------------------------------------------------------
// Tool parameter types
// ---------------------------------------------------------------------------

/// Parameters for `subscription_list`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubscriptionListParams {
    /// Azure AD tenant to authenticate against.  Defaults to `AZURE_TENANT_ID`
    /// or the credential's home tenant.
    pub tenant: Option<String>,
}

/// Parameters for the `*_list` tools that enumerate resources in a subscription.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResourceListParams {
    /// Subscription id or display name.  Falls back to `AZURE_SUBSCRIPTION_ID`.
    pub subscription: Option<String>,
    pub tenant: Option<String>,
}

/// Parameters for `kusto_database_list`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KustoDatabaseListParams {
    /// Cluster URI, e.g. `https://mycluster.westeurope.kusto.windows.net`.
    pub cluster_uri: Option<String>,
    /// Cluster name, looked up in `subscription` when `cluster_uri` is omitted.
    pub cluster_name: Option<String>,
    pub subscription: Option<String>,
    pub tenant: Option<String>,
}

/// Parameters for `kusto_table_list`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KustoTableListParams {
    pub cluster_uri: Option<String>,
    pub cluster_name: Option<String>,
    pub subscription: Option<String>,
    pub database: String,
    pub tenant: Option<String>,
}

/// Parameters for `kusto_table_schema` and `kusto_sample`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KustoTableParams {
    pub cluster_uri: Option<String>,
    pub cluster_name: Option<String>,
    pub subscription: Option<String>,
    pub database: String,
    pub table: String,
    /// Rows to sample (`kusto_sample` only, default: 10).
    pub limit: Option<usize>,
    pub tenant: Option<String>,
}

/// Parameters for `kusto_query`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KustoQueryParams {
    pub cluster_uri: Option<String>,
    pub cluster_name: Option<String>,
    pub subscription: Option<String>,
    pub database: String,
    /// KQL query to run.
    pub query: String,
    /// Maximum number of rows to return (default: 500, maximum: 10 000).
    pub max_rows: Option<usize>,
    pub tenant: Option<String>,
}

/// Parameters for `cosmos_database_list`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CosmosDatabaseListParams {
    /// Cosmos DB account name.
    pub account: String,
    pub subscription: Option<String>,
    pub tenant: Option<String>,
}

/// Parameters for `cosmos_container_list`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CosmosContainerListParams {
    pub account: String,
    pub database: String,
    pub subscription: Option<String>,
    pub tenant: Option<String>,
}

/// Parameters for `cosmos_query_items`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CosmosQueryItemsParams {
    pub account: String,
    pub database: String,
    /// Container to query.
    pub container: String,
    /// SQL-API query string (default: `SELECT * FROM c`).
    pub query: Option<String>,
    /// Partition key value for single-partition queries.  Omit (or set to
    /// `null`) to issue a cross-partition query.
    pub partition_key: Option<String>,
    /// Maximum number of items to return (default: 100, maximum: 5 000).
    pub max_items: Option<usize>,
    pub subscription: Option<String>,
    pub tenant: Option<String>,
}

/// Parameters for `keyvault_key_list`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KeyListParams {
    /// Vault name (`myvault`) or URI (`https://myvault.vault.azure.net`).
    pub vault: String,
    /// Include keys managed by Key Vault certificates (default: false).
    pub include_managed: Option<bool>,
    pub tenant: Option<String>,
}

/// Parameters for `keyvault_key_get`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KeyGetParams {
    pub vault: String,
    /// Key name.
    pub key: String,
    pub tenant: Option<String>,
}

/// Parameters for `keyvault_key_create`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KeyCreateParams {
    pub vault: String,
    pub key: String,
    /// One of `EC`, `EC-HSM`, `RSA`, `RSA-HSM`, `oct`, `oct-HSM`.
    pub key_type: String,
    pub tenant: Option<String>,
}

/// Serialize a service result as tool output, or hand back its error message.
fn render<T: Serialize>(tool: &str, result: ServiceResult<T>) -> Result<String, String> {
    match result {
        Ok(value) => serde_json::to_string(&value).map_err(|e| e.to_string()),
        Err(e) => {
            tracing::warn!(tool, kind = %e.kind(), error = %e, "tool call failed");
            Err(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Service adapters sharing one cache and one credential resolver.
pub struct Services {
    pub cache: TtlCache,
    pub subscriptions: SubscriptionService,
    pub kusto: KustoService,
    pub cosmos: CosmosService,
    pub keyvault: KeyVaultService,
}

impl Services {
    pub fn new(config: &Config, resolver: Arc<CredentialResolver>, http: reqwest::Client) -> Self {
        let arm: Arc<dyn ResourceEnumerator> =
            Arc::new(ArmClient::new(http.clone(), Arc::clone(&resolver)));
        Self::with_enumerator(config, resolver, http, arm)
    }

    pub fn with_enumerator(
        config: &Config,
        resolver: Arc<CredentialResolver>,
        http: reqwest::Client,
        arm: Arc<dyn ResourceEnumerator>,
    ) -> Self {
        let cache = TtlCache::new();
        let ttl = config.cache;
        let subscriptions = SubscriptionService::new(arm, cache.clone(), ttl.list_ttl);
        Self {
            kusto: KustoService::new(
                subscriptions.clone(),
                Arc::clone(&resolver),
                Arc::new(RestKustoConnector::new(http.clone())),
                cache.clone(),
                ttl,
            ),
            cosmos: CosmosService::new(
                subscriptions.clone(),
                Arc::clone(&resolver),
                Arc::new(SdkCosmosConnector),
                cache.clone(),
                ttl,
            ),
            keyvault: KeyVaultService::new(http, resolver, cache.clone(), ttl),
            subscriptions,
            cache,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// MCP server that exposes Kusto, Cosmos DB and Key Vault as tools.
#[derive(Clone)]
pub struct AzureMcpServer {
    config: Arc<Config>,
    services: Arc<Services>,
    shutdown: CancellationToken,
    tool_router: ToolRouter<Self>,
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for AzureMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "azure-data-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "This MCP server provides tools for Azure Data Explorer (kusto_*), \
                 Cosmos DB (cosmos_*) and Key Vault keys (keyvault_*).  Resources \
                 are located through the subscription given per call or \
                 AZURE_SUBSCRIPTION_ID; use subscription_list to discover them."
                    .into(),
            ),
        }
    }
}

#[tool_router]
impl AzureMcpServer {
    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    #[tool(description = "List the Azure subscriptions visible to the signed-in identity.")]
    async fn subscription_list(
        &self,
        Parameters(params): Parameters<SubscriptionListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = self
            .services
            .subscriptions
            .list_subscriptions(params.tenant.as_deref(), &cancel)
            .await;
        render("subscription_list", result)
    }

    // ------------------------------------------------------------------
    // Kusto tools
    // ------------------------------------------------------------------

    #[tool(description = "List Azure Data Explorer (Kusto) clusters in a subscription.")]
    async fn kusto_cluster_list(
        &self,
        Parameters(params): Parameters<ResourceListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let subscription = self.subscription(params.subscription.as_deref())?;
            self.services
                .kusto
                .list_clusters(subscription, params.tenant.as_deref(), &cancel)
                .await
        }
        .await;
        render("kusto_cluster_list", result)
    }

    #[tool(description = "List databases on a Kusto cluster.  Identify the cluster \
                          by `cluster_uri`, or by `cluster_name` within a subscription.")]
    async fn kusto_database_list(
        &self,
        Parameters(params): Parameters<KustoDatabaseListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let cluster = self.cluster_ref(
                params.cluster_uri,
                params.cluster_name,
                params.subscription.as_deref(),
            )?;
            self.services
                .kusto
                .list_databases(&cluster, params.tenant.as_deref(), &cancel)
                .await
        }
        .await;
        render("kusto_database_list", result)
    }

    #[tool(description = "List tables in a Kusto database.")]
    async fn kusto_table_list(
        &self,
        Parameters(params): Parameters<KustoTableListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let cluster = self.cluster_ref(
                params.cluster_uri,
                params.cluster_name,
                params.subscription.as_deref(),
            )?;
            self.services
                .kusto
                .list_tables(&cluster, &params.database, params.tenant.as_deref(), &cancel)
                .await
        }
        .await;
        render("kusto_table_list", result)
    }

    #[tool(description = "Get the CSL schema of a Kusto table.")]
    async fn kusto_table_schema(
        &self,
        Parameters(params): Parameters<KustoTableParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let cluster = self.cluster_ref(
                params.cluster_uri,
                params.cluster_name,
                params.subscription.as_deref(),
            )?;
            self.services
                .kusto
                .table_schema(
                    &cluster,
                    &params.database,
                    &params.table,
                    params.tenant.as_deref(),
                    &cancel,
                )
                .await
        }
        .await;
        render("kusto_table_schema", result)
    }

    #[tool(description = "Run a KQL query against a Kusto database.  Results are \
                          returned as JSON row objects, capped at max_rows \
                          (default 500, maximum 10 000).")]
    async fn kusto_query(
        &self,
        Parameters(params): Parameters<KustoQueryParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let cluster = self.cluster_ref(
                params.cluster_uri,
                params.cluster_name,
                params.subscription.as_deref(),
            )?;
            self.services
                .kusto
                .query(
                    &cluster,
                    &params.database,
                    &params.query,
                    params.max_rows,
                    params.tenant.as_deref(),
                    &cancel,
                )
                .await
        }
        .await;
        render("kusto_query", result)
    }

    #[tool(description = "Return a random sample of rows from a Kusto table \
                          (default 10 rows).")]
    async fn kusto_sample(
        &self,
        Parameters(params): Parameters<KustoTableParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let cluster = self.cluster_ref(
                params.cluster_uri,
                params.cluster_name,
                params.subscription.as_deref(),
            )?;
            self.services
                .kusto
                .sample(
                    &cluster,
                    &params.database,
                    &params.table,
                    params.limit,
                    params.tenant.as_deref(),
                    &cancel,
                )
                .await
        }
        .await;
        render("kusto_sample", result)
    }

    // ------------------------------------------------------------------
    // Cosmos DB tools
    // ------------------------------------------------------------------

    #[tool(description = "List Cosmos DB accounts in a subscription.")]
    async fn cosmos_account_list(
        &self,
        Parameters(params): Parameters<ResourceListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let subscription = self.subscription(params.subscription.as_deref())?;
            self.services
                .cosmos
                .list_accounts(subscription, params.tenant.as_deref(), &cancel)
                .await
        }
        .await;
        render("cosmos_account_list", result)
    }

    #[tool(description = "List databases in a Cosmos DB account.")]
    async fn cosmos_database_list(
        &self,
        Parameters(params): Parameters<CosmosDatabaseListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let subscription = self.subscription(params.subscription.as_deref())?;
            self.services
                .cosmos
                .list_databases(&params.account, subscription, params.tenant.as_deref(), &cancel)
                .await
        }
        .await;
        render("cosmos_database_list", result)
    }

    #[tool(description = "List containers in a Cosmos DB database.")]
    async fn cosmos_container_list(
        &self,
        Parameters(params): Parameters<CosmosContainerListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let subscription = self.subscription(params.subscription.as_deref())?;
            self.services
                .cosmos
                .list_containers(
                    &params.account,
                    &params.database,
                    subscription,
                    params.tenant.as_deref(),
                    &cancel,
                )
                .await
        }
        .await;
        render("cosmos_container_list", result)
    }

    #[tool(description = "Query items in a Cosmos DB container using a \
                          Cosmos SQL-API query string.  Results are capped at \
                          max_items (default 100, maximum 5 000).")]
    async fn cosmos_query_items(
        &self,
        Parameters(params): Parameters<CosmosQueryItemsParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = async {
            let subscription = self.subscription(params.subscription.as_deref())?;
            self.services
                .cosmos
                .query_items(
                    &params.account,
                    &params.database,
                    &params.container,
                    params.query.as_deref(),
                    params.partition_key.as_deref(),
                    params.max_items,
                    subscription,
                    params.tenant.as_deref(),
                    &cancel,
                )
                .await
        }
        .await;
        render("cosmos_query_items", result)
    }

    // ------------------------------------------------------------------
    // Key Vault tools
    // ------------------------------------------------------------------

    #[tool(description = "List keys in an Azure Key Vault.  Certificate-managed \
                          keys are skipped unless include_managed is true.")]
    async fn keyvault_key_list(
        &self,
        Parameters(params): Parameters<KeyListParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = self
            .services
            .keyvault
            .list_keys(
                &params.vault,
                params.include_managed.unwrap_or(false),
                params.tenant.as_deref(),
                &cancel,
            )
            .await;
        render("keyvault_key_list", result)
    }

    #[tool(description = "Get the public details of a Key Vault key.")]
    async fn keyvault_key_get(
        &self,
        Parameters(params): Parameters<KeyGetParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = self
            .services
            .keyvault
            .get_key(&params.vault, &params.key, params.tenant.as_deref(), &cancel)
            .await;
        render("keyvault_key_get", result)
    }

    #[tool(description = "Create a key in an Azure Key Vault.  key_type is one of \
                          EC, EC-HSM, RSA, RSA-HSM, oct, oct-HSM.")]
    async fn keyvault_key_create(
        &self,
        Parameters(params): Parameters<KeyCreateParams>,
    ) -> Result<String, String> {
        let cancel = self.shutdown.child_token();
        let result = self
            .services
            .keyvault
            .create_key(
                &params.vault,
                &params.key,
                &params.key_type,
                params.tenant.as_deref(),
                &cancel,
            )
            .await;
        render("keyvault_key_create", result)
    }
}

impl AzureMcpServer {
    /// Create a new server instance.
    pub fn new(config: Config, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            services: Arc::new(services),
            shutdown: CancellationToken::new(),
            tool_router: Self::tool_router(),
        }
    }

    /// Token cancelled when the server shuts down; every tool call runs under
    /// a child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn cache(&self) -> &TtlCache {
        &self.services.cache
    }

    /// Cancel in-flight tool calls and close every cached connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let kusto = self.services.kusto.dispose();
        let cosmos = self.services.cosmos.dispose();
        let keyvault = self.services.keyvault.dispose();
        tracing::info!(kusto, cosmos, keyvault, "cached connections closed");
    }

    fn subscription<'a>(&'a self, explicit: Option<&'a str>) -> ServiceResult<&'a str> {
        self.config.require_subscription(explicit)
    }

    fn cluster_ref(
        &self,
        uri: Option<String>,
        name: Option<String>,
        subscription: Option<&str>,
    ) -> ServiceResult<ClusterRef> {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        match (non_blank(uri), non_blank(name)) {
            (Some(uri), _) => Ok(ClusterRef::Uri(uri)),
            (None, Some(name)) => Ok(ClusterRef::Named {
                name,
                subscription: self.subscription(subscription)?.to_string(),
            }),
            (None, None) => Err(ServiceError::validation(
                "either 'cluster_uri' or 'cluster_name' is required",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::StaticCredential;
    use crate::auth::AuthorityHost;
    use crate::subscription::testing::FakeArm;
    use std::sync::atomic::Ordering;

    fn make_server(default_subscription: Option<&str>) -> AzureMcpServer {
        let config = Config {
            default_subscription: default_subscription.map(str::to_string),
            ..Config::default()
        };
        let resolver = Arc::new(CredentialResolver::with_credential(
            AuthorityHost::AzurePublicCloud,
            Arc::new(StaticCredential::new("tok")),
        ));
        let services = Services::with_enumerator(
            &config,
            resolver,
            reqwest::Client::new(),
            Arc::new(FakeArm::default()),
        );
        AzureMcpServer::new(config, services)
    }

    #[test]
    fn server_info_contains_correct_name() {
        let info = make_server(None).get_info();
        assert_eq!(info.server_info.name, "azure-data-mcp");
    }

    #[test]
    fn server_info_has_tools_capability() {
        let info = make_server(None).get_info();
        assert!(
            info.capabilities.tools.is_some(),
            "tools capability must be present"
        );
    }

    #[test]
    fn tool_router_lists_expected_tools() {
        let server = make_server(None);
        let tools = server.tool_router.list_all();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();

        for expected in [
            "subscription_list",
            "kusto_cluster_list",
            "kusto_database_list",
            "kusto_table_list",
            "kusto_table_schema",
            "kusto_query",
            "kusto_sample",
            "cosmos_account_list",
            "cosmos_database_list",
            "cosmos_container_list",
            "cosmos_query_items",
            "keyvault_key_list",
            "keyvault_key_get",
            "keyvault_key_create",
        ] {
            assert!(names.contains(&expected), "{expected} missing");
        }
        assert_eq!(names.len(), 14);
    }

    #[tokio::test]
    async fn cluster_name_without_subscription_is_rejected() {
        let server = make_server(None);
        let err = server
            .kusto_database_list(Parameters(KustoDatabaseListParams {
                cluster_uri: None,
                cluster_name: Some("c1".into()),
                subscription: None,
                tenant: None,
            }))
            .await
            .unwrap_err();
        assert!(err.contains("AZURE_SUBSCRIPTION_ID"), "{err}");
    }

    #[tokio::test]
    async fn cluster_must_be_identified() {
        let server = make_server(Some("sub"));
        let err = server
            .kusto_table_list(Parameters(KustoTableListParams {
                cluster_uri: Some("  ".into()),
                cluster_name: None,
                subscription: None,
                database: "db".into(),
                tenant: None,
            }))
            .await
            .unwrap_err();
        assert!(err.contains("cluster_uri"), "{err}");
    }

    #[tokio::test]
    async fn invalid_key_type_is_reported_as_tool_error() {
        let server = make_server(None);
        let err = server
            .keyvault_key_create(Parameters(KeyCreateParams {
                vault: "myvault".into(),
                key: "k1".into(),
                key_type: "DSA".into(),
                tenant: None,
            }))
            .await
            .unwrap_err();
        assert!(err.starts_with("Invalid key type 'DSA'"), "{err}");
    }

    #[tokio::test]
    async fn calls_after_shutdown_are_cancelled() {
        let server = make_server(None);
        server.shutdown();
        assert!(server.shutdown_token().is_cancelled());
        let err = server
            .kusto_query(Parameters(KustoQueryParams {
                cluster_uri: Some("https://c1.kusto.windows.net".into()),
                cluster_name: None,
                subscription: None,
                database: "db".into(),
                query: "T | take 1".into(),
                max_rows: None,
                tenant: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(err, "operation was cancelled");
    }

    #[tokio::test]
    async fn subscription_list_is_cancelled_after_shutdown() {
        let config = Config::default();
        let resolver = Arc::new(CredentialResolver::with_credential(
            AuthorityHost::AzurePublicCloud,
            Arc::new(StaticCredential::new("tok")),
        ));
        let arm = Arc::new(FakeArm::default().with_subscription("0000-1", "Dev"));
        let services =
            Services::with_enumerator(&config, resolver, reqwest::Client::new(), arm.clone());
        let server = AzureMcpServer::new(config, services);
        server.shutdown();

        let err = server
            .subscription_list(Parameters(SubscriptionListParams { tenant: None }))
            .await
            .unwrap_err();
        assert_eq!(err, "operation was cancelled");
        assert_eq!(arm.subscription_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn subscription_list_renders_json() {
        let config = Config::default();
        let resolver = Arc::new(CredentialResolver::with_credential(
            AuthorityHost::AzurePublicCloud,
            Arc::new(StaticCredential::new("tok")),
        ));
        let arm = FakeArm::default().with_subscription("0000-1", "Dev");
        let services =
            Services::with_enumerator(&config, resolver, reqwest::Client::new(), Arc::new(arm));
        let server = AzureMcpServer::new(config, services);

        let out = server
            .subscription_list(Parameters(SubscriptionListParams { tenant: None }))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["subscriptionId"], "0000-1");
        assert_eq!(parsed[0]["displayName"], "Dev");
    }
}
