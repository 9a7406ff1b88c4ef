//! Azure Data Explorer (Kusto) adapter over the v1 REST endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::arm::{ResourceInfo, ResourceKind};
use crate::auth::{default_scope, CredentialResolver, TokenCredential};
use crate::cache::{CacheGroup, CacheKey, TtlCache};
use crate::config::CacheConfig;
use crate::error::{cancellable, require, ErrorKind, ResultExt, ServiceError, ServiceResult};
use crate::rest;
use crate::subscription::SubscriptionService;

/// Default row cap for `kusto_query`.
pub const DEFAULT_MAX_ROWS: usize = 500;
/// Hard upper bound on returned rows regardless of what the caller asks for.
pub const HARD_MAX_ROWS: usize = 10_000;
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

// Database used for cluster-level management commands.
const PROBE_DATABASE: &str = "NetDefaultDB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Control commands (`.show ...`), sent to `/v1/rest/mgmt`.
    Management,
    Query,
}

impl CommandKind {
    fn path(self) -> &'static str {
        match self {
            CommandKind::Management => "v1/rest/mgmt",
            CommandKind::Query => "v1/rest/query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KustoColumn {
    #[serde(rename = "ColumnName")]
    pub name: String,
    #[serde(rename = "ColumnType", default, skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
    #[serde(rename = "DataType", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl KustoColumn {
    pub fn type_name(&self) -> &str {
        self.column_type
            .as_deref()
            .or(self.data_type.as_deref())
            .unwrap_or("dynamic")
    }
}

/// First result table of a v1 response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KustoTable {
    #[serde(rename = "TableName", default)]
    pub name: String,
    #[serde(rename = "Columns")]
    pub columns: Vec<KustoColumn>,
    #[serde(rename = "Rows", default)]
    pub rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct V1Response {
    #[serde(rename = "Tables")]
    tables: Vec<KustoTable>,
}

impl KustoTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn rows(&self) -> impl Iterator<Item = KustoRow<'_>> {
        self.rows.iter().map(move |values| KustoRow {
            table: self,
            values,
        })
    }

    /// Values of one string column, skipping rows where it is missing.
    pub fn string_column(&self, name: &str) -> ServiceResult<Vec<String>> {
        if self.column_index(name).is_none() {
            return Err(ServiceError::new(
                ErrorKind::Other,
                format!("result has no column '{name}'"),
            ));
        }
        Ok(self
            .rows()
            .filter_map(|row| row.get_str(name).map(str::to_string))
            .collect())
    }

    /// Rows as JSON objects keyed by column name, capped at `limit`.
    pub fn to_records(&self, limit: usize) -> Vec<Map<String, Value>> {
        self.rows()
            .take(limit)
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.values)
                    .map(|(col, v)| (col.name.clone(), v.clone()))
                    .collect()
            })
            .collect()
    }
}

/// Row view with access by column name.
#[derive(Debug, Clone, Copy)]
pub struct KustoRow<'a> {
    table: &'a KustoTable,
    values: &'a [Value],
}

impl<'a> KustoRow<'a> {
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.table
            .column_index(column)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_str(&self, column: &str) -> Option<&'a str> {
        self.get(column).and_then(Value::as_str)
    }
}

/// Executes commands and queries against one cluster.
#[async_trait]
pub trait KustoClient: Send + Sync {
    async fn execute(&self, database: &str, csl: &str, kind: CommandKind)
        -> ServiceResult<KustoTable>;
}

/// Builds a [`KustoClient`] for a cluster URI.
#[async_trait]
pub trait KustoConnector: Send + Sync {
    async fn connect(
        &self,
        cluster_uri: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> ServiceResult<Arc<dyn KustoClient>>;
}

pub struct RestKustoConnector {
    http: reqwest::Client,
}

impl RestKustoConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl KustoConnector for RestKustoConnector {
    async fn connect(
        &self,
        cluster_uri: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> ServiceResult<Arc<dyn KustoClient>> {
        Ok(Arc::new(RestKustoClient::new(
            self.http.clone(),
            cluster_uri,
            credential,
        )))
    }
}

pub struct RestKustoClient {
    http: reqwest::Client,
    cluster_uri: String,
    scope: String,
    credential: Arc<dyn TokenCredential>,
}

impl RestKustoClient {
    pub fn new(http: reqwest::Client, cluster_uri: &str, credential: Arc<dyn TokenCredential>) -> Self {
        let cluster_uri = cluster_uri.trim_end_matches('/').to_string();
        Self {
            http,
            scope: default_scope(&cluster_uri),
            cluster_uri,
            credential,
        }
    }
}

#[async_trait]
impl KustoClient for RestKustoClient {
    async fn execute(
        &self,
        database: &str,
        csl: &str,
        kind: CommandKind,
    ) -> ServiceResult<KustoTable> {
        let url = format!("{}/{}", self.cluster_uri, kind.path());
        let body = serde_json::json!({ "db": database, "csl": csl });
        let value = rest::call(
            &self.http,
            self.credential.as_ref(),
            &self.scope,
            Method::POST,
            &url,
            Some(&body),
        )
        .await?;
        let response: V1Response = serde_json::from_value(value)?;
        response.tables.into_iter().next().ok_or_else(|| {
            ServiceError::new(ErrorKind::Other, "response contained no result tables")
        })
    }
}

/// Cached per-cluster handle. Refuses work once closed.
pub struct KustoConnection {
    cluster_uri: String,
    client: Arc<dyn KustoClient>,
    closed: AtomicBool,
}

impl KustoConnection {
    pub fn new(cluster_uri: &str, client: Arc<dyn KustoClient>) -> Self {
        Self {
            cluster_uri: cluster_uri.to_string(),
            client,
            closed: AtomicBool::new(false),
        }
    }

    pub fn cluster_uri(&self) -> &str {
        &self.cluster_uri
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn execute(
        &self,
        database: &str,
        csl: &str,
        kind: CommandKind,
    ) -> ServiceResult<KustoTable> {
        if self.is_closed() {
            return Err(ServiceError::new(
                ErrorKind::Other,
                format!("connection to {} is closed", self.cluster_uri),
            ));
        }
        self.client.execute(database, csl, kind).await
    }
}

/// How a tool call names its cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRef {
    Uri(String),
    Named { name: String, subscription: String },
}

/// Query output shaped for the tool layer.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub columns: Vec<KustoColumn>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

impl QueryResult {
    fn from_table(table: &KustoTable, limit: usize) -> Self {
        let rows = table.to_records(limit);
        Self {
            columns: table.columns.clone(),
            row_count: rows.len(),
            truncated: table.rows.len() > rows.len(),
            rows,
        }
    }
}

/// Prefix `query` with a server-side record cap one above `limit`, so the
/// cluster never sends more than is needed to tell whether rows were dropped.
fn capped_query(query: &str, limit: usize) -> String {
    format!("set truncationmaxrecords={};\n{query}", limit + 1)
}

fn is_missing_entity(err: &ServiceError) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("could not be found") || message.contains("not found")
}

/// Bracket-quote a table name for use in KQL.
pub fn quote_identifier(name: &str) -> String {
    format!("['{}']", name.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Clone)]
pub struct KustoService {
    subscriptions: SubscriptionService,
    resolver: Arc<CredentialResolver>,
    connector: Arc<dyn KustoConnector>,
    cache: TtlCache,
    ttl: CacheConfig,
}

impl KustoService {
    pub fn new(
        subscriptions: SubscriptionService,
        resolver: Arc<CredentialResolver>,
        connector: Arc<dyn KustoConnector>,
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

    pub async fn list_clusters(
        &self,
        subscription: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Arc<Vec<ResourceInfo>>> {
        cancellable(
            cancel,
            self.subscriptions
                .list_resources(subscription, ResourceKind::KustoCluster, tenant),
        )
        .await
    }

    async fn cluster_uri(&self, cluster: &ClusterRef, tenant: Option<&str>) -> ServiceResult<String> {
        match cluster {
            ClusterRef::Uri(uri) => {
                require("cluster_uri", uri)?;
                Ok(uri.trim().to_string())
            }
            ClusterRef::Named { name, subscription } => {
                let info = self
                    .subscriptions
                    .find_resource(subscription, ResourceKind::KustoCluster, name, tenant)
                    .await?;
                if info.endpoint.is_empty() {
                    return Err(ServiceError::not_found(format!(
                        "Kusto cluster '{name}' has no query endpoint"
                    )));
                }
                Ok(info.endpoint)
            }
        }
    }

    /// Cached connection for `cluster_uri`, built and probed on a miss.
    async fn connection(
        &self,
        cluster_uri: &str,
        tenant: Option<&str>,
    ) -> ServiceResult<Arc<KustoConnection>> {
        let key = CacheKey::endpoint(cluster_uri).with_tenant(tenant);
        self.cache
            .get_or_try_insert_with(&CacheGroup::KUSTO, key, self.ttl.client_ttl, || async {
                let resolved = self.resolver.resolve(tenant).await?;
                let client = self
                    .connector
                    .connect(cluster_uri, resolved.credential())
                    .await?;
                client
                    .execute(PROBE_DATABASE, ".show version", CommandKind::Management)
                    .await
                    .with_context(|| format!("connect to Kusto cluster {cluster_uri}"))?;
                tracing::info!(cluster = cluster_uri, "kusto connection established");
                Ok::<_, ServiceError>(KustoConnection::new(cluster_uri, client))
            })
            .await
    }

    pub async fn list_databases(
        &self,
        cluster: &ClusterRef,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Arc<Vec<String>>> {
        cancellable(cancel, async {
            let uri = self.cluster_uri(cluster, tenant).await?;
            let conn = self.connection(&uri, tenant).await?;
            let key = CacheKey::endpoint(&uri)
                .with_tenant(tenant)
                .with_facet("databases");
            self.cache
                .get_or_try_insert_with(&CacheGroup::KUSTO, key, self.ttl.list_ttl, || async {
                    conn.execute(PROBE_DATABASE, ".show databases", CommandKind::Management)
                        .await
                        .and_then(|t| t.string_column("DatabaseName"))
                        .with_context(|| format!("list databases on {uri}"))
                })
                .await
        })
        .await
    }

    pub async fn list_tables(
        &self,
        cluster: &ClusterRef,
        database: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Arc<Vec<String>>> {
        require("database", database)?;
        cancellable(cancel, async {
            let uri = self.cluster_uri(cluster, tenant).await?;
            let conn = self.connection(&uri, tenant).await?;
            let key = CacheKey::endpoint(&uri)
                .with_database(database)
                .with_tenant(tenant)
                .with_facet("tables");
            self.cache
                .get_or_try_insert_with(&CacheGroup::KUSTO, key, self.ttl.list_ttl, || async {
                    conn.execute(database, ".show tables", CommandKind::Management)
                        .await
                        .and_then(|t| t.string_column("TableName"))
                        .with_context(|| format!("list tables in database '{database}' on {uri}"))
                })
                .await
        })
        .await
    }

    /// CSL schema string of one table.
    pub async fn table_schema(
        &self,
        cluster: &ClusterRef,
        database: &str,
        table: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<String> {
        require("database", database)?;
        require("table", table)?;
        cancellable(cancel, async {
            let uri = self.cluster_uri(cluster, tenant).await?;
            let conn = self.connection(&uri, tenant).await?;
            let missing = || {
                ServiceError::not_found(format!(
                    "No schema found for table '{table}' in database '{database}'"
                ))
            };
            let csl = format!(".show table {} cslschema", quote_identifier(table));
            let result = match conn.execute(database, &csl, CommandKind::Management).await {
                Ok(result) => result,
                // Clusters answer an unknown table with 400 rather than no rows.
                Err(e) if e.status() == Some(400) && is_missing_entity(&e) => {
                    return Err(missing())
                }
                Err(e) => return Err(e.context(format!("get schema of table '{table}'"))),
            };
            let schema = result
                .rows()
                .find_map(|row| row.get_str("Schema").map(str::to_string));
            schema.ok_or_else(missing)
        })
        .await
    }

    /// Run a KQL query, returning at most `max_rows` rows (clamped to
    /// [`HARD_MAX_ROWS`]).
    pub async fn query(
        &self,
        cluster: &ClusterRef,
        database: &str,
        query: &str,
        max_rows: Option<usize>,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<QueryResult> {
        require("database", database)?;
        require("query", query)?;
        let limit = max_rows.unwrap_or(DEFAULT_MAX_ROWS).clamp(1, HARD_MAX_ROWS);
        cancellable(cancel, async {
            let uri = self.cluster_uri(cluster, tenant).await?;
            let conn = self.connection(&uri, tenant).await?;
            let table = conn
                .execute(database, &capped_query(query, limit), CommandKind::Query)
                .await
                .with_context(|| format!("query database '{database}' on {uri}"))?;
            Ok::<_, ServiceError>(QueryResult::from_table(&table, limit))
        })
        .await
    }

    pub async fn sample(
        &self,
        cluster: &ClusterRef,
        database: &str,
        table: &str,
        limit: Option<usize>,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<QueryResult> {
        require("table", table)?;
        let limit = limit.unwrap_or(DEFAULT_SAMPLE_SIZE).clamp(1, HARD_MAX_ROWS);
        let csl = format!("{} | sample {limit}", quote_identifier(table));
        self.query(cluster, database, &csl, Some(limit), tenant, cancel)
            .await
    }

    /// Close and drop every cached Kusto connection and list.
    pub fn dispose(&self) -> usize {
        self.cache
            .dispose_group::<KustoConnection, _>(&CacheGroup::KUSTO, |_, conn| {
                tracing::debug!(cluster = conn.cluster_uri(), "closing kusto connection");
                conn.close()
            })
    }
}
