//! Azure Resource Manager enumeration: subscriptions, resources of one type,
//! and Cosmos DB account keys.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{default_scope, CredentialResolver, TokenCredential};
use crate::error::{ResultExt, ServiceError, ServiceResult};
use crate::rest;

const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";

/// Resource types the server knows how to locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    KustoCluster,
    CosmosAccount,
}

impl ResourceKind {
    pub fn provider_type(self) -> &'static str {
        match self {
            ResourceKind::KustoCluster => "Microsoft.Kusto/clusters",
            ResourceKind::CosmosAccount => "Microsoft.DocumentDB/databaseAccounts",
        }
    }

    fn api_version(self) -> &'static str {
        match self {
            ResourceKind::KustoCluster => "2023-08-15",
            ResourceKind::CosmosAccount => "2024-05-15",
        }
    }

    /// Property holding the data-plane endpoint.
    fn endpoint_property(self) -> &'static str {
        match self {
            ResourceKind::KustoCluster => "uri",
            ResourceKind::CosmosAccount => "documentEndpoint",
        }
    }

    /// Human-readable name used in error messages.
    pub fn display_name(self) -> &'static str {
        match self {
            ResourceKind::KustoCluster => "Kusto cluster",
            ResourceKind::CosmosAccount => "Cosmos DB account",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub name: String,
    pub id: String,
    pub endpoint: String,
    pub location: Option<String>,
}

impl ResourceInfo {
    fn from_arm(kind: ResourceKind, value: &Value) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let id = value.get("id")?.as_str()?.to_string();
        let endpoint = value
            .pointer(&format!("/properties/{}", kind.endpoint_property()))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let location = value
            .get("location")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            name,
            id,
            endpoint,
            location,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub subscription_id: String,
    pub display_name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Control-plane lookups the service adapters depend on.
#[async_trait]
pub trait ResourceEnumerator: Send + Sync {
    async fn list_subscriptions(&self, tenant: Option<&str>) -> ServiceResult<Vec<Subscription>>;

    async fn list_resources(
        &self,
        subscription_id: &str,
        kind: ResourceKind,
        tenant: Option<&str>,
    ) -> ServiceResult<Vec<ResourceInfo>>;

    /// Primary key of a Cosmos DB account.
    async fn list_account_keys(&self, resource_id: &str, tenant: Option<&str>)
        -> ServiceResult<String>;
}

/// ARM REST client authenticated through the shared [`CredentialResolver`].
pub struct ArmClient {
    http: reqwest::Client,
    resolver: Arc<CredentialResolver>,
    endpoint_override: Option<String>,
}

impl ArmClient {
    pub fn new(http: reqwest::Client, resolver: Arc<CredentialResolver>) -> Self {
        Self {
            http,
            resolver,
            endpoint_override: None,
        }
    }

    /// Point requests at a different management endpoint.
    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    async fn target(
        &self,
        tenant: Option<&str>,
    ) -> ServiceResult<(String, Arc<dyn TokenCredential>, String)> {
        let resolved = self.resolver.resolve(tenant).await?;
        let cloud_endpoint = resolved.authority().resource_manager_endpoint();
        let scope = default_scope(cloud_endpoint);
        let endpoint = self
            .endpoint_override
            .clone()
            .unwrap_or_else(|| cloud_endpoint.trim_end_matches('/').to_string());
        Ok((endpoint, resolved.credential(), scope))
    }
}

#[async_trait]
impl ResourceEnumerator for ArmClient {
    async fn list_subscriptions(&self, tenant: Option<&str>) -> ServiceResult<Vec<Subscription>> {
        let (endpoint, credential, scope) = self.target(tenant).await?;
        let url = format!("{endpoint}/subscriptions?api-version={SUBSCRIPTIONS_API_VERSION}");
        let values = rest::get_all_pages(&self.http, credential.as_ref(), &scope, &url)
            .await
            .context("list subscriptions")?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(ServiceError::from))
            .collect::<ServiceResult<Vec<_>>>()
            .context("list subscriptions")
    }

    async fn list_resources(
        &self,
        subscription_id: &str,
        kind: ResourceKind,
        tenant: Option<&str>,
    ) -> ServiceResult<Vec<ResourceInfo>> {
        let (endpoint, credential, scope) = self.target(tenant).await?;
        let url = format!(
            "{endpoint}/subscriptions/{subscription_id}/providers/{}?api-version={}",
            kind.provider_type(),
            kind.api_version()
        );
        let values = rest::get_all_pages(&self.http, credential.as_ref(), &scope, &url)
            .await
            .with_context(|| {
                format!(
                    "list {} resources in subscription '{subscription_id}'",
                    kind.display_name()
                )
            })?;
        Ok(values
            .iter()
            .filter_map(|v| ResourceInfo::from_arm(kind, v))
            .collect())
    }

    async fn list_account_keys(
        &self,
        resource_id: &str,
        tenant: Option<&str>,
    ) -> ServiceResult<String> {
        let (endpoint, credential, scope) = self.target(tenant).await?;
        let url = format!(
            "{endpoint}{resource_id}/listKeys?api-version={}",
            ResourceKind::CosmosAccount.api_version()
        );
        let body = rest::call(
            &self.http,
            credential.as_ref(),
            &scope,
            Method::POST,
            &url,
            None,
        )
        .await
        .with_context(|| format!("list keys of '{}'", rest::last_segment(resource_id)))?;
        body.get("primaryMasterKey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::not_found(format!(
                    "no primary key returned for '{}'",
                    rest::last_segment(resource_id)
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::StaticCredential;
    use crate::auth::AuthorityHost;
    use crate::error::ErrorKind;
    use mockito::Matcher;

    fn client(url: &str) -> (ArmClient, Arc<StaticCredential>) {
        let cred = Arc::new(StaticCredential::new("arm-token"));
        let resolver = Arc::new(CredentialResolver::with_credential(
            AuthorityHost::AzurePublicCloud,
            cred.clone(),
        ));
        (
            ArmClient::new(reqwest::Client::new(), resolver).with_endpoint(url),
            cred,
        )
    }

    #[tokio::test]
    async fn lists_kusto_clusters_with_endpoints() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock(
                "GET",
                Matcher::Regex(r"^/subscriptions/sub-1/providers/Microsoft.Kusto/clusters".into()),
            )
            .match_header("authorization", "Bearer arm-token")
            .with_body(
                serde_json::json!({
                    "value": [
                        {
                            "id": "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Kusto/clusters/c1",
                            "name": "c1",
                            "location": "westeurope",
                            "properties": {"uri": "https://c1.westeurope.kusto.windows.net"}
                        },
                        {"name": "missing-id"}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let (arm, _) = client(&server.url());
        let clusters = arm
            .list_resources("sub-1", ResourceKind::KustoCluster, None)
            .await
            .unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "c1");
        assert_eq!(clusters[0].endpoint, "https://c1.westeurope.kusto.windows.net");
        assert_eq!(clusters[0].location.as_deref(), Some("westeurope"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn parses_subscriptions() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/subscriptions(\?|$)".into()))
            .with_body(
                r#"{"value":[{"subscriptionId":"0000-1","displayName":"Dev","tenantId":"t1","state":"Enabled"}]}"#,
            )
            .create_async()
            .await;

        let (arm, _) = client(&server.url());
        let subs = arm.list_subscriptions(None).await.unwrap();
        assert_eq!(subs[0].subscription_id, "0000-1");
        assert_eq!(subs[0].display_name, "Dev");
        assert_eq!(subs[0].state.as_deref(), Some("Enabled"));
    }

    #[tokio::test]
    async fn account_keys_come_from_list_keys() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Regex(r"/databaseAccounts/acct/listKeys".into()))
            .with_body(r#"{"primaryMasterKey":"a2V5"}"#)
            .create_async()
            .await;

        let (arm, _) = client(&server.url());
        let key = arm
            .list_account_keys(
                "/subscriptions/s/resourceGroups/rg/providers/Microsoft.DocumentDB/databaseAccounts/acct",
                None,
            )
            .await
            .unwrap();
        assert_eq!(key, "a2V5");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn forbidden_is_classified_with_context() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(r"^/subscriptions/sub-1/".into()))
            .with_status(403)
            .with_body(r#"{"error":{"code":"AuthorizationFailed","message":"denied"}}"#)
            .create_async()
            .await;

        let (arm, _) = client(&server.url());
        let err = arm
            .list_resources("sub-1", ResourceKind::CosmosAccount, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert!(err.to_string().contains("Cosmos DB account"), "{err}");
    }
}
