use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::arm::{ResourceEnumerator, ResourceInfo, ResourceKind, Subscription};
use crate::cache::{CacheGroup, CacheKey, TtlCache};
use crate::error::{cancellable, require, ServiceError, ServiceResult};

// All control-plane listings share one pseudo-endpoint in the cache.
const ARM_CACHE_ENDPOINT: &str = "arm";

/// Resolves subscription names and locates resources, caching every ARM
/// listing for the list TTL.
#[derive(Clone)]
pub struct SubscriptionService {
    arm: Arc<dyn ResourceEnumerator>,
    cache: TtlCache,
    list_ttl: Duration,
}

impl SubscriptionService {
    pub fn new(arm: Arc<dyn ResourceEnumerator>, cache: TtlCache, list_ttl: Duration) -> Self {
        Self {
            arm,
            cache,
            list_ttl,
        }
    }

    pub fn enumerator(&self) -> &Arc<dyn ResourceEnumerator> {
        &self.arm
    }

    pub async fn list_subscriptions(
        &self,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Arc<Vec<Subscription>>> {
        cancellable(cancel, self.cached_subscriptions(tenant)).await
    }

    async fn cached_subscriptions(
        &self,
        tenant: Option<&str>,
    ) -> ServiceResult<Arc<Vec<Subscription>>> {
        let key = CacheKey::endpoint(ARM_CACHE_ENDPOINT)
            .with_tenant(tenant)
            .with_facet("subscriptions");
        self.cache
            .get_or_try_insert_with(&CacheGroup::SUBSCRIPTION, key, self.list_ttl, || {
                self.arm.list_subscriptions(tenant)
            })
            .await
    }

    /// Turn a subscription id or display name into an id.
    ///
    /// GUIDs pass through without a lookup. Names are compared
    /// case-insensitively against the (cached) subscription list.
    pub async fn resolve_id(&self, subscription: &str, tenant: Option<&str>) -> ServiceResult<String> {
        require("subscription", subscription)?;
        let subscription = subscription.trim();
        if uuid::Uuid::parse_str(subscription).is_ok() {
            return Ok(subscription.to_string());
        }
        let subs = self.cached_subscriptions(tenant).await?;
        subs.iter()
            .find(|s| {
                s.display_name.eq_ignore_ascii_case(subscription)
                    || s.subscription_id.eq_ignore_ascii_case(subscription)
            })
            .map(|s| s.subscription_id.clone())
            .ok_or_else(|| {
                ServiceError::not_found(format!("Subscription '{subscription}' not found"))
            })
    }

    pub async fn list_resources(
        &self,
        subscription: &str,
        kind: ResourceKind,
        tenant: Option<&str>,
    ) -> ServiceResult<Arc<Vec<ResourceInfo>>> {
        let subscription_id = self.resolve_id(subscription, tenant).await?;
        let key = CacheKey::endpoint(ARM_CACHE_ENDPOINT)
            .with_database(subscription_id.clone())
            .with_tenant(tenant)
            .with_facet(kind.provider_type());
        self.cache
            .get_or_try_insert_with(&CacheGroup::SUBSCRIPTION, key, self.list_ttl, || {
                self.arm.list_resources(&subscription_id, kind, tenant)
            })
            .await
    }

    /// Find one resource by name (case-insensitive) in a subscription.
    pub async fn find_resource(
        &self,
        subscription: &str,
        kind: ResourceKind,
        name: &str,
        tenant: Option<&str>,
    ) -> ServiceResult<ResourceInfo> {
        require("name", name)?;
        let name = name.trim();
        let resources = self.list_resources(subscription, kind, tenant).await?;
        resources
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| {
                ServiceError::not_found(format!(
                    "{} '{name}' not found in subscription '{subscription}'",
                    kind.display_name()
                ))
            })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeArm;
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::Ordering;

    const SUB: &str = "6f0c2a52-5a3b-4b8e-9a84-5b2b2f1d1e11";

    fn service(arm: Arc<FakeArm>) -> SubscriptionService {
        SubscriptionService::new(arm, TtlCache::new(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn guid_passes_through_without_lookup() {
        let arm = Arc::new(FakeArm::default());
        let svc = service(arm.clone());
        assert_eq!(svc.resolve_id(SUB, None).await.unwrap(), SUB);
        assert_eq!(arm.subscription_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn display_name_resolves_case_insensitively_and_is_cached() {
        let arm = Arc::new(FakeArm::default().with_subscription(SUB, "Data Platform"));
        let svc = service(arm.clone());
        assert_eq!(svc.resolve_id("data platform", None).await.unwrap(), SUB);
        assert_eq!(svc.resolve_id("DATA PLATFORM", None).await.unwrap(), SUB);
        assert_eq!(arm.subscription_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_subscription_name_is_not_found() {
        let arm = Arc::new(FakeArm::default().with_subscription(SUB, "Data Platform"));
        let err = service(arm).resolve_id("prod", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("'prod'"));
    }

    #[tokio::test]
    async fn missing_resource_names_resource_and_subscription() {
        let arm = Arc::new(FakeArm::default().with_resource(
            ResourceKind::KustoCluster,
            "c2",
            "https://c2.kusto.windows.net",
        ));
        let err = service(arm)
            .find_resource(SUB, ResourceKind::KustoCluster, "c1", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            format!("Kusto cluster 'c1' not found in subscription '{SUB}'")
        );
    }

    #[tokio::test]
    async fn resource_list_is_cached_per_kind() {
        let arm = Arc::new(
            FakeArm::default()
                .with_resource(ResourceKind::KustoCluster, "c1", "https://c1.kusto.windows.net")
                .with_resource(ResourceKind::CosmosAccount, "a1", "https://a1.documents.azure.com:443/"),
        );
        let svc = service(arm.clone());
        let found = svc
            .find_resource(SUB, ResourceKind::KustoCluster, "C1", None)
            .await
            .unwrap();
        assert_eq!(found.endpoint, "https://c1.kusto.windows.net");
        svc.find_resource(SUB, ResourceKind::KustoCluster, "c1", None)
            .await
            .unwrap();
        svc.find_resource(SUB, ResourceKind::CosmosAccount, "a1", None)
            .await
            .unwrap();
        assert_eq!(arm.resource_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blank_name_is_rejected_before_listing() {
        let arm = Arc::new(FakeArm::default());
        let err = service(arm.clone())
            .find_resource(SUB, ResourceKind::CosmosAccount, "  ", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(arm.resource_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_listing_skips_arm() {
        let arm = Arc::new(FakeArm::default().with_subscription("0000-1", "Dev"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service(arm.clone())
            .list_subscriptions(None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(arm.subscription_calls.load(Ordering::SeqCst), 0);
    }
}
