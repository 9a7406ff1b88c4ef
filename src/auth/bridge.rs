//! Adapter exposing a [`TokenCredential`] through the `azure_core` credential
//! trait so SDK clients (Cosmos DB) can use the resolved chain.

use std::fmt;
use std::sync::Arc;

use azure_core::credentials::{
    AccessToken as CoreAccessToken, TokenCredential as CoreTokenCredential, TokenRequestOptions,
};
use azure_core::error::ErrorKind as CoreErrorKind;
use azure_core::time::OffsetDateTime;

use super::TokenCredential;
use crate::error::ServiceError;

pub struct AzureCoreCredential {
    inner: Arc<dyn TokenCredential>,
}

impl AzureCoreCredential {
    pub fn new(inner: Arc<dyn TokenCredential>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

impl fmt::Debug for AzureCoreCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCoreCredential")
            .field("inner", &self.inner.name())
            .finish()
    }
}

#[async_trait::async_trait]
impl CoreTokenCredential for AzureCoreCredential {
    async fn get_token(
        &self,
        scopes: &[&str],
        _options: Option<TokenRequestOptions<'_>>,
    ) -> azure_core::Result<CoreAccessToken> {
        let scope = scopes.first().copied().ok_or_else(|| {
            azure_core::Error::new(
                CoreErrorKind::Credential,
                ServiceError::validation("no scope requested"),
            )
        })?;
        let token = self
            .inner
            .get_token(scope)
            .await
            .map_err(|e| azure_core::Error::new(CoreErrorKind::Credential, e))?;
        let expires_on = OffsetDateTime::from_unix_timestamp(token.expires_on.timestamp())
            .map_err(|e| azure_core::Error::new(CoreErrorKind::DataConversion, e))?;
        Ok(CoreAccessToken::new(token.token, expires_on))
    }
}
