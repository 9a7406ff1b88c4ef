//! Key Vault keys over the data-plane REST API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::auth::{default_scope, CredentialResolver, TokenCredential};
use crate::cache::{CacheGroup, CacheKey, TtlCache};
use crate::config::CacheConfig;
use crate::error::{cancellable, require, ErrorKind, ResultExt, ServiceError, ServiceResult};
use crate::rest;

pub const API_VERSION: &str = "7.5";

const MAX_KEY_NAME_LEN: usize = 127;
const MIN_VAULT_NAME_LEN: usize = 3;
const MAX_VAULT_NAME_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Ec,
    EcHsm,
    Rsa,
    RsaHsm,
    Oct,
    OctHsm,
}

impl KeyType {
    pub const ALL: [KeyType; 6] = [
        KeyType::Ec,
        KeyType::EcHsm,
        KeyType::Rsa,
        KeyType::RsaHsm,
        KeyType::Oct,
        KeyType::OctHsm,
    ];

    /// Wire name (`kty`).
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Ec => "EC",
            KeyType::EcHsm => "EC-HSM",
            KeyType::Rsa => "RSA",
            KeyType::RsaHsm => "RSA-HSM",
            KeyType::Oct => "oct",
            KeyType::OctHsm => "oct-HSM",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|kt| kt.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|kt| kt.as_str()).collect();
                ServiceError::validation(format!(
                    "Invalid key type '{s}'. Valid types: {}",
                    valid.join(", ")
                ))
            })
    }
}

/// Key names are 1-127 characters of ASCII letters, digits and `-`.
pub fn validate_key_name(name: &str) -> ServiceResult<()> {
    require("key", name)?;
    let valid = name.len() <= MAX_KEY_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(ServiceError::validation(format!(
            "Invalid key name '{name}': use 1-{MAX_KEY_NAME_LEN} letters, digits or dashes"
        )));
    }
    Ok(())
}

fn is_vault_name(name: &str) -> bool {
    (MIN_VAULT_NAME_LEN..=MAX_VAULT_NAME_LEN).contains(&name.len())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// `https://{vault}.{suffix}` for a bare vault name. A full URI is accepted
/// only over `https` with a host directly under the cloud's Key Vault suffix,
/// since the bearer token is minted for that suffix.
pub fn vault_uri(vault: &str, suffix: &str) -> ServiceResult<String> {
    require("vault", vault)?;
    let vault = vault.trim();
    let invalid = || {
        ServiceError::validation(format!(
            "Invalid vault '{vault}': use a vault name ({MIN_VAULT_NAME_LEN}-{MAX_VAULT_NAME_LEN} \
             letters, digits or dashes) or https://<name>.{suffix}"
        ))
    };
    if !vault.contains("://") {
        return if is_vault_name(vault) {
            Ok(format!("https://{vault}.{suffix}"))
        } else {
            Err(invalid())
        };
    }

    let url = Url::parse(vault).map_err(|_| invalid())?;
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let name = host
        .strip_suffix(&suffix.to_ascii_lowercase())
        .and_then(|rest| rest.strip_suffix('.'));
    let well_formed = url.scheme() == "https"
        && url.port().is_none()
        && url.username().is_empty()
        && url.password().is_none()
        && url.path() == "/"
        && url.query().is_none()
        && name.is_some_and(is_vault_name);
    if !well_formed {
        return Err(invalid());
    }
    Ok(format!("https://{host}"))
}

#[derive(Debug, Default, Deserialize)]
struct Attributes {
    enabled: Option<bool>,
    created: Option<i64>,
    updated: Option<i64>,
    exp: Option<i64>,
}

fn timestamp(secs: Option<i64>) -> Option<String> {
    secs.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .map(|t| t.to_rfc3339())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeySummary {
    pub name: String,
    pub kid: String,
    pub enabled: bool,
    pub managed: bool,
    pub created: Option<String>,
    pub updated: Option<String>,
}

#[derive(Deserialize)]
struct KeyItem {
    kid: String,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    managed: bool,
}

impl From<KeyItem> for KeySummary {
    fn from(item: KeyItem) -> Self {
        Self {
            name: rest::last_segment(&item.kid).to_string(),
            enabled: item.attributes.enabled.unwrap_or(true),
            created: timestamp(item.attributes.created),
            updated: timestamp(item.attributes.updated),
            managed: item.managed,
            kid: item.kid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyDetails {
    pub name: String,
    pub kid: String,
    pub key_type: String,
    pub key_ops: Vec<String>,
    pub enabled: bool,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub expires: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct KeyBundle {
    key: JsonWebKey,
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
    kty: String,
    #[serde(default)]
    key_ops: Vec<String>,
}

impl From<KeyBundle> for KeyDetails {
    fn from(bundle: KeyBundle) -> Self {
        // kid is `.../keys/{name}/{version}`
        let name = bundle
            .key
            .kid
            .trim_end_matches('/')
            .rsplit('/')
            .nth(1)
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            key_type: bundle.key.kty,
            key_ops: bundle.key.key_ops,
            enabled: bundle.attributes.enabled.unwrap_or(true),
            created: timestamp(bundle.attributes.created),
            updated: timestamp(bundle.attributes.updated),
            expires: timestamp(bundle.attributes.exp),
            tags: bundle.tags,
            kid: bundle.key.kid,
        }
    }
}

/// Cached per-vault handle holding the credential and scope for one vault.
pub struct KeyVaultConnection {
    vault_uri: String,
    scope: String,
    credential: Arc<dyn TokenCredential>,
    http: reqwest::Client,
    closed: AtomicBool,
}

impl KeyVaultConnection {
    pub fn vault_uri(&self) -> &str {
        &self.vault_uri
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> ServiceResult<()> {
        if self.is_closed() {
            return Err(ServiceError::new(
                ErrorKind::Other,
                format!("connection to {} is closed", self.vault_uri),
            ));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}?api-version={API_VERSION}", self.vault_uri)
    }

    async fn list_keys(&self) -> ServiceResult<Vec<KeySummary>> {
        self.ensure_open()?;
        let items = rest::get_all_pages(
            &self.http,
            self.credential.as_ref(),
            &self.scope,
            &self.url("/keys"),
        )
        .await?;
        items
            .into_iter()
            .map(|v| {
                serde_json::from_value::<KeyItem>(v)
                    .map(KeySummary::from)
                    .map_err(ServiceError::from)
            })
            .collect()
    }

    async fn get_key(&self, name: &str) -> ServiceResult<KeyDetails> {
        self.ensure_open()?;
        let body = rest::call(
            &self.http,
            self.credential.as_ref(),
            &self.scope,
            Method::GET,
            &self.url(&format!("/keys/{name}")),
            None,
        )
        .await?;
        Ok(serde_json::from_value::<KeyBundle>(body)?.into())
    }

    async fn create_key(&self, name: &str, key_type: KeyType) -> ServiceResult<KeyDetails> {
        self.ensure_open()?;
        let request = serde_json::json!({ "kty": key_type.as_str() });
        let body = rest::call(
            &self.http,
            self.credential.as_ref(),
            &self.scope,
            Method::POST,
            &self.url(&format!("/keys/{name}/create")),
            Some(&request),
        )
        .await?;
        Ok(serde_json::from_value::<KeyBundle>(body)?.into())
    }
}

#[derive(Clone)]
pub struct KeyVaultService {
    http: reqwest::Client,
    resolver: Arc<CredentialResolver>,
    cache: TtlCache,
    ttl: CacheConfig,
    endpoint_override: Option<String>,
}

impl KeyVaultService {
    pub fn new(
        http: reqwest::Client,
        resolver: Arc<CredentialResolver>,
        cache: TtlCache,
        ttl: CacheConfig,
    ) -> Self {
        Self {
            http,
            resolver,
            cache,
            ttl,
            endpoint_override: None,
        }
    }

    /// Send every vault request to `endpoint` once the vault has been
    /// validated.
    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    async fn connection(
        &self,
        vault: &str,
        tenant: Option<&str>,
    ) -> ServiceResult<Arc<KeyVaultConnection>> {
        let resolved = self.resolver.resolve(tenant).await?;
        let suffix = resolved.authority().key_vault_suffix();
        let uri = vault_uri(vault, suffix)?;
        let uri = self.endpoint_override.clone().unwrap_or(uri);
        let key = CacheKey::endpoint(&uri).with_tenant(tenant);
        self.cache
            .get_or_try_insert_with(&CacheGroup::KEY_VAULT, key, self.ttl.client_ttl, || async {
                tracing::info!(vault = %uri, "key vault connection created");
                Ok::<_, ServiceError>(KeyVaultConnection {
                    scope: default_scope(&format!("https://{suffix}")),
                    vault_uri: uri.clone(),
                    credential: resolved.credential(),
                    http: self.http.clone(),
                    closed: AtomicBool::new(false),
                })
            })
            .await
    }

    /// Keys in a vault. Keys managed by certificates are skipped unless
    /// `include_managed` is set.
    pub async fn list_keys(
        &self,
        vault: &str,
        include_managed: bool,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<Vec<KeySummary>> {
        require("vault", vault)?;
        cancellable(cancel, async {
            let conn = self.connection(vault, tenant).await?;
            let key = CacheKey::endpoint(conn.vault_uri())
                .with_tenant(tenant)
                .with_facet("keys");
            let keys = self
                .cache
                .get_or_try_insert_with(&CacheGroup::KEY_VAULT, key, self.ttl.list_ttl, || {
                    conn.list_keys()
                })
                .await
                .with_context(|| format!("list keys in vault '{vault}'"))?;
            Ok::<_, ServiceError>(
                keys.iter()
                    .filter(|k| include_managed || !k.managed)
                    .cloned()
                    .collect(),
            )
        })
        .await
    }

    pub async fn get_key(
        &self,
        vault: &str,
        name: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<KeyDetails> {
        require("vault", vault)?;
        validate_key_name(name)?;
        cancellable(cancel, async {
            let conn = self.connection(vault, tenant).await?;
            conn.get_key(name)
                .await
                .with_context(|| format!("get key '{name}' from vault '{vault}'"))
        })
        .await
    }

    /// Create a key. The key type is validated before any request is made.
    pub async fn create_key(
        &self,
        vault: &str,
        name: &str,
        key_type: &str,
        tenant: Option<&str>,
        cancel: &CancellationToken,
    ) -> ServiceResult<KeyDetails> {
        require("vault", vault)?;
        validate_key_name(name)?;
        let key_type: KeyType = key_type.parse()?;
        cancellable(cancel, async {
            let conn = self.connection(vault, tenant).await?;
            let created = conn
                .create_key(name, key_type)
                .await
                .with_context(|| format!("create {key_type} key '{name}' in vault '{vault}'"))?;
            let list_key = CacheKey::endpoint(conn.vault_uri())
                .with_tenant(tenant)
                .with_facet("keys");
            self.cache.remove(&CacheGroup::KEY_VAULT, &list_key);
            Ok::<_, ServiceError>(created)
        })
        .await
    }

    /// Close and drop every cached vault connection and key list.
    pub fn dispose(&self) -> usize {
        self.cache
            .dispose_group::<KeyVaultConnection, _>(&CacheGroup::KEY_VAULT, |_, conn| conn.close())
    }
}
