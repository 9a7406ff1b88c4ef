//! Non-interactive token sources of the default chain.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::{AccessToken, TokenCredential};
use crate::config::EnvLookup;
use crate::error::{ErrorKind, ServiceError, ServiceResult};

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_TIMEOUT: Duration = Duration::from_secs(2);
const CLI_TIMEOUT: Duration = Duration::from_secs(30);

fn unavailable(source: &str, reason: impl std::fmt::Display) -> ServiceError {
    ServiceError::new(ErrorKind::Unauthorized, format!("{source} unavailable: {reason}"))
}

/// The resource form (`https://vault.azure.net`) of a `.default` scope.
fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    expires_on: Option<Value>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Integer seconds, sent by some endpoints as a JSON string.
fn as_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl TokenResponse {
    fn expiry(&self) -> DateTime<Utc> {
        if let Some(ts) = self.expires_on.as_ref().and_then(as_seconds) {
            if let Some(at) = Utc.timestamp_opt(ts, 0).single() {
                return at;
            }
        }
        let secs = self.expires_in.as_ref().and_then(as_seconds).unwrap_or(3600);
        Utc::now() + chrono::Duration::seconds(secs)
    }
}

/// POST an OAuth2 token request form and parse the standard response.
///
/// Returns the access token and, when issued, the refresh token.
pub(super) async fn request_token(
    http: &reqwest::Client,
    url: &str,
    form: &[(&str, &str)],
) -> ServiceResult<(AccessToken, Option<String>)> {
    let response = http.post(url).form(form).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ServiceError::from_status(status.as_u16(), &body));
    }
    let parsed: TokenResponse = serde_json::from_str(&body)?;
    let token = AccessToken::new(parsed.access_token.clone(), parsed.expiry());
    Ok((token, parsed.refresh_token))
}

/// Service principal with a client secret (`AZURE_TENANT_ID`,
/// `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`).
pub struct EnvironmentCredential {
    http: reqwest::Client,
    authority_uri: String,
    tenant_id: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl EnvironmentCredential {
    pub fn new(http: reqwest::Client, authority_uri: &str, env: &EnvLookup) -> Self {
        Self {
            http,
            authority_uri: authority_uri.trim_end_matches('/').to_string(),
            tenant_id: env("AZURE_TENANT_ID"),
            client_id: env("AZURE_CLIENT_ID"),
            client_secret: env("AZURE_CLIENT_SECRET"),
        }
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    fn name(&self) -> &'static str {
        "EnvironmentCredential"
    }

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken> {
        let (Some(tenant), Some(client_id), Some(secret)) =
            (&self.tenant_id, &self.client_id, &self.client_secret)
        else {
            return Err(unavailable(
                self.name(),
                "AZURE_TENANT_ID, AZURE_CLIENT_ID and AZURE_CLIENT_SECRET must all be set",
            ));
        };
        let url = format!("{}/{tenant}/oauth2/v2.0/token", self.authority_uri);
        let (token, _) = request_token(
            &self.http,
            &url,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", secret.as_str()),
                ("scope", scope),
            ],
        )
        .await?;
        Ok(token)
    }
}

/// Federated workload identity (`AZURE_FEDERATED_TOKEN_FILE`).
pub struct WorkloadIdentityCredential {
    http: reqwest::Client,
    authority_uri: String,
    tenant_id: Option<String>,
    client_id: Option<String>,
    token_file: Option<String>,
}

impl WorkloadIdentityCredential {
    pub fn new(http: reqwest::Client, authority_uri: &str, env: &EnvLookup) -> Self {
        Self {
            http,
            authority_uri: authority_uri.trim_end_matches('/').to_string(),
            tenant_id: env("AZURE_TENANT_ID"),
            client_id: env("AZURE_CLIENT_ID"),
            token_file: env("AZURE_FEDERATED_TOKEN_FILE"),
        }
    }
}

#[async_trait]
impl TokenCredential for WorkloadIdentityCredential {
    fn name(&self) -> &'static str {
        "WorkloadIdentityCredential"
    }

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken> {
        let (Some(tenant), Some(client_id), Some(file)) =
            (&self.tenant_id, &self.client_id, &self.token_file)
        else {
            return Err(unavailable(
                self.name(),
                "AZURE_TENANT_ID, AZURE_CLIENT_ID and AZURE_FEDERATED_TOKEN_FILE must all be set",
            ));
        };
        let assertion = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| unavailable(self.name(), format!("cannot read '{file}': {e}")))?;
        let url = format!("{}/{tenant}/oauth2/v2.0/token", self.authority_uri);
        let (token, _) = request_token(
            &self.http,
            &url,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                (
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                ),
                ("client_assertion", assertion.trim()),
                ("scope", scope),
            ],
        )
        .await?;
        Ok(token)
    }
}

/// Managed identity via App Service (`IDENTITY_ENDPOINT`/`IDENTITY_HEADER`)
/// or the VM instance metadata service.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    client_id: Option<String>,
    identity_endpoint: Option<String>,
    identity_header: Option<String>,
}

impl ManagedIdentityCredential {
    pub fn new(http: reqwest::Client, env: &EnvLookup) -> Self {
        Self {
            http,
            client_id: env("AZURE_CLIENT_ID"),
            identity_endpoint: env("IDENTITY_ENDPOINT"),
            identity_header: env("IDENTITY_HEADER"),
        }
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        "ManagedIdentityCredential"
    }

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken> {
        let resource = scope_to_resource(scope);
        let mut query = vec![("resource", resource)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let request = match (&self.identity_endpoint, &self.identity_header) {
            (Some(endpoint), Some(header)) => {
                query.push(("api-version", "2019-08-01"));
                self.http
                    .get(endpoint)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            _ => {
                query.push(("api-version", "2018-02-01"));
                self.http
                    .get(IMDS_ENDPOINT)
                    .header("Metadata", "true")
                    .timeout(IMDS_TIMEOUT)
                    .query(&query)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| unavailable(self.name(), e))?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::from_status(status.as_u16(), &body).context(self.name()));
        }
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        Ok(AccessToken::new(parsed.access_token.clone(), parsed.expiry()))
    }
}

/// Token from the signed-in Azure CLI (`az account get-access-token`).
pub struct AzureCliCredential {
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    #[serde(default, rename = "expires_on")]
    expires_on_unix: Option<i64>,
}

impl AzureCliCredential {
    pub fn new(tenant_id: Option<&str>) -> Self {
        Self {
            tenant_id: tenant_id.map(str::to_string),
        }
    }

    fn command(&self, scope: &str) -> tokio::process::Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = tokio::process::Command::new("cmd");
            c.args(["/C", "az"]);
            c
        } else {
            tokio::process::Command::new("az")
        };
        command.args(["account", "get-access-token", "--output", "json", "--scope", scope]);
        if let Some(tenant) = &self.tenant_id {
            command.args(["--tenant", tenant]);
        }
        command.kill_on_drop(true);
        command
    }
}

fn parse_cli_token(stdout: &[u8]) -> ServiceResult<AccessToken> {
    let parsed: CliToken = serde_json::from_slice(stdout)?;
    let expires_on = parsed
        .expires_on_unix
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .or_else(|| {
            // Older CLIs only report local wall-clock time.
            let raw = parsed.expires_on.as_deref()?;
            let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok()?;
            Local
                .from_local_datetime(&naive)
                .single()
                .map(|local| local.with_timezone(&Utc))
        })
        .ok_or_else(|| {
            ServiceError::new(ErrorKind::Other, "Azure CLI token has no usable expiry")
        })?;
    Ok(AccessToken::new(parsed.access_token, expires_on))
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        "AzureCliCredential"
    }

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken> {
        let output = tokio::time::timeout(CLI_TIMEOUT, self.command(scope).output())
            .await
            .map_err(|_| {
                ServiceError::new(
                    ErrorKind::Timeout,
                    format!("{} timed out after {}s", self.name(), CLI_TIMEOUT.as_secs()),
                )
            })?
            .map_err(|e| unavailable(self.name(), format!("failed to run 'az': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unavailable(self.name(), stderr.trim()));
        }
        parse_cli_token(&output.stdout)
    }
}
