//! Interactive browser sign-in (authorization code + PKCE, loopback redirect).
//!
//! The first token request opens the system browser and waits, bounded by the
//! configured timeout, for the identity provider to redirect back to a
//! one-shot listener on `127.0.0.1`. The refresh token obtained there is kept
//! in memory, so later scopes are acquired without another prompt.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::sources::request_token;
use super::{AccessToken, TokenCredential};
use crate::error::{ErrorKind, ServiceError, ServiceResult};

/// Public client id used when neither configuration nor an authentication
/// record supplies one.
pub const DEFAULT_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

const DEFAULT_TENANT: &str = "organizations";
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Snapshot of a completed interactive sign-in, serialized as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRecord {
    pub username: String,
    pub authority: String,
    pub home_account_id: String,
    pub tenant_id: String,
    pub client_id: String,
}

impl AuthenticationRecord {
    pub fn parse(json: &str) -> ServiceResult<Self> {
        serde_json::from_str(json).map_err(|e| {
            ServiceError::validation(format!("invalid authentication record: {e}"))
        })
    }
}

/// Opens a URL for the user. Swappable so tests never launch a browser.
pub type BrowserLauncher = fn(&str) -> std::io::Result<()>;

pub fn open_system_browser(url: &str) -> std::io::Result<()> {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else {
        std::process::Command::new("xdg-open")
    };
    command
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
}

pub struct InteractiveBrowserCredential {
    http: reqwest::Client,
    authority_uri: String,
    tenant: String,
    client_id: String,
    login_hint: Option<String>,
    timeout: Duration,
    launcher: BrowserLauncher,
    // Held across the interactive wait so concurrent callers share one prompt.
    refresh_token: Mutex<Option<String>>,
}

impl InteractiveBrowserCredential {
    /// `tenant` and `client_id` override whatever the record carries.
    pub fn new(
        http: reqwest::Client,
        authority_uri: impl Into<String>,
        tenant: Option<&str>,
        client_id: Option<&str>,
        record: Option<&AuthenticationRecord>,
        timeout: Duration,
    ) -> Self {
        let tenant = tenant
            .or(record.map(|r| r.tenant_id.as_str()))
            .unwrap_or(DEFAULT_TENANT)
            .to_string();
        let client_id = client_id
            .or(record.map(|r| r.client_id.as_str()))
            .unwrap_or(DEFAULT_CLIENT_ID)
            .to_string();
        let mut authority_uri = authority_uri.into();
        if !authority_uri.ends_with('/') {
            authority_uri.push('/');
        }
        Self {
            http,
            authority_uri,
            tenant,
            client_id,
            login_hint: record.map(|r| r.username.clone()),
            timeout,
            launcher: open_system_browser,
            refresh_token: Mutex::new(None),
        }
    }

    fn token_endpoint(&self) -> String {
        format!("{}{}/oauth2/v2.0/token", self.authority_uri, self.tenant)
    }

    fn authorize_url(
        &self,
        scope: &str,
        redirect_uri: &str,
        challenge: &str,
        state: &str,
    ) -> ServiceResult<Url> {
        let base = format!("{}{}/oauth2/v2.0/authorize", self.authority_uri, self.tenant);
        let mut url = Url::parse(&base)
            .map_err(|e| ServiceError::validation(format!("invalid authority URI '{base}': {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &request_scopes(scope))
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", "S256")
                .append_pair("state", state);
            match &self.login_hint {
                Some(hint) => {
                    query.append_pair("login_hint", hint);
                }
                None => {
                    query.append_pair("prompt", "select_account");
                }
            }
        }
        Ok(url)
    }

    async fn refresh(&self, refresh_token: &str, scope: &str) -> ServiceResult<(AccessToken, Option<String>)> {
        let scopes = request_scopes(scope);
        request_token(
            &self.http,
            &self.token_endpoint(),
            &[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("scope", scopes.as_str()),
            ],
        )
        .await
    }

    async fn authorize(&self, scope: &str) -> ServiceResult<(AccessToken, Option<String>)> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(|e| {
            ServiceError::new(ErrorKind::Other, format!("failed to bind loopback listener: {e}"))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| ServiceError::new(ErrorKind::Other, e.to_string()))?
            .port();
        let redirect_uri = format!("http://localhost:{port}");

        let verifier = random_token(32);
        let state = random_token(16);
        let url = self.authorize_url(scope, &redirect_uri, &pkce_challenge(&verifier), &state)?;

        tracing::info!(url = %url, "opening browser for interactive sign-in");
        if let Err(e) = (self.launcher)(url.as_str()) {
            tracing::warn!(error = %e, url = %url, "could not launch a browser; open the URL manually");
        }

        let code = loop {
            let (stream, _) = listener.accept().await.map_err(|e| {
                ServiceError::new(ErrorKind::Other, format!("loopback accept failed: {e}"))
            })?;
            if let Some(code) = handle_redirect(stream, &state).await? {
                break code;
            }
        };

        let scopes = request_scopes(scope);
        request_token(
            &self.http,
            &self.token_endpoint(),
            &[
                ("grant_type", "authorization_code"),
                ("client_id", self.client_id.as_str()),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("code_verifier", verifier.as_str()),
                ("scope", scopes.as_str()),
            ],
        )
        .await
    }
}

#[cfg(test)]
impl InteractiveBrowserCredential {
    pub fn with_launcher(mut self, launcher: BrowserLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn authority_uri(&self) -> &str {
        &self.authority_uri
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl TokenCredential for InteractiveBrowserCredential {
    fn name(&self) -> &'static str {
        "InteractiveBrowserCredential"
    }

    async fn get_token(&self, scope: &str) -> ServiceResult<AccessToken> {
        let mut session = self.refresh_token.lock().await;

        if let Some(refresh_token) = session.as_deref() {
            match self.refresh(refresh_token, scope).await {
                Ok((token, rotated)) => {
                    if rotated.is_some() {
                        *session = rotated;
                    }
                    return Ok(token);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "silent refresh failed; falling back to interactive sign-in");
                }
            }
        }

        let (token, refresh_token) = tokio::time::timeout(self.timeout, self.authorize(scope))
            .await
            .map_err(|_| {
                ServiceError::new(
                    ErrorKind::Timeout,
                    format!(
                        "interactive browser sign-in did not complete within {} seconds",
                        self.timeout.as_secs()
                    ),
                )
            })??;
        *session = refresh_token;
        Ok(token)
    }
}

/// Requested scopes: the resource scope plus `offline_access` for a refresh
/// token.
fn request_scopes(scope: &str) -> String {
    format!("{scope} offline_access openid profile")
}

fn random_token(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// RFC 7636 S256 code challenge.
fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Outcome of parsing the redirect request line.
#[derive(Debug, PartialEq, Eq)]
enum Redirect {
    Code { code: String, state: String },
    Error { error: String, description: String },
    Unrelated,
}

fn parse_redirect(request_line: &str) -> Redirect {
    let mut parts = request_line.split_whitespace();
    let (Some("GET"), Some(target)) = (parts.next(), parts.next()) else {
        return Redirect::Unrelated;
    };
    let Ok(url) = Url::parse(&format!("http://localhost{target}")) else {
        return Redirect::Unrelated;
    };
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    if let Some(error) = param("error") {
        return Redirect::Error {
            error,
            description: param("error_description").unwrap_or_default(),
        };
    }
    match (param("code"), param("state")) {
        (Some(code), Some(state)) => Redirect::Code { code, state },
        _ => Redirect::Unrelated,
    }
}

async fn handle_redirect(mut stream: TcpStream, expected_state: &str) -> ServiceResult<Option<String>> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => head.extend_from_slice(&buf[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "failed to read loopback redirect");
                break;
            }
        }
    }
    let text = String::from_utf8_lossy(&head);
    let request_line = text.lines().next().unwrap_or_default();

    let (status, body, outcome) = match parse_redirect(request_line) {
        Redirect::Unrelated => ("404 Not Found", "Not found.", Ok(None)),
        Redirect::Error { error, description } => (
            "200 OK",
            "Sign-in failed. You can close this window.",
            Err(ServiceError::new(
                ErrorKind::Unauthorized,
                format!("interactive sign-in failed: {error}: {description}"),
            )),
        ),
        Redirect::Code { state, .. } if state != expected_state => (
            "400 Bad Request",
            "State mismatch.",
            Err(ServiceError::validation(
                "interactive sign-in returned an unexpected state parameter",
            )),
        ),
        Redirect::Code { code, .. } => (
            "200 OK",
            "Authentication complete. You can close this window.",
            Ok(Some(code)),
        ),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        tracing::debug!(error = %e, "failed to answer loopback redirect");
    }
    let _ = stream.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_browser(_: &str) -> std::io::Result<()> {
        Ok(())
    }

    fn record() -> AuthenticationRecord {
        AuthenticationRecord {
            username: "ada@contoso.com".into(),
            authority: "login.microsoftonline.com".into(),
            home_account_id: "oid.tid".into(),
            tenant_id: "record-tenant".into(),
            client_id: "record-client".into(),
        }
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_vector() {
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn record_supplies_tenant_client_and_login_hint() {
        let rec = record();
        let cred = InteractiveBrowserCredential::new(
            reqwest::Client::new(),
            "https://login.microsoftonline.com",
            None,
            None,
            Some(&rec),
            Duration::from_secs(300),
        );
        assert_eq!(cred.tenant(), "record-tenant");
        assert_eq!(cred.client_id(), "record-client");
        assert_eq!(cred.authority_uri(), "https://login.microsoftonline.com/");

        let url = cred
            .authorize_url("https://vault.azure.net/.default", "http://localhost:1", "ch", "st")
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("login_hint".into(), "ada@contoso.com".into())));
        assert!(pairs.contains(&("code_challenge_method".into(), "S256".into())));
        assert!(url.path().starts_with("/record-tenant/oauth2/v2.0/authorize"));
    }

    #[test]
    fn explicit_options_override_record() {
        let rec = record();
        let cred = InteractiveBrowserCredential::new(
            reqwest::Client::new(),
            "https://login.microsoftonline.us/",
            Some("tid"),
            Some("cid"),
            Some(&rec),
            Duration::from_secs(1),
        );
        assert_eq!(cred.tenant(), "tid");
        assert_eq!(cred.client_id(), "cid");
    }

    #[test]
    fn parses_redirect_request_lines() {
        assert_eq!(
            parse_redirect("GET /?code=abc&state=xyz HTTP/1.1"),
            Redirect::Code {
                code: "abc".into(),
                state: "xyz".into()
            }
        );
        assert_eq!(
            parse_redirect("GET /?error=access_denied&error_description=nope HTTP/1.1"),
            Redirect::Error {
                error: "access_denied".into(),
                description: "nope".into()
            }
        );
        assert_eq!(parse_redirect("GET /favicon.ico HTTP/1.1"), Redirect::Unrelated);
        assert_eq!(parse_redirect("POST /?code=a&state=b HTTP/1.1"), Redirect::Unrelated);
    }

    #[test]
    fn authentication_record_round_trips_camel_case_json() {
        let json = serde_json::to_string(&record()).unwrap();
        assert!(json.contains("homeAccountId"));
        assert_eq!(AuthenticationRecord::parse(&json).unwrap(), record());
    }

    #[tokio::test]
    async fn interactive_flow_times_out_as_terminal_failure() {
        let cred = InteractiveBrowserCredential::new(
            reqwest::Client::new(),
            "https://login.microsoftonline.com/",
            None,
            None,
            None,
            Duration::from_millis(50),
        )
        .with_launcher(no_browser);

        let err = cred.get_token("https://management.azure.com/.default").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn redirect_with_code_completes_token_exchange() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/tid/oauth2/v2.0/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                "authorization_code".into(),
            ))
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"at","expires_in":3600,"refresh_token":"rt"}"#)
            .create_async()
            .await;

        // The launcher "visits" the authorize URL by hitting the redirect URI
        // with the state the credential generated.
        fn follow_redirect(url: &str) -> std::io::Result<()> {
            let url = Url::parse(url).map_err(std::io::Error::other)?;
            let param = |name: &str| {
                url.query_pairs()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default()
            };
            let redirect = Url::parse(&param("redirect_uri")).map_err(std::io::Error::other)?;
            let state = param("state");
            let port = redirect.port().unwrap_or(80);
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let req = format!("GET /?code=the-code&state={state} HTTP/1.1\r\nHost: localhost\r\n\r\n");
                stream.write_all(req.as_bytes()).await.unwrap();
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
            });
            Ok(())
        }

        let cred = InteractiveBrowserCredential::new(
            reqwest::Client::new(),
            server.url(),
            Some("tid"),
            None,
            None,
            Duration::from_secs(10),
        )
        .with_launcher(follow_redirect);

        let access = cred.get_token("https://vault.azure.net/.default").await.unwrap();
        assert_eq!(access.token, "at");
        assert_eq!(cred.refresh_token.lock().await.as_deref(), Some("rt"));
        token.assert_async().await;
    }

    #[tokio::test]
    async fn dropped_loopback_connection_is_ignored() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            drop(stream);
        });
        let (stream, _) = listener.accept().await.unwrap();
        client.await.unwrap();

        let outcome = handle_redirect(stream, "state").await.unwrap();
        assert_eq!(outcome, None);
    }
}
