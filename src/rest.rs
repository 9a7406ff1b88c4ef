//! Small helpers shared by the REST-backed clients (ARM, Kusto, Key Vault).

use reqwest::{Method, RequestBuilder};
use serde_json::Value;

use crate::auth::TokenCredential;
use crate::error::{ServiceError, ServiceResult};

/// Send `request` and decode a JSON body, classifying non-2xx statuses.
///
/// An empty success body decodes as `Value::Null`.
pub async fn send_json(request: RequestBuilder) -> ServiceResult<Value> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ServiceError::from_status(status.as_u16(), &body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}

/// Authenticated JSON call: acquires a token for `scope`, then sends.
pub async fn call(
    http: &reqwest::Client,
    credential: &dyn TokenCredential,
    scope: &str,
    method: Method,
    url: &str,
    body: Option<&Value>,
) -> ServiceResult<Value> {
    let token = credential.get_token(scope).await?;
    let mut request = http.request(method, url).bearer_auth(&token.token);
    if let Some(body) = body {
        request = request.json(body);
    }
    send_json(request).await
}

/// GET `url` and every `nextLink` page after it, concatenating `value` arrays.
///
/// A failure on any page discards everything fetched so far.
pub async fn get_all_pages(
    http: &reqwest::Client,
    credential: &dyn TokenCredential,
    scope: &str,
    url: &str,
) -> ServiceResult<Vec<Value>> {
    let mut items = Vec::new();
    let mut next = Some(url.to_string());
    while let Some(url) = next.take() {
        let page = call(http, credential, scope, Method::GET, &url, None).await?;
        if let Some(values) = page.get("value").and_then(Value::as_array) {
            items.extend(values.iter().cloned());
        }
        next = page
            .get("nextLink")
            .and_then(Value::as_str)
            .filter(|link| !link.is_empty())
            .map(str::to_string);
    }
    Ok(items)
}

/// Last path segment of a resource id or URL (`.../keys/my-key` → `my-key`).
pub fn last_segment(id: &str) -> &str {
    id.trim_end_matches('/').rsplit('/').next().unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::StaticCredential;
    use crate::error::ErrorKind;

    #[test]
    fn last_segment_handles_trailing_slash() {
        assert_eq!(last_segment("https://v.vault.azure.net/keys/k1"), "k1");
        assert_eq!(last_segment("/subscriptions/s/resourceGroups/rg/"), "rg");
        assert_eq!(last_segment("plain"), "plain");
    }

    #[tokio::test]
    async fn follows_next_links_and_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let page2 = format!("{}/items-page-2", server.url());
        let first = server
            .mock("GET", "/items")
            .match_header("authorization", "Bearer tok")
            .with_body(serde_json::json!({"value": [1, 2], "nextLink": page2}).to_string())
            .create_async()
            .await;
        let second = server
            .mock("GET", "/items-page-2")
            .with_body(r#"{"value": [3]}"#)
            .create_async()
            .await;

        let cred = StaticCredential::new("tok");
        let items = get_all_pages(
            &reqwest::Client::new(),
            &cred,
            "scope",
            &format!("{}/items", server.url()),
        )
        .await
        .unwrap();

        assert_eq!(items, vec![Value::from(1), Value::from(2), Value::from(3)]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn failed_page_discards_partial_results() {
        let mut server = mockito::Server::new_async().await;
        let page2 = format!("{}/items-page-2", server.url());
        server
            .mock("GET", "/items")
            .with_body(serde_json::json!({"value": [1], "nextLink": page2}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/items-page-2")
            .with_status(500)
            .create_async()
            .await;

        let cred = StaticCredential::new("tok");
        let err = get_all_pages(
            &reqwest::Client::new(),
            &cred,
            "scope",
            &format!("{}/items", server.url()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
