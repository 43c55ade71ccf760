use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

/// Client for the account activity, webhook, and user endpoints of the v2 API.
///
/// Every call takes the bearer token explicitly: admin operations use the
/// application token, subscription changes use the end user's token.
#[derive(Clone)]
pub struct XApiClient {
    http: Client,
    base_url: Url,
}

/// Successful upstream answer, forwarded as-is by the proxy handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiReply {
    pub status: StatusCode,
    /// Parsed JSON body, `Value::Null` when the upstream sent no content.
    pub body: Value,
}

/// Display projection of a user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserLookup {
    #[serde(default)]
    data: Option<UserData>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
    username: String,
    name: String,
    #[serde(default)]
    profile_image_url: Option<String>,
}

impl UserProfile {
    /// Reads a `users/{id}` body.
    ///
    /// The API reports unknown or suspended accounts with a 200 carrying
    /// `errors` and no `data`; both count as a failed lookup.
    pub fn from_lookup(body: Value) -> Result<Self, XApiError> {
        let lookup: UserLookup = serde_json::from_value(body)?;
        if let Some(error) = lookup.errors.first() {
            let detail = error
                .get("detail")
                .or_else(|| error.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("user lookup returned an error");
            return Err(XApiError::Lookup(detail.to_string()));
        }
        let data = lookup
            .data
            .ok_or_else(|| XApiError::Lookup("user lookup returned no data".to_string()))?;
        Ok(Self {
            id: data.id,
            username: data.username,
            name: data.name,
            avatar_url: data.profile_image_url,
        })
    }
}

impl XApiClient {
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    pub async fn list_webhooks(&self, token: &str) -> Result<ApiReply, XApiError> {
        let url = self.endpoint(&["webhooks"])?;
        self.send(Method::GET, url, token, None).await
    }

    pub async fn create_webhook(&self, token: &str, callback_url: &str) -> Result<ApiReply, XApiError> {
        let url = self.endpoint(&["webhooks"])?;
        let body = json!({ "url": callback_url });
        self.send(Method::POST, url, token, Some(&body)).await
    }

    /// Asks the provider to re-run the CRC challenge against the webhook.
    pub async fn validate_webhook(&self, token: &str, webhook_id: &str) -> Result<ApiReply, XApiError> {
        let url = self.endpoint(&["webhooks", webhook_id])?;
        self.send(Method::PUT, url, token, None).await
    }

    pub async fn delete_webhook(&self, token: &str, webhook_id: &str) -> Result<ApiReply, XApiError> {
        let url = self.endpoint(&["webhooks", webhook_id])?;
        self.send(Method::DELETE, url, token, None).await
    }

    /// Requests redelivery of activity between two UTC `YYYYMMDDHHmm` instants.
    pub async fn replay(
        &self,
        token: &str,
        webhook_id: &str,
        from_date: &str,
        to_date: &str,
    ) -> Result<ApiReply, XApiError> {
        let mut url = self.endpoint(&[
            "account_activity",
            "replay",
            "webhooks",
            webhook_id,
            "subscriptions",
            "all",
        ])?;
        url.query_pairs_mut()
            .append_pair("from_date", from_date)
            .append_pair("to_date", to_date);
        self.send(Method::POST, url, token, None).await
    }

    pub async fn subscription_count(&self, token: &str) -> Result<ApiReply, XApiError> {
        let url = self.endpoint(&["account_activity", "subscriptions", "count"])?;
        self.send(Method::GET, url, token, None).await
    }

    /// Checks whether the token's user is subscribed to the webhook.
    pub async fn check_subscription(&self, token: &str, webhook_id: &str) -> Result<ApiReply, XApiError> {
        let url = self.subscriptions_url(webhook_id, &[])?;
        self.send(Method::GET, url, token, None).await
    }

    pub async fn list_subscriptions(&self, token: &str, webhook_id: &str) -> Result<ApiReply, XApiError> {
        let url = self.subscriptions_url(webhook_id, &["list"])?;
        self.send(Method::GET, url, token, None).await
    }

    /// Subscribes the user owning `user_token` to the webhook.
    pub async fn subscribe(&self, user_token: &str, webhook_id: &str) -> Result<ApiReply, XApiError> {
        let url = self.subscriptions_url(webhook_id, &[])?;
        self.send(Method::POST, url, user_token, Some(&json!({}))).await
    }

    pub async fn unsubscribe(
        &self,
        user_token: &str,
        webhook_id: &str,
        user_id: &str,
    ) -> Result<ApiReply, XApiError> {
        let url = self.endpoint(&[
            "account_activity",
            "webhooks",
            webhook_id,
            "subscriptions",
            user_id,
            "all",
        ])?;
        self.send(Method::DELETE, url, user_token, None).await
    }

    pub async fn lookup_user(&self, token: &str, user_id: &str) -> Result<ApiReply, XApiError> {
        let mut url = self.endpoint(&["users", user_id])?;
        url.query_pairs_mut()
            .append_pair("user.fields", "profile_image_url");
        self.send(Method::GET, url, token, None).await
    }

    pub async fn user_profile(&self, token: &str, user_id: &str) -> Result<UserProfile, XApiError> {
        let reply = self.lookup_user(token, user_id).await?;
        UserProfile::from_lookup(reply.body)
    }

    /// Returns the profile of the user owning `user_token`.
    pub async fn me(&self, user_token: &str) -> Result<ApiReply, XApiError> {
        let mut url = self.endpoint(&["users", "me"])?;
        url.query_pairs_mut()
            .append_pair("user.fields", "profile_image_url");
        self.send(Method::GET, url, user_token, None).await
    }

    fn subscriptions_url(&self, webhook_id: &str, tail: &[&str]) -> Result<Url, XApiError> {
        let mut segments = vec![
            "account_activity",
            "webhooks",
            webhook_id,
            "subscriptions",
            "all",
        ];
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    /// Appends percent-encoded path segments to the base URL, so ids taken from
    /// request paths cannot escape their position.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, XApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| XApiError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        token: &str,
        body: Option<&Value>,
    ) -> Result<ApiReply, XApiError> {
        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {token}"));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        read_reply(response).await
    }
}

/// Errors produced by [`XApiClient`].
#[derive(Debug, Error)]
pub enum XApiError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid json body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("user lookup failed: {0}")]
    Lookup(String),
}

async fn read_reply(response: Response) -> Result<ApiReply, XApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(XApiError::Status { status, body });
    }

    let text = response.text().await?;
    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text)?
    };
    Ok(ApiReply { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method as MockMethod;

    fn client(server: &MockServer) -> XApiClient {
        let base = Url::parse(&server.url("/2/")).expect("url");
        XApiClient::new(base, Client::builder().build().expect("client"))
    }

    #[tokio::test]
    async fn list_webhooks_sends_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/2/webhooks")
                    .header("Authorization", "Bearer app-token");
                then.status(200)
                    .json_body(json!({ "data": [{ "id": "wh-1", "valid": true }] }));
            })
            .await;

        let reply = client(&server)
            .list_webhooks("app-token")
            .await
            .expect("list webhooks");
        mock.assert_async().await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["data"][0]["id"], "wh-1");
    }

    #[tokio::test]
    async fn create_webhook_keeps_upstream_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2/webhooks")
                    .json_body(json!({ "url": "https://example.com/hook" }));
                then.status(201).json_body(json!({ "data": { "id": "wh-2" } }));
            })
            .await;

        let reply = client(&server)
            .create_webhook("app-token", "https://example.com/hook")
            .await
            .expect("create webhook");
        mock.assert_async().await;
        assert_eq!(reply.status, StatusCode::CREATED);
        assert_eq!(reply.body["data"]["id"], "wh-2");
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(MockMethod::DELETE).path("/2/webhooks/wh-1");
                then.status(204);
            })
            .await;

        let reply = client(&server)
            .delete_webhook("app-token", "wh-1")
            .await
            .expect("delete webhook");
        mock.assert_async().await;
        assert_eq!(reply.status, StatusCode::NO_CONTENT);
        assert!(reply.body.is_null());
    }

    #[tokio::test]
    async fn replay_passes_window_as_query() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2/account_activity/replay/webhooks/wh-1/subscriptions/all")
                    .query_param("from_date", "202505150300")
                    .query_param("to_date", "202505150400");
                then.status(200)
                    .json_body(json!({ "data": { "job_id": "job-9" } }));
            })
            .await;

        let reply = client(&server)
            .replay("app-token", "wh-1", "202505150300", "202505150400")
            .await
            .expect("replay");
        mock.assert_async().await;
        assert_eq!(reply.body["data"]["job_id"], "job-9");
    }

    #[tokio::test]
    async fn subscription_calls_use_user_token() {
        let server = MockServer::start_async().await;
        let subscribe = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/2/account_activity/webhooks/wh-1/subscriptions/all")
                    .header("Authorization", "Bearer user-token");
                then.status(200).json_body(json!({ "data": { "subscribed": true } }));
            })
            .await;
        let unsubscribe = server
            .mock_async(|when, then| {
                when.method(MockMethod::DELETE)
                    .path("/2/account_activity/webhooks/wh-1/subscriptions/42/all")
                    .header("Authorization", "Bearer user-token");
                then.status(200).json_body(json!({ "data": { "subscribed": false } }));
            })
            .await;

        let client = client(&server);
        let reply = client.subscribe("user-token", "wh-1").await.expect("subscribe");
        assert_eq!(reply.body["data"]["subscribed"], true);
        let reply = client
            .unsubscribe("user-token", "wh-1", "42")
            .await
            .expect("unsubscribe");
        assert_eq!(reply.body["data"]["subscribed"], false);
        subscribe.assert_async().await;
        unsubscribe.assert_async().await;
    }

    #[tokio::test]
    async fn lookup_user_requests_profile_image() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/2/users/42")
                    .query_param("user.fields", "profile_image_url");
                then.status(200)
                    .json_body(json!({ "data": { "id": "42", "username": "someone" } }));
            })
            .await;

        let reply = client(&server)
            .lookup_user("app-token", "42")
            .await
            .expect("lookup user");
        mock.assert_async().await;
        assert_eq!(reply.body["data"]["username"], "someone");
    }

    #[tokio::test]
    async fn error_status_returns_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/2/account_activity/subscriptions/count");
                then.status(403).body(r#"{"title":"Forbidden"}"#);
            })
            .await;

        let err = client(&server)
            .subscription_count("app-token")
            .await
            .expect_err("should error");
        match err {
            XApiError::Status { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, r#"{"title":"Forbidden"}"#);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn user_profile_maps_avatar_and_rejects_error_bodies() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/2/users/1")
                    .query_param("user.fields", "profile_image_url");
                then.status(200).json_body(json!({
                    "data": {
                        "id": "1",
                        "username": "alice",
                        "name": "Alice",
                        "profile_image_url": "https://pbs.twimg.com/a_normal.jpg"
                    }
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/2/users/3");
                then.status(200).json_body(json!({
                    "errors": [{
                        "title": "Not Found Error",
                        "detail": "Could not find user with id: [3]."
                    }]
                }));
            })
            .await;

        let api = client(&server);
        let profile = api.user_profile("app-token", "1").await.expect("profile");
        assert_eq!(
            profile,
            UserProfile {
                id: "1".into(),
                username: "alice".into(),
                name: "Alice".into(),
                avatar_url: Some("https://pbs.twimg.com/a_normal.jpg".into()),
            }
        );

        let err = api.user_profile("app-token", "3").await.expect_err("missing user");
        assert!(matches!(err, XApiError::Lookup(ref detail) if detail.contains("[3]")));
    }

    #[test]
    fn empty_lookup_body_is_an_error() {
        let err = UserProfile::from_lookup(json!({})).expect_err("no data");
        assert!(matches!(err, XApiError::Lookup(_)));
    }
}
