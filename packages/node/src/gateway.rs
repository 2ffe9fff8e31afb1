//! Outbound API calls on top of the [`SessionPool`].
//!
//! [`ApiGateway`] turns an [`ApiRequest`] into an HTTP call:
//!
//! 1. `{name}` placeholders in the URL template are replaced from the
//!    request's context map. A placeholder with no value is an error.
//! 2. For `POST`, a trailing integer path segment is dropped: create and
//!    append endpoints reject an identifier (`/append/123` → `/append`).
//! 3. A pooled session is chosen for the target host and credential.
//! 4. JSON bodies get `Content-Type: application/json`; raw bodies carry
//!    only what the caller set.
//!
//! Every failure, whether transport-level (timeout, refused connection,
//! certificate) or an HTTP status of 400 or above, surfaces as
//! [`NodeError::RemoteCallFailed`]. Nothing is retried.
//!
//! [`ApiGateway::call`] is the async form used by request handlers and the
//! federator; [`ApiGateway::call_blocking`] drives the same future on the
//! gateway's runtime for synchronous callers such as the CLI.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tokio::runtime::Handle;

use crate::{error::NodeError, identity::ClientCredential, session_pool::SessionPool};

// ---------------------------------------------------------------------------
// ApiRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Body {
    Json(serde_json::Value),
    Raw(Bytes),
}

/// A call to be made through the gateway. Built with chained setters.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    url_template: String,
    context: HashMap<String, String>,
    params: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Body>,
    timeout: Option<Duration>,
    invalid: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, url_template: impl Into<String>) -> Self {
        Self {
            method,
            url_template: url_template.into(),
            context: HashMap::new(),
            params: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            invalid: None,
        }
    }

    pub fn get(url_template: impl Into<String>) -> Self {
        Self::new(Method::GET, url_template)
    }

    pub fn post(url_template: impl Into<String>) -> Self {
        Self::new(Method::POST, url_template)
    }

    /// Value for the `{name}` placeholder.
    pub fn context(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    /// Append a query-string parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => self.invalid = Some(format!("invalid header {name}")),
        }
        self
    }

    /// Serialize `body` as JSON. Timestamps travel as RFC 3339 and UUIDs in
    /// hyphenated form.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => self.body = Some(Body::Json(value)),
            Err(e) => self.invalid = Some(format!("request body: {e}")),
        }
        self
    }

    /// Send `bytes` as-is. No content type is added.
    pub fn raw(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = Some(Body::Raw(bytes.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve placeholders and apply the POST rule.
    pub fn resolve_url(&self) -> Result<Url, NodeError> {
        let resolved = resolve_template(&self.url_template, &self.context)?;
        let mut url = Url::parse(&resolved).map_err(|e| NodeError::remote(&resolved, e))?;
        if self.method == Method::POST {
            strip_trailing_id(&mut url);
        }
        Ok(url)
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

fn resolve_template(template: &str, context: &HashMap<String, String>) -> Result<String, NodeError> {
    if let Some(missing) = placeholder()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .find(|name| !context.contains_key(name))
    {
        return Err(NodeError::remote(
            template,
            format!("unresolved placeholder {{{missing}}}"),
        ));
    }
    Ok(placeholder()
        .replace_all(template, |c: &regex::Captures<'_>| context[&c[1]].clone())
        .into_owned())
}

fn strip_trailing_id(url: &mut Url) {
    let last_is_id = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .is_some_and(|last| !last.is_empty() && last.parse::<i64>().is_ok());
    if last_is_id {
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop();
        }
    }
}

// ---------------------------------------------------------------------------
// ApiResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub url: Url,
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| NodeError::remote(self.url.as_str(), format!("invalid response body: {e}")))
    }
}

// ---------------------------------------------------------------------------
// ApiGateway
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiGateway {
    pool: Arc<SessionPool>,
    runtime: Handle,
}

impl ApiGateway {
    /// `runtime` is where [`call_blocking`](Self::call_blocking) drives its
    /// futures. Pass [`Handle::current`] from inside the server.
    pub fn new(pool: Arc<SessionPool>, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub async fn call(
        &self,
        request: ApiRequest,
        credential: Option<&ClientCredential>,
    ) -> Result<ApiResponse, NodeError> {
        if let Some(reason) = &request.invalid {
            return Err(NodeError::remote(&request.url_template, reason));
        }
        let url = request.resolve_url()?;
        let session = self.pool.session(&url, credential)?;

        let mut builder = session
            .client()
            .request(request.method.clone(), url.clone())
            .headers(request.headers);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match request.body {
            Some(Body::Json(value)) => builder.header(CONTENT_TYPE, "application/json").body(
                serde_json::to_vec(&value).map_err(|e| NodeError::remote(url.as_str(), e))?,
            ),
            Some(Body::Raw(bytes)) => builder.body(bytes),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| NodeError::remote(url.as_str(), transport_cause(&e)))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| NodeError::remote(url.as_str(), transport_cause(&e)))?;

        if status.as_u16() >= 400 {
            let snippet = String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned();
            return Err(NodeError::remote(
                url.as_str(),
                format!("HTTP {}: {snippet}", status.as_u16()),
            ));
        }
        Ok(ApiResponse { url, status, body })
    }

    /// Same as [`call`](Self::call), for synchronous callers.
    ///
    /// # Panics
    ///
    /// Like [`Handle::block_on`], panics when called from an async task.
    /// Use it from plain threads or from `spawn_blocking`.
    pub fn call_blocking(
        &self,
        request: ApiRequest,
        credential: Option<&ClientCredential>,
    ) -> Result<ApiResponse, NodeError> {
        self.runtime.block_on(self.call(request, credential))
    }
}

fn transport_cause(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timed out: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_pool::TrustSettings;
    use axum::{
        body::Bytes as AxumBytes,
        extract::{Path, Query},
        http::HeaderMap as AxumHeaders,
        routing::{get, post},
        Json, Router,
    };
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};
    use uuid::Uuid;

    async fn spawn_mock_server() -> String {
        async fn echo(headers: AxumHeaders, body: AxumBytes) -> Json<Value> {
            Json(json!({
                "content_type": headers.get("content-type").and_then(|v| v.to_str().ok()),
                "body": String::from_utf8_lossy(&body),
            }))
        }
        async fn params(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
            Json(json!(q))
        }
        async fn item(Path(id): Path<String>) -> Json<Value> {
            Json(json!({ "id": id }))
        }
        async fn slow() -> &'static str {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        }
        async fn teapot() -> (axum::http::StatusCode, &'static str) {
            (axum::http::StatusCode::IM_A_TEAPOT, "short and stout")
        }

        let app = Router::new()
            .route("/v1/classes/photo/append", post(echo))
            .route("/v1/echo", post(echo))
            .route("/v1/params", get(params))
            .route("/v1/items/{id}", get(item))
            .route("/slow", get(slow))
            .route("/teapot", get(teapot));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gateway() -> ApiGateway {
        let pool = Arc::new(SessionPool::new(TrustSettings::default()).unwrap());
        ApiGateway::new(pool, Handle::current())
    }

    #[test]
    fn templates_resolve_from_context() {
        let req = ApiRequest::get("{base}/v1/members/{member_id}")
            .context("base", "https://dir.example.net")
            .context("member_id", "42");
        assert_eq!(
            req.resolve_url().unwrap().as_str(),
            "https://dir.example.net/v1/members/42"
        );
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let req = ApiRequest::get("https://dir.example.net/v1/members/{member_id}");
        let err = req.resolve_url().unwrap_err();
        assert!(err.to_string().contains("{member_id}"));
    }

    #[test]
    fn post_strips_trailing_integer_segment() {
        let url = ApiRequest::post("https://p.example.net/v1/classes/photo/append/123")
            .resolve_url()
            .unwrap();
        assert_eq!(url.path(), "/v1/classes/photo/append");

        let url = ApiRequest::post("https://p.example.net/v1/classes/photo/append/abc")
            .resolve_url()
            .unwrap();
        assert_eq!(url.path(), "/v1/classes/photo/append/abc");

        let url = ApiRequest::get("https://p.example.net/v1/items/123")
            .resolve_url()
            .unwrap();
        assert_eq!(url.path(), "/v1/items/123");
    }

    #[tokio::test]
    async fn json_body_is_lossless_and_typed() {
        let base = spawn_mock_server().await;
        let at: DateTime<Utc> = "2026-03-01T10:00:00.123456Z".parse().unwrap();
        let id = Uuid::now_v7();
        let resp = gateway()
            .call(
                ApiRequest::post(format!("{base}/v1/echo")).json(&json!({ "at": at, "id": id })),
                None,
            )
            .await
            .unwrap();
        let echoed: Value = resp.json().unwrap();
        assert_eq!(echoed["content_type"], "application/json");
        let sent: Value = serde_json::from_str(echoed["body"].as_str().unwrap()).unwrap();
        assert_eq!(sent["at"].as_str().unwrap().parse::<DateTime<Utc>>().unwrap(), at);
        assert_eq!(sent["id"].as_str().unwrap().parse::<Uuid>().unwrap(), id);
    }

    #[tokio::test]
    async fn raw_body_gets_no_content_type() {
        let base = spawn_mock_server().await;
        let resp = gateway()
            .call(ApiRequest::post(format!("{base}/v1/echo")).raw("plain"), None)
            .await
            .unwrap();
        let echoed: Value = resp.json().unwrap();
        assert!(echoed["content_type"].is_null());
        assert_eq!(echoed["body"], "plain");
    }

    #[tokio::test]
    async fn post_to_append_with_id_reaches_append() {
        let base = spawn_mock_server().await;
        let resp = gateway()
            .call(
                ApiRequest::post(format!("{base}/v1/classes/photo/append/123"))
                    .json(&json!({ "fields": {} })),
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn params_are_sent() {
        let base = spawn_mock_server().await;
        let resp = gateway()
            .call(
                ApiRequest::get(format!("{base}/v1/params")).param("first", "10"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.json::<Value>().unwrap()["first"], "10");
    }

    #[tokio::test]
    async fn error_status_is_remote_call_failed() {
        let base = spawn_mock_server().await;
        let err = gateway()
            .call(ApiRequest::get(format!("{base}/teapot")), None)
            .await
            .unwrap_err();
        match err {
            NodeError::RemoteCallFailed { url, cause } => {
                assert!(url.ends_with("/teapot"));
                assert!(cause.contains("418"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_and_refused_are_remote_call_failed() {
        let base = spawn_mock_server().await;
        let err = gateway()
            .call(
                ApiRequest::get(format!("{base}/slow")).timeout(Duration::from_millis(100)),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::RemoteCallFailed { .. }));

        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = gateway()
            .call(ApiRequest::get(format!("http://127.0.0.1:{port}/")), None)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::RemoteCallFailed { .. }));
    }

    #[tokio::test]
    async fn calls_reuse_one_session_per_host() {
        let base = spawn_mock_server().await;
        let gw = gateway();
        for id in ["1", "2"] {
            gw.call(
                ApiRequest::get(format!("{base}/v1/items/{{id}}")).context("id", id),
                None,
            )
            .await
            .unwrap();
        }
        assert_eq!(gw.pool().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_call_matches_async_call() {
        let base = spawn_mock_server().await;
        let gw = gateway();
        let url = format!("{base}/v1/items/7");

        let blocking = {
            let gw = gw.clone();
            let url = url.clone();
            tokio::task::spawn_blocking(move || gw.call_blocking(ApiRequest::get(url), None))
                .await
                .unwrap()
                .unwrap()
        };
        let concurrent = gw.call(ApiRequest::get(url), None).await.unwrap();
        assert_eq!(blocking.body, concurrent.body);
    }
}
