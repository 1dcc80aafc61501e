//! Client for the APIC REST API
//!
//! The collection pipeline only needs one capability from the controller: "given a class and a
//! set of query parameters, return the decoded JSON document". That capability is the
//! [`ApiClient`] trait. [`Client`] is the HTTP implementation used against a real APIC; it owns
//! the session lifecycle (login, token refresh) so that callers never see it.

use std::{
    fmt::{Debug, Display},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{IntoUrl, Method, RequestBuilder, Response, StatusCode, header::COOKIE};
use secrecy::{ExposeSecret, Secret};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

/// Primary error type for the [`Client`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base URL error: {0}")]
    BaseUrl(#[source] reqwest::Error),

    #[error("request URL error: {0}")]
    RequestUrl(#[from] url::ParseError),

    #[error("failed to build the HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to parse JSON response: {0}")]
    Json(#[source] reqwest::Error),

    #[error("failed to parse plaintext response: {0}")]
    Text(#[source] reqwest::Error),

    #[error("APIC responded with error [{code}]: {message}")]
    ApiError { code: StatusCode, message: String },

    #[error("failed to send {method} {url} request: {source}")]
    RequestSend {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("no credentials were provided to log in with")]
    MissingCredentials,

    #[error("login response did not contain a session token")]
    MissingToken,

    #[error("client is not logged in, call `login` first")]
    NotLoggedIn,

    /// Returned by test and fixture implementations of [`ApiClient`]
    #[error("{0}")]
    Other(String),
}

impl Error {
    fn request_send(method: Method, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::RequestSend {
            method,
            url: url.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single request-shaping parameter, e.g., `rsp-subtree-include=count`
///
/// These are passed through to the APIC as URL query parameters, in the order given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryParam {
    key: String,
    value: String,
}

impl QueryParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Display for QueryParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The capability the collection pipeline consumes: fetch every object of a class
///
/// Authentication, session handling and any retry policy are the implementor's concern.
#[async_trait]
pub trait ApiClient: Debug + Send + Sync + 'static {
    /// Fetch the objects of `class`, shaped by `query`, as the decoded JSON response body
    async fn get(&self, class: &str, query: &[QueryParam]) -> Result<Value>;
}

/// Options used to construct the underlying HTTP client of a [`Client`]
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Timeout applied to every request
    pub request_timeout: Duration,
    /// APICs commonly serve self-signed certificates
    pub accept_invalid_certs: bool,
    /// Age after which the session token is refreshed before the next request
    pub refresh_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(90),
            accept_invalid_certs: true,
            // the APIC default session lifetime is 10 minutes
            refresh_interval: Duration::from_secs(8 * 60),
        }
    }
}

#[derive(Debug)]
struct Session {
    token: Secret<String>,
    refreshed_at: Instant,
}

impl Session {
    fn new(token: impl Into<String>) -> Self {
        Self {
            token: Secret::new(token.into()),
            refreshed_at: Instant::now(),
        }
    }

    fn cookie(&self) -> String {
        format!("APIC-cookie={}", self.token.expose_secret())
    }
}

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: Secret<String>,
}

/// The APIC HTTP client
///
/// Cloning a [`Client`] is cheap and clones share the same session.
#[derive(Debug, Clone)]
pub struct Client {
    /// The base URL of the APIC, e.g., `https://apic`
    base_url: Url,
    credentials: Option<Credentials>,
    session: Arc<Mutex<Option<Session>>>,
    refresh_interval: Duration,
    /// A [`reqwest::Client`] for handling HTTP requests
    http_client: reqwest::Client,
}

impl Client {
    /// Create a new [`Client`] with default [`ClientOptions`]
    pub fn new<U: IntoUrl>(base_url: U) -> Result<Self> {
        Self::with_options(base_url, ClientOptions::default())
    }

    /// Create a new [`Client`]
    pub fn with_options<U: IntoUrl>(base_url: U, options: ClientOptions) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self {
            base_url: base_url.into_url().map_err(Error::BaseUrl)?,
            credentials: None,
            session: Arc::new(Mutex::new(None)),
            refresh_interval: options.refresh_interval,
            http_client,
        })
    }

    /// Set the username and password used by [`login`][Client::login]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: Secret::new(password.into()),
        });
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Authenticate against `POST /api/aaaLogin.json` and store the session token
    pub async fn login(&self) -> Result<()> {
        const PATH: &str = "/api/aaaLogin.json";
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(Error::MissingCredentials)?;
        let url = self.base_url.join(PATH)?;
        let body = json!({
            "aaaUser": {
                "attributes": {
                    "name": credentials.username,
                    "pwd": credentials.password.expose_secret(),
                }
            }
        });
        let resp = self
            .http_client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|src| Error::request_send(Method::POST, PATH, src))?;
        let doc = json_body(resp).await?;
        *self.session.lock() = Some(Session::new(token_from(&doc)?));
        debug!(user = %credentials.username, "logged in to APIC");
        Ok(())
    }

    /// Refresh the session token with `GET /api/aaaRefresh.json`
    pub async fn refresh(&self) -> Result<()> {
        const PATH: &str = "/api/aaaRefresh.json";
        let url = self.base_url.join(PATH)?;
        let req = self.authenticated(self.http_client.get(url))?;
        let resp = req
            .send()
            .await
            .map_err(|src| Error::request_send(Method::GET, PATH, src))?;
        let doc = json_body(resp).await?;
        *self.session.lock() = Some(Session::new(token_from(&doc)?));
        debug!("refreshed APIC session token");
        Ok(())
    }

    /// Make a request to `GET /api/class/<class>.json`
    pub async fn get_class(&self, class: &str, query: &[QueryParam]) -> Result<Value> {
        if self.needs_refresh()? {
            self.refresh().await?;
        }
        let path = format!("/api/class/{class}.json");
        let url = self.base_url.join(&path)?;
        let pairs: Vec<(&str, &str)> = query.iter().map(|q| (q.key(), q.value())).collect();
        let req = self.authenticated(self.http_client.get(url).query(&pairs))?;
        let resp = req
            .send()
            .await
            .map_err(|src| Error::request_send(Method::GET, path, src))?;
        json_body(resp).await
    }

    fn needs_refresh(&self) -> Result<bool> {
        match self.session.lock().as_ref() {
            Some(session) => Ok(session.refreshed_at.elapsed() >= self.refresh_interval),
            None => Err(Error::NotLoggedIn),
        }
    }

    fn authenticated(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        let cookie = self
            .session
            .lock()
            .as_ref()
            .map(Session::cookie)
            .ok_or(Error::NotLoggedIn)?;
        Ok(req.header(COOKIE, cookie))
    }
}

#[async_trait]
impl ApiClient for Client {
    async fn get(&self, class: &str, query: &[QueryParam]) -> Result<Value> {
        self.get_class(class, query).await
    }
}

/// Decode a successful response body, or turn an error status into [`Error::ApiError`]
///
/// The APIC reports failures as `{"imdata":[{"error":{"attributes":{"text":"..."}}}]}`; when
/// the body has that shape only the text is kept.
async fn json_body(resp: Response) -> Result<Value> {
    match resp.status() {
        StatusCode::OK => resp.json::<Value>().await.map_err(Error::Json),
        code => {
            let text = resp.text().await.map_err(Error::Text)?;
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|doc| {
                    doc.pointer("/imdata/0/error/attributes/text")
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned)
                })
                .unwrap_or(text);
            Err(Error::ApiError { code, message })
        }
    }
}

fn token_from(doc: &Value) -> Result<&str> {
    doc.pointer("/imdata/0/aaaLogin/attributes/token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or(Error::MissingToken)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockito::{Matcher, Server};
    use reqwest::StatusCode;
    use serde_json::json;

    use crate::{ApiClient, Client, ClientOptions, Error, QueryParam};

    fn login_body(token: &str) -> String {
        json!({
            "imdata": [{ "aaaLogin": { "attributes": { "token": token } } }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn login_then_get_class() {
        let mut mock_server = Server::new_async().await;
        let login = mock_server
            .mock("POST", "/api/aaaLogin.json")
            .match_body(Matcher::Json(json!({
                "aaaUser": { "attributes": { "name": "admin", "pwd": "hunter2" } }
            })))
            .with_status(200)
            .with_body(login_body("abc123"))
            .create_async()
            .await;
        let body = json!({
            "totalCount": "1",
            "imdata": [{ "fvTenant": { "attributes": { "dn": "uni/tn-common" } } }]
        });
        let get = mock_server
            .mock("GET", "/api/class/fvTenant.json")
            .match_header("cookie", "APIC-cookie=abc123")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let client = Client::new(mock_server.url())
            .expect("create client")
            .with_credentials("admin", "hunter2");
        client.login().await.expect("login");
        let r = client.get("fvTenant", &[]).await.expect("get fvTenant");

        assert_eq!(r, body);
        login.assert_async().await;
        get.assert_async().await;
    }

    #[tokio::test]
    async fn query_params_are_sent_in_order() {
        let mut mock_server = Server::new_async().await;
        let _login = mock_server
            .mock("POST", "/api/aaaLogin.json")
            .with_body(login_body("t"))
            .create_async()
            .await;
        let get = mock_server
            .mock("GET", "/api/class/topSystem.json")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("rsp-subtree-include".into(), "health,no-scoped".into()),
                Matcher::UrlEncoded("query-target".into(), "self".into()),
            ]))
            .with_body(r#"{"imdata":[]}"#)
            .create_async()
            .await;

        let client = Client::new(mock_server.url())
            .expect("create client")
            .with_credentials("admin", "pwd");
        client.login().await.expect("login");
        client
            .get(
                "topSystem",
                &[
                    QueryParam::new("rsp-subtree-include", "health,no-scoped"),
                    QueryParam::new("query-target", "self"),
                ],
            )
            .await
            .expect("get topSystem");

        get.assert_async().await;
    }

    #[tokio::test]
    async fn api_error_text_is_extracted() {
        let mut mock_server = Server::new_async().await;
        let _login = mock_server
            .mock("POST", "/api/aaaLogin.json")
            .with_body(login_body("t"))
            .create_async()
            .await;
        let _get = mock_server
            .mock("GET", "/api/class/notAClass.json")
            .with_status(400)
            .with_body(
                json!({
                    "imdata": [{ "error": { "attributes": {
                        "code": "400",
                        "text": "Request failed, unresolved class for notAClass"
                    } } }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = Client::new(mock_server.url())
            .expect("create client")
            .with_credentials("admin", "pwd");
        client.login().await.expect("login");
        let err = client.get("notAClass", &[]).await.unwrap_err();

        match err {
            Error::ApiError { code, message } => {
                assert_eq!(code, StatusCode::BAD_REQUEST);
                assert_eq!(message, "Request failed, unresolved class for notAClass");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failed_login_is_an_api_error() {
        let mut mock_server = Server::new_async().await;
        let _login = mock_server
            .mock("POST", "/api/aaaLogin.json")
            .with_status(401)
            .with_body("denied")
            .create_async()
            .await;

        let client = Client::new(mock_server.url())
            .expect("create client")
            .with_credentials("admin", "wrong");
        let err = client.login().await.unwrap_err();

        assert!(
            matches!(err, Error::ApiError { code, ref message } if code == StatusCode::UNAUTHORIZED && message == "denied"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn get_before_login_fails() {
        let client = Client::new("https://apic.invalid").expect("create client");
        let err = client.get("fvTenant", &[]).await.unwrap_err();
        assert!(matches!(err, Error::NotLoggedIn));
    }

    #[tokio::test]
    async fn login_without_credentials_fails() {
        let client = Client::new("https://apic.invalid").expect("create client");
        let err = client.login().await.unwrap_err();
        assert!(matches!(err, Error::MissingCredentials));
    }

    #[tokio::test]
    async fn stale_session_is_refreshed_before_get() {
        let mut mock_server = Server::new_async().await;
        let _login = mock_server
            .mock("POST", "/api/aaaLogin.json")
            .with_body(login_body("first"))
            .create_async()
            .await;
        let refresh = mock_server
            .mock("GET", "/api/aaaRefresh.json")
            .match_header("cookie", "APIC-cookie=first")
            .with_body(login_body("second"))
            .create_async()
            .await;
        let get = mock_server
            .mock("GET", "/api/class/fvCtx.json")
            .match_header("cookie", "APIC-cookie=second")
            .with_body(r#"{"imdata":[]}"#)
            .create_async()
            .await;

        let client = Client::with_options(
            mock_server.url(),
            ClientOptions {
                refresh_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .expect("create client")
        .with_credentials("admin", "pwd");
        client.login().await.expect("login");
        client.get("fvCtx", &[]).await.expect("get fvCtx");

        refresh.assert_async().await;
        get.assert_async().await;
    }

    #[test]
    fn query_param_display() {
        let q = QueryParam::new("rsp-subtree-include", "count");
        assert_eq!(q.to_string(), "rsp-subtree-include=count");
    }
}
