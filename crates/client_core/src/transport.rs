use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, ClientResult};

pub mod endpoints {
    pub const CHANNELS: &str = "/api/message/channels";
    pub const CREATE_CHANNEL: &str = "/api/message/channel/create";
    pub const MESSAGES: &str = "/api/message/messages";
    pub const SEND_MESSAGE: &str = "/api/message/send";
    pub const SUBSCRIBE_ALL: &str = "/api/message/subscribe";
    pub const SUBSCRIBE_CHANNEL: &str = "/api/message/subscribe/channel";
    pub const PUBLIC_USER: &str = "/api/public/user";
    pub const CURRENT_USER: &str = "/api/user/from/jwt";
    pub const REFRESH: &str = "/api/auth/refresh";
    pub const LOGOUT: &str = "/auth/logout";
    pub const HEALTHCHECK: &str = "/api/healthcheck";
}

const STATUS_UNAVAILABLE: u16 = 503;
const STATUS_UNAUTHORIZED: u16 = 401;

/// Appends url-encoded query pairs to an endpoint path.
pub fn with_query(path: &str, pairs: &[(&str, &str)]) -> String {
    if pairs.is_empty() {
        return path.to_string();
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{path}?{query}")
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub api_key: Option<String>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            api_key: None,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: None,
            api_key: None,
        }
    }

    pub fn json(mut self, body: &impl Serialize) -> ClientResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ApiResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    /// Stand-in for a request that never reached the server.
    pub fn unavailable() -> Self {
        Self::new(STATUS_UNAVAILABLE, None)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unavailable(&self) -> bool {
        self.status == STATUS_UNAVAILABLE && self.body.is_none()
    }

    pub fn json<T: DeserializeOwned>(&self) -> ClientResult<T> {
        let body = self
            .body
            .clone()
            .ok_or_else(|| ClientError::Decode("empty response body".into()))?;
        Ok(serde_json::from_value(body)?)
    }
}

/// Authenticated request function consumed by the messaging engine.
#[async_trait]
pub trait HttpApi: Send + Sync {
    async fn request(&self, request: ApiRequest) -> ClientResult<ApiResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Online,
    Offline,
    Unknown,
}

pub async fn server_status(api: &dyn HttpApi) -> ServerStatus {
    match api.request(ApiRequest::get(endpoints::HEALTHCHECK)).await {
        Ok(response) if response.is_success() => ServerStatus::Online,
        Ok(response) if response.status == STATUS_UNAVAILABLE => ServerStatus::Offline,
        Ok(_) => ServerStatus::Unknown,
        Err(err) => {
            warn!("api: unknown server status: {err}");
            ServerStatus::Unknown
        }
    }
}

/// Ends the server session; failures are only logged.
pub async fn logout(api: &dyn HttpApi) {
    match api.request(ApiRequest::post(endpoints::LOGOUT)).await {
        Ok(response) if response.is_success() => info!("api: logged out"),
        Ok(response) => warn!(status = response.status, "api: logout rejected"),
        Err(err) => warn!("api: logout failed: {err}"),
    }
}

/// Cookie-carrying HTTP client that refreshes the session once on 401.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        let http = Client::builder().cookie_store(true).build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Underlying client, so other connections share the session cookies.
    pub fn http_client(&self) -> Client {
        self.http.clone()
    }

    async fn send_once(&self, request: &ApiRequest) -> ClientResult<ApiResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), format!("{}{}", self.base_url, request.path))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(api_key) = &request.api_key {
            builder = builder.bearer_auth(api_key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if err.is_connect() || err.is_timeout() => {
                debug!(path = %request.path, "api: server unreachable: {err}");
                return Ok(ApiResponse::unavailable());
            }
            Err(err) => return Err(err.into()),
        };

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };
        Ok(ApiResponse::new(status, body))
    }

    async fn refresh_tokens(&self) -> bool {
        match self
            .http
            .post(format!("{}{}", self.base_url, endpoints::REFRESH))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                error!("api: token refresh failed: {err}");
                false
            }
        }
    }
}

#[async_trait]
impl HttpApi for ApiClient {
    async fn request(&self, request: ApiRequest) -> ClientResult<ApiResponse> {
        let response = self.send_once(&request).await?;
        if response.status != STATUS_UNAUTHORIZED {
            return Ok(response);
        }

        if self.refresh_tokens().await {
            debug!(path = %request.path, "api: session refreshed, retrying request");
            return self.send_once(&request).await;
        }
        Ok(response)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
