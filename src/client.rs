use std::env;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::observability::{
    CLIENT_HEALTH_CHECKS, CLIENT_HEALTH_FAILURES, CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS,
};
use crate::stream::{StreamHandle, StreamHandler, spawn_stream};
use crate::types::{ChatRequest, HealthStatus};

/// Base URL used when none is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Environment variable consulted when no base URL is passed in.
pub const BASE_URL_ENV: &str = "STREAMCHAT_BASE_URL";

/// A response body as it arrives off the wire.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_PATH: &str = "api/chat/stream";
const HEALTH_PATH: &str = "api/health";

/// Client for a streaming chat endpoint.
///
/// The client holds its own base URL; there is no process-wide configuration.  Only the
/// connect phase of a request is bounded by a timeout.  A stream that stays open without
/// sending anything stays open until it is cancelled.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: ReqwestClient,
    base_url: Url,
    connect_timeout: Duration,
}

impl ChatClient {
    /// Create a new chat client.
    ///
    /// The base URL can be provided directly or read from the STREAMCHAT_BASE_URL environment
    /// variable, falling back to `http://localhost:8000`.
    pub fn new(base_url: Option<String>) -> Result<Self> {
        Self::with_options(base_url, None)
    }

    /// Create a new client with custom settings.
    pub fn with_options(
        base_url: Option<String>,
        connect_timeout: Option<Duration>,
    ) -> Result<Self> {
        let base_url = match base_url {
            Some(url) => url,
            None => env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        };
        let base_url = parse_base_url(&base_url)?;

        let connect_timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let client = ReqwestClient::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            client,
            base_url,
            connect_timeout,
        })
    }

    /// The base URL every endpoint is resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The timeout applied to establishing connections.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("request timed out: {e}"),
                Some(self.connect_timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(e.to_string(), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(response: Response) -> Error {
        let status = response.status();
        let status_code = status.as_u16();

        #[derive(Deserialize)]
        struct ErrorResponse {
            detail: Option<serde_json::Value>,
            error: Option<ErrorDetail>,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            message: Option<String>,
        }

        let error_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };

        let parsed_error = serde_json::from_str::<ErrorResponse>(&error_body).ok();
        let detail = parsed_error.as_ref().and_then(|e| match &e.detail {
            Some(serde_json::Value::String(detail)) => Some(detail.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        });
        let error_message = detail
            .or_else(|| parsed_error.and_then(|e| e.error).and_then(|e| e.message))
            .unwrap_or_else(|| {
                if error_body.trim().is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("no response body")
                        .to_string()
                } else {
                    error_body.clone()
                }
            });

        match status_code {
            400 => Error::bad_request(error_message),
            404 => Error::not_found(error_message),
            408 => Error::request_timeout(error_message),
            500 => Error::internal_server(error_message),
            502..=504 => Error::service_unavailable(status_code, error_message),
            _ => Error::api(status_code, error_message),
        }
    }

    /// Send a chat request and return the raw response body.
    ///
    /// Fails when the request cannot be sent or the endpoint answers with a non-success status.
    pub async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        let url = self.endpoint(STREAM_PATH)?;
        CLIENT_REQUESTS.click();
        debug!(%url, history = request.chat_history.len(), "opening chat stream");

        let mut headers = Self::default_headers();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                CLIENT_REQUEST_ERRORS.click();
                self.map_send_error(e)
            })?;

        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            return Err(Self::process_error_response(response).await);
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| {
                Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
            })
        })))
    }

    /// Start streaming a reply to `request`.
    ///
    /// Returns immediately.  The request runs on a spawned task that reports progress through
    /// `handler`; see [`StreamHandler`] for the callback contract.  Failures are only ever
    /// reported through `on_error`, and nothing is reported once the returned handle has been
    /// cancelled.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn stream<H: StreamHandler>(&self, request: ChatRequest, handler: H) -> StreamHandle {
        let this = self.clone();
        spawn_stream(async move { this.open_stream(&request).await }, handler)
    }

    async fn fetch_health(&self) -> Result<HealthStatus> {
        let url = self.endpoint(HEALTH_PATH)?;
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, HeaderValue::from_static("application/json"))
            .timeout(self.connect_timeout)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(Self::process_error_response(response).await);
        }

        response.json::<HealthStatus>().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse health response: {e}"),
                Some(Box::new(e)),
            )
        })
    }

    /// Ask the service for its health.
    ///
    /// Never fails: any error is logged and reported as [`HealthStatus::error`].
    pub async fn health_check(&self) -> HealthStatus {
        CLIENT_HEALTH_CHECKS.click();
        match self.fetch_health().await {
            Ok(health) => health,
            Err(err) => {
                CLIENT_HEALTH_FAILURES.click();
                warn!(error = %err, "health check failed");
                HealthStatus::error()
            }
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(Error::url(
            format!("base URL must be an http(s) URL: {raw}"),
            None,
        ));
    }
    // Url::join drops the last path segment unless the path ends in a slash.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
