use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use roomsync_core::{
    SyncBatch, SyncError, SyncErrorCategory, SyncRequest, Transport, classify_http_status,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

const SYNC_PATH: &str = "/_matrix/client/r0/sync";
const WHOAMI_PATH: &str = "/_matrix/client/r0/account/whoami";
/// Added to the long-poll wait so the server can answer before we give up.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(10);
const PLAIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait applied to an HTTP 429 that carries no hint.
pub const DEFAULT_RATE_LIMIT_WAIT_MS: u64 = 5_000;
pub const DEFAULT_MAX_RATE_LIMIT_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTransportConfig {
    pub homeserver: Url,
    pub access_token: String,
    pub user_agent: String,
    pub rate_limit_wait: Duration,
    pub max_rate_limit_retries: u32,
}

/// [`Transport`] speaking the client-server HTTP API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    sync_url: Url,
    whoami_url: Url,
    access_token: String,
    rate_limit_wait: Duration,
    max_rate_limit_retries: u32,
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    user_id: String,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, SyncError> {
        let sync_url = join_endpoint(&config.homeserver, SYNC_PATH)?;
        let whoami_url = join_endpoint(&config.homeserver, WHOAMI_PATH)?;
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .build()
            .map_err(|err| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "http_client_build_error",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            http,
            sync_url,
            whoami_url,
            access_token: config.access_token,
            rate_limit_wait: config.rate_limit_wait,
            max_rate_limit_retries: config.max_rate_limit_retries,
        })
    }

    /// Resolve the user id the access token belongs to.
    pub async fn whoami(&self) -> Result<String, SyncError> {
        let response = self
            .send_with_rate_limit(|| {
                self.http
                    .get(self.whoami_url.clone())
                    .bearer_auth(&self.access_token)
                    .timeout(PLAIN_REQUEST_TIMEOUT)
            })
            .await?;
        let body: WhoAmIResponse = response.json().await.map_err(map_reqwest_error)?;
        Ok(body.user_id)
    }

    /// Send a request, retrying in place while the server answers 429.
    async fn send_with_rate_limit<F>(&self, build: F) -> Result<Response, SyncError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retries: u32 = 0;
        loop {
            let response = build().send().await.map_err(map_reqwest_error)?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<Value>(&body).ok();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = parsed
                    .as_ref()
                    .and_then(parse_retry_after_ms)
                    .map(Duration::from_millis)
                    .unwrap_or(self.rate_limit_wait);
                if retries < self.max_rate_limit_retries {
                    retries += 1;
                    warn!(
                        retry = retries,
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "rate limited by homeserver; waiting"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                return Err(status_error(status, parsed.as_ref(), &body).with_retry_after(wait));
            }

            return Err(status_error(status, parsed.as_ref(), &body));
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_batch(&self, request: SyncRequest) -> Result<SyncBatch, SyncError> {
        let query = sync_query(&request);
        let timeout = request.timeout + REQUEST_TIMEOUT_SLACK;
        debug!(
            since = request.since.as_ref().map(|token| token.as_str()),
            timeout_ms = request.timeout_ms(),
            "polling homeserver"
        );

        let response = self
            .send_with_rate_limit(|| {
                self.http
                    .get(self.sync_url.clone())
                    .bearer_auth(&self.access_token)
                    .query(&query)
                    .timeout(timeout)
            })
            .await?;
        let body = response.text().await.map_err(map_reqwest_error)?;
        serde_json::from_str(&body)
            .map_err(|err| SyncError::malformed(format!("sync body is not a valid batch: {err}")))
    }
}

/// Query parameters of a sync request.
pub fn sync_query(request: &SyncRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![("timeout", request.timeout_ms().to_string())];
    if let Some(since) = &request.since {
        query.push(("since", since.as_str().to_owned()));
    }
    if let Some(filter) = &request.filter {
        query.push(("filter", filter.clone()));
    }
    if request.full_state {
        query.push(("full_state", "true".to_owned()));
    }
    if let Some(presence) = &request.set_presence {
        query.push(("set_presence", presence.clone()));
    }
    query
}

/// Extract `retry_after_ms` from an error body.
///
/// Some servers nest the real error object as a JSON string under `error`.
pub fn parse_retry_after_ms(body: &Value) -> Option<u64> {
    if let Some(ms) = body.get("retry_after_ms").and_then(Value::as_u64) {
        return Some(ms);
    }
    let nested = body.get("error").and_then(Value::as_str)?;
    serde_json::from_str::<Value>(nested)
        .ok()?
        .get("retry_after_ms")
        .and_then(Value::as_u64)
}

fn status_error(status: StatusCode, body: Option<&Value>, raw: &str) -> SyncError {
    let errcode = body
        .and_then(|body| body.get("errcode"))
        .and_then(Value::as_str);
    let message = body
        .and_then(|body| body.get("error"))
        .and_then(Value::as_str)
        .unwrap_or(raw);
    let code = errcode
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("http_{}", status.as_u16()));

    SyncError::new(
        classify_http_status(status.as_u16()),
        code,
        format!("{status}: {message}"),
    )
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::new(SyncErrorCategory::Network, "request_timeout", err.to_string())
    } else if err.is_connect() {
        SyncError::new(SyncErrorCategory::Network, "connect_error", err.to_string())
    } else if err.is_decode() {
        SyncError::malformed(err.to_string())
    } else if let Some(status) = err.status() {
        SyncError::new(
            classify_http_status(status.as_u16()),
            "http_error",
            err.to_string(),
        )
    } else {
        SyncError::new(SyncErrorCategory::Network, "http_transport_error", err.to_string())
    }
}

fn join_endpoint(homeserver: &Url, path: &str) -> Result<Url, SyncError> {
    homeserver.join(path).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_homeserver_url",
            format!("cannot build {path} from {homeserver}: {err}"),
        )
    })
}
