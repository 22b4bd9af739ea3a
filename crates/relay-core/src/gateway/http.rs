//! HTTP implementation of every collaborator trait against the agent server.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::sse::SseParser;
use super::{
    AgentTransport, ConfigGateway, ConfigSnapshot, CostTracker, ExtensionGateway, GatewayError,
    GatewayErrorKind, GatewayResult, ReadMode, RecipeSecurityScanner, ReplyRequest, ReplyStream,
    ResumeRequest, ScanReport, SessionSnapshot, StartRequest, ToolConfirmationAction,
};
use crate::config::Config;
use crate::extension::{ExtensionConfig, ExtensionEntry};
use crate::recipe::Recipe;

/// Standard User-Agent header for relay requests.
pub const USER_AGENT: &str = concat!("relay/", env!("CARGO_PKG_VERSION"));

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "X-Secret-Key";

/// Client for one agent server.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: Url,
    secret_key: Option<String>,
    timeout: Option<Duration>,
}

#[derive(Deserialize)]
struct ExtensionList {
    #[serde(default)]
    extensions: Vec<ExtensionEntry>,
}

impl HttpGateway {
    pub fn new(mut base_url: Url, secret_key: Option<String>, timeout: Option<Duration>) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
            secret_key,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.effective_server_url()?,
            config.effective_secret_key(),
            config.request_timeout(),
        ))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> GatewayResult<Url> {
        self.base_url.join(path).map_err(|e| {
            GatewayError::new(
                GatewayErrorKind::Connection,
                format!("Invalid endpoint {path}: {e}"),
            )
        })
    }

    /// Endpoint under `prefix` with `id` appended as one escaped path segment.
    fn endpoint_with_id(&self, prefix: &str, id: &str) -> GatewayResult<Url> {
        let mut url = self.endpoint(prefix)?;
        url.path_segments_mut()
            .map_err(|()| {
                GatewayError::new(
                    GatewayErrorKind::Connection,
                    format!("Invalid endpoint {prefix}: base URL cannot take a path"),
                )
            })?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    fn builder(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header("user-agent", USER_AGENT);
        if let Some(secret) = &self.secret_key {
            builder = builder.header(SECRET_HEADER, secret);
        }
        builder
    }

    /// Builder for a request/response call, bounded by the request timeout.
    fn call(&self, method: Method, path: &str) -> GatewayResult<RequestBuilder> {
        Ok(self.call_at(method, self.endpoint(path)?))
    }

    fn call_at(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .builder(method, url)
            .header("accept", "application/json");
        match self.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> GatewayResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::http_status(status.as_u16(), &body));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> GatewayResult<T> {
        let response = Self::send(builder).await?;
        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        serde_json::from_str(&body).map_err(|err| {
            let mut error = GatewayError::parse(format!("Failed to parse response: {err}"));
            error.details = Some(body);
            error
        })
    }

    async fn send_empty(builder: RequestBuilder) -> GatewayResult<()> {
        Self::send(builder).await.map(drop)
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        GatewayError::new(
            GatewayErrorKind::Connection,
            format!("Connection failed: {e}"),
        )
    } else if e.is_decode() {
        GatewayError::parse(format!("Failed to decode response: {e}"))
    } else {
        GatewayError::new(
            GatewayErrorKind::Connection,
            format!("Network error: {e}"),
        )
    }
}

#[async_trait]
impl ConfigGateway for HttpGateway {
    async fn init(&self) -> GatewayResult<()> {
        Self::send_empty(self.call(Method::POST, "config/init")?.json(&json!({}))).await
    }

    async fn reset(&self) -> GatewayResult<()> {
        Self::send_empty(
            self.call(Method::POST, "config/init")?
                .json(&json!({"force": true})),
        )
        .await
    }

    async fn read(&self, key: &str) -> GatewayResult<Option<Value>> {
        let value: Value = Self::send_json(
            self.call(Method::POST, "config/read")?
                .json(&json!({"key": key, "is_secret": false})),
        )
        .await?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn read_all(&self, mode: ReadMode) -> GatewayResult<ConfigSnapshot> {
        let strict = matches!(mode, ReadMode::Strict);
        Self::send_json(
            self.call(Method::GET, "config")?
                .query(&[("strict", strict)]),
        )
        .await
    }

    async fn validate(&self) -> GatewayResult<()> {
        Self::send_empty(self.call(Method::GET, "config/validate")?).await
    }

    async fn backup(&self) -> GatewayResult<()> {
        Self::send_empty(self.call(Method::POST, "config/backup")?).await
    }

    async fn recover(&self) -> GatewayResult<()> {
        Self::send_empty(self.call(Method::POST, "config/recover")?).await
    }
}

#[async_trait]
impl ExtensionGateway for HttpGateway {
    async fn list(&self) -> GatewayResult<Vec<ExtensionEntry>> {
        let list: ExtensionList =
            Self::send_json(self.call(Method::GET, "config/extensions")?).await?;
        Ok(list.extensions)
    }

    async fn add_to_session(
        &self,
        session_id: &str,
        config: &ExtensionConfig,
    ) -> GatewayResult<()> {
        Self::send_empty(
            self.call(Method::POST, "agent/add_extension")?
                .json(&json!({"session_id": session_id, "config": config})),
        )
        .await
    }
}

#[async_trait]
impl RecipeSecurityScanner for HttpGateway {
    async fn scan(&self, recipe: &Recipe) -> GatewayResult<ScanReport> {
        Self::send_json(
            self.call(Method::POST, "recipes/scan")?
                .json(&json!({"recipe": recipe})),
        )
        .await
    }
}

#[async_trait]
impl CostTracker for HttpGateway {
    async fn initialize(&self) -> GatewayResult<()> {
        Self::send_empty(
            self.call(Method::POST, "config/pricing")?
                .json(&json!({"configured_only": true})),
        )
        .await
    }
}

#[async_trait]
impl AgentTransport for HttpGateway {
    async fn start(&self, request: StartRequest) -> GatewayResult<SessionSnapshot> {
        Self::send_json(self.call(Method::POST, "agent/start")?.json(&request)).await
    }

    async fn resume(&self, request: ResumeRequest) -> GatewayResult<SessionSnapshot> {
        Self::send_json(self.call(Method::POST, "agent/resume")?.json(&request)).await
    }

    async fn session(&self, session_id: &str) -> GatewayResult<SessionSnapshot> {
        let url = self.endpoint_with_id("sessions/", session_id)?;
        Self::send_json(self.call_at(Method::GET, url)).await
    }

    async fn reply(
        &self,
        request: ReplyRequest,
        cancel: CancellationToken,
    ) -> GatewayResult<ReplyStream> {
        // No request timeout: replies stream for as long as the agent works.
        let builder = self
            .builder(Method::POST, self.endpoint("reply")?)
            .header("accept", "text/event-stream")
            .json(&request);

        let response = tokio::select! {
            () = cancel.cancelled() => {
                return Ok(futures_util::stream::empty().boxed());
            }
            response = Self::send(builder) => response?,
        };

        let events = SseParser::new(response.bytes_stream());
        Ok(events.take_until(cancel.cancelled_owned()).boxed())
    }

    async fn confirm_tool(
        &self,
        session_id: &str,
        request_id: &str,
        action: ToolConfirmationAction,
    ) -> GatewayResult<()> {
        Self::send_empty(
            self.call(Method::POST, "action-required/tool-confirmation")?
                .json(&json!({"id": request_id, "action": action, "session_id": session_id})),
        )
        .await
    }
}
