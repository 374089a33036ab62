use crate::classify::{classify_decode, classify_http, classify_transport};
use crate::config::{resolve_credential, Credential, ProviderConfig};
use crate::error_kind::{ClassifiedError, ErrorKind};
use crate::{BoxStream, Error, ErrorContext, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Proxy;
use std::env;
use std::time::Duration;

/// Correlation header carrying the request trace id.
pub const REQUEST_ID_HEADER: &str = "x-llm-router-request-id";

/// A configured HTTP client bound to one provider endpoint.
///
/// Every failure leaving this type is already classified.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    provider: String,
    credential: Option<Credential>,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let base_url = config
            .endpoint
            .as_deref()
            .ok_or_else(|| {
                Error::configuration_with_context(
                    "HTTP providers require an endpoint",
                    ErrorContext::new()
                        .with_field_path("endpoint")
                        .with_source(format!("provider:{}", config.name)),
                )
            })?
            .trim_end_matches('/')
            .to_string();

        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect())
            .pool_max_idle_per_host(
                env::var("LLM_ROUTER_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(config.max_concurrency.max(1)),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Ok(proxy_url) = env::var("LLM_ROUTER_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder.build().map_err(|e| {
            Error::configuration_with_context(
                format!("cannot build HTTP client: {}", e),
                ErrorContext::new().with_source(format!("provider:{}", config.name)),
            )
        })?;

        Ok(Self {
            client,
            base_url,
            provider: config.name.clone(),
            credential: resolve_credential(&config.name, config.credential_ref.as_deref()),
            request_timeout: config.timeouts.request(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// POST a JSON body and return the response once its status is known good.
    ///
    /// `timeout` bounds the whole exchange and should be `None` for streamed
    /// bodies, whose lifetime is governed by the caller.
    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        trace_id: &str,
        stream: bool,
        timeout: Option<Duration>,
    ) -> std::result::Result<reqwest::Response, ClassifiedError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url).json(body);

        if let Some(key) = &self.credential {
            req = req.bearer_auth(key.expose());
        }
        if stream {
            req = req.header("accept", "text/event-stream, application/x-ndjson");
        }
        if !trace_id.is_empty() {
            req = req.header(REQUEST_ID_HEADER, trace_id);
        }
        if let Some(t) = timeout {
            req = req.timeout(t.min(self.request_timeout));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport(&e, &self.provider))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let headers = resp.headers().clone();
        let text = resp.text().await.unwrap_or_default();
        Err(classify_http(status.as_u16(), &headers, &text, &self.provider))
    }

    /// Read a full JSON body.
    pub async fn read_json(
        &self,
        resp: reqwest::Response,
    ) -> std::result::Result<serde_json::Value, ClassifiedError> {
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, &self.provider))?;
        serde_json::from_slice(&bytes).map_err(|e| classify_decode(&e, &self.provider))
    }

    /// Body as a byte stream with classified errors.
    pub fn byte_stream(&self, resp: reqwest::Response) -> BoxStream<'static, Bytes> {
        let provider = self.provider.clone();
        let stream = resp
            .bytes_stream()
            .map_err(move |e| Error::Classified(classify_transport(&e, &provider)));
        Box::pin(stream)
    }

    /// `auth` error used when a provider that needs a key has none.
    pub fn missing_credential(&self) -> ClassifiedError {
        ClassifiedError::new(
            ErrorKind::Auth,
            format!("no credential resolved for provider '{}'", self.provider),
        )
        .with_provider(self.provider.clone())
    }
}
