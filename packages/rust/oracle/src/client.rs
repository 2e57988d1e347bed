//! OpenAI-compatible chat-completions client (OpenRouter by default).

use std::time::Duration;

use async_trait::async_trait;
use planindex_shared::{AppConfig, OracleConfig, OracleError, PlanIndexError, resolve_api_key};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use crate::{AnalysisOracle, OracleRequest};

/// User-Agent string for oracle requests.
const USER_AGENT: &str = concat!("PlanIndex/", env!("CARGO_PKG_VERSION"));

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 500;

/// HTTP oracle speaking the `/chat/completions` protocol.
pub struct OpenRouterOracle {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenRouterOracle {
    /// Build a client from the `[oracle]` section and an API key.
    pub fn new(config: &OracleConfig, api_key: impl Into<String>) -> Result<Self, PlanIndexError> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .map_err(|e| {
                PlanIndexError::config(format!("invalid oracle base_url {}: {e}", config.base_url))
            })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PlanIndexError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            model: config.model.clone(),
        })
    }

    /// Build a client from the full app config, reading the key from the environment.
    pub fn from_config(config: &AppConfig) -> Result<Self, PlanIndexError> {
        let api_key = resolve_api_key(config)?;
        Self::new(&config.oracle, api_key)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn request_body(&self, request: &OracleRequest) -> Value {
        let content = match &request.image {
            Some(image) => json!([
                { "type": "text", "text": request.prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", image.mime_type, image.data) }
                }
            ]),
            None => Value::String(request.prompt.clone()),
        };

        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": request.max_output_tokens,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl AnalysisOracle for OpenRouterOracle {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, max_tokens = request.max_output_tokens))]
    async fn generate(&self, request: &OracleRequest) -> Result<String, OracleError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| OracleError::malformed(format!("invalid completion envelope: {e}"), false))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| OracleError::malformed("empty completion", false))?;

        debug!(chars = text.len(), "oracle response received");
        Ok(text)
    }
}

/// Map a non-success HTTP status onto the oracle error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> OracleError {
    let message = format!("HTTP {status}: {}", truncate(body, MAX_ERROR_BODY));
    match status {
        StatusCode::TOO_MANY_REQUESTS => OracleError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => OracleError::Timeout(message),
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE => OracleError::Unavailable(message),
        StatusCode::BAD_REQUEST => OracleError::InvalidInput(message),
        other => OracleError::Rejected {
            status: other.as_u16(),
            message,
        },
    }
}

fn classify_transport(e: reqwest::Error) -> OracleError {
    if e.is_timeout() {
        OracleError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        OracleError::Unavailable(e.to_string())
    } else {
        OracleError::Rejected {
            status: 0,
            message: e.to_string(),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
