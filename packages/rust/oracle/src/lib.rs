//! Analysis-oracle access for the PlanIndex pipeline.
//!
//! The pipeline only ever talks to an [`AnalysisOracle`]: prompt in, free
//! text out. [`StructuredOracle`] layers the retry policy and the JSON
//! response contract on top of it:
//!
//! 1. call the oracle through [`RetryPolicy`] (transient failures back off and retry)
//! 2. strip code fences and surrounding prose, then parse the JSON
//! 3. if the parse failed because the text looks truncated, retry exactly once
//!    with the compact prompt and the extended output budget

mod client;
mod json;
mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use planindex_shared::{AppConfig, OracleError};
use serde::de::DeserializeOwned;
use tracing::warn;

pub use client::OpenRouterOracle;
pub use json::{clean_json_response, parse_json};
pub use retry::RetryPolicy;

/// An inline image sent alongside the prompt.
#[derive(Debug, Clone)]
pub struct OracleImage {
    pub mime_type: String,
    /// Base64-encoded bytes.
    pub data: String,
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub prompt: String,
    pub image: Option<OracleImage>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// The generative analysis capability, consumed through a prompt/text contract.
#[async_trait]
pub trait AnalysisOracle: Send + Sync {
    /// Short identifier for logs (model name, "scripted", ...).
    fn name(&self) -> &str;

    /// Generate a free-text response for `request`.
    async fn generate(&self, request: &OracleRequest) -> Result<String, OracleError>;
}

/// Output budgets for the normal call and the truncation retry.
#[derive(Debug, Clone, Copy)]
pub struct OutputBudget {
    pub max_output_tokens: u32,
    pub extended_max_output_tokens: u32,
    pub temperature: f32,
}

impl Default for OutputBudget {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for OutputBudget {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_output_tokens: config.oracle.max_output_tokens,
            extended_max_output_tokens: config.oracle.extended_max_output_tokens,
            temperature: config.oracle.temperature,
        }
    }
}

/// An oracle that returns typed JSON results.
#[derive(Clone)]
pub struct StructuredOracle {
    oracle: Arc<dyn AnalysisOracle>,
    retry: RetryPolicy,
    budget: OutputBudget,
}

impl StructuredOracle {
    pub fn new(oracle: Arc<dyn AnalysisOracle>, retry: RetryPolicy, budget: OutputBudget) -> Self {
        Self {
            oracle,
            retry,
            budget,
        }
    }

    pub fn name(&self) -> &str {
        self.oracle.name()
    }

    /// Call the oracle and parse its response as `T`.
    ///
    /// `compact_prompt` is only used for the single truncation retry.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        prompt: &str,
        compact_prompt: &str,
        image: Option<&OracleImage>,
    ) -> Result<T, OracleError> {
        let text = self
            .generate(prompt, image, self.budget.max_output_tokens)
            .await?;

        match parse_json::<T>(&text) {
            Ok(value) => Ok(value),
            Err(OracleError::Malformed {
                message,
                truncated: true,
            }) => {
                warn!(
                    oracle = self.oracle.name(),
                    error = %message,
                    max_output_tokens = self.budget.extended_max_output_tokens,
                    "response looks truncated, retrying with compact prompt"
                );
                let text = self
                    .generate(
                        compact_prompt,
                        image,
                        self.budget.extended_max_output_tokens,
                    )
                    .await?;
                parse_json::<T>(&text)
            }
            Err(e) => Err(e),
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        image: Option<&OracleImage>,
        max_output_tokens: u32,
    ) -> Result<String, OracleError> {
        let request = OracleRequest {
            prompt: prompt.to_string(),
            image: image.cloned(),
            max_output_tokens,
            temperature: self.budget.temperature,
        };
        self.retry
            .run(self.oracle.name(), || self.oracle.generate(&request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        value: u32,
    }

    /// Replays canned responses and records every request.
    struct Replay {
        responses: Mutex<VecDeque<Result<String, OracleError>>>,
        seen: Mutex<Vec<OracleRequest>>,
    }

    impl Replay {
        fn new(responses: Vec<Result<String, OracleError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AnalysisOracle for Replay {
        fn name(&self) -> &str {
            "replay"
        }

        async fn generate(&self, request: &OracleRequest) -> Result<String, OracleError> {
            self.seen.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(OracleError::Unavailable("script exhausted".into())))
        }
    }

    fn structured(oracle: Arc<Replay>) -> StructuredOracle {
        StructuredOracle::new(
            oracle,
            RetryPolicy::new(3, Duration::from_millis(1)),
            OutputBudget {
                max_output_tokens: 100,
                extended_max_output_tokens: 1000,
                temperature: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn fenced_and_raw_parse_identically() {
        let oracle = Replay::new(vec![
            Ok("```json\n{\"value\": 7}\n```".into()),
            Ok("{\"value\": 7}".into()),
        ]);
        let s = structured(oracle);
        let fenced: Answer = s.call_json("p", "c", None).await.unwrap();
        let raw: Answer = s.call_json("p", "c", None).await.unwrap();
        assert_eq!(fenced, raw);
    }

    #[tokio::test]
    async fn truncated_response_retries_once_with_compact_prompt() {
        let oracle = Replay::new(vec![
            Ok("{\"value\": 7, \"extra\": [1, 2,".into()),
            Ok("{\"value\": 8}".into()),
        ]);
        let s = structured(oracle.clone());
        let answer: Answer = s.call_json("full", "compact", None).await.unwrap();
        assert_eq!(answer.value, 8);

        let seen = oracle.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].prompt, "compact");
        assert_eq!(seen[1].max_output_tokens, 1000);
    }

    #[tokio::test]
    async fn persistent_truncation_surfaces_parse_error() {
        let oracle = Replay::new(vec![Ok("{\"value\": ".into()), Ok("{\"value\": ".into())]);
        let err = structured(oracle.clone())
            .call_json::<Answer>("full", "compact", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Malformed { .. }));
        assert_eq!(oracle.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_truncated_garbage_does_not_retry() {
        let oracle = Replay::new(vec![Ok("{\"value\": \"seven\"}".into())]);
        let err = structured(oracle.clone())
            .call_json::<Answer>("full", "compact", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Malformed { truncated: false, .. }));
        assert_eq!(oracle.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_before_parsing() {
        let oracle = Replay::new(vec![
            Err(OracleError::RateLimited("429".into())),
            Ok("{\"value\": 1}".into()),
        ]);
        let answer: Answer = structured(oracle.clone())
            .call_json("p", "c", None)
            .await
            .unwrap();
        assert_eq!(answer.value, 1);
        assert_eq!(oracle.seen.lock().unwrap().len(), 2);
    }
}
