use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use podseed_shared::{PipelineError, estimate_tokens};

use crate::json_repair::parse_lenient;
use crate::keys::KeyPool;
use crate::provider::{CompletionProvider, CompletionRequest, ProviderError};
use crate::schema::strict_schema_for;

/// Exponential backoff between retries of a transient provider failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub initial_backoff: Duration,
  pub backoff_factor: f64,
  pub max_backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_backoff: Duration::from_secs(5),
      backoff_factor: 2.0,
      max_backoff: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone)]
pub struct CompletionOptions {
  pub system: Option<String>,
  pub temperature: f32,
  pub max_tokens: u32,
  pub json_mode: bool,
  pub timeout: Duration,
}

impl Default for CompletionOptions {
  fn default() -> Self {
    Self {
      system: None,
      temperature: 0.7,
      max_tokens: 4096,
      json_mode: false,
      timeout: Duration::from_secs(120),
    }
  }
}

/// Rate-limited LLM client: key rotation, windowed quotas, retries with
/// exponential backoff, cancellation between attempts.
pub struct LlmClient {
  provider: Arc<dyn CompletionProvider>,
  keys: KeyPool,
  retry: RetryPolicy,
}

impl LlmClient {
  pub fn new(provider: Arc<dyn CompletionProvider>, keys: KeyPool, retry: RetryPolicy) -> Self {
    Self {
      provider,
      keys,
      retry,
    }
  }

  /// Estimated token footprint of a request, used for quota prediction.
  pub fn estimate_request_tokens(&self, prompt: &str, options: &CompletionOptions) -> u32 {
    estimate_tokens(prompt) + options.max_tokens
  }

  pub fn key_snapshot(&self) -> Vec<crate::KeySnapshot> {
    self.keys.snapshot()
  }

  /// Whether any API key currently has quota headroom. Callers that can
  /// degrade gracefully use this to tell a failed call apart from a fully
  /// exhausted provider.
  pub fn has_usable_key(&self) -> bool {
    self.keys.any_usable(0)
  }

  pub async fn complete(
    &self,
    prompt: &str,
    options: &CompletionOptions,
    cancel: &CancellationToken,
  ) -> Result<String, PipelineError> {
    self
      .complete_request(
        CompletionRequest {
          system: options.system.clone(),
          prompt: prompt.to_owned(),
          temperature: options.temperature,
          max_tokens: options.max_tokens,
          json_mode: options.json_mode,
          schema: None,
        },
        options.timeout,
        cancel,
      )
      .await
  }

  /// Structured completion: the response must deserialize into `T`, whose
  /// JSON schema (strict mode) is sent with the request. Lenient parsing
  /// still applies on the way back in, since some backends ignore
  /// `response_format` and wrap JSON in code fences.
  pub async fn complete_json<T>(
    &self,
    schema_name: &str,
    prompt: &str,
    options: &CompletionOptions,
    cancel: &CancellationToken,
  ) -> Result<T, PipelineError>
  where
    T: DeserializeOwned + JsonSchema,
  {
    let response = self
      .complete_request(
        CompletionRequest {
          system: options.system.clone(),
          prompt: prompt.to_owned(),
          temperature: options.temperature,
          max_tokens: options.max_tokens,
          json_mode: true,
          schema: Some((schema_name.to_owned(), strict_schema_for::<T>())),
        },
        options.timeout,
        cancel,
      )
      .await?;

    parse_lenient(&response).map_err(PipelineError::Schema)
  }

  async fn complete_request(
    &self,
    request: CompletionRequest,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<String, PipelineError> {
    let estimated = estimate_tokens(&request.prompt) + request.max_tokens;
    let mut delay = self.retry.initial_backoff;
    let mut last_error = String::new();

    for attempt in 0..=self.retry.max_retries {
      if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
      }

      // A cooled-down pool gets the backoff treatment too; a minute window
      // may reopen before the retries run out.
      let key = match self.keys.acquire(estimated) {
        Ok(key) => key,
        Err(err) => {
          last_error = err.to_string();
          if attempt < self.retry.max_retries {
            tokio::select! {
              () = cancel.cancelled() => return Err(PipelineError::Cancelled),
              () = tokio::time::sleep(delay) => {}
            }
            delay = delay
              .mul_f64(self.retry.backoff_factor)
              .min(self.retry.max_backoff);
            continue;
          }
          return Err(PipelineError::ExhaustedProvider(last_error));
        }
      };
      let outcome = tokio::time::timeout(timeout, self.provider.complete(&key, &request)).await;

      let backoff_needed = match outcome {
        Ok(Ok(text)) => return Ok(text),
        Ok(Err(ProviderError::Quota(message))) => {
          // Rotate immediately; another key may have headroom right now.
          self.keys.report_quota_error(&key);
          last_error = message;
          false
        }
        Ok(Err(ProviderError::Transient(message))) => {
          last_error = message;
          true
        }
        Ok(Err(ProviderError::Permanent(message))) => {
          return Err(PipelineError::ExhaustedProvider(format!(
            "permanent provider error: {message}"
          )));
        }
        Err(_elapsed) => {
          last_error = format!("request timed out after {}s", timeout.as_secs());
          true
        }
      };

      tracing::warn!(
        attempt,
        max_retries = self.retry.max_retries,
        error = %last_error,
        "LLM call failed"
      );

      if attempt < self.retry.max_retries && backoff_needed {
        tokio::select! {
          () = cancel.cancelled() => return Err(PipelineError::Cancelled),
          () = tokio::time::sleep(delay) => {}
        }
        delay = delay
          .mul_f64(self.retry.backoff_factor)
          .min(self.retry.max_backoff);
      }
    }

    Err(PipelineError::ExhaustedProvider(last_error))
  }
}
