use async_openai::{
  Client,
  config::OpenAIConfig,
  error::OpenAIError,
  types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs, ResponseFormat,
    ResponseFormatJsonSchema,
  },
};
use async_trait::async_trait;
use thiserror::Error;

/// Provider failures, pre-classified so the client can decide between key
/// rotation, backoff, and giving up.
#[derive(Debug, Error)]
pub enum ProviderError {
  /// Rate limit or quota exhaustion on the key used for the call.
  #[error("quota: {0}")]
  Quota(String),
  /// Network errors, 5xx, overload. Worth a retry.
  #[error("transient: {0}")]
  Transient(String),
  /// Malformed request, auth failure, anything a retry cannot fix.
  #[error("permanent: {0}")]
  Permanent(String),
}

/// One chat completion to run. The prompt is already fully rendered; the
/// provider only adds transport concerns.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
  pub system: Option<String>,
  pub prompt: String,
  pub temperature: f32,
  pub max_tokens: u32,
  pub json_mode: bool,
  /// Strict response schema, when the caller wants structured output.
  pub schema: Option<(String, serde_json::Value)>,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
  /// Run one completion with the given API key. Key selection and retries
  /// belong to the caller.
  async fn complete(&self, api_key: &str, request: &CompletionRequest)
  -> Result<String, ProviderError>;
}

// ──────────────────────────────────────────────────
// OpenAI-compatible provider
// ──────────────────────────────────────────────────

/// Chat completions against an OpenAI-compatible endpoint.
pub struct OpenAiProvider {
  base_url: String,
  model: String,
}

impl OpenAiProvider {
  pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into(),
      model: model.into(),
    }
  }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
  async fn complete(
    &self,
    api_key: &str,
    request: &CompletionRequest,
  ) -> Result<String, ProviderError> {
    // Client construction happens per call, with the rotated key.
    let config = OpenAIConfig::new()
      .with_api_key(api_key)
      .with_api_base(&self.base_url);
    let client = Client::with_config(config);

    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
    if let Some(system) = &request.system {
      messages.push(ChatCompletionRequestSystemMessage::from(system.as_str()).into());
    }
    messages.push(ChatCompletionRequestUserMessage::from(request.prompt.as_str()).into());

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder
      .model(&self.model)
      .messages(messages)
      .temperature(request.temperature)
      .max_completion_tokens(request.max_tokens);

    if let Some((name, schema)) = &request.schema {
      builder.response_format(ResponseFormat::JsonSchema {
        json_schema: ResponseFormatJsonSchema {
          description: None,
          name: name.clone(),
          schema: Some(schema.clone()),
          strict: Some(true),
        },
      });
    } else if request.json_mode {
      builder.response_format(ResponseFormat::JsonObject);
    }

    let request = builder
      .build()
      .map_err(|err| ProviderError::Permanent(err.to_string()))?;

    let response = client
      .chat()
      .create(request)
      .await
      .map_err(classify_openai_error)?;

    response
      .choices
      .into_iter()
      .find_map(|choice| choice.message.content)
      .ok_or_else(|| ProviderError::Transient("empty message content".to_owned()))
  }
}

fn classify_openai_error(err: OpenAIError) -> ProviderError {
  match err {
    OpenAIError::ApiError(api) => {
      let kind = api.r#type.as_deref().unwrap_or_default().to_lowercase();
      let message = api.message.to_lowercase();
      if kind.contains("quota")
        || kind.contains("rate_limit")
        || message.contains("quota")
        || message.contains("rate limit")
        || message.contains("429")
      {
        ProviderError::Quota(api.message)
      } else if kind.contains("server_error")
        || message.contains("overloaded")
        || message.contains("internal")
        || message.contains("unavailable")
      {
        ProviderError::Transient(api.message)
      } else {
        ProviderError::Permanent(api.message)
      }
    }
    // Network-level failures: connection refused, DNS, read timeouts, 5xx
    // without a parsed body.
    OpenAIError::Reqwest(err) => ProviderError::Transient(err.to_string()),
    OpenAIError::JSONDeserialize(err, _) => ProviderError::Transient(err.to_string()),
    other => ProviderError::Permanent(other.to_string()),
  }
}
