use thiserror::Error;

/// Error taxonomy for the seeding pipeline.
///
/// Unit-level failures (`Schema`, a retried `Store`) are captured into the
/// episode report and degrade its status instead of bubbling out of the
/// pipeline; only episode-fatal errors reach the caller.
#[derive(Debug, Error)]
pub enum PipelineError {
  /// Malformed VTT or missing required input.
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// Network, 5xx, quota or timeout from a remote provider. Retried with
  /// backoff and key rotation before becoming `ExhaustedProvider`.
  #[error("transient provider error: {0}")]
  TransientProvider(String),

  /// All retries (and all keys) spent.
  #[error("provider exhausted: {0}")]
  ExhaustedProvider(String),

  /// LLM response could not be repaired into the expected schema.
  #[error("schema error: {0}")]
  Schema(String),

  /// The segmenter produced out-of-bounds units and the fallback also failed.
  #[error("invariant violation: {0}")]
  InvariantViolation(String),

  /// Graph write or connection failure.
  #[error("graph store error: {0}")]
  Store(String),

  /// Cooperative cancellation observed at a checkpoint.
  #[error("cancelled")]
  Cancelled,

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

impl PipelineError {
  /// Whether a retry could plausibly succeed.
  pub const fn is_transient(&self) -> bool {
    matches!(self, Self::TransientProvider(_))
  }

  /// Process exit code for an episode that aborted with this error.
  ///
  /// Partial success is not an error; the episode report maps its status to
  /// exit 0 or 3 separately.
  pub const fn exit_code(&self) -> i32 {
    match self {
      Self::InvalidInput(_) => 2,
      Self::Cancelled => 130,
      _ => 4,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::PipelineError;

  #[test]
  fn exit_codes_follow_the_cli_contract() {
    assert_eq!(PipelineError::InvalidInput("bad vtt".into()).exit_code(), 2);
    assert_eq!(PipelineError::Cancelled.exit_code(), 130);
    assert_eq!(PipelineError::ExhaustedProvider("quota".into()).exit_code(), 4);
    assert_eq!(PipelineError::Store("down".into()).exit_code(), 4);
  }

  #[test]
  fn only_transient_errors_are_retryable() {
    assert!(PipelineError::TransientProvider("503".into()).is_transient());
    assert!(!PipelineError::Schema("not json".into()).is_transient());
  }
}
