use podseed_core::EpisodeStatus;

/// Outcome of one episode ingest, for the CLI and logs.
#[derive(Debug, Clone)]
pub struct EpisodeReport {
  pub episode_id: String,
  pub status: EpisodeStatus,
  pub units_total: usize,
  pub units_committed: usize,
  pub units_extraction_failed: usize,
  pub units_write_failed: usize,
  /// Combined-mode extraction calls that succeeded. Metric only; not
  /// observable in the graph.
  pub combined_extraction_calls: usize,
  /// Set when the overall pipeline deadline expired and in-flight work was
  /// cancelled; committed units were still flushed.
  pub timed_out: bool,
}

impl EpisodeReport {
  pub const fn exit_code(&self) -> i32 {
    self.status.exit_code()
  }
}

/// Episode status from unit outcomes: any failed unit degrades to partial,
/// fewer than half succeeding means failed.
pub fn compute_status(
  units_total: usize,
  units_extraction_failed: usize,
  units_write_failed: usize,
) -> EpisodeStatus {
  if units_total == 0 {
    return EpisodeStatus::Failed;
  }
  let failed = units_extraction_failed + units_write_failed;
  let succeeded = units_total.saturating_sub(failed);
  if succeeded * 2 < units_total {
    EpisodeStatus::Failed
  } else if failed > 0 {
    EpisodeStatus::Partial
  } else {
    EpisodeStatus::Ok
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn all_units_clean_is_ok() {
    assert_eq!(compute_status(20, 0, 0), EpisodeStatus::Ok);
  }

  #[test]
  fn a_single_failure_degrades_to_partial() {
    assert_eq!(compute_status(20, 1, 0), EpisodeStatus::Partial);
    assert_eq!(compute_status(20, 0, 1), EpisodeStatus::Partial);
  }

  #[test]
  fn under_half_success_is_failed() {
    assert_eq!(compute_status(20, 11, 0), EpisodeStatus::Failed);
    assert_eq!(compute_status(20, 6, 5), EpisodeStatus::Failed);
    assert_eq!(compute_status(2, 1, 0), EpisodeStatus::Partial);
  }

  #[test]
  fn zero_units_is_failed() {
    assert_eq!(compute_status(0, 0, 0), EpisodeStatus::Failed);
  }
}
