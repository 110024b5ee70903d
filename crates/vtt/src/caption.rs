use serde::{Deserialize, Serialize};

/// One timed text cue from a VTT file.
///
/// Captions exist only within a single ingest: the parser creates them, the
/// segmenter groups them into units, and they are discarded after that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caption {
  /// Position in file order, 0..N-1 after any merging.
  pub index: usize,
  /// Start offset in seconds from the beginning of the episode.
  pub start_time: f64,
  /// End offset in seconds.
  pub end_time: f64,
  /// Voice tag (`<v Name>`), if the cue carried one.
  pub speaker_tag: Option<String>,
  /// Cue payload; multi-line payloads are joined with single spaces.
  pub text: String,
}

impl Caption {
  pub fn duration(&self) -> f64 {
    self.end_time - self.start_time
  }
}
