use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use podseed_shared::PipelineError;

/// Per-episode progress, written after every committed unit so a crashed or
/// timed-out run can resume without rewriting what already landed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
  pub episode_id: String,
  /// Last completed stage: parsed, speakers, segmented, writing, done.
  pub stage: String,
  pub units_total: usize,
  /// IDs of units whose transactions committed, in write order.
  pub committed_units: Vec<String>,
}

impl Checkpoint {
  pub fn new(episode_id: impl Into<String>) -> Self {
    Self {
      episode_id: episode_id.into(),
      ..Self::default()
    }
  }

  pub fn is_committed(&self, unit_id: &str) -> bool {
    self.committed_units.iter().any(|id| id == unit_id)
  }
}

/// Append-only per-episode checkpoint files, replaced atomically.
pub struct CheckpointStore {
  dir: PathBuf,
}

impl CheckpointStore {
  pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
    let dir = dir.into();
    fs::create_dir_all(&dir)?;
    Ok(Self { dir })
  }

  fn path_for(&self, episode_id: &str) -> PathBuf {
    self.dir.join(format!("{episode_id}.json"))
  }

  pub fn load(&self, episode_id: &str) -> Option<Checkpoint> {
    let json = fs::read_to_string(self.path_for(episode_id)).ok()?;
    match serde_json::from_str(&json) {
      Ok(checkpoint) => Some(checkpoint),
      Err(err) => {
        tracing::warn!(episode_id, error = %err, "ignoring unreadable checkpoint");
        None
      }
    }
  }

  /// Crash-safe write: temp file in the same directory, then rename.
  pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
    let path = self.path_for(&checkpoint.episode_id);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(checkpoint)
      .map_err(|err| PipelineError::Other(err.into()))?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;
    Ok(())
  }
}
