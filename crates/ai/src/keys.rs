use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use podseed_shared::PipelineError;

/// File the pool persists its accounting to, inside `STATE_DIR`.
const STATE_FILE: &str = "key_rotation_state.json";

/// Per-key windowed quotas.
#[derive(Debug, Clone, Copy)]
pub struct KeyQuota {
  pub requests_per_minute: u32,
  pub tokens_per_minute: u64,
  pub requests_per_day: u32,
}

impl Default for KeyQuota {
  fn default() -> Self {
    Self {
      requests_per_minute: 10,
      tokens_per_minute: 250_000,
      requests_per_day: 250,
    }
  }
}

/// Rolling usage counters for one key. Persisted across restarts so quota
/// accounting survives a crash mid-episode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyUsage {
  minute_started_at: Option<DateTime<Utc>>,
  minute_requests: u32,
  minute_tokens: u64,
  day_started_at: Option<DateTime<Utc>>,
  day_requests: u32,
  cooldown_until: Option<DateTime<Utc>>,
}

impl KeyUsage {
  fn roll_windows(&mut self, now: DateTime<Utc>) {
    if self
      .minute_started_at
      .is_some_and(|start| now - start >= Duration::seconds(60))
    {
      self.minute_started_at = None;
      self.minute_requests = 0;
      self.minute_tokens = 0;
    }
    if self
      .day_started_at
      .is_some_and(|start| now - start >= Duration::hours(24))
    {
      self.day_started_at = None;
      self.day_requests = 0;
    }
    if self.cooldown_until.is_some_and(|until| now >= until) {
      self.cooldown_until = None;
    }
  }

  fn has_headroom(&self, quota: &KeyQuota, estimated_tokens: u64) -> bool {
    if self.cooldown_until.is_some() {
      return false;
    }
    self.minute_requests < quota.requests_per_minute
      && self.minute_tokens + estimated_tokens <= quota.tokens_per_minute
      && self.day_requests < quota.requests_per_day
  }

  fn record(&mut self, now: DateTime<Utc>, estimated_tokens: u64) {
    self.minute_started_at.get_or_insert(now);
    self.day_started_at.get_or_insert(now);
    self.minute_requests += 1;
    self.minute_tokens += estimated_tokens;
    self.day_requests += 1;
  }
}

/// Read-only view of one key's accounting, for logging and tests.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
  pub fingerprint: String,
  pub minute_requests: u32,
  pub day_requests: u32,
  pub cooled_down: bool,
}

struct PoolState {
  next: usize,
  usage: HashMap<String, KeyUsage>,
}

/// Round-robin API key pool with windowed quotas.
///
/// Keys are the only shared mutable resource in the pipeline; one mutex
/// covers rotation and accounting. State is keyed by fingerprint so raw keys
/// never touch disk.
pub struct KeyPool {
  keys: Vec<String>,
  quota: KeyQuota,
  state_path: PathBuf,
  state: Mutex<PoolState>,
}

impl KeyPool {
  pub fn new(keys: Vec<String>, quota: KeyQuota, state_dir: &Path) -> Result<Self, PipelineError> {
    assert!(!keys.is_empty(), "key pool requires at least one key");
    fs::create_dir_all(state_dir)?;
    let state_path = state_dir.join(STATE_FILE);
    let usage = load_state(&state_path);
    Ok(Self {
      keys,
      quota,
      state_path,
      state: Mutex::new(PoolState { next: 0, usage }),
    })
  }

  /// Pick the next key with quota headroom for a request of the given
  /// estimated size, recording the usage. Fails when every key is over quota
  /// or cooling down.
  pub fn acquire(&self, estimated_tokens: u32) -> Result<String, PipelineError> {
    let now = Utc::now();
    let mut state = self.state.lock().expect("key pool mutex poisoned");

    for offset in 0..self.keys.len() {
      let candidate = (state.next + offset) % self.keys.len();
      let key = &self.keys[candidate];
      let usage = state.usage.entry(fingerprint(key)).or_default();
      usage.roll_windows(now);
      if usage.has_headroom(&self.quota, u64::from(estimated_tokens)) {
        usage.record(now, u64::from(estimated_tokens));
        state.next = (candidate + 1) % self.keys.len();
        self.persist(&state);
        return Ok(key.clone());
      }
    }

    Err(PipelineError::ExhaustedProvider(
      "all API keys are over quota or cooling down".to_owned(),
    ))
  }

  /// Cool the key down for the remainder of its window after the provider
  /// reported a quota error. Daily exhaustion cools it for the rest of the
  /// day window.
  pub fn report_quota_error(&self, key: &str) {
    let now = Utc::now();
    let mut state = self.state.lock().expect("key pool mutex poisoned");
    let quota = self.quota;
    let usage = state.usage.entry(fingerprint(key)).or_default();

    let window_end = if usage.day_requests >= quota.requests_per_day {
      usage.day_started_at.unwrap_or(now) + Duration::hours(24)
    } else {
      usage.minute_started_at.unwrap_or(now) + Duration::seconds(60)
    };
    usage.cooldown_until = Some(window_end.max(now));
    tracing::warn!(
      key = %fingerprint(key),
      cooldown_until = %window_end,
      "API key cooled down after quota error"
    );
    self.persist(&state);
  }

  /// Whether any key currently has headroom for a request of the given
  /// size. Distinguishes "this call failed" from "no LLM available at all".
  pub fn any_usable(&self, estimated_tokens: u32) -> bool {
    let now = Utc::now();
    let mut state = self.state.lock().expect("key pool mutex poisoned");
    self.keys.iter().any(|key| {
      let usage = state.usage.entry(fingerprint(key)).or_default();
      usage.roll_windows(now);
      usage.has_headroom(&self.quota, u64::from(estimated_tokens))
    })
  }

  pub fn snapshot(&self) -> Vec<KeySnapshot> {
    let now = Utc::now();
    let state = self.state.lock().expect("key pool mutex poisoned");
    self
      .keys
      .iter()
      .map(|key| {
        let fp = fingerprint(key);
        let usage = state.usage.get(&fp).cloned().unwrap_or_default();
        KeySnapshot {
          fingerprint: fp,
          minute_requests: usage.minute_requests,
          day_requests: usage.day_requests,
          cooled_down: usage.cooldown_until.is_some_and(|until| until > now),
        }
      })
      .collect()
  }

  fn persist(&self, state: &PoolState) {
    // Crash-safe replace: write the whole map to a temp file, then rename.
    let write = || -> std::io::Result<()> {
      let tmp = self.state_path.with_extension("json.tmp");
      let json = serde_json::to_string_pretty(&state.usage).expect("usage map serializes");
      fs::write(&tmp, json)?;
      fs::rename(&tmp, &self.state_path)
    };
    if let Err(err) = write() {
      tracing::warn!(error = %err, path = %self.state_path.display(), "failed to persist key rotation state");
    }
  }
}

fn load_state(path: &Path) -> HashMap<String, KeyUsage> {
  match fs::read_to_string(path) {
    Ok(json) => serde_json::from_str(&json).unwrap_or_else(|err| {
      tracing::warn!(error = %err, "ignoring unreadable key rotation state");
      HashMap::new()
    }),
    Err(_) => HashMap::new(),
  }
}

/// Stable, non-reversible identifier for a key. Raw keys are never persisted.
fn fingerprint(key: &str) -> String {
  const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x51c0_93ab_7e2f_4b15_9c4d_2aa8_01f3_6e77);
  Uuid::new_v5(&KEY_NAMESPACE, key.as_bytes())
    .simple()
    .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pool(keys: &[&str], quota: KeyQuota, dir: &Path) -> KeyPool {
    KeyPool::new(keys.iter().map(|k| (*k).to_owned()).collect(), quota, dir).unwrap()
  }

  #[test]
  fn rotates_round_robin() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(&["key-a", "key-b"], KeyQuota::default(), dir.path());
    assert_eq!(pool.acquire(100).unwrap(), "key-a");
    assert_eq!(pool.acquire(100).unwrap(), "key-b");
    assert_eq!(pool.acquire(100).unwrap(), "key-a");
  }

  #[test]
  fn skips_cooled_down_keys() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(&["key-a", "key-b"], KeyQuota::default(), dir.path());
    pool.report_quota_error("key-a");
    assert_eq!(pool.acquire(100).unwrap(), "key-b");
    assert_eq!(pool.acquire(100).unwrap(), "key-b");
    let snapshot = pool.snapshot();
    assert!(snapshot[0].cooled_down);
    assert!(!snapshot[1].cooled_down);
  }

  #[test]
  fn exhausts_when_every_key_is_cooling() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(&["key-a", "key-b"], KeyQuota::default(), dir.path());
    pool.report_quota_error("key-a");
    pool.report_quota_error("key-b");
    let err = pool.acquire(100).unwrap_err();
    assert!(matches!(err, PipelineError::ExhaustedProvider(_)));
  }

  #[test]
  fn respects_request_per_minute_quota() {
    let dir = tempfile::tempdir().unwrap();
    let quota = KeyQuota {
      requests_per_minute: 2,
      ..KeyQuota::default()
    };
    let pool = pool(&["only"], quota, dir.path());
    assert!(pool.acquire(10).is_ok());
    assert!(pool.acquire(10).is_ok());
    assert!(pool.acquire(10).is_err());
  }

  #[test]
  fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let quota = KeyQuota {
      requests_per_minute: 2,
      ..KeyQuota::default()
    };
    {
      let pool = pool(&["only"], quota, dir.path());
      assert!(pool.acquire(10).is_ok());
      assert!(pool.acquire(10).is_ok());
    }
    let reloaded = pool(&["only"], quota, dir.path());
    assert!(reloaded.acquire(10).is_err());
  }

  #[test]
  fn state_file_contains_no_raw_keys() {
    let dir = tempfile::tempdir().unwrap();
    let pool = pool(&["sk-secret-value"], KeyQuota::default(), dir.path());
    pool.acquire(10).unwrap();
    let state = std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
    assert!(!state.contains("sk-secret-value"));
  }
}
