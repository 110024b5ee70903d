use std::collections::HashMap;

use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use podseed_ai::{CompletionOptions, LlmClient};
use podseed_shared::{PipelineError, normalize_speaker_name, speaker_id, word_count};
use podseed_vtt::Caption;

use crate::model::{Speaker, SpeakerRole};
use crate::prompts;

/// Token share below which an unidentified tag is only a brief contributor.
const BRIEF_CONTRIBUTOR_SHARE: f64 = 0.02;

/// Confidence assigned to deterministic fallback roles. Kept at or below 0.5
/// so a later LLM identification can replace them.
const FALLBACK_CONFIDENCE: f32 = 0.3;

/// Resolution from voice tags to named speakers for one episode.
#[derive(Debug, Clone)]
pub struct SpeakerMap {
  by_tag: HashMap<String, Speaker>,
  default_speaker: Speaker,
}

impl SpeakerMap {
  pub fn resolve(&self, tag: Option<&str>) -> &Speaker {
    tag
      .and_then(|t| self.by_tag.get(t))
      .unwrap_or(&self.default_speaker)
  }

  /// Distinct speakers, deduplicated by ID.
  pub fn speakers(&self) -> Vec<Speaker> {
    let mut seen: HashMap<String, Speaker> = HashMap::new();
    for speaker in self
      .by_tag
      .values()
      .chain(std::iter::once(&self.default_speaker))
    {
      seen
        .entry(speaker.id.clone())
        .or_insert_with(|| speaker.clone());
    }
    let mut speakers: Vec<Speaker> = seen.into_values().collect();
    speakers.sort_by(|a, b| a.name.cmp(&b.name));
    speakers
  }
}

#[cfg(test)]
impl SpeakerMap {
  /// A map with only the synthesized default speaker, for tests elsewhere in
  /// the crate that need speaker resolution without an LLM.
  pub(crate) fn fallback_for_tests() -> Self {
    let normalized = normalize_speaker_name("Primary Speaker");
    Self {
      by_tag: HashMap::new(),
      default_speaker: Speaker {
        id: speaker_id("test-podcast", &normalized),
        name: "Primary Speaker".to_owned(),
        role: SpeakerRole::Host,
        confidence: 0.3,
      },
    }
  }
}

// ──────────────────────────────────────────────────
// LLM response shape
// ──────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct SpeakerAssignments {
  assignments: Vec<SpeakerAssignment>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SpeakerAssignment {
  tag: String,
  name: String,
  role: String,
  confidence: f32,
}

// ──────────────────────────────────────────────────
// Identification
// ──────────────────────────────────────────────────

pub struct SpeakerIdentifier<'a> {
  llm: &'a LlmClient,
  confidence_threshold: f32,
}

impl<'a> SpeakerIdentifier<'a> {
  pub fn new(llm: &'a LlmClient, confidence_threshold: f32) -> Self {
    Self {
      llm,
      confidence_threshold,
    }
  }

  /// Map each voice tag to a named speaker.
  ///
  /// An LLM assignment is accepted when it clears the confidence threshold;
  /// rejected tags fall back to deterministic roles based on token share.
  /// A failed LLM call degrades to fallback-only and the episode proceeds;
  /// only cancellation and a fully exhausted key pool propagate.
  pub async fn identify(
    &self,
    podcast_id: &str,
    episode_title: &str,
    episode_description: &str,
    captions: &[Caption],
    cancel: &CancellationToken,
  ) -> Result<SpeakerMap, PipelineError> {
    let shares = token_shares(captions);

    let assignments = if shares.is_empty() {
      Vec::new()
    } else {
      match self
        .ask_llm(episode_title, episode_description, captions, &shares, cancel)
        .await
      {
        Ok(assignments) => assignments,
        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
        Err(err) => {
          // No LLM available at all aborts the episode; a failed call with
          // keys still usable degrades to fallback roles.
          if !self.llm.has_usable_key() {
            return Err(PipelineError::ExhaustedProvider(format!(
              "no usable API key for speaker identification: {err}"
            )));
          }
          tracing::warn!(error = %err, "speaker identification LLM call failed; using fallback roles");
          Vec::new()
        }
      }
    };

    let accepted: HashMap<String, SpeakerAssignment> = assignments
      .into_iter()
      .filter(|a| a.confidence >= self.confidence_threshold && !a.name.trim().is_empty())
      .map(|a| (a.tag.clone(), a))
      .collect();

    Ok(build_map(podcast_id, &shares, &accepted))
  }

  async fn ask_llm(
    &self,
    episode_title: &str,
    episode_description: &str,
    captions: &[Caption],
    shares: &[(String, f64)],
    cancel: &CancellationToken,
  ) -> Result<Vec<SpeakerAssignment>, PipelineError> {
    let prompt = prompts::speaker_prompt(episode_title, episode_description, captions, shares);
    let options = CompletionOptions {
      temperature: 0.2,
      ..CompletionOptions::default()
    };
    let response: SpeakerAssignments = self
      .llm
      .complete_json("speaker_assignments", &prompt, &options, cancel)
      .await?;
    Ok(response.assignments)
  }
}

/// Share-based speaker map without any LLM involvement, used when the
/// identification stage fails outright or times out.
pub fn fallback_speaker_map(podcast_id: &str, captions: &[Caption]) -> SpeakerMap {
  build_map(podcast_id, &token_shares(captions), &HashMap::new())
}

/// Resolve every tag to a (name, role, confidence), then merge by normalized
/// name. A lower-confidence identification never replaces a higher one.
fn build_map(
  podcast_id: &str,
  shares: &[(String, f64)],
  accepted: &HashMap<String, SpeakerAssignment>,
) -> SpeakerMap {
  let mut by_name: HashMap<String, Speaker> = HashMap::new();
  let mut by_tag: HashMap<String, Speaker> = HashMap::new();

  for (rank, (tag, share)) in shares.iter().enumerate() {
    let (name, role, confidence) = match accepted.get(tag) {
      Some(assignment) => (
        assignment.name.trim().to_owned(),
        SpeakerRole::coerce(&assignment.role),
        assignment.confidence.clamp(0.0, 1.0),
      ),
      None => {
        let (name, role) = fallback_role(rank, *share);
        (name.to_owned(), role, FALLBACK_CONFIDENCE)
      }
    };

    let normalized = normalize_speaker_name(&name);
    let speaker = Speaker {
      id: speaker_id(podcast_id, &normalized),
      name,
      role,
      confidence,
    };
    let merged = by_name
      .entry(normalized)
      .and_modify(|existing| {
        if speaker.confidence > existing.confidence {
          *existing = speaker.clone();
        }
      })
      .or_insert(speaker)
      .clone();
    by_tag.insert(tag.clone(), merged);
  }

  // Re-point every tag at the winning record for its normalized name, so a
  // later higher-confidence identification reaches earlier tags too.
  for speaker in by_tag.values_mut() {
    if let Some(winner) = by_name.get(&normalize_speaker_name(&speaker.name)) {
      *speaker = winner.clone();
    }
  }

  // Untagged captions attach to the dominant speaker when one exists.
  let default_speaker = shares
    .first()
    .and_then(|(tag, _)| by_tag.get(tag).cloned())
    .unwrap_or_else(|| {
      let normalized = normalize_speaker_name("Primary Speaker");
      Speaker {
        id: speaker_id(podcast_id, &normalized),
        name: "Primary Speaker".to_owned(),
        role: SpeakerRole::Host,
        confidence: FALLBACK_CONFIDENCE,
      }
    });

  SpeakerMap {
    by_tag,
    default_speaker,
  }
}

/// Fraction of spoken tokens per voice tag, sorted descending.
fn token_shares(captions: &[Caption]) -> Vec<(String, f64)> {
  let mut counts: HashMap<String, usize> = HashMap::new();
  let mut total = 0usize;
  for caption in captions {
    if let Some(tag) = &caption.speaker_tag {
      let words = word_count(&caption.text);
      *counts.entry(tag.clone()).or_default() += words;
      total += words;
    }
  }
  if total == 0 {
    return Vec::new();
  }
  let mut shares: Vec<(String, f64)> = counts
    .into_iter()
    .map(|(tag, count)| (tag, count as f64 / total as f64))
    .collect();
  shares.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
  shares
}

fn fallback_role(rank: usize, share: f64) -> (&'static str, SpeakerRole) {
  if share < BRIEF_CONTRIBUTOR_SHARE {
    ("Brief Contributor", SpeakerRole::BriefContributor)
  } else {
    match rank {
      0 => ("Primary Speaker", SpeakerRole::Host),
      1 => ("Co-host/Major Guest", SpeakerRole::Guest),
      _ => ("Guest/Contributor", SpeakerRole::Guest),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn caption(index: usize, tag: Option<&str>, words: usize) -> Caption {
    Caption {
      index,
      start_time: index as f64 * 5.0,
      end_time: index as f64 * 5.0 + 4.0,
      speaker_tag: tag.map(str::to_owned),
      text: vec!["word"; words].join(" "),
    }
  }

  #[test]
  fn token_shares_rank_by_volume() {
    let captions = vec![
      caption(0, Some("S1"), 80),
      caption(1, Some("S2"), 19),
      caption(2, Some("S3"), 1),
    ];
    let shares = token_shares(&captions);
    assert_eq!(shares[0].0, "S1");
    assert!((shares[0].1 - 0.8).abs() < 1e-9);
    assert_eq!(shares.len(), 3);
  }

  #[test]
  fn fallback_map_assigns_roles_and_default() {
    let captions = vec![
      caption(0, Some("S1"), 70),
      caption(1, Some("S2"), 29),
      caption(2, Some("S3"), 1),
      caption(3, None, 10),
    ];
    let map = fallback_speaker_map("pod", &captions);
    assert_eq!(map.resolve(Some("S1")).name, "Primary Speaker");
    assert_eq!(map.resolve(Some("S1")).role, SpeakerRole::Host);
    assert_eq!(map.resolve(Some("S2")).name, "Co-host/Major Guest");
    assert_eq!(map.resolve(Some("S3")).role, SpeakerRole::BriefContributor);
    // Untagged captions resolve to the dominant speaker.
    assert_eq!(map.resolve(None).name, "Primary Speaker");
    assert!(map.resolve(Some("S1")).confidence <= 0.5);
  }

  #[test]
  fn assignments_merge_across_honorifics_keeping_the_higher_confidence() {
    let shares = vec![("S1".to_owned(), 0.6), ("S2".to_owned(), 0.4)];
    let accepted: HashMap<String, SpeakerAssignment> = [
      (
        "S1".to_owned(),
        SpeakerAssignment {
          tag: "S1".to_owned(),
          name: "Dr. Jane Smith".to_owned(),
          role: "guest".to_owned(),
          confidence: 0.6,
        },
      ),
      (
        "S2".to_owned(),
        SpeakerAssignment {
          tag: "S2".to_owned(),
          name: "Jane Smith".to_owned(),
          role: "host".to_owned(),
          confidence: 0.9,
        },
      ),
    ]
    .into_iter()
    .collect();

    let map = build_map("pod", &shares, &accepted);
    let s1 = map.resolve(Some("S1"));
    let s2 = map.resolve(Some("S2"));
    assert_eq!(s1.id, s2.id, "honorific variants collapse to one speaker");
    assert_eq!(s1.role, SpeakerRole::Host, "higher confidence wins");
    assert!((s1.confidence - 0.9).abs() < 1e-6);
    assert_eq!(map.speakers().len(), 1);
  }

  #[test]
  fn fallback_roles_follow_token_share() {
    assert_eq!(fallback_role(0, 0.7).0, "Primary Speaker");
    assert_eq!(fallback_role(1, 0.28).0, "Co-host/Major Guest");
    assert_eq!(fallback_role(2, 0.05).0, "Guest/Contributor");
    assert_eq!(
      fallback_role(2, 0.01),
      ("Brief Contributor", SpeakerRole::BriefContributor)
    );
  }
}
