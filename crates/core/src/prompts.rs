//! Prompt builders for the three LLM-driven stages.

use std::fmt::Write;

use podseed_shared::truncate_chars;
use podseed_vtt::{Caption, format_timestamp};

/// Per-caption text cap in the segmentation listing, to bound prompt size on
/// long episodes.
const SEGMENTATION_CAPTION_CHARS: usize = 160;

/// Episode description cap in the speaker prompt.
const SPEAKER_DESCRIPTION_CHARS: usize = 4096;

/// Transcript-head cap in the speaker prompt.
const SPEAKER_TRANSCRIPT_CHARS: usize = 2048;

pub fn speaker_prompt(
  episode_title: &str,
  episode_description: &str,
  captions: &[Caption],
  tags: &[(String, f64)],
) -> String {
  let mut transcript = String::new();
  for caption in captions {
    if transcript.len() >= SPEAKER_TRANSCRIPT_CHARS {
      break;
    }
    match &caption.speaker_tag {
      Some(tag) => {
        let _ = writeln!(transcript, "{tag}: {}", caption.text);
      }
      None => {
        let _ = writeln!(transcript, "{}", caption.text);
      }
    }
  }

  let mut tag_list = String::new();
  for (tag, share) in tags {
    let _ = writeln!(tag_list, "- {tag} ({:.1}% of speech)", share * 100.0);
  }

  format!(
    "Identify the people behind the voice tags in this podcast episode.\n\
     \n\
     Episode title: {title}\n\
     Episode description:\n{description}\n\
     \n\
     Voice tags found in the transcript:\n{tag_list}\n\
     Transcript opening:\n{transcript}\n\
     For each voice tag, infer the speaker's real name and their role in the\n\
     show. Roles must be one of: host, recurring_host, guest,\n\
     brief_contributor, unknown. Give a confidence between 0 and 1; use a low\n\
     confidence when the transcript does not actually name the person.\n\
     Respond with JSON: {{\"assignments\": [{{\"tag\": ..., \"name\": ...,\n\
     \"role\": ..., \"confidence\": ...}}]}}.",
    title = episode_title,
    description = truncate_chars(episode_description, SPEAKER_DESCRIPTION_CHARS),
    tag_list = tag_list,
    transcript = truncate_chars(&transcript, SPEAKER_TRANSCRIPT_CHARS),
  )
}

fn caption_listing(captions: &[Caption]) -> String {
  let mut listing = String::new();
  for caption in captions {
    let speaker = caption.speaker_tag.as_deref().unwrap_or("?");
    let _ = writeln!(
      listing,
      "[{idx}] {start}-{end} {speaker}: {text}",
      idx = caption.index,
      start = format_timestamp(caption.start_time),
      end = format_timestamp(caption.end_time),
      text = truncate_chars(&caption.text, SEGMENTATION_CAPTION_CHARS),
    );
  }
  listing
}

pub fn segmentation_prompt(
  episode_title: &str,
  captions: &[Caption],
  expected_units: usize,
) -> String {
  format!(
    "Segment this podcast transcript into meaningful conversational units.\n\
     \n\
     Episode: {title}\n\
     Captions ({count} total, indexed):\n{listing}\n\
     Group the captions into roughly {expected} coherent units. A unit is one\n\
     topical or discursive chunk: a story, an explanation, a question-and-answer\n\
     exchange, a discussion, an example, or a transition. Prefer boundaries at\n\
     sustained speaker changes, explicit topic shifts (\"so, next...\",\n\
     \"let's talk about...\"), silences of 8 seconds or more, and completed\n\
     question/answer exchanges.\n\
     \n\
     Every caption index must belong to exactly one unit, units must cover\n\
     contiguous index ranges in order, and no unit may span more than 60\n\
     captions.\n\
     Respond with JSON: {{\"units\": [{{\"start_index\": ..., \"end_index\": ...,\n\
     \"unit_type\": ..., \"summary\": one sentence, \"themes\": [...]}}]}}.",
    title = episode_title,
    count = captions.len(),
    listing = caption_listing(captions),
    expected = expected_units,
  )
}

/// Retry prompt after a degenerate plan: enumerates the allowed unit types
/// and forbids the failure mode outright.
pub fn segmentation_prompt_strict(
  episode_title: &str,
  captions: &[Caption],
  expected_units: usize,
) -> String {
  format!(
    "Segment this podcast transcript into meaningful conversational units.\n\
     Your previous answer was rejected because it did not split the\n\
     conversation properly.\n\
     \n\
     Episode: {title}\n\
     Captions ({count} total, indexed):\n{listing}\n\
     STRICT REQUIREMENTS:\n\
     - Produce between {min_units} and {max_units} units. Returning a single\n\
       unit for the whole transcript is WRONG and will be rejected.\n\
     - Each unit covers between 5 and 60 consecutive captions.\n\
     - unit_type must be exactly one of: story, explanation, q_and_a,\n\
       discussion, example, transition, other.\n\
     - Cover every caption index exactly once, in order.\n\
     Respond with JSON: {{\"units\": [{{\"start_index\": ..., \"end_index\": ...,\n\
     \"unit_type\": ..., \"summary\": one sentence, \"themes\": [...]}}]}}.",
    title = episode_title,
    count = captions.len(),
    listing = caption_listing(captions),
    min_units = expected_units.saturating_sub(expected_units * 3 / 10).max(2),
    max_units = expected_units + (expected_units * 3 / 10).max(1),
  )
}

/// The JSON contract sent with every extraction request. Shown to the model
/// verbatim; the lenient parser accepts the usual deviations.
const EXTRACTION_SCHEMA: &str = r#"{
  "entities": [{"value": "string", "type": "person|organization|place|product|concept|event|technology|other", "confidence": 0.0, "description": "string (optional)", "importance": 0.0, "frequency": 1}],
  "quotes": [{"text": "verbatim from the transcript", "speaker": "string", "context": "string (optional)", "quote_type": "key_point|funny|provocative|personal|other", "importance": 0.0}],
  "insights": [{"title": "string", "description": "string", "type": "key_point|summary|fact|other", "confidence": 0.0, "supporting_entities": ["entity value"]}],
  "relationships": [{"source": "entity value", "target": "entity value", "type": "string", "confidence": 0.0}],
  "topics": ["short lowercase tag"]
}"#;

pub fn extraction_prompt(
  podcast_name: &str,
  episode_title: &str,
  time_range: (f64, f64),
  unit_text: &str,
  speakers: &[String],
  strict: bool,
) -> String {
  let strict_preamble = if strict {
    "Your previous response could not be parsed against the schema. Respond\n\
     with ONLY a single JSON object exactly matching the schema below: no\n\
     prose, no code fences, no comments.\n\n"
  } else {
    ""
  };

  format!(
    "{strict_preamble}Extract structured knowledge from this podcast excerpt.\n\
     \n\
     Podcast: {podcast}\n\
     Episode: {title}\n\
     Time range: {start} - {end}\n\
     Speakers in this excerpt: {speakers}\n\
     \n\
     Transcript:\n{text}\n\
     \n\
     Extract entities (people, organizations, places, products, concepts,\n\
     events, technologies), notable quotes (verbatim: copy the exact words\n\
     from the transcript), insights, relationships between the extracted\n\
     entities, and topic tags.\n\
     Respond with JSON matching this schema:\n{schema}",
    strict_preamble = strict_preamble,
    podcast = podcast_name,
    title = episode_title,
    start = format_timestamp(time_range.0),
    end = format_timestamp(time_range.1),
    speakers = speakers.join(", "),
    text = unit_text,
    schema = EXTRACTION_SCHEMA,
  )
}
