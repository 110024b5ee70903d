use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use podseed_shared::PipelineError;

use crate::Caption;

/// Captions closer together than this are merge candidates.
const MERGE_GAP_SECONDS: f64 = 0.25;

static TIMING_RE: LazyLock<Regex> = LazyLock::new(|| {
  // Hours are optional on input; settings after the end time are ignored.
  Regex::new(
    r"^\s*(?:(\d+):)?(\d{2}):(\d{2})\.(\d{3})\s+-->\s+(?:(\d+):)?(\d{2}):(\d{2})\.(\d{3})(?:\s+\S.*)?$",
  )
  .expect("timing regex compiles")
});

static VOICE_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
  // `<v Name>` with an optional class list (`<v.loud Name>`).
  Regex::new(r"^<v(?:\.[^\s>]+)?\s+([^>]+)>\s*").expect("voice tag regex compiles")
});

#[derive(Debug, Error)]
pub enum VttError {
  #[error("invalid VTT format: {0}")]
  InvalidFormat(String),
  #[error("unparseable cue timing at line {line}: {text:?}")]
  InvalidTiming { line: usize, text: String },
}

impl From<VttError> for PipelineError {
  fn from(err: VttError) -> Self {
    Self::InvalidInput(err.to_string())
  }
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
  /// Merge consecutive same-speaker captions separated by < 250 ms when the
  /// merged cue stays under this duration. Reduces auto-caption noise.
  pub min_segment_duration: f64,
  pub merge_short_captions: bool,
}

impl Default for ParseOptions {
  fn default() -> Self {
    Self {
      min_segment_duration: 2.0,
      merge_short_captions: true,
    }
  }
}

/// Cheap pre-check used by the CLI before reading the whole file.
pub fn validate_vtt_file(path: &Path) -> Result<(), VttError> {
  if !path.is_file() {
    return Err(VttError::InvalidFormat(format!(
      "not a file: {}",
      path.display()
    )));
  }
  if !path
    .extension()
    .is_some_and(|ext| ext.eq_ignore_ascii_case("vtt"))
  {
    return Err(VttError::InvalidFormat(format!(
      "not a .vtt file: {}",
      path.display()
    )));
  }
  Ok(())
}

/// Parse WebVTT text into ordered captions.
///
/// Accepts the `WEBVTT` header (with optional trailing text), NOTE/STYLE/
/// REGION blocks, optional cue identifiers, and `<v Name>` voice tags with or
/// without a closing tag. Unknown cue settings are ignored.
pub fn parse_vtt(input: &str, options: &ParseOptions) -> Result<Vec<Caption>, VttError> {
  let input = input.strip_prefix('\u{feff}').unwrap_or(input);
  let mut lines = input.lines().enumerate().peekable();

  let (_, header) = lines
    .next()
    .ok_or_else(|| VttError::InvalidFormat("empty file".to_owned()))?;
  let header = header.trim_end();
  if header != "WEBVTT" && !header.starts_with("WEBVTT ") && !header.starts_with("WEBVTT\t") {
    return Err(VttError::InvalidFormat("missing WEBVTT header".to_owned()));
  }

  let mut captions: Vec<Caption> = Vec::new();

  while let Some((line_no, line)) = lines.next() {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    // NOTE (and the other non-cue block kinds) run until the next blank line.
    if trimmed == "NOTE"
      || trimmed.starts_with("NOTE ")
      || trimmed.starts_with("STYLE")
      || trimmed.starts_with("REGION")
    {
      while let Some((_, block_line)) = lines.next() {
        if block_line.trim().is_empty() {
          break;
        }
      }
      continue;
    }

    // Cue block: optional identifier line, then the timing line.
    let (timing_no, timing_line) = if trimmed.contains("-->") {
      (line_no, trimmed.to_owned())
    } else {
      match lines.next() {
        Some((next_no, next_line)) if next_line.contains("-->") => {
          (next_no, next_line.trim().to_owned())
        }
        Some((next_no, next_line)) => {
          return Err(VttError::InvalidTiming {
            line: next_no + 1,
            text: next_line.to_owned(),
          });
        }
        None => {
          return Err(VttError::InvalidTiming {
            line: line_no + 1,
            text: trimmed.to_owned(),
          });
        }
      }
    };

    let (start_time, end_time) =
      parse_timing(&timing_line).ok_or_else(|| VttError::InvalidTiming {
        line: timing_no + 1,
        text: timing_line.clone(),
      })?;

    let mut payload: Vec<String> = Vec::new();
    while let Some((_, text_line)) = lines.peek() {
      if text_line.trim().is_empty() {
        break;
      }
      payload.push(text_line.trim().to_owned());
      lines.next();
    }

    let (speaker_tag, text) = split_voice_tag(&payload.join(" "));
    captions.push(Caption {
      index: 0, // assigned below, after merging
      start_time,
      end_time,
      speaker_tag,
      text,
    });
  }

  if options.merge_short_captions {
    captions = merge_short_captions(captions, options.min_segment_duration);
  }
  for (index, caption) in captions.iter_mut().enumerate() {
    caption.index = index;
  }
  Ok(captions)
}

fn parse_timing(line: &str) -> Option<(f64, f64)> {
  let caps = TIMING_RE.captures(line)?;
  let component = |i: usize| -> f64 {
    caps
      .get(i)
      .map_or(0.0, |m| m.as_str().parse::<f64>().unwrap_or(0.0))
  };
  let start = component(1) * 3600.0 + component(2) * 60.0 + component(3) + component(4) / 1000.0;
  let end = component(5) * 3600.0 + component(6) * 60.0 + component(7) + component(8) / 1000.0;
  if end < start {
    return None;
  }
  Some((start, end))
}

fn split_voice_tag(text: &str) -> (Option<String>, String) {
  let without_close = text.replace("</v>", "");
  match VOICE_TAG_RE.captures(&without_close) {
    Some(caps) => {
      let speaker = caps[1].trim().to_owned();
      let rest = without_close[caps.get(0).expect("full match").end()..]
        .trim()
        .to_owned();
      (Some(speaker), rest)
    }
    None => (None, without_close.trim().to_owned()),
  }
}

fn merge_short_captions(captions: Vec<Caption>, min_segment_duration: f64) -> Vec<Caption> {
  let mut merged: Vec<Caption> = Vec::with_capacity(captions.len());
  for caption in captions {
    if let Some(last) = merged.last_mut() {
      let gap = caption.start_time - last.end_time;
      let combined = caption.end_time - last.start_time;
      if last.speaker_tag == caption.speaker_tag
        && gap < MERGE_GAP_SECONDS
        && combined < min_segment_duration
      {
        last.end_time = caption.end_time;
        last.text.push(' ');
        last.text.push_str(&caption.text);
        continue;
      }
    }
    merged.push(caption);
  }
  merged
}
