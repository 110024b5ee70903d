use std::fmt::Write;

use crate::Caption;

/// Seconds as `HH:MM:SS.mmm`.
pub fn format_timestamp(seconds: f64) -> String {
  let total_millis = (seconds * 1000.0).round() as u64;
  let millis = total_millis % 1000;
  let total_secs = total_millis / 1000;
  format!(
    "{:02}:{:02}:{:02}.{:03}",
    total_secs / 3600,
    (total_secs % 3600) / 60,
    total_secs % 60,
    millis
  )
}

/// Serialize captions back to WebVTT.
///
/// Round-trips with the parser up to whitespace normalization (multi-line
/// payloads come back out as a single line).
pub fn to_vtt(captions: &[Caption]) -> String {
  let mut out = String::from("WEBVTT\n\n");
  for caption in captions {
    let _ = writeln!(
      out,
      "{} --> {}",
      format_timestamp(caption.start_time),
      format_timestamp(caption.end_time)
    );
    match &caption.speaker_tag {
      Some(speaker) => {
        let _ = writeln!(out, "<v {speaker}>{}", caption.text);
      }
      None => {
        let _ = writeln!(out, "{}", caption.text);
      }
    }
    out.push('\n');
  }
  out
}
