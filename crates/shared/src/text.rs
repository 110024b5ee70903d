/// Honorifics stripped before speaker names are compared, so "Dr. Jane Smith"
/// and "Jane Smith" collapse to the same speaker.
const HONORIFICS: &[&str] = &["dr", "mr", "mrs", "ms", "prof", "professor", "sir", "dame"];

/// Collapse all runs of whitespace to single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
  text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form of a speaker name: casefolded, punctuation stripped,
/// leading honorifics removed.
pub fn normalize_speaker_name(name: &str) -> String {
  let cleaned: String = name
    .to_lowercase()
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || c.is_whitespace() {
        c
      } else {
        ' '
      }
    })
    .collect();

  let mut words: Vec<&str> = cleaned.split_whitespace().collect();
  while let Some(first) = words.first() {
    if HONORIFICS.contains(first) {
      words.remove(0);
    } else {
      break;
    }
  }
  words.join(" ")
}

pub fn word_count(text: &str) -> usize {
  text.split_whitespace().count()
}

/// Rough token estimate (words × 1.3), used for quota prediction before a
/// request is sent.
pub fn estimate_tokens(text: &str) -> u32 {
  (word_count(text) as f64 * 1.3).ceil() as u32
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
  text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn whitespace_normalization_collapses_runs() {
    assert_eq!(normalize_whitespace("  a\t b\n\nc "), "a b c");
  }

  #[test]
  fn speaker_names_collapse_across_honorifics_and_punctuation() {
    assert_eq!(normalize_speaker_name("Dr. Jane Smith"), "jane smith");
    assert_eq!(normalize_speaker_name("JANE SMITH"), "jane smith");
    assert_eq!(normalize_speaker_name("jane smith"), "jane smith");
  }

  #[test]
  fn token_estimate_scales_with_words() {
    assert_eq!(estimate_tokens(""), 0);
    assert_eq!(estimate_tokens("one two three four"), 6); // ceil(4 * 1.3)
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    assert_eq!(truncate_chars("héllo", 2), "hé");
    assert_eq!(truncate_chars("abc", 10), "abc");
  }
}
