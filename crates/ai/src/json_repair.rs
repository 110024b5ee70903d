use serde::de::DeserializeOwned;

/// Parse an LLM response that should contain JSON, tolerating code fences,
/// prose around the payload, trailing commas, and raw newlines inside string
/// literals. Repairs are conservative: the first top-level JSON value wins.
pub fn parse_lenient<T: DeserializeOwned>(response: &str) -> Result<T, String> {
  let value = parse_lenient_value(response)?;
  serde_json::from_value(value).map_err(|err| format!("response did not match schema: {err}"))
}

/// Like [`parse_lenient`] but stops at `serde_json::Value`, for callers that
/// apply their own coercions before typed deserialization.
pub fn parse_lenient_value(response: &str) -> Result<serde_json::Value, String> {
  if let Ok(value) = serde_json::from_str(response) {
    return Ok(value);
  }

  let stripped = strip_code_fences(response);
  let candidate = extract_json(stripped).ok_or_else(|| {
    format!(
      "no JSON object or array found in response: {:?}",
      head(response, 120)
    )
  })?;

  if let Ok(value) = serde_json::from_str(candidate) {
    return Ok(value);
  }

  let repaired = repair_json(candidate);
  serde_json::from_str(&repaired)
    .map_err(|err| format!("unrepairable JSON ({err}): {:?}", head(candidate, 120)))
}

fn head(text: &str, max: usize) -> String {
  text.chars().take(max).collect()
}

/// Drop a surrounding ```...``` fence (with an optional language word).
pub fn strip_code_fences(text: &str) -> &str {
  let trimmed = text.trim();
  let Some(rest) = trimmed.strip_prefix("```") else {
    return trimmed;
  };
  let rest = rest.strip_prefix("json").unwrap_or(rest);
  let rest = rest.strip_suffix("```").unwrap_or(rest);
  rest.trim()
}

/// Extract the first balanced top-level JSON object or array, string-aware.
pub fn extract_json(text: &str) -> Option<&str> {
  let start = text.find(['{', '['])?;
  let bytes = text.as_bytes();
  let mut depth = 0usize;
  let mut in_string = false;
  let mut escaped = false;

  for (offset, &byte) in bytes[start..].iter().enumerate() {
    if in_string {
      if escaped {
        escaped = false;
      } else if byte == b'\\' {
        escaped = true;
      } else if byte == b'"' {
        in_string = false;
      }
      continue;
    }
    match byte {
      b'"' => in_string = true,
      b'{' | b'[' => depth += 1,
      b'}' | b']' => {
        depth = depth.saturating_sub(1);
        if depth == 0 {
          return Some(&text[start..=start + offset]);
        }
      }
      _ => {}
    }
  }
  None
}

/// Conservative repairs: trailing commas removed, raw control characters in
/// string literals escaped.
pub fn repair_json(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut in_string = false;
  let mut escaped = false;
  let mut pending_comma = false;

  for c in text.chars() {
    if in_string {
      match c {
        _ if escaped => {
          escaped = false;
          out.push(c);
        }
        '\\' => {
          escaped = true;
          out.push(c);
        }
        '"' => {
          in_string = false;
          out.push(c);
        }
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        _ => out.push(c),
      }
      continue;
    }

    match c {
      ',' => pending_comma = true,
      '}' | ']' => {
        // A comma directly before a closer is dropped.
        pending_comma = false;
        out.push(c);
      }
      _ => {
        if pending_comma && !c.is_whitespace() {
          out.push(',');
          pending_comma = false;
        }
        if c == '"' {
          in_string = true;
        }
        if !c.is_whitespace() || !pending_comma {
          out.push(c);
        }
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use serde::Deserialize;

  use super::*;

  #[derive(Debug, Deserialize, PartialEq)]
  struct Payload {
    name: String,
    score: f32,
  }

  #[test]
  fn parses_clean_json() {
    let parsed: Payload = parse_lenient(r#"{"name": "a", "score": 0.5}"#).unwrap();
    assert_eq!(parsed.name, "a");
  }

  #[test]
  fn parses_fenced_json() {
    let response = "```json\n{\"name\": \"a\", \"score\": 0.5}\n```";
    let parsed: Payload = parse_lenient(response).unwrap();
    assert_eq!(parsed.score, 0.5);
  }

  #[test]
  fn parses_json_embedded_in_prose() {
    let response = "Sure! Here is the result:\n{\"name\": \"a\", \"score\": 1.0}\nHope that helps.";
    let parsed: Payload = parse_lenient(response).unwrap();
    assert_eq!(parsed.score, 1.0);
  }

  #[test]
  fn repairs_trailing_commas() {
    let response = r#"{"name": "a", "score": 0.5,}"#;
    let parsed: Payload = parse_lenient(response).unwrap();
    assert_eq!(parsed.name, "a");
  }

  #[test]
  fn repairs_raw_newlines_in_strings() {
    let response = "{\"name\": \"line one\nline two\", \"score\": 0.1}";
    let parsed: Payload = parse_lenient(response).unwrap();
    assert_eq!(parsed.name, "line one\nline two");
  }

  #[test]
  fn ignores_braces_inside_strings() {
    let response = r#"noise {"name": "has } brace", "score": 0.2} trailing"#;
    let parsed: Payload = parse_lenient(response).unwrap();
    assert_eq!(parsed.name, "has } brace");
  }

  #[test]
  fn reports_missing_json() {
    let err = parse_lenient::<Payload>("no structured data here").unwrap_err();
    assert!(err.contains("no JSON"));
  }
}
