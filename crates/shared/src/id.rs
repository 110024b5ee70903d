use uuid::Uuid;

/// Fixed namespace for every deterministic ID. Changing this value would
/// orphan all nodes written by earlier runs.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x8f2d_1c4a_9b6e_4d3f_a57c_0e81_42b9_d6a3);

/// Key-part separator. A non-printable separator keeps `["ab","c"]` and
/// `["a","bc"]` from hashing to the same ID.
const SEP: &str = "\u{1f}";

fn hash_parts(parts: &[&str]) -> String {
  Uuid::new_v5(&ID_NAMESPACE, parts.join(SEP).as_bytes()).to_string()
}

/// Seconds formatted with millisecond precision, so float noise below a
/// millisecond cannot change an ID between runs.
fn format_seconds(seconds: f64) -> String {
  format!("{seconds:.3}")
}

/// Stable fingerprint of raw file content, used as the episode discriminator
/// when no published date is known.
pub fn content_fingerprint(bytes: &[u8]) -> String {
  Uuid::new_v5(&ID_NAMESPACE, bytes).to_string()
}

pub fn podcast_id(external_key: &str) -> String {
  hash_parts(&["podcast", external_key])
}

/// `discriminator` is the published date when known, otherwise the VTT file's
/// [`content_fingerprint`].
pub fn episode_id(podcast_id: &str, title: &str, discriminator: &str) -> String {
  hash_parts(&["episode", podcast_id, title, discriminator])
}

pub fn unit_id(episode_id: &str, start_time: f64, end_time: f64) -> String {
  hash_parts(&[
    "unit",
    episode_id,
    &format_seconds(start_time),
    &format_seconds(end_time),
  ])
}

pub fn speaker_id(podcast_id: &str, normalized_name: &str) -> String {
  hash_parts(&["speaker", podcast_id, normalized_name])
}

pub fn entity_id(unit_id: &str, normalized_value: &str, entity_type: &str) -> String {
  hash_parts(&["entity", unit_id, normalized_value, entity_type])
}

/// Quotes hash on their first 128 characters; long quotes stay stable even
/// when the tail gets re-punctuated between extraction runs.
pub fn quote_id(unit_id: &str, text: &str) -> String {
  let prefix: String = text.chars().take(128).collect();
  hash_parts(&["quote", unit_id, &prefix])
}

pub fn insight_id(unit_id: &str, title: &str) -> String {
  hash_parts(&["insight", unit_id, title])
}
