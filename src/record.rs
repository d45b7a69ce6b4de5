//! The opaque JSON record type stored by the log, and its line encoding.

use crate::error::{HistoryError, Result};
use serde::ser::Error as _;
use serde_json::Value;

/// An opaque JSON object supplied by the caller.
///
/// The core does not interpret payload fields beyond `metadata.gsn`, which
/// it stamps itself on a successful append. Everything else — message id,
/// sender, timestamp, structured content — is the producer's business.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(Value);

impl Record {
    /// Wrap a JSON value as a record.
    ///
    /// Fails with [`HistoryError::Schema`] if `value` is not a JSON object —
    /// a top-level array or scalar cannot carry `metadata.gsn`.
    pub fn new(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(HistoryError::Schema {
                reason: format!("expected a JSON object, got {}", type_name(&value)),
            });
        }
        Ok(Record(value))
    }

    /// Borrow the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume the record, returning the underlying JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Read the `message_id` field, if the caller's payload carries one.
    ///
    /// The core treats this purely as metadata used for deduplication in
    /// `after_gsn`/`before_gsn`; it never requires the field to be present.
    pub fn message_id(&self) -> Option<&str> {
        self.0.get("message_id")?.as_str()
    }

    /// Read `metadata.gsn`, if this record has been stamped.
    pub fn gsn(&self) -> Option<u64> {
        self.0.get("metadata")?.get("gsn")?.as_u64()
    }

    /// Clone the record and stamp `metadata.gsn = gsn` on the clone.
    ///
    /// Creates the `metadata` object if absent. Does not mutate in place —
    /// the caller's original value is untouched.
    pub fn stamped(&self, gsn: u64) -> Record {
        let mut value = self.0.clone();
        let obj = value.as_object_mut().expect("Record invariant: always an object");
        match obj.get_mut("metadata") {
            Some(Value::Object(meta)) => {
                meta.insert("gsn".to_string(), Value::from(gsn));
            }
            _ => {
                let mut meta = serde_json::Map::new();
                meta.insert("gsn".to_string(), Value::from(gsn));
                obj.insert("metadata".to_string(), Value::Object(meta));
            }
        }
        Record(value)
    }

    /// Encode this record as a single line (no trailing `\n`).
    ///
    /// Control characters are escaped by JSON string rules; printable
    /// non-ASCII is preserved verbatim (`serde_json`'s default, non-
    /// `ensure_ascii` behavior). The encoded line is parsed back and
    /// compared for semantic equality with the original value; on mismatch
    /// a permissive re-encode is attempted, and if that also fails to
    /// round-trip, [`HistoryError::Serialisation`] is returned.
    pub fn to_line(&self) -> Result<String> {
        let primary = serde_json::to_string(&self.0)?;
        if line_round_trips(&primary, &self.0) {
            return Ok(primary);
        }

        // Permissive fallback: re-encode through a fresh buffer, which
        // catches the rare case where a `Value` built from non-UTF8-safe
        // intermediate state serialises differently the second time.
        let bytes = serde_json::to_vec(&self.0)?;
        let permissive = String::from_utf8(bytes)
            .map_err(|e| HistoryError::Serialisation(serde_json::Error::custom(e)))?;
        if line_round_trips(&permissive, &self.0) {
            return Ok(permissive);
        }

        Err(HistoryError::Serialisation(serde_json::Error::custom(
            "record does not round-trip through its own encoding",
        )))
    }

    /// Decode a record from a line's content (no trailing `\n`).
    ///
    /// On a plain parse error this returns `None` — the caller logs and
    /// skips the line rather than surfacing an error. On an "extra data"
    /// condition (trailing garbage after an otherwise complete object) the
    /// first balanced top-level `{…}` is recovered and parsed instead.
    pub fn from_line(line: &str) -> Option<Record> {
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => Some(Record(value)),
            Ok(_) => None,
            Err(e) if is_trailing_data_error(&e) => {
                let prefix = recover_balanced_object(line)?;
                match serde_json::from_str::<Value>(prefix) {
                    Ok(value) if value.is_object() => Some(Record(value)),
                    _ => None,
                }
            }
            Err(_) => None,
        }
    }
}

fn line_round_trips(line: &str, original: &Value) -> bool {
    matches!(serde_json::from_str::<Value>(line), Ok(v) if &v == original)
}

fn is_trailing_data_error(e: &serde_json::Error) -> bool {
    // serde_json reports trailing-data conditions as `Eof`-adjacent "trailing
    // characters" io-category errors; matching on the rendered message is
    // the only stable signal serde_json exposes for this classification.
    e.to_string().contains("trailing characters")
}

/// Scan `line` for the end of its first balanced top-level `{...}` object,
/// tracking string/escape state so braces inside string literals don't
/// confuse the depth counter. Returns the matching prefix, or `None` if the
/// line never opens an object or never balances.
fn recover_balanced_object(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut started = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => {
                depth += 1;
                started = true;
            }
            b'}' => {
                depth -= 1;
                if started && depth == 0 {
                    return Some(&line[..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_non_object_top_level() {
        assert!(Record::new(json!([1, 2, 3])).is_err());
        assert!(Record::new(json!("hello")).is_err());
        assert!(Record::new(json!(42)).is_err());
    }

    #[test]
    fn stamp_creates_metadata_if_absent() {
        let record = Record::new(json!({"msg": "a"})).unwrap();
        let stamped = record.stamped(7);
        assert_eq!(stamped.gsn(), Some(7));
        assert_eq!(record.gsn(), None, "original must not be mutated");
    }

    #[test]
    fn stamp_preserves_existing_metadata_fields() {
        let record = Record::new(json!({"msg": "a", "metadata": {"sender": "x"}})).unwrap();
        let stamped = record.stamped(3);
        assert_eq!(stamped.as_value()["metadata"]["sender"], "x");
        assert_eq!(stamped.gsn(), Some(3));
    }

    #[test]
    fn round_trips_unicode_and_control_chars() {
        let record = Record::new(json!({"msg": "héllo\nwörld\t\"quoted\""})).unwrap();
        let line = record.to_line().unwrap();
        assert!(!line.contains('\n'));
        let back = Record::from_line(&line).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn recovers_balanced_object_from_trailing_garbage() {
        let line = r#"{"a":1}garbage-tail"#;
        let record = Record::from_line(line).unwrap();
        assert_eq!(record.as_value()["a"], 1);
    }

    #[test]
    fn from_line_returns_none_on_unrecoverable_garbage() {
        assert!(Record::from_line("not json at all").is_none());
        assert!(Record::from_line(r#"{"a":1"#).is_none());
    }

    #[test]
    fn from_line_rejects_top_level_array() {
        assert!(Record::from_line("[1,2,3]").is_none());
    }

    #[test]
    fn message_id_reads_payload_field() {
        let record = Record::new(json!({"message_id": "m-1"})).unwrap();
        assert_eq!(record.message_id(), Some("m-1"));
    }
}
