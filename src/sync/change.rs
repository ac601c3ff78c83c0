//! Content hashing for change detection.
//!
//! Payloads are serialised canonically (object keys sorted at every depth, no whitespace) and
//! hashed with SHA-256, so two snapshots that differ only in key order compare equal.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical JSON text of `value`.
pub fn canonical_json(value: &Value) -> String {
	let mut out = String::new();
	write_canonical(value, &mut out);
	out
}

fn write_canonical(value: &Value, out: &mut String) {
	match value {
		Value::Object(map) => {
			let mut entries: Vec<(&String, &Value)> = map.iter().collect();
			entries.sort_by(|a, b| a.0.cmp(b.0));
			out.push('{');
			for (i, (key, item)) in entries.into_iter().enumerate() {
				if i > 0 {
					out.push(',');
				}
				out.push_str(&Value::String(key.clone()).to_string());
				out.push(':');
				write_canonical(item, out);
			}
			out.push('}');
		}
		Value::Array(items) => {
			out.push('[');
			for (i, item) in items.iter().enumerate() {
				if i > 0 {
					out.push(',');
				}
				write_canonical(item, out);
			}
			out.push(']');
		}
		scalar => out.push_str(&scalar.to_string()),
	}
}

/// Stable hex digest of a payload. Pure and side-effect free.
pub fn content_hash(value: &Value) -> String {
	let digest = Sha256::digest(canonical_json(value).as_bytes());
	hex::encode(digest)
}

/// Outcome of comparing a payload with the previously accepted one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
	Changed(String),
	Unchanged(String),
}

impl Observation {
	pub fn is_changed(&self) -> bool {
		matches!(self, Observation::Changed(_))
	}

	pub fn into_hash(self) -> String {
		match self {
			Observation::Changed(hash) | Observation::Unchanged(hash) => hash,
		}
	}
}

/// Compares payload digests; when disabled every payload counts as a change.
#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
	enabled: bool,
}

impl ChangeDetector {
	pub fn new(enabled: bool) -> Self {
		Self { enabled }
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	pub fn observe(&self, previous: Option<&str>, payload: &Value) -> Observation {
		let hash = content_hash(payload);
		if self.enabled && previous == Some(hash.as_str()) {
			Observation::Unchanged(hash)
		} else {
			Observation::Changed(hash)
		}
	}
}

impl Default for ChangeDetector {
	fn default() -> Self {
		Self::new(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_key_order_does_not_matter() {
		let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[1,2],"x":null}}"#).unwrap();
		let b: Value = serde_json::from_str(r#"{"a":{"x":null,"y":[1,2]},"b":1}"#).unwrap();
		assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":[1,2]},"b":1}"#);
		assert_eq!(content_hash(&a), content_hash(&b));
	}

	#[test]
	fn test_array_order_matters() {
		assert_ne!(content_hash(&json!([1, 2])), content_hash(&json!([2, 1])));
	}

	#[test]
	fn test_values_distinguish() {
		assert_ne!(content_hash(&json!({"a": 1})), content_hash(&json!({"a": "1"})));
		assert_eq!(content_hash(&json!({"a": 1})).len(), 64);
	}

	#[test]
	fn test_escaped_keys_are_canonical() {
		let v = json!({"quote\"key": "line\nbreak"});
		assert_eq!(canonical_json(&v), r#"{"quote\"key":"line\nbreak"}"#);
	}

	#[test]
	fn test_detector_observe() {
		let detector = ChangeDetector::default();
		let payload = json!({"status": "online"});
		let first = detector.observe(None, &payload);
		assert!(first.is_changed());
		let hash = first.into_hash();
		assert_eq!(
			detector.observe(Some(&hash), &payload),
			Observation::Unchanged(hash.clone())
		);
		assert!(detector.observe(Some(&hash), &json!({"status": "offline"})).is_changed());
	}

	#[test]
	fn test_disabled_detector_always_changes() {
		let detector = ChangeDetector::new(false);
		let payload = json!({"status": "online"});
		let hash = content_hash(&payload);
		assert!(detector.observe(Some(&hash), &payload).is_changed());
	}
}
