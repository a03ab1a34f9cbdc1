// Document codec - split documents into (id, payload) rows and back

use crate::error::{JotDbError, Result};
use serde_json::Value;

/// Name of the identifier field carried by object documents.
pub const ID_FIELD: &str = "id";

/// How identifiers are generated for documents inserted without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// Lexicographically sortable, millisecond-ordered (default). Insertion
    /// order is roughly preserved when listing by identifier; the 80-bit
    /// random component makes collisions within one millisecond negligible.
    #[default]
    Ulid,
    /// Random v4 UUID. No ordering; 122 bits of randomness.
    Uuid,
    /// 21-character URL-safe random id.
    Nanoid,
}

impl IdStrategy {
    pub fn generate(&self) -> String {
        match self {
            IdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            IdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            IdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

/// Converts documents to and from their stored row form.
///
/// An object document's `id` field lives in the identifier column, never in
/// the payload; `decode` re-attaches it. Array and scalar documents are
/// stored verbatim and their identifier is only visible through the insert
/// return value and id-based lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentCodec {
    strategy: IdStrategy,
}

impl DocumentCodec {
    pub fn new(strategy: IdStrategy) -> Self {
        DocumentCodec { strategy }
    }

    /// Split a document into `(identifier, payload text)`.
    ///
    /// A pre-existing `id` field is reused and must be a non-empty JSON
    /// string (the identifier column is TEXT); otherwise a fresh identifier
    /// is generated. Uniqueness is enforced by the primary key at insert
    /// time, not here.
    pub fn encode(&self, document: &Value) -> Result<(String, String)> {
        match document {
            Value::Object(map) if map.contains_key(ID_FIELD) => {
                let id = match &map[ID_FIELD] {
                    Value::String(s) if !s.is_empty() => s.clone(),
                    other => {
                        return Err(JotDbError::Serialization(format!(
                            "document id must be a non-empty string, got {other}"
                        )))
                    }
                };
                let mut payload = map.clone();
                payload.remove(ID_FIELD);
                Ok((id, Value::Object(payload).to_string()))
            }
            _ => Ok((self.strategy.generate(), document.to_string())),
        }
    }

    /// Payload text for a full-document replacement. A present `id` field
    /// is dropped: identifiers are immutable under update.
    pub fn encode_replacement(&self, document: &Value) -> String {
        match document {
            Value::Object(map) if map.contains_key(ID_FIELD) => {
                let mut payload = map.clone();
                payload.remove(ID_FIELD);
                Value::Object(payload).to_string()
            }
            _ => document.to_string(),
        }
    }

    /// Payload text for a merge patch (RFC 7386, applied by the engine's
    /// `json_patch`). The patch must be an object; its `id` field, if any,
    /// is dropped so the identifier cannot leak into stored payloads.
    pub fn encode_patch(&self, patch: &Value) -> Result<String> {
        match patch {
            Value::Object(map) => {
                let mut payload = map.clone();
                payload.remove(ID_FIELD);
                Ok(Value::Object(payload).to_string())
            }
            other => Err(JotDbError::Serialization(format!(
                "merge patch must be a JSON object, got {other}"
            ))),
        }
    }

    /// Rebuild a document from its row, re-attaching the identifier to
    /// object documents.
    pub fn decode(&self, id: &str, payload: &str) -> Result<Value> {
        let mut value: Value = serde_json::from_str(payload)?;
        if let Value::Object(map) = &mut value {
            map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_object() {
        let codec = DocumentCodec::default();
        let doc = json!({"name": "Blueberry", "type": "dog", "age": 4});

        let (id, payload) = codec.encode(&doc).unwrap();
        assert!(!id.is_empty());
        assert!(!payload.contains("\"id\""));

        let decoded = codec.decode(&id, &payload).unwrap();
        assert_eq!(decoded["name"], "Blueberry");
        assert_eq!(decoded["age"], 4);
        assert_eq!(decoded["id"], Value::String(id));
    }

    #[test]
    fn test_existing_id_is_reused() {
        let codec = DocumentCodec::default();
        let doc = json!({"id": "luna", "name": "Luna"});

        let (id, payload) = codec.encode(&doc).unwrap();
        assert_eq!(id, "luna");
        // the payload never carries the identifier
        let stored: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(stored, json!({"name": "Luna"}));
    }

    #[test]
    fn test_non_string_id_rejected() {
        let codec = DocumentCodec::default();
        for doc in [json!({"id": 42}), json!({"id": null}), json!({"id": ""})] {
            let err = codec.encode(&doc).unwrap_err();
            assert!(matches!(err, JotDbError::Serialization(_)), "{doc}");
        }
    }

    #[test]
    fn test_non_object_documents() {
        let codec = DocumentCodec::default();
        for doc in [json!([1, 2, 3]), json!("plain"), json!(7), json!(null)] {
            let (id, payload) = codec.encode(&doc).unwrap();
            assert!(!id.is_empty());
            let decoded = codec.decode(&id, &payload).unwrap();
            assert_eq!(decoded, doc);
        }
    }

    #[test]
    fn test_replacement_drops_id() {
        let codec = DocumentCodec::default();
        let payload = codec.encode_replacement(&json!({"id": "x", "age": 5}));
        let stored: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(stored, json!({"age": 5}));
    }

    #[test]
    fn test_patch_must_be_object() {
        let codec = DocumentCodec::default();
        assert!(codec.encode_patch(&json!({"age": 5})).is_ok());
        assert!(codec.encode_patch(&json!([1])).is_err());
        assert!(codec.encode_patch(&json!(3)).is_err());
    }

    #[test]
    fn test_id_strategies() {
        assert_eq!(IdStrategy::Ulid.generate().len(), 26);
        assert_eq!(IdStrategy::Uuid.generate().len(), 36);
        assert_eq!(IdStrategy::Nanoid.generate().len(), 21);

        let a = IdStrategy::Ulid.generate();
        let b = IdStrategy::Ulid.generate();
        assert_ne!(a, b);
    }
}
