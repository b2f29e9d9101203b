//! Event assembly.
//!
//! An event is a nested JSON object built by deep-merging layers in a fixed
//! order; `serde_json`'s preserve_order feature keeps object keys in merge
//! insertion order, which makes the serialized form canonical. The document
//! id is derived from that serialization before the `@metadata` subtree is
//! attached, so re-shipping the same line yields the same id downstream.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use std::io::Cursor;

/// Merge `overlay` into `base`. Objects merge recursively; everything else
/// is a leaf and the overlay wins.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// 128-bit MurmurHash3 of the canonical serialization, base64 without
/// padding. A 16-byte digest always encodes to 22 characters.
pub fn document_id(event: &Map<String, Value>) -> String {
    let serialized = serde_json::to_vec(event).expect("event maps always serialize");
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(&serialized), 0)
        .expect("in-memory read cannot fail");
    STANDARD_NO_PAD.encode(hash.to_le_bytes())
}

/// Build the final event from its layers, in the order that fixes key
/// precedence and serialization order: skeleton, syslog fields, sampling
/// metadata, container tags, then `@metadata`.
pub fn assemble(
    message: &str,
    timestamp: &str,
    stream: &str,
    syslog_fields: Map<String, Value>,
    sample_metadata: Map<String, Value>,
    tags: &Map<String, Value>,
) -> Map<String, Value> {
    let mut event = Map::new();
    event.insert("message".into(), json!(message));
    event.insert("@timestamp".into(), json!(timestamp));
    event.insert("moby".into(), json!({ "stream": stream }));

    deep_merge(&mut event, syslog_fields);
    deep_merge(&mut event, sample_metadata);
    deep_merge(&mut event, tags.clone());

    let id = document_id(&event);
    event.insert(
        "@metadata".into(),
        json!({ "document_id": id, "event_type": "moby" }),
    );
    event
}
