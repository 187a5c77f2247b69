//! Msgpack turn-payload encoding keyed by registry field tags.

use std::collections::HashMap;

use serde_json::Value;

use crate::registry::field_tags;

/// Convert named JSON-like turn data into msgpack keyed by numeric field
/// tags (as strings) using the published registry bundle. Names without a
/// registered tag are dropped; caller-supplied numeric keys pass through.
pub fn encode_turn_payload(
    type_id: &str,
    type_version: u32,
    data: &HashMap<String, Value>,
) -> kilroy_types::Result<Vec<u8>> {
    let tags = field_tags(type_id, type_version);
    let mut out: HashMap<String, &Value> = HashMap::with_capacity(data.len());
    for (k, v) in data {
        if let Some(tag) = tags.get(k) {
            out.insert(tag.clone(), v);
            continue;
        }
        if k.trim().parse::<u64>().is_ok() {
            out.insert(k.clone(), v);
        }
    }
    rmp_serde::to_vec(&out)
        .map_err(|e| kilroy_types::KilroyError::Other(format!("msgpack encode: {e}")))
}
