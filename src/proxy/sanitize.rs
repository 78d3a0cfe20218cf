//! Request-body sanitisation for the OpenAI-compatible engine.
//!
//! The upstream compatibility endpoint rejects several OpenAI-only request
//! fields, so they are removed before forwarding. Null-valued fields are
//! dropped as well; common clients serialise unset options as `null`,
//! which the upstream treats as present-and-invalid.

use serde_json::Value;

/// Fields the upstream compatibility endpoint does not accept.
const REMOVED_FIELDS: &[&str] = &[
    "frequency_penalty",
    "presence_penalty",
    "logit_bias",
    "logprobs",
    "top_logprobs",
    "reasoning_effort",
    "max_completion_tokens",
    "n",
    "tools",
    "function_call",
    "functions",
    "top_k",
];

/// Sanitise a JSON request body. Returns `None` when the body is not a JSON
/// object or needed no changes, in which case the caller forwards the
/// original bytes untouched.
pub fn sanitize_openai_body(body: &[u8]) -> Option<Vec<u8>> {
    if body.is_empty() {
        return None;
    }

    let mut json: serde_json::Map<String, Value> = match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => map,
        _ => return None,
    };

    let mut modified = false;
    for field in REMOVED_FIELDS {
        if json.remove(*field).is_some() {
            modified = true;
        }
    }

    let null_keys: Vec<String> = json
        .iter()
        .filter(|(_, v)| v.is_null())
        .map(|(k, _)| k.clone())
        .collect();
    for key in null_keys {
        json.remove(&key);
        modified = true;
    }

    // The native API names models "models/<name>"; the compatibility
    // endpoint wants the bare name.
    let stripped_model = match json.get("model") {
        Some(Value::String(model)) => model.strip_prefix("models/").map(str::to_string),
        _ => None,
    };
    if let Some(model) = stripped_model {
        json.insert("model".to_string(), Value::String(model));
        modified = true;
    }

    if !modified {
        return None;
    }
    serde_json::to_vec(&Value::Object(json)).ok()
}
