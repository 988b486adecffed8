//! Tolerant extraction of JSON from noisy model output, plus canonical
//! serialization helpers.
//!
//! Models asked for structured output often wrap it in prose or markdown
//! fences. [`extract_first_json`] finds the first top-level JSON object or
//! array by bracket matching, skipping string contents and escapes. Callers
//! fall back to their declared default when it returns `None`.

use serde_json::Value;

/// Extract the first top-level JSON object or array from `text`.
#[must_use]
pub fn extract_first_json(text: &str) -> Option<Value> {
    let s = strip_fences(text.trim());
    if s.is_empty() {
        return None;
    }

    // Fast path: the whole string is valid JSON.
    if let Ok(v) = serde_json::from_str::<Value>(s) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    let start = s.find(['{', '['])?;
    let bytes = s.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    let candidate = &s[start..=i];
                    return serde_json::from_str::<Value>(candidate)
                        .ok()
                        .filter(|v| v.is_object() || v.is_array());
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the first JSON object, rejecting arrays.
#[must_use]
pub fn extract_first_object(text: &str) -> Option<Value> {
    extract_first_json(text).filter(Value::is_object)
}

/// Strip an outer markdown code fence (```json ... ```), if present.
fn strip_fences(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Drop the info string (e.g. "json") up to the first newline.
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => return s,
    };
    body.trim_end()
        .strip_suffix("```")
        .map_or(s, str::trim)
}

/// Serialize with sorted object keys, producing a stable byte sequence for
/// digests and prompt embedding.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Short stable digest of the canonical JSON of `args`, used to reference
/// tool arguments in events without embedding them.
#[must_use]
pub fn args_digest(args: &Value) -> String {
    // FNV-1a, 64-bit. Collision resistance is irrelevant here; stability and
    // zero dependencies are the point.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in canonical_json(args).as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}
