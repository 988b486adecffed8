//! Durable world model and key-level diffing.
//!
//! The world is the structured long-lived memory of the assistant: current
//! project, active topics, goals, rules, and identity. It lives in a single
//! JSON file owned by the controller; stages only ever see an in-turn
//! snapshot and mutate it through the `world_apply_ops` tool.
//!
//! The schema is append-tolerant: unknown top-level keys survive a
//! load/save round trip via the flattened `extra` map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current schema version written to disk.
pub const WORLD_SCHEMA_VERSION: u32 = 1;

/// Identity block of the world state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub session_user_name: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub user_location: String,
}

/// The durable world state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// ISO-8601 timestamp of the last commit.
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub goals: Vec<Value>,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Unknown keys preserved across load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_schema_version() -> u32 {
    WORLD_SCHEMA_VERSION
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            schema_version: WORLD_SCHEMA_VERSION,
            updated_at: String::new(),
            project: String::new(),
            topics: Vec::new(),
            goals: Vec::new(),
            rules: Vec::new(),
            identity: Identity::default(),
            tz: None,
            extra: Map::new(),
        }
    }
}

impl WorldState {
    /// A fresh world stamped with the given time and timezone.
    #[must_use]
    pub fn new(now_iso: &str, tz: &str) -> Self {
        Self {
            updated_at: now_iso.to_owned(),
            tz: if tz.is_empty() {
                None
            } else {
                Some(tz.to_owned())
            },
            ..Self::default()
        }
    }

    /// Serialize to a JSON object map.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Diffing
// ─────────────────────────────────────────────────────────────────────────────

/// A changed top-level key: the value before and after the turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangedValue {
    pub from: Value,
    pub to: Value,
}

/// Key-level difference between two world snapshots.
///
/// `updated_at` is excluded: it changes on every commit and would make
/// every diff non-empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldDiff {
    #[serde(default)]
    pub added: Map<String, Value>,
    #[serde(default)]
    pub removed: Map<String, Value>,
    #[serde(default)]
    pub changed: Map<String, Value>,
}

impl WorldDiff {
    /// Whether the diff carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Whether two snapshots differ on anything other than `updated_at`.
#[must_use]
pub fn world_changed(before: &WorldState, after: &WorldState) -> bool {
    !diff_worlds(before, after).is_empty()
}

/// Compute the key-level diff between two snapshots, ignoring `updated_at`.
#[must_use]
pub fn diff_worlds(before: &WorldState, after: &WorldState) -> WorldDiff {
    let b = before.to_map();
    let a = after.to_map();
    let mut diff = WorldDiff::default();

    for (key, before_val) in &b {
        if key == "updated_at" {
            continue;
        }
        match a.get(key) {
            None => {
                let _ = diff.removed.insert(key.clone(), before_val.clone());
            }
            Some(after_val) if after_val != before_val => {
                let _ = diff.changed.insert(
                    key.clone(),
                    serde_json::to_value(ChangedValue {
                        from: before_val.clone(),
                        to: after_val.clone(),
                    })
                    .unwrap_or(Value::Null),
                );
            }
            Some(_) => {}
        }
    }
    for (key, after_val) in &a {
        if key == "updated_at" || b.contains_key(key) {
            continue;
        }
        let _ = diff.added.insert(key.clone(), after_val.clone());
    }
    diff
}

/// Apply a diff to a snapshot. Applying the same diff twice is a no-op.
#[must_use]
pub fn apply_diff(world: &WorldState, diff: &WorldDiff) -> WorldState {
    let mut map = world.to_map();

    for (key, val) in &diff.added {
        let _ = map.insert(key.clone(), val.clone());
    }
    for key in diff.removed.keys() {
        let _ = map.remove(key);
    }
    for (key, change) in &diff.changed {
        if let Some(to) = change.get("to") {
            let _ = map.insert(key.clone(), to.clone());
        }
    }

    serde_json::from_value(Value::Object(map)).unwrap_or_else(|_| world.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_has_schema_version() {
        let w = WorldState::default();
        assert_eq!(w.schema_version, WORLD_SCHEMA_VERSION);
        assert!(w.topics.is_empty());
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let raw = json!({
            "schema_version": 1,
            "updated_at": "2026-01-01T00:00:00Z",
            "project": "aurora",
            "topics": ["trip"],
            "goals": [],
            "rules": [],
            "identity": {"user_name": "kim", "session_user_name": "", "agent_name": "", "user_location": ""},
            "mood": "curious"
        });
        let w: WorldState = serde_json::from_value(raw).unwrap();
        assert_eq!(w.extra.get("mood"), Some(&json!("curious")));
        let back = serde_json::to_value(&w).unwrap();
        assert_eq!(back["mood"], "curious");
    }

    #[test]
    fn diff_ignores_updated_at() {
        let before = WorldState::new("2026-01-01T00:00:00Z", "UTC");
        let mut after = before.clone();
        after.updated_at = "2026-01-02T00:00:00Z".into();
        assert!(!world_changed(&before, &after));
        assert!(diff_worlds(&before, &after).is_empty());
    }

    #[test]
    fn diff_reports_changed_key_with_from_to() {
        let before = WorldState {
            project: "old".into(),
            ..WorldState::default()
        };
        let mut after = before.clone();
        after.project = "aurora".into();

        let diff = diff_worlds(&before, &after);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        let change = diff.changed.get("project").unwrap();
        assert_eq!(change["from"], "old");
        assert_eq!(change["to"], "aurora");
    }

    #[test]
    fn diff_reports_added_and_removed_extra_keys() {
        let mut before = WorldState::default();
        let _ = before.extra.insert("legacy".into(), json!(1));
        let mut after = WorldState::default();
        let _ = after.extra.insert("mood".into(), json!("calm"));

        let diff = diff_worlds(&before, &after);
        assert_eq!(diff.added.get("mood"), Some(&json!("calm")));
        assert_eq!(diff.removed.get("legacy"), Some(&json!(1)));
    }

    #[test]
    fn apply_diff_is_idempotent() {
        let before = WorldState {
            project: "old".into(),
            topics: vec!["a".into()],
            ..WorldState::default()
        };
        let mut after = before.clone();
        after.project = "aurora".into();
        after.topics.push("b".into());

        let diff = diff_worlds(&before, &after);
        let once = apply_diff(&before, &diff);
        assert_eq!(once.project, "aurora");
        assert_eq!(once.topics, vec!["a".to_owned(), "b".to_owned()]);

        let twice = apply_diff(&once, &diff);
        assert_eq!(twice, once);
    }

    #[test]
    fn apply_diff_removes_keys() {
        let mut before = WorldState::default();
        let _ = before.extra.insert("stale".into(), json!(true));
        let after = WorldState::default();

        let diff = diff_worlds(&before, &after);
        let applied = apply_diff(&before, &diff);
        assert!(applied.extra.get("stale").is_none());
    }
}
