//! The durable world-state file.
//!
//! One JSON file, one writer (the controller). Reads take a full-file
//! snapshot; writes go through a temp file in the same directory followed by
//! a rename, so readers never observe a torn file. A corrupt or non-object
//! file resets to defaults with a logged warning rather than failing boot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use pallium_core::world::WorldState;

use crate::StoreError;

/// Owns `world_state.json`.
pub struct WorldStore {
    path: PathBuf,
}

impl WorldStore {
    /// Create a store for the file at `path`. Nothing is read until
    /// [`load`](Self::load).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the world, creating it with defaults if missing.
    ///
    /// Corruption (unparseable or non-object content) resets the file to a
    /// fresh default world and logs a warning. `updated_at` is refreshed to
    /// `now_iso` on load; `tz` is backfilled if absent.
    pub fn load(&self, now_iso: &str, tz: &str) -> Result<WorldState, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        if !self.path.exists() {
            let world = WorldState::new(now_iso, tz);
            self.commit(&world)?;
            debug!(path = %self.path.display(), "created default world state");
            return Ok(world);
        }

        let content = fs::read_to_string(&self.path)?;
        let mut world = match serde_json::from_str::<WorldState>(&content) {
            Ok(world) => world,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "world state corrupt, resetting to defaults"
                );
                let world = WorldState::new(now_iso, tz);
                self.commit(&world)?;
                return Ok(world);
            }
        };

        if !now_iso.is_empty() {
            world.updated_at = now_iso.to_owned();
        }
        if world.tz.is_none() && !tz.is_empty() {
            world.tz = Some(tz.to_owned());
        }
        Ok(world)
    }

    /// Atomically replace the file with `world`.
    ///
    /// A failed write is retried once before the error surfaces.
    pub fn commit(&self, world: &WorldState) -> Result<(), StoreError> {
        match self.write_atomic(world) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    path = %self.path.display(),
                    error = %first,
                    "world commit failed, retrying once"
                );
                self.write_atomic(world)
            }
        }
    }

    fn write_atomic(&self, world: &WorldState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            let mut body = serde_json::to_string_pretty(world)?;
            body.push('\n');
            file.write_all(body.as_bytes())?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pallium_core::world::{diff_worlds, WORLD_SCHEMA_VERSION};
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> WorldStore {
        WorldStore::new(dir.path().join("world_state.json"))
    }

    #[test]
    fn load_creates_default_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let world = store.load("2026-01-01T00:00:00Z", "UTC").unwrap();
        assert_eq!(world.schema_version, WORLD_SCHEMA_VERSION);
        assert_eq!(world.updated_at, "2026-01-01T00:00:00Z");
        assert_eq!(world.tz.as_deref(), Some("UTC"));
        assert!(store.path().exists());
    }

    #[test]
    fn commit_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let mut world = store.load("2026-01-01T00:00:00Z", "UTC").unwrap();
        world.project = "aurora".into();
        world.topics.push("trip".into());
        store.commit(&world).unwrap();

        let loaded = store.load("2026-01-02T00:00:00Z", "UTC").unwrap();
        assert_eq!(loaded.project, "aurora");
        assert_eq!(loaded.topics, vec!["trip".to_owned()]);
        // updated_at refreshed on load; nothing else differs
        assert!(diff_worlds(&world, &loaded).is_empty());
    }

    #[test]
    fn corrupt_file_resets_to_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{not json").unwrap();

        let world = store.load("2026-01-01T00:00:00Z", "UTC").unwrap();
        assert_eq!(world.project, "");
        // The reset was persisted.
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(serde_json::from_str::<WorldState>(&raw).is_ok());
    }

    #[test]
    fn non_object_file_resets_to_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "[1, 2, 3]").unwrap();
        let world = store.load("", "").unwrap();
        assert!(world.topics.is_empty());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let world = store.load("now", "UTC").unwrap();
        store.commit(&world).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn unknown_keys_survive_commit() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"schema_version":1,"updated_at":"","project":"","topics":[],"goals":[],"rules":[],"identity":{"user_name":"","session_user_name":"","agent_name":"","user_location":""},"custom_flag":true}"#,
        )
        .unwrap();

        let world = store.load("", "").unwrap();
        store.commit(&world).unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("custom_flag"));
    }
}
