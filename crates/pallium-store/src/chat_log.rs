//! The append-only chat history log.
//!
//! One JSON object per newline-terminated line. A single appender (the
//! controller) writes complete lines and syncs after each append, so tail
//! readers need no locking; they simply ignore a partial trailing line.
//! An optional size cap is enforced by copy-compaction: rewrite the newest
//! N turns to a temp file and rename it over the log.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use pallium_core::state::{ChatRole, ChatTurn};

use crate::StoreError;

/// Owns `chat_history.jsonl`.
pub struct ChatLog {
    path: PathBuf,
    /// Maximum turns kept on disk; `None` disables compaction.
    max_turns: Option<usize>,
}

impl ChatLog {
    /// Create a log at `path` with an optional line-count cap.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_turns: Option<usize>) -> Self {
        Self {
            path: path.into(),
            max_turns,
        }
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one turn as a complete line, then sync.
    pub fn append(&self, turn: &ChatTurn) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(turn)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        if let Some(max) = self.max_turns {
            self.compact(max)?;
        }
        Ok(())
    }

    /// Append a turn stamped with the current UTC time.
    pub fn append_now(&self, role: ChatRole, content: &str) -> Result<ChatTurn, StoreError> {
        let turn = ChatTurn {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            role,
            content: content.to_owned(),
            meta: None,
        };
        self.append(&turn)?;
        Ok(turn)
    }

    /// Return the newest `limit` turns, oldest first, optionally filtered by
    /// role. Unparseable lines and a partial trailing line are skipped.
    pub fn tail(&self, limit: usize, roles: Option<&[ChatRole]>) -> Result<Vec<ChatTurn>, StoreError> {
        if limit == 0 || !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let mut turns: Vec<ChatTurn> = Vec::new();
        let mut rest = content.as_str();
        while let Some(newline) = rest.find('\n') {
            let line = &rest[..newline];
            rest = &rest[newline + 1..];
            if line.trim().is_empty() {
                continue;
            }
            let Ok(turn) = serde_json::from_str::<ChatTurn>(line) else {
                continue;
            };
            if let Some(roles) = roles {
                if !roles.contains(&turn.role) {
                    continue;
                }
            }
            turns.push(turn);
        }
        // `rest` now holds any partial trailing line; it is ignored.

        if turns.len() > limit {
            let drop = turns.len() - limit;
            let _ = turns.drain(..drop);
        }
        Ok(turns)
    }

    /// Rewrite the log keeping only the newest `max` turns.
    fn compact(&self, max: usize) -> Result<(), StoreError> {
        let turns = self.tail(usize::MAX, None)?;
        if turns.len() <= max {
            return Ok(());
        }
        debug!(
            path = %self.path.display(),
            have = turns.len(),
            keep = max,
            "compacting chat log"
        );

        let keep = &turns[turns.len() - max..];
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for turn in keep {
                let mut line = serde_json::to_string(turn)?;
                line.push('\n');
                file.write_all(line.as_bytes())?;
            }
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
