//! Primary run persistence: one JSON state document per run.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/<run_id>/state.json   # full RunState, rewritten atomically
//! <base>/<run_id>/logs.txt     # append-only event log
//! ```
//!
//! `save` is the durability point of the pipeline: the state file is
//! written to a temp path, flushed to disk and renamed into place
//! before the call returns, so a crash never leaves a half-written
//! document and every completed await really is on disk.

use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::run::RunState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {0} not found")]
    NotFound(Uuid),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode run state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Corrupt state document at {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-backed store of run state documents.
#[derive(Debug, Clone)]
pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn run_dir(&self, id: Uuid) -> PathBuf {
        self.base_dir.join(id.to_string())
    }

    fn state_path(&self, id: Uuid) -> PathBuf {
        self.run_dir(id).join("state.json")
    }

    fn log_path(&self, id: Uuid) -> PathBuf {
        self.run_dir(id).join("logs.txt")
    }

    /// Create the run directory and write the initial state document.
    pub async fn init_run(&self, state: &RunState) -> Result<(), StoreError> {
        let dir = self.run_dir(state.id);
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        self.write_state(state).await
    }

    /// Load a run's state document.
    pub async fn load(&self, id: Uuid) -> Result<RunState, StoreError> {
        let path = self.state_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id))
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode { path, source })
    }

    /// Persist the full state document, bumping `updated_at`. Returns
    /// only after the bytes are flushed and the document is renamed
    /// into place.
    pub async fn save(&self, state: &mut RunState) -> Result<(), StoreError> {
        state.updated_at = Utc::now();
        self.write_state(state).await
    }

    /// Append one timestamped line to the run's event log.
    pub async fn append_log(&self, id: Uuid, line: &str) -> Result<(), StoreError> {
        let path = self.log_path(id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        let entry = format!("{} {}\n", Utc::now().to_rfc3339(), line);
        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    async fn write_state(&self, state: &RunState) -> Result<(), StoreError> {
        let path = self.state_path(state.id);
        let tmp_path = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(state).map_err(StoreError::Encode)?;

        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| io_err(&tmp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| io_err(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| io_err(&tmp_path, e))?;
        drop(file);

        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_err(&path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunInputs, RunStatus};

    fn sample_state() -> RunState {
        RunState::new(RunInputs {
            source_text: "PRD body".to_string(),
            title: "Title".to_string(),
            tone: "professional".to_string(),
            audience: "engineers".to_string(),
            target_word_count: 900,
            additional_instructions: String::new(),
        })
    }

    #[tokio::test]
    async fn init_save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());

        let mut state = sample_state();
        store.init_run(&state).await.expect("init");

        state.status = RunStatus::Running;
        let before = state.updated_at;
        store.save(&mut state).await.expect("save");
        assert!(state.updated_at >= before);

        let loaded = store.load(state.id).await.expect("load");
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());
        let err = store.load(Uuid::new_v4()).await.expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());
        let mut state = sample_state();
        store.init_run(&state).await.expect("init");
        store.save(&mut state).await.expect("save");

        let run_dir = store.run_dir(state.id);
        let mut entries = tokio::fs::read_dir(&run_dir).await.expect("read_dir");
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            let name = entry.file_name();
            assert!(!name.to_string_lossy().ends_with(".tmp"));
        }
    }

    #[tokio::test]
    async fn logs_append_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());
        let state = sample_state();
        store.init_run(&state).await.expect("init");

        store.append_log(state.id, "research started").await.expect("log");
        store.append_log(state.id, "research done").await.expect("log");

        let log_path = store.run_dir(state.id).join("logs.txt");
        let text = tokio::fs::read_to_string(&log_path).await.expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("research started"));
        assert!(lines[1].ends_with("research done"));
    }
}
