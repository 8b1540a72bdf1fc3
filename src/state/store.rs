//! Atomic, crash-safe persistence for `StateRecord`s: one JSON file per
//! (part, step), written via write-temp-then-rename so a reader never
//! observes a partial file.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::{StateRecord, SCHEMA_VERSION};
use crate::errors::ExecutionError;
use crate::step::Step;

/// Persists and retrieves `StateRecord`s under `<work_dir>/state`.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateStore { root: root.into() }
    }

    fn path_for(&self, part: &str, step: Step) -> PathBuf {
        self.root.join(part).join("state").join(format!("{step}.json"))
    }

    /// Write `record` for (part, step). Crash-safe: written to a temp file
    /// in the same directory, fsynced, then renamed over the final path so
    /// a concurrent reader (or a process that crashes mid-write) never sees
    /// a truncated file.
    pub async fn save(&self, part: &str, step: Step, record: &StateRecord) -> Result<(), ExecutionError> {
        let final_path = self.path_for(part, step);
        let dir = final_path.parent().expect("path_for always has a parent");
        tokio::fs::create_dir_all(dir).await.map_err(|e| state_write_failed(part, step, e))?;

        let body = serde_json::to_string_pretty(record).map_err(|e| state_write_failed(part, step, e))?;
        let temp_path = dir.join(format!(".{step}.json.tmp"));
        {
            let mut file = tokio::fs::File::create(&temp_path)
                .await
                .map_err(|e| state_write_failed(part, step, e))?;
            file.write_all(body.as_bytes()).await.map_err(|e| state_write_failed(part, step, e))?;
            file.sync_all().await.map_err(|e| state_write_failed(part, step, e))?;
        }
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| state_write_failed(part, step, e))?;
        Ok(())
    }

    /// Load the record for (part, step), if present. A record whose
    /// `schema_version` this crate doesn't recognize is treated as absent —
    /// the caller will see `None` and plan a fresh `Run`/`Rerun`.
    pub async fn load(&self, part: &str, step: Step) -> Option<StateRecord> {
        let path = self.path_for(part, step);
        let body = tokio::fs::read_to_string(&path).await.ok()?;
        let record: StateRecord = serde_json::from_str(&body).ok()?;
        if record.schema_version == SCHEMA_VERSION {
            Some(record)
        } else {
            None
        }
    }

    /// Delete the record for (part, step) if it exists. Not an error if it
    /// doesn't.
    pub async fn remove(&self, part: &str, step: Step) -> Result<(), ExecutionError> {
        let path = self.path_for(part, step);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(state_write_failed(part, step, e)),
        }
    }

    /// Remove every recorded step at or after `from` for `part`, used when
    /// an action is a `Rerun` or when cleaning.
    pub async fn remove_from(&self, part: &str, from: Step) -> Result<(), ExecutionError> {
        for step in Step::ALL.into_iter().filter(|s| *s >= from) {
            self.remove(part, step).await?;
        }
        Ok(())
    }

    /// Remove the entire on-disk record directory for one part.
    pub async fn remove_part(&self, part: &str) -> Result<(), ExecutionError> {
        let dir = self.root.join(part);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExecutionError::StateWriteFailed {
                part: part.to_string(),
                step: Step::Pull,
                message: e.to_string(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn state_write_failed(part: &str, step: Step, err: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::StateWriteFailed {
        part: part.to_string(),
        step,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StepOutcome;

    fn sample_record() -> StateRecord {
        StateRecord::new(
            "fingerprint-a",
            StepOutcome::Pull {
                assets: vec![],
                stage_packages_manifest: vec![],
            },
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let record = sample_record();
        store.save("hello", Step::Pull, &record).await.unwrap();
        let loaded = store.load("hello", Step::Pull).await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn load_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load("hello", Step::Pull).await.is_none());
    }

    #[tokio::test]
    async fn unknown_schema_version_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut record = sample_record();
        record.schema_version = 999;
        store.save("hello", Step::Pull, &record).await.unwrap();
        assert!(store.load("hello", Step::Pull).await.is_none());
    }

    #[tokio::test]
    async fn remove_deletes_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save("hello", Step::Pull, &sample_record()).await.unwrap();
        store.remove("hello", Step::Pull).await.unwrap();
        assert!(store.load("hello", Step::Pull).await.is_none());
    }

    #[tokio::test]
    async fn remove_is_not_an_error_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.remove("ghost", Step::Build).await.is_ok());
    }

    #[tokio::test]
    async fn save_produces_pretty_json_with_schema_version_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save("hello", Step::Pull, &sample_record()).await.unwrap();
        let path = store.path_for("hello", Step::Pull);
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(body.starts_with("{\n"));
        let first_field_line = body.lines().nth(1).unwrap();
        assert!(first_field_line.contains("schema_version"));
    }
}
