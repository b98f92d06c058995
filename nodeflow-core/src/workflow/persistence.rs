//! Workflow checkpoint persistence

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::CheckpointError;

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Output of a step recorded in a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: String,
    pub output: Value,
}

/// Progress of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub execution_id: Uuid,
    pub workflow_name: String,
    /// Completed steps in completion order
    pub completed: Vec<CompletedStep>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(execution_id: Uuid, workflow_name: impl Into<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            execution_id,
            workflow_name: workflow_name.into(),
            completed: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.completed
            .iter()
            .find(|c| c.step_id == step_id)
            .map(|c| &c.output)
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.output(step_id).is_some()
    }

    fn check_version(&self) -> Result<(), CheckpointError> {
        if self.version == CHECKPOINT_VERSION {
            Ok(())
        } else {
            Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                supported: CHECKPOINT_VERSION,
            })
        }
    }
}

/// Storage for workflow checkpoints, keyed by execution id
pub trait CheckpointStore: Send + Sync {
    /// Insert or replace the checkpoint for its execution
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    fn load(&self, execution_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError>;

    fn delete(&self, execution_id: Uuid) -> Result<(), CheckpointError>;

    /// Execution ids with a stored checkpoint
    fn list(&self) -> Result<Vec<Uuid>, CheckpointError>;
}

/// Process-local checkpoint store
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<Uuid, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .insert(checkpoint.execution_id, checkpoint.clone());
        Ok(())
    }

    fn load(&self, execution_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.get(&execution_id).map(|c| c.clone()))
    }

    fn delete(&self, execution_id: Uuid) -> Result<(), CheckpointError> {
        self.checkpoints.remove(&execution_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Uuid>, CheckpointError> {
        Ok(self.checkpoints.iter().map(|c| *c.key()).collect())
    }
}

/// Root JSON document of the file store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    checkpoints: Vec<Checkpoint>,
}

/// Checkpoints in one JSON file guarded by advisory file locks
#[derive(Debug, Clone)]
pub struct JsonFileCheckpointStore {
    path: PathBuf,
}

impl JsonFileCheckpointStore {
    /// Open (or prepare to create) the store at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn parse(contents: &str) -> Result<CheckpointFile, CheckpointError> {
        if contents.trim().is_empty() {
            return Ok(CheckpointFile::default());
        }
        serde_json::from_str(contents).map_err(|e| CheckpointError::Corrupt(e.to_string()))
    }

    /// Read the whole store under a shared lock
    fn read_store(&self) -> Result<CheckpointFile, CheckpointError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointFile::default())
            }
            Err(e) => return Err(self.io_error(e)),
        };

        file.lock_shared().map_err(|e| self.io_error(e))?;
        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        let _ = file.unlock();
        read.map_err(|e| self.io_error(e))?;

        Self::parse(&contents)
    }

    /// Read-modify-write the store under an exclusive lock
    fn update_store<F>(&self, update: F) -> Result<(), CheckpointError>
    where
        F: FnOnce(&mut CheckpointFile),
    {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        file.lock_exclusive().map_err(|e| self.io_error(e))?;
        let result = self.rewrite(&mut file, update);
        let _ = file.unlock();
        result
    }

    fn rewrite<F>(&self, file: &mut File, update: F) -> Result<(), CheckpointError>
    where
        F: FnOnce(&mut CheckpointFile),
    {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| self.io_error(e))?;
        let mut store = Self::parse(&contents)?;

        update(&mut store);

        let json = serde_json::to_string_pretty(&store)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
        file.set_len(0).map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| self.io_error(e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| self.io_error(e))?;
        file.flush().map_err(|e| self.io_error(e))
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.check_version()?;
        self.update_store(|store| {
            match store
                .checkpoints
                .iter_mut()
                .find(|c| c.execution_id == checkpoint.execution_id)
            {
                Some(existing) => *existing = checkpoint.clone(),
                None => store.checkpoints.push(checkpoint.clone()),
            }
        })
    }

    fn load(&self, execution_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        let store = self.read_store()?;
        let checkpoint = store
            .checkpoints
            .into_iter()
            .find(|c| c.execution_id == execution_id);
        if let Some(checkpoint) = &checkpoint {
            checkpoint.check_version()?;
        }
        Ok(checkpoint)
    }

    fn delete(&self, execution_id: Uuid) -> Result<(), CheckpointError> {
        if !self.path.exists() {
            return Ok(());
        }
        self.update_store(|store| {
            store.checkpoints.retain(|c| c.execution_id != execution_id);
        })
    }

    fn list(&self) -> Result<Vec<Uuid>, CheckpointError> {
        Ok(self
            .read_store()?
            .checkpoints
            .iter()
            .map(|c| c.execution_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn checkpoint(steps: &[&str]) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4(), "etl");
        for step in steps {
            checkpoint.completed.push(CompletedStep {
                step_id: step.to_string(),
                output: json!({"step": step}),
            });
        }
        checkpoint
    }

    #[test]
    fn test_in_memory_store_round_trip() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint(&["extract"]);

        store.save(&cp).unwrap();
        assert_eq!(store.load(cp.execution_id).unwrap(), Some(cp.clone()));
        assert_eq!(store.list().unwrap(), vec![cp.execution_id]);

        store.delete(cp.execution_id).unwrap();
        assert!(store.load(cp.execution_id).unwrap().is_none());
    }

    #[test]
    fn test_json_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state").join("checkpoints.json");
        let first = checkpoint(&["extract"]);
        let mut second = checkpoint(&["extract", "transform"]);

        {
            let store = JsonFileCheckpointStore::new(&path).unwrap();
            store.save(&first).unwrap();
            store.save(&second).unwrap();

            second.completed.push(CompletedStep {
                step_id: "load".to_string(),
                output: json!(null),
            });
            store.save(&second).unwrap();
        }

        let reopened = JsonFileCheckpointStore::new(&path).unwrap();
        assert_eq!(reopened.list().unwrap().len(), 2);
        let loaded = reopened.load(second.execution_id).unwrap().unwrap();
        assert_eq!(loaded.completed.len(), 3);
        assert!(loaded.is_completed("transform"));

        reopened.delete(first.execution_id).unwrap();
        assert_eq!(reopened.list().unwrap(), vec![second.execution_id]);
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileCheckpointStore::new(temp_dir.path().join("none.json")).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(store.load(Uuid::new_v4()).unwrap().is_none());
        store.delete(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileCheckpointStore::new(&path).unwrap();
        assert!(matches!(store.list(), Err(CheckpointError::Corrupt(_))));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut cp = checkpoint(&[]);
        cp.version = 99;
        let temp_dir = TempDir::new().unwrap();
        let file_store = JsonFileCheckpointStore::new(temp_dir.path().join("cp.json")).unwrap();

        assert!(matches!(
            file_store.save(&cp),
            Err(CheckpointError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
