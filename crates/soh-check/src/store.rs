use crate::SohError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Key the health checks write their status under.
pub const STATUS_KEY: &str = "soh";

/// Per-experiment status storage, one blob per subsystem key.
pub trait StatusStore: Send + Sync {
    /// Replace the blob stored under `key`.
    ///
    /// # Errors
    /// Returns `SohError` if the blob cannot be persisted.
    fn write(&self, experiment: &str, key: &str, blob: &Value) -> Result<(), SohError>;

    /// # Errors
    /// Returns `SohError` if stored status exists but cannot be read.
    fn read(&self, experiment: &str, key: &str) -> Result<Option<Value>, SohError>;
}

/// Stores each experiment's status as `<dir>/<experiment>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, experiment: &str) -> PathBuf {
        self.dir.join(format!("{experiment}.json"))
    }

    fn load(path: &Path) -> Result<Map<String, Value>, SohError> {
        if !path.exists() {
            return Ok(Map::new());
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(SohError::Store(format!(
                "{} does not hold a status object",
                path.display()
            ))),
        }
    }
}

impl StatusStore for JsonFileStore {
    fn write(&self, experiment: &str, key: &str, blob: &Value) -> Result<(), SohError> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(experiment);
        let mut statuses = Self::load(&path)?;
        statuses.insert(key.to_string(), blob.clone());

        // Readers never see a half-written file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&statuses)?)?;
        std::fs::rename(&tmp, &path)?;

        Ok(())
    }

    fn read(&self, experiment: &str, key: &str) -> Result<Option<Value>, SohError> {
        Ok(Self::load(&self.path_for(experiment))?.remove(key))
    }
}

/// In-memory store that also keeps every write, in order.
#[derive(Default)]
pub struct MemoryStore {
    writes: Mutex<Vec<(String, String, Value)>>,
    current: Mutex<HashMap<(String, String), Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn history(&self) -> Vec<Value> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, _, v)| v.clone())
            .collect()
    }
}

impl StatusStore for MemoryStore {
    fn write(&self, experiment: &str, key: &str, blob: &Value) -> Result<(), SohError> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((experiment.to_string(), key.to_string(), blob.clone()));
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((experiment.to_string(), key.to_string()), blob.clone());
        Ok(())
    }

    fn read(&self, experiment: &str, key: &str) -> Result<Option<Value>, SohError> {
        Ok(self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(experiment.to_string(), key.to_string()))
            .cloned())
    }
}
