use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persisted store at {path} is unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("persisted store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("stored value for {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// Small typed key/value store shared across process restarts.
pub trait KeyValueStore: Send + Sync {
    /// # Errors
    /// Returns an error when the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError>;

    /// # Errors
    /// Returns an error when the backing storage cannot be written.
    fn put(&self, key: &str, value: StoreValue) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error when the backing storage cannot be written.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error on storage failure or when the key holds another type.
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoreValue::String(value)) => Ok(Some(value)),
            Some(_) => Err(mismatch(key, "string")),
        }
    }

    /// # Errors
    /// Returns an error on storage failure or when the key holds another type.
    fn get_int(&self, key: &str) -> Result<Option<i32>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoreValue::Int(value)) => Ok(Some(value)),
            Some(_) => Err(mismatch(key, "int")),
        }
    }

    /// # Errors
    /// Returns an error on storage failure or when the key holds another type.
    fn get_long(&self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoreValue::Long(value)) => Ok(Some(value)),
            Some(_) => Err(mismatch(key, "long")),
        }
    }

    /// # Errors
    /// Returns an error on storage failure or when the key holds another type.
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoreValue::Bool(value)) => Ok(Some(value)),
            Some(_) => Err(mismatch(key, "bool")),
        }
    }
}

fn mismatch(key: &str, expected: &'static str) -> StoreError {
    StoreError::TypeMismatch {
        key: key.to_string(),
        expected,
    }
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, StoreValue>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten atomically on every change.
///
/// Nothing is cached: every read goes to the file and every change is a
/// read-modify-write, so processes sharing the file see each other's keys.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the file exists but cannot be
    /// read, and [`StoreError::Corrupt`] when it does not decode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        store.read()?;
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, StoreValue>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(StoreError::Unavailable {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn persist(&self, values: &BTreeMap<String, StoreValue>) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(values).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        xcman_platform::write_atomic(&self.path, &data).map_err(|source| {
            StoreError::Unavailable {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, StoreValue>),
    {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let values = self.read()?;
        let mut next = values.clone();
        change(&mut next);
        if next == values {
            return Ok(());
        }
        self.persist(&next)
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: StoreValue) -> Result<(), StoreError> {
        self.update(|values| {
            values.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|values| {
            values.remove(key);
        })
    }
}
