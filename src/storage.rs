//! Local device storage
//!
//! Two keys survive restarts independent of any card: the loaded election
//! definition and the shared station state (precinct, printed count, live
//! mode, polls). Values are stored as JSON and read back verbatim.

use crate::election::{ElectionDefinition, PrecinctSelection};
use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub const ELECTION_STORAGE_KEY: &str = "electionDefinition";
pub const STATE_STORAGE_KEY: &str = "state";

/// Generic key/value store for JSON values
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;
    fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// Shared station state persisted under `state`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredAppState {
    pub app_precinct: Option<PrecinctSelection>,
    pub ballots_printed_count: u32,
    pub is_live_mode: bool,
    pub is_polls_open: bool,
}

pub fn load_election_definition(
    storage: &dyn KeyValueStorage,
) -> Result<Option<ElectionDefinition>, StorageError> {
    storage
        .get(ELECTION_STORAGE_KEY)?
        .map(serde_json::from_value)
        .transpose()
        .map_err(StorageError::from)
}

pub fn load_app_state(storage: &dyn KeyValueStorage) -> Result<StoredAppState, StorageError> {
    Ok(storage
        .get(STATE_STORAGE_KEY)?
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default())
}

pub fn save_election_definition(
    storage: &dyn KeyValueStorage,
    definition: Option<&ElectionDefinition>,
) -> Result<(), StorageError> {
    match definition {
        Some(definition) => storage.set(ELECTION_STORAGE_KEY, &serde_json::to_value(definition)?),
        None => storage.remove(ELECTION_STORAGE_KEY),
    }
}

pub fn save_app_state(
    storage: &dyn KeyValueStorage,
    state: &StoredAppState,
) -> Result<(), StorageError> {
    storage.set(STATE_STORAGE_KEY, &serde_json::to_value(state)?)
}

/// One `<key>.json` file per key in a directory
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    pub fn open(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl KeyValueStorage for JsonFileStorage {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        match std::fs::read_to_string(self.key_path(key)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        let path = self.key_path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.key_path(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn clear(&self) -> Result<(), StorageError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn keys(&self) -> Vec<String> {
        self.values().keys().cloned().collect()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        self.values().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.values().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.values().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::fixture;

    #[test]
    fn test_stored_state_defaults_missing_fields() {
        let state: StoredAppState = serde_json::from_str(r#"{"isLiveMode":true}"#).unwrap();
        assert!(state.is_live_mode);
        assert_eq!(state.ballots_printed_count, 0);
        assert!(state.app_precinct.is_none());
    }

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(load_app_state(&storage).unwrap(), StoredAppState::default());
        assert!(load_election_definition(&storage).unwrap().is_none());

        let def = fixture();
        save_election_definition(&storage, Some(&def)).unwrap();
        let state = StoredAppState {
            app_precinct: Some(PrecinctSelection::single("p1")),
            ballots_printed_count: 3,
            is_live_mode: true,
            is_polls_open: true,
        };
        save_app_state(&storage, &state).unwrap();

        assert_eq!(load_election_definition(&storage).unwrap(), Some(def));
        assert_eq!(load_app_state(&storage).unwrap(), state);
        assert_eq!(storage.keys(), vec!["electionDefinition", "state"]);

        save_election_definition(&storage, None).unwrap();
        assert_eq!(storage.keys(), vec!["state"]);
    }

    #[test]
    fn test_json_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::open(dir.path().join("storage")).unwrap();

        assert!(storage.get(STATE_STORAGE_KEY).unwrap().is_none());
        storage
            .set(STATE_STORAGE_KEY, &serde_json::json!({"ballotsPrintedCount": 2}))
            .unwrap();
        assert!(dir.path().join("storage/state.json").exists());
        assert_eq!(load_app_state(&storage).unwrap().ballots_printed_count, 2);

        storage.remove("missing").unwrap();
        storage.clear().unwrap();
        assert!(storage.get(STATE_STORAGE_KEY).unwrap().is_none());
    }

    #[test]
    fn test_json_file_storage_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::open(dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.path().join("state.json"), "{").unwrap();
        assert!(matches!(
            load_app_state(&storage),
            Err(StorageError::Json(_))
        ));
    }
}
