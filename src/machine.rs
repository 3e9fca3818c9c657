//! Machine identity
//!
//! The station reads a small record describing what kind of machine it is
//! running on. Any failure to read it falls back to defaults.

use crate::error::StationError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which workflows the hardware supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppMode {
    #[default]
    MarkOnly,
    PrintOnly,
    MarkAndPrint,
}

impl AppMode {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "MarkOnly" | "VxMark" => Some(AppMode::MarkOnly),
            "PrintOnly" | "VxPrint" => Some(AppMode::PrintOnly),
            "MarkAndPrint" | "VxMark + VxPrint" => Some(AppMode::MarkAndPrint),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            AppMode::MarkOnly => "MarkOnly",
            AppMode::PrintOnly => "PrintOnly",
            AppMode::MarkAndPrint => "MarkAndPrint",
        }
    }

    pub fn is_mark(&self) -> bool {
        matches!(self, AppMode::MarkOnly | AppMode::MarkAndPrint)
    }

    pub fn is_print(&self) -> bool {
        matches!(self, AppMode::PrintOnly | AppMode::MarkAndPrint)
    }
}

impl std::fmt::Display for AppMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Raw record as fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigRecord {
    pub app_mode_key: String,
    pub machine_id: String,
    pub code_version: String,
}

/// Machine identity as used by the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    pub app_mode: AppMode,
    pub machine_id: String,
    pub code_version: String,
}

impl Default for MachineInfo {
    fn default() -> Self {
        Self {
            app_mode: AppMode::MarkOnly,
            machine_id: "0000".to_string(),
            code_version: "dev".to_string(),
        }
    }
}

impl TryFrom<MachineConfigRecord> for MachineInfo {
    type Error = StationError;

    fn try_from(record: MachineConfigRecord) -> Result<Self, Self::Error> {
        let app_mode = AppMode::from_key(&record.app_mode_key).ok_or_else(|| {
            StationError::Config(format!("Unknown app mode '{}'", record.app_mode_key))
        })?;
        Ok(Self {
            app_mode,
            machine_id: record.machine_id,
            code_version: record.code_version,
        })
    }
}

/// Source of the machine config record
#[async_trait::async_trait]
pub trait MachineConfigProvider: Send + Sync {
    async fn get(&self) -> Result<MachineConfigRecord, StationError>;

    fn name(&self) -> &'static str;
}

/// Reads the record from a JSON file
pub struct FileMachineConfigProvider {
    path: PathBuf,
}

impl FileMachineConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl MachineConfigProvider for FileMachineConfigProvider {
    async fn get(&self) -> Result<MachineConfigRecord, StationError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&contents)
            .map_err(|e| StationError::Config(format!("{:?}: {}", self.path, e)))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Fetch machine identity, using defaults on any failure
pub async fn load_machine_info(provider: Option<&dyn MachineConfigProvider>) -> MachineInfo {
    let Some(provider) = provider else {
        return MachineInfo::default();
    };
    match provider.get().await.and_then(MachineInfo::try_from) {
        Ok(info) => {
            tracing::info!(
                "Machine {} ({}, {})",
                info.machine_id,
                info.app_mode,
                info.code_version
            );
            info
        }
        Err(e) => {
            tracing::debug!("Machine config unavailable from {}: {}", provider.name(), e);
            MachineInfo::default()
        }
    }
}
