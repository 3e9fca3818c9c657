//! Card backed by a JSON slot file
//!
//! A reader bridge keeps the slot file in sync with the physical card:
//!
//! ```json
//! { "status": "ready", "shortValue": "{\"t\":\"voter\",...}", "longValue": "5658..." }
//! ```
//!
//! A missing file means no card. `status` is "ready" or "error". The long
//! value is hex encoded.

use super::{Card, CardSummary};
use crate::error::CardError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SlotStatus {
    #[default]
    Ready,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlotFile {
    #[serde(default)]
    status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    short_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    long_value: Option<String>,
}

pub struct FileCard {
    path: PathBuf,
}

impl FileCard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `Ok(None)` when no card is inserted
    async fn load(&self) -> Result<Option<SlotFile>, CardError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| CardError::Malformed(format!("slot file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CardError::Io(e.to_string())),
        }
    }

    async fn load_writable(&self) -> Result<SlotFile, CardError> {
        match self.load().await? {
            Some(slot) if slot.status == SlotStatus::Ready => Ok(slot),
            Some(_) => Err(CardError::Io("card is unreadable".to_string())),
            None => Err(CardError::NoCard),
        }
    }

    /// Put a card in the slot, replacing any card there
    pub async fn insert(
        &self,
        short_value: &str,
        long_value: Option<&[u8]>,
    ) -> Result<(), CardError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CardError::Io(e.to_string()))?;
        }
        self.store(&SlotFile {
            status: SlotStatus::Ready,
            short_value: Some(short_value.to_string()),
            long_value: long_value.map(hex::encode),
        })
        .await
    }

    /// Empty the slot
    pub async fn remove(&self) -> Result<(), CardError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CardError::Io(e.to_string())),
        }
    }

    async fn store(&self, slot: &SlotFile) -> Result<(), CardError> {
        let contents =
            serde_json::to_string_pretty(slot).map_err(|e| CardError::Malformed(e.to_string()))?;
        // Write to a sibling file and rename so the bridge never sees a partial slot
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| CardError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CardError::Io(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Card for FileCard {
    async fn read_summary(&self) -> Result<CardSummary, CardError> {
        match self.load().await {
            Ok(None) => Ok(CardSummary::NoCard),
            Ok(Some(slot)) if slot.status == SlotStatus::Error => Ok(CardSummary::Error),
            Ok(Some(slot)) => Ok(CardSummary::Ready {
                short_value: slot.short_value,
                long_value_exists: slot.long_value.is_some_and(|v| !v.is_empty()),
            }),
            Err(CardError::Malformed(e)) => {
                tracing::warn!("Unreadable card slot file: {}", e);
                Ok(CardSummary::Error)
            }
            Err(e) => Err(e),
        }
    }

    async fn read_stored_string(&self) -> Result<Option<String>, CardError> {
        match self.read_stored_bytes().await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| CardError::Malformed(e.to_string())),
            None => Ok(None),
        }
    }

    async fn read_stored_bytes(&self) -> Result<Option<Vec<u8>>, CardError> {
        let slot = self.load_writable().await?;
        match slot.long_value.filter(|v| !v.is_empty()) {
            Some(encoded) => hex::decode(encoded)
                .map(Some)
                .map_err(|e| CardError::Malformed(format!("long value: {}", e))),
            None => Ok(None),
        }
    }

    async fn write_stored_data(&self, data: &[u8]) -> Result<(), CardError> {
        let mut slot = self.load_writable().await?;
        slot.long_value = Some(hex::encode(data));
        self.store(&slot).await
    }

    async fn clear_stored_data(&self) -> Result<(), CardError> {
        let mut slot = self.load_writable().await?;
        slot.long_value = None;
        self.store(&slot).await
    }

    async fn write_short_value(&self, value: &str) -> Result<(), CardError> {
        let mut slot = self.load_writable().await?;
        slot.short_value = Some(value.to_string());
        self.store(&slot).await
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
