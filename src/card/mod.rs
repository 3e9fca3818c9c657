//! Smartcard access and payload classification
//!
//! A card has a small "short value" holding the role record (JSON) and a
//! larger "long value" holding bulk data: the in-progress ballot for voters,
//! a tally payload for poll workers.
//!
//! Backends:
//! - file: a JSON slot file maintained by an external reader bridge
//! - memory: in-process card for development and tests

pub mod file;
pub mod memory;

use crate::config::{CardBackend, CardConfig};
use crate::error::CardError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What the reader reports about the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardSummary {
    /// Nothing inserted
    NoCard,
    /// Card inserted but unreadable (backwards, damaged)
    Error,
    Ready {
        short_value: Option<String>,
        long_value_exists: bool,
    },
}

/// Trait for card reader implementations
#[async_trait::async_trait]
pub trait Card: Send + Sync {
    /// Presence and short value
    async fn read_summary(&self) -> Result<CardSummary, CardError>;

    /// Long value as UTF-8 text, `None` when empty
    async fn read_stored_string(&self) -> Result<Option<String>, CardError>;

    /// Long value as raw bytes, `None` when empty
    async fn read_stored_bytes(&self) -> Result<Option<Vec<u8>>, CardError>;

    async fn write_stored_data(&self, data: &[u8]) -> Result<(), CardError>;

    async fn clear_stored_data(&self) -> Result<(), CardError>;

    async fn write_short_value(&self, value: &str) -> Result<(), CardError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Factory function that creates the configured card backend
pub fn create_card(config: &CardConfig) -> Arc<dyn Card> {
    match config.backend {
        CardBackend::File => {
            let path = config.resolve_slot_path();
            tracing::info!("Using card slot file {:?}", path);
            Arc::new(file::FileCard::new(path))
        }
        CardBackend::Memory => {
            tracing::info!("Using in-memory card");
            Arc::new(memory::MemoryCard::new())
        }
    }
}

/// Short value of a voter card. Field names are kept short to fit the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterCardData {
    /// Issued at, seconds since the epoch
    #[serde(rename = "c")]
    pub created_at: i64,
    #[serde(rename = "bs")]
    pub ballot_style_id: String,
    #[serde(rename = "pr")]
    pub precinct_id: String,
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub election_hash: Option<String>,
    #[serde(rename = "uz", default, skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<i64>,
    #[serde(rename = "bp", default, skip_serializing_if = "Option::is_none")]
    pub ballot_printed_at: Option<i64>,
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Id of the machine that issued the card
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub mark_machine_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollWorkerCardData {
    #[serde(rename = "h")]
    pub election_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionManagerCardData {
    #[serde(rename = "h")]
    pub election_hash: String,
    /// SHA-256 hex of the passcode
    #[serde(rename = "p")]
    pub passcode_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAdministratorCardData {
    #[serde(rename = "p")]
    pub passcode_hash: String,
}

/// Role record stored in the short value, discriminated by `t`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum CardData {
    Voter(VoterCardData),
    #[serde(alias = "pollworker")]
    PollWorker(PollWorkerCardData),
    #[serde(alias = "admin")]
    ElectionManager(ElectionManagerCardData),
    #[serde(alias = "superadmin")]
    SystemAdministrator(SystemAdministratorCardData),
}

impl CardData {
    pub fn to_short_value(&self) -> Result<String, CardError> {
        serde_json::to_string(self).map_err(|e| CardError::Malformed(e.to_string()))
    }
}

/// Validated view of whatever is in the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardContents {
    Empty,
    Unreadable,
    ParseError,
    Voter {
        data: VoterCardData,
        has_stored_data: bool,
    },
    PollWorker {
        election_hash: String,
        has_stored_data: bool,
    },
    ElectionManager {
        election_hash: String,
        passcode_hash: String,
    },
    SystemAdministrator {
        passcode_hash: String,
    },
}

impl CardContents {
    pub fn is_present(&self) -> bool {
        !matches!(self, CardContents::Empty)
    }
}

/// Classify a reader summary. Blank cards count as empty.
pub fn classify(summary: &CardSummary) -> CardContents {
    let (short_value, long_value_exists) = match summary {
        CardSummary::NoCard => return CardContents::Empty,
        CardSummary::Error => return CardContents::Unreadable,
        CardSummary::Ready {
            short_value,
            long_value_exists,
        } => (short_value.as_deref(), *long_value_exists),
    };

    let Some(short_value) = short_value.filter(|s| !s.trim().is_empty()) else {
        return CardContents::Empty;
    };

    match serde_json::from_str::<CardData>(short_value) {
        Ok(CardData::Voter(data)) => CardContents::Voter {
            data,
            has_stored_data: long_value_exists,
        },
        Ok(CardData::PollWorker(data)) => CardContents::PollWorker {
            election_hash: data.election_hash,
            has_stored_data: long_value_exists,
        },
        Ok(CardData::ElectionManager(data)) => CardContents::ElectionManager {
            election_hash: data.election_hash,
            passcode_hash: data.passcode_hash,
        },
        Ok(CardData::SystemAdministrator(data)) => CardContents::SystemAdministrator {
            passcode_hash: data.passcode_hash,
        },
        Err(e) => {
            tracing::debug!("Card short value did not parse: {}", e);
            CardContents::ParseError
        }
    }
}

/// Stamp a voter card as having printed its ballot and drop the stored ballot
pub async fn mark_printed(
    card: &dyn Card,
    data: &VoterCardData,
    now: DateTime<Utc>,
) -> Result<(), CardError> {
    let stamped = VoterCardData {
        ballot_printed_at: Some(now.timestamp()),
        updated_at: Some(now.timestamp()),
        ..data.clone()
    };
    card.clear_stored_data().await?;
    card.write_short_value(&CardData::Voter(stamped).to_short_value()?)
        .await
}

/// Stamp a voter card as voided and drop the stored ballot
pub async fn mark_voided(
    card: &dyn Card,
    data: &VoterCardData,
    now: DateTime<Utc>,
) -> Result<(), CardError> {
    let stamped = VoterCardData {
        voided_at: Some(now.timestamp()),
        updated_at: Some(now.timestamp()),
        ..data.clone()
    };
    card.clear_stored_data().await?;
    card.write_short_value(&CardData::Voter(stamped).to_short_value()?)
        .await
}
