//! In-process card
//!
//! Starts with the slot empty. Tests drive it directly: insert and remove
//! cards, simulate reader faults, fail or hold writes.

use super::{Card, CardData, CardSummary};
use crate::error::CardError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Slot {
    present: bool,
    fault: bool,
    short_value: Option<String>,
    long_value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct MemoryCard {
    slot: Mutex<Slot>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    write_gate: tokio::sync::Mutex<()>,
}

impl MemoryCard {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a card holding `data`, optionally with a long value
    pub fn insert(&self, data: &CardData, long_value: Option<Vec<u8>>) {
        let short_value = serde_json::to_string(data).ok();
        self.insert_raw(short_value, long_value);
    }

    /// Insert a card with an arbitrary short value
    pub fn insert_raw(&self, short_value: Option<String>, long_value: Option<Vec<u8>>) {
        let mut slot = self.slot();
        *slot = Slot {
            present: true,
            fault: false,
            short_value,
            long_value,
        };
    }

    pub fn remove(&self) {
        *self.slot() = Slot::default();
    }

    /// Report the inserted card as unreadable
    pub fn set_fault(&self, fault: bool) {
        let mut slot = self.slot();
        slot.present = true;
        slot.fault = fault;
    }

    /// Make every write fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Block long value writes until the returned guard is dropped
    pub async fn hold_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Number of long value writes attempted
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn long_value(&self) -> Option<Vec<u8>> {
        self.slot().long_value.clone()
    }

    pub fn short_value(&self) -> Option<String> {
        self.slot().short_value.clone()
    }

    fn check_writable(&self) -> Result<(), CardError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CardError::Io("simulated write failure".to_string()));
        }
        let slot = self.slot();
        if !slot.present {
            return Err(CardError::NoCard);
        }
        if slot.fault {
            return Err(CardError::Io("card is unreadable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Card for MemoryCard {
    async fn read_summary(&self) -> Result<CardSummary, CardError> {
        let slot = self.slot();
        Ok(if !slot.present {
            CardSummary::NoCard
        } else if slot.fault {
            CardSummary::Error
        } else {
            CardSummary::Ready {
                short_value: slot.short_value.clone(),
                long_value_exists: slot.long_value.is_some(),
            }
        })
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
        let slot = self.slot();
        if !slot.present {
            return Err(CardError::NoCard);
        }
        Ok(slot.long_value.clone())
    }

    async fn write_stored_data(&self, data: &[u8]) -> Result<(), CardError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _gate = self.write_gate.lock().await;
        self.check_writable()?;
        self.slot().long_value = Some(data.to_vec());
        Ok(())
    }

    async fn clear_stored_data(&self) -> Result<(), CardError> {
        self.check_writable()?;
        self.slot().long_value = None;
        Ok(())
    }

    async fn write_short_value(&self, value: &str) -> Result<(), CardError> {
        self.check_writable()?;
        self.slot().short_value = Some(value.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
