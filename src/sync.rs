//! Card sync engine
//!
//! While a voter with a card is logged in, the engine copies the session's
//! votes to the card's long value. Writes are debounced behind the last vote
//! change, can be forced, and never overlap:
//!
//! ```text
//! tick ──► due? ──► startWritingLongValue ──► card write ──► finishWritingLongValue
//!                                                  │
//!                               session changed? ──┴──► result ignored
//! ```
//!
//! `begin` and `complete` are split so the station can keep polling the
//! card while a write drains. `tick` runs both back to back.

use crate::auth::{AuthGate, AuthState, Role};
use crate::ballot::{decode_ballot, encode_ballot, CompletedBallot};
use crate::card::Card;
use crate::election::ElectionDefinition;
use crate::error::CardError;
use crate::session::{Action, SessionState, SessionStore, SessionSubscriber, WriteOutcome};
use crate::votes::{BallotType, VotesDict};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Notify;

/// A write handed out by `begin`, to be passed back to `complete`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCardWrite {
    pub session_id: u64,
    pub revision: u64,
    pub bytes: Vec<u8>,
}

pub struct CardSyncEngine {
    write_delay: Duration,
    /// Revision that failed to encode; not retried until the votes change
    rejected_revision: Option<u64>,
}

impl CardSyncEngine {
    pub fn new(write_delay: std::time::Duration) -> Self {
        let millis = i64::try_from(write_delay.as_millis()).unwrap_or(i64::MAX);
        Self {
            write_delay: Duration::milliseconds(millis),
            rejected_revision: None,
        }
    }

    /// Whether a write should start now
    pub fn is_due(&self, state: &SessionState, now: DateTime<Utc>) -> bool {
        if state.writing_vote_to_card {
            return false;
        }
        // A ballot that failed to encode waits for the next vote change
        if self.rejected_revision == Some(state.votes_revision) {
            return false;
        }
        if state.force_save_vote {
            return true;
        }
        state.has_unsaved_votes()
            && state
                .last_vote_update_at
                .is_some_and(|updated| now - updated >= self.write_delay)
    }

    /// Start a write if one is due, returning the bytes to put on the card
    pub fn begin(
        &mut self,
        auth: &AuthGate,
        store: &mut SessionStore,
        now: DateTime<Utc>,
    ) -> Option<PendingCardWrite> {
        let AuthState::LoggedIn {
            role:
                Role::Voter {
                    precinct_id,
                    ballot_style_id,
                },
        } = auth.state()
        else {
            return None;
        };

        let state = store.state();
        if !self.is_due(state, now) {
            return None;
        }
        let Some(definition) = state.election_definition.as_ref() else {
            return None;
        };

        let ballot = CompletedBallot {
            election_hash: definition.election_hash.clone(),
            ballot_style_id: ballot_style_id.clone(),
            precinct_id: precinct_id.clone(),
            votes: state.votes.clone().unwrap_or_default(),
            is_test_mode: !state.is_live_mode,
            ballot_type: BallotType::Standard,
        };
        let bytes = match encode_ballot(definition, &ballot) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Cannot encode ballot for card: {}", e);
                self.rejected_revision = Some(state.votes_revision);
                return None;
            }
        };

        let state = store.dispatch(Action::StartWritingLongValue { at: now });
        let revision = state
            .write_in_flight
            .map(|write| write.revision)
            .unwrap_or(state.votes_revision);
        tracing::debug!(
            "Writing ballot to card ({} bytes, revision {})",
            bytes.len(),
            revision
        );

        Some(PendingCardWrite {
            session_id: auth.session_id(),
            revision,
            bytes,
        })
    }

    /// Record how a write ended. Results for a session that is no longer
    /// active only release the write guard.
    pub fn complete(
        &self,
        auth: &AuthGate,
        store: &mut SessionStore,
        pending: &PendingCardWrite,
        result: Result<(), CardError>,
    ) -> WriteOutcome {
        let still_active = auth.session_id() == pending.session_id
            && matches!(
                auth.state(),
                AuthState::LoggedIn {
                    role: Role::Voter { .. }
                }
            );

        let outcome = match (still_active, result) {
            (false, _) => {
                tracing::debug!("Card write finished after its session ended");
                WriteOutcome::Abandoned
            }
            (true, Ok(())) => WriteOutcome::Saved,
            (true, Err(e)) => {
                tracing::warn!("Failed to save ballot to card: {}", e);
                WriteOutcome::Failed
            }
        };
        store.dispatch(Action::FinishWritingLongValue(outcome));
        outcome
    }

    /// Run one full sync cycle inline
    pub async fn tick(
        &mut self,
        card: &dyn Card,
        auth: &AuthGate,
        store: &mut SessionStore,
        now: DateTime<Utc>,
    ) -> Option<WriteOutcome> {
        let pending = self.begin(auth, store, now)?;
        let result = card.write_stored_data(&pending.bytes).await;
        Some(self.complete(auth, store, &pending, result))
    }
}

/// Read the votes a voter card carries for this election and voter.
///
/// A blank, undecodable or mismatched payload yields an empty ballot. Only
/// card I/O errors are returned.
pub async fn read_votes_from_card(
    card: &dyn Card,
    definition: &ElectionDefinition,
    precinct_id: &str,
    ballot_style_id: &str,
) -> Result<VotesDict, CardError> {
    let Some(bytes) = card.read_stored_bytes().await? else {
        return Ok(VotesDict::new());
    };

    match decode_ballot(definition, &bytes) {
        Ok(ballot)
            if ballot.precinct_id == precinct_id && ballot.ballot_style_id == ballot_style_id =>
        {
            tracing::info!("Restored {} votes from voter card", ballot.votes.len());
            Ok(ballot.votes)
        }
        Ok(ballot) => {
            tracing::warn!(
                "Card ballot is for precinct {} / style {}, ignoring it",
                ballot.precinct_id,
                ballot.ballot_style_id
            );
            Ok(VotesDict::new())
        }
        Err(e) => {
            tracing::warn!("Card ballot could not be decoded, starting fresh: {}", e);
            Ok(VotesDict::new())
        }
    }
}

/// Wakes the station's sync loop when a write may have become due
pub struct SyncWake {
    notify: Arc<Notify>,
}

impl SyncWake {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

impl SessionSubscriber for SyncWake {
    fn on_dispatch(&mut self, action: &Action, state: &SessionState) {
        let wake = match action {
            Action::ForceSaveVote => true,
            Action::FinishWritingLongValue(_) => state.force_save_vote || state.has_unsaved_votes(),
            _ => false,
        };
        if wake {
            self.notify.notify_one();
        }
    }

    fn name(&self) -> &'static str {
        "sync-wake"
    }
}
