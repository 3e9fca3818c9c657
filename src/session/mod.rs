//! Voting session state machine
//!
//! `SessionState` is only changed by `reduce`, a pure function over a closed
//! set of actions. Side effects (card writes, device storage) live in
//! subscribers attached to the `SessionStore`.

pub mod store;

pub use store::{SessionStore, SessionSubscriber, StoragePersistence};

use crate::election::{ElectionDefinition, PrecinctSelection};
use crate::machine::MachineInfo;
use crate::storage::StoredAppState;
use crate::votes::{ContestId, Vote, VotesDict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which instructions to show after a ballot is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostVotingInstructions {
    Card,
    Cardless,
}

/// A card write that has started but not finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteInFlight {
    /// `votes_revision` captured in the write
    pub revision: u64,
    pub started_at: DateTime<Utc>,
    pub forced: bool,
}

/// How a card write ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Bytes are on the card
    Saved,
    /// The card rejected the write; the votes stay unsaved
    Failed,
    /// The session ended while the write was in flight
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub election_definition: Option<ElectionDefinition>,
    pub app_precinct: Option<PrecinctSelection>,
    pub machine: MachineInfo,
    pub is_live_mode: bool,
    pub is_polls_open: bool,
    pub ballots_printed_count: u32,

    /// `None` until the voter's card has been read or a vote is cast
    pub votes: Option<VotesDict>,
    pub post_voting_instructions: Option<PostVotingInstructions>,

    pub last_vote_update_at: Option<DateTime<Utc>>,
    pub last_vote_save_to_card_at: Option<DateTime<Utc>>,
    /// Bumped on every vote change
    pub votes_revision: u64,
    /// Highest revision known to be on the card
    pub saved_revision: u64,
    pub writing_vote_to_card: bool,
    pub write_in_flight: Option<WriteInFlight>,
    pub force_save_vote: bool,

    pub initialized_from_storage: bool,
}

impl SessionState {
    /// Votes changed since the last successful card write
    pub fn has_unsaved_votes(&self) -> bool {
        self.saved_revision < self.votes_revision
    }

    /// The shared fields kept in device storage
    pub fn stored_app_state(&self) -> StoredAppState {
        StoredAppState {
            app_precinct: self.app_precinct.clone(),
            ballots_printed_count: self.ballots_printed_count,
            is_live_mode: self.is_live_mode,
            is_polls_open: self.is_polls_open,
        }
    }

    fn reset_voter(&mut self) {
        self.votes = None;
        self.post_voting_instructions = None;
        self.force_save_vote = false;
        self.last_vote_update_at = None;
        // A new ballot never shares a revision with the previous voter's
        self.votes_revision += 1;
        self.saved_revision = self.votes_revision;
    }

    fn reset_user(&mut self) {
        self.reset_voter();
        self.election_definition = None;
        self.app_precinct = None;
        self.ballots_printed_count = 0;
        self.is_live_mode = false;
        self.is_polls_open = false;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SetMachineConfig(MachineInfo),
    UpdateVote {
        contest_id: ContestId,
        vote: Option<Vote>,
        at: DateTime<Utc>,
    },
    LoadVotesFromVoterCard(VotesDict),
    ResetBallot(Option<PostVotingInstructions>),
    ForceSaveVote,
    UpdateAppPrecinct(PrecinctSelection),
    ToggleLiveMode,
    EnableLiveMode,
    TogglePollsOpen,
    UpdateTally,
    UpdateElectionDefinition(Box<ElectionDefinition>),
    StartWritingLongValue {
        at: DateTime<Utc>,
    },
    FinishWritingLongValue(WriteOutcome),
    Unconfigure,
    InitializeAppState {
        election_definition: Option<Box<ElectionDefinition>>,
        stored: StoredAppState,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::SetMachineConfig(_) => "setMachineConfig",
            Action::UpdateVote { .. } => "updateVote",
            Action::LoadVotesFromVoterCard(_) => "loadVotesFromVoterCard",
            Action::ResetBallot(_) => "resetBallot",
            Action::ForceSaveVote => "forceSaveVote",
            Action::UpdateAppPrecinct(_) => "updateAppPrecinct",
            Action::ToggleLiveMode => "toggleLiveMode",
            Action::EnableLiveMode => "enableLiveMode",
            Action::TogglePollsOpen => "togglePollsOpen",
            Action::UpdateTally => "updateTally",
            Action::UpdateElectionDefinition(_) => "updateElectionDefinition",
            Action::StartWritingLongValue { .. } => "startWritingLongValue",
            Action::FinishWritingLongValue(_) => "finishWritingLongValue",
            Action::Unconfigure => "unconfigure",
            Action::InitializeAppState { .. } => "initializeAppState",
        }
    }

    /// Whether the action changes fields kept in device storage
    pub fn touches_stored_state(&self) -> bool {
        matches!(
            self,
            Action::UpdateAppPrecinct(_)
                | Action::ToggleLiveMode
                | Action::EnableLiveMode
                | Action::TogglePollsOpen
                | Action::UpdateTally
                | Action::UpdateElectionDefinition(_)
                | Action::Unconfigure
        )
    }
}

pub fn reduce(mut state: SessionState, action: &Action) -> SessionState {
    match action {
        Action::SetMachineConfig(machine) => {
            state.machine = machine.clone();
        }
        Action::UpdateVote {
            contest_id,
            vote,
            at,
        } => {
            let votes = state.votes.get_or_insert_with(VotesDict::new);
            match vote {
                Some(vote) if !vote.is_empty() => {
                    votes.insert(contest_id.clone(), vote.clone());
                }
                _ => {
                    votes.remove(contest_id);
                }
            }
            state.votes_revision += 1;
            state.last_vote_update_at = Some(*at);
        }
        Action::LoadVotesFromVoterCard(votes) => {
            state.votes = Some(votes.clone());
            state.votes_revision += 1;
            state.saved_revision = state.votes_revision;
        }
        Action::ResetBallot(instructions) => {
            state.reset_voter();
            state.post_voting_instructions = *instructions;
        }
        Action::ForceSaveVote => {
            state.force_save_vote = true;
        }
        Action::UpdateAppPrecinct(precinct) => {
            state.app_precinct = Some(precinct.clone());
            state.ballots_printed_count = 0;
        }
        Action::ToggleLiveMode => {
            state.is_live_mode = !state.is_live_mode;
            state.is_polls_open = false;
            state.ballots_printed_count = 0;
        }
        Action::EnableLiveMode => {
            state.is_live_mode = true;
            state.is_polls_open = false;
            state.ballots_printed_count = 0;
        }
        Action::TogglePollsOpen => {
            state.is_polls_open = !state.is_polls_open;
        }
        Action::UpdateTally => {
            state.ballots_printed_count += 1;
        }
        Action::UpdateElectionDefinition(definition) => {
            state.reset_user();
            state.app_precinct = match definition.election.precincts.as_slice() {
                [only] => Some(PrecinctSelection::single(only.id.clone())),
                _ => None,
            };
            state.election_definition = Some(definition.as_ref().clone());
        }
        Action::StartWritingLongValue { at } => {
            state.write_in_flight = Some(WriteInFlight {
                revision: state.votes_revision,
                started_at: *at,
                forced: state.force_save_vote,
            });
            state.writing_vote_to_card = true;
            state.force_save_vote = false;
        }
        Action::FinishWritingLongValue(outcome) => {
            if let Some(write) = state.write_in_flight.take() {
                match outcome {
                    WriteOutcome::Saved => {
                        state.saved_revision = state.saved_revision.max(write.revision);
                        state.last_vote_save_to_card_at = Some(write.started_at);
                    }
                    WriteOutcome::Failed => {
                        state.force_save_vote |= write.forced;
                    }
                    WriteOutcome::Abandoned => {}
                }
            }
            state.writing_vote_to_card = false;
        }
        Action::Unconfigure => {
            state.reset_user();
        }
        Action::InitializeAppState {
            election_definition,
            stored,
        } => {
            state.election_definition = election_definition.as_deref().cloned();
            state.app_precinct = stored.app_precinct.clone();
            state.ballots_printed_count = stored.ballots_printed_count;
            state.is_live_mode = stored.is_live_mode;
            state.is_polls_open = stored.is_polls_open;
            state.initialized_from_storage = true;
        }
    }
    state
}
