//! Screen selection
//!
//! The presentation layer shows exactly one full screen, chosen here from
//! the auth state and the session state alone.

use crate::auth::{AuthState, LoggedOutReason, Role};
use crate::session::{PostVotingInstructions, SessionState};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "screen", rename_all = "snake_case")]
pub enum Screen {
    CardError,
    UnlockMachine,
    SystemAdministrator { machine_configured: bool },
    /// Manager card for another election; offers to load it
    ReplaceElection,
    ElectionManager,
    Unconfigured,
    WrongElection { voter_card: bool },
    WrongPrecinct,
    PollWorker,
    ExpiredCard,
    UsedCard,
    CastBallotInstructions { instructions: PostVotingInstructions },
    PrintOnly,
    Ballot { cardless: bool },
    InsertCard,
}

impl Screen {
    pub fn as_str(&self) -> &'static str {
        match self {
            Screen::CardError => "card_error",
            Screen::UnlockMachine => "unlock_machine",
            Screen::SystemAdministrator { .. } => "system_administrator",
            Screen::ReplaceElection => "replace_election",
            Screen::ElectionManager => "election_manager",
            Screen::Unconfigured => "unconfigured",
            Screen::WrongElection { .. } => "wrong_election",
            Screen::WrongPrecinct => "wrong_precinct",
            Screen::PollWorker => "poll_worker",
            Screen::ExpiredCard => "expired_card",
            Screen::UsedCard => "used_card",
            Screen::CastBallotInstructions { .. } => "cast_ballot_instructions",
            Screen::PrintOnly => "print_only",
            Screen::Ballot { .. } => "ballot",
            Screen::InsertCard => "insert_card",
        }
    }
}

impl std::fmt::Display for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn select_screen(auth: &AuthState, session: &SessionState) -> Screen {
    let definition = session.election_definition.as_ref();

    match auth {
        AuthState::LoggedOut {
            reason: LoggedOutReason::CardError,
        } => return Screen::CardError,
        AuthState::CheckingPasscode { .. } => return Screen::UnlockMachine,
        AuthState::LoggedIn {
            role: Role::SystemAdministrator,
        } => {
            return Screen::SystemAdministrator {
                machine_configured: definition.is_some(),
            }
        }
        AuthState::LoggedIn {
            role: Role::ElectionManager { election_hash },
        } => {
            return match definition {
                Some(def) if def.election_hash != *election_hash => Screen::ReplaceElection,
                _ => Screen::ElectionManager,
            }
        }
        _ => {}
    }

    if definition.is_none() || session.app_precinct.is_none() {
        return Screen::Unconfigured;
    }

    let app_mode = session.machine.app_mode;
    match auth {
        AuthState::LoggedOut { reason } => match reason {
            LoggedOutReason::VoterWrongElection => Screen::WrongElection { voter_card: true },
            LoggedOutReason::PollWorkerWrongElection
            | LoggedOutReason::ElectionManagerWrongElection => {
                Screen::WrongElection { voter_card: false }
            }
            LoggedOutReason::VoterWrongPrecinct => Screen::WrongPrecinct,
            LoggedOutReason::VoterCardExpired | LoggedOutReason::VoterCardVoided => {
                Screen::ExpiredCard
            }
            LoggedOutReason::VoterCardPrinted => Screen::UsedCard,
            LoggedOutReason::MachineNotConfigured => Screen::Unconfigured,
            LoggedOutReason::CardError => Screen::CardError,
            LoggedOutReason::NoCard => match session.post_voting_instructions {
                Some(instructions)
                    if session.is_polls_open && app_mode.is_mark() && app_mode.is_print() =>
                {
                    Screen::CastBallotInstructions { instructions }
                }
                _ => Screen::InsertCard,
            },
        },
        AuthState::LoggedIn {
            role: Role::PollWorker { .. },
        } => Screen::PollWorker,
        AuthState::LoggedIn { role } if session.is_polls_open => {
            if let Some(instructions) = session.post_voting_instructions {
                if app_mode.is_mark() && app_mode.is_print() {
                    return Screen::CastBallotInstructions { instructions };
                }
            }
            match role {
                Role::Voter { .. } if app_mode.is_print() && !app_mode.is_mark() => {
                    Screen::PrintOnly
                }
                Role::Voter { .. } => Screen::Ballot { cardless: false },
                Role::CardlessVoter { .. } => Screen::Ballot { cardless: true },
                _ => Screen::InsertCard,
            }
        }
        _ => Screen::InsertCard,
    }
}
