//! Card authentication
//!
//! The gate turns classified card contents plus the machine's configured
//! election and precinct into an `AuthState`:
//!
//! ```text
//! no card ──► LoggedOut{no_card}
//! card    ──► validate ──► LoggedOut{reason}
//!                     └──► CheckingPasscode ──► LoggedIn   (managers, admins)
//!                     └──► LoggedIn                        (poll workers, voters)
//! ```
//!
//! The gate is the only owner of the current role. Everything else reads it.

use crate::card::CardContents;
use crate::config::AuthConfig;
use crate::election::{sha256_hex, ElectionDefinition, PrecinctSelection};
use crate::error::{AuthError, StationError};
use chrono::{DateTime, Duration, Utc};

/// How far ahead of the station clock a card writer's clock may run
const MAX_CARD_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Who is using the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    SystemAdministrator,
    ElectionManager {
        election_hash: String,
    },
    PollWorker {
        election_hash: String,
    },
    Voter {
        precinct_id: String,
        ballot_style_id: String,
    },
    CardlessVoter {
        precinct_id: String,
        ballot_style_id: String,
    },
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SystemAdministrator => "system_administrator",
            Role::ElectionManager { .. } => "election_manager",
            Role::PollWorker { .. } => "poll_worker",
            Role::Voter { .. } => "voter",
            Role::CardlessVoter { .. } => "cardless_voter",
        }
    }

    /// Precinct and ballot style for either kind of voter
    pub fn voter_ballot(&self) -> Option<(&str, &str)> {
        match self {
            Role::Voter {
                precinct_id,
                ballot_style_id,
            }
            | Role::CardlessVoter {
                precinct_id,
                ballot_style_id,
            } => Some((precinct_id, ballot_style_id)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why nobody is logged in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoggedOutReason {
    NoCard,
    CardError,
    MachineNotConfigured,
    VoterWrongElection,
    PollWorkerWrongElection,
    ElectionManagerWrongElection,
    VoterWrongPrecinct,
    VoterCardExpired,
    VoterCardVoided,
    VoterCardPrinted,
}

impl LoggedOutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoggedOutReason::NoCard => "no_card",
            LoggedOutReason::CardError => "card_error",
            LoggedOutReason::MachineNotConfigured => "machine_not_configured",
            LoggedOutReason::VoterWrongElection => "voter_wrong_election",
            LoggedOutReason::PollWorkerWrongElection => "poll_worker_wrong_election",
            LoggedOutReason::ElectionManagerWrongElection => "election_manager_wrong_election",
            LoggedOutReason::VoterWrongPrecinct => "voter_wrong_precinct",
            LoggedOutReason::VoterCardExpired => "voter_card_expired",
            LoggedOutReason::VoterCardVoided => "voter_card_voided",
            LoggedOutReason::VoterCardPrinted => "voter_card_printed",
        }
    }
}

impl std::fmt::Display for LoggedOutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    LoggedOut {
        reason: LoggedOutReason,
    },
    CheckingPasscode {
        role: Role,
        attempts_remaining: u32,
    },
    LoggedIn {
        role: Role,
    },
}

impl AuthState {
    pub fn logged_out(reason: LoggedOutReason) -> Self {
        AuthState::LoggedOut { reason }
    }

    /// The logged-in role, if any
    pub fn role(&self) -> Option<&Role> {
        match self {
            AuthState::LoggedIn { role } => Some(role),
            _ => None,
        }
    }

    /// Short status string for external integrations
    pub fn status(&self) -> &'static str {
        match self {
            AuthState::LoggedOut { reason } => reason.as_str(),
            AuthState::CheckingPasscode { .. } => "checking_passcode",
            AuthState::LoggedIn { role } => role.as_str(),
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        AuthState::logged_out(LoggedOutReason::NoCard)
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthState::LoggedOut { reason } => write!(f, "Logged out ({})", reason),
            AuthState::CheckingPasscode {
                role,
                attempts_remaining,
            } => write!(
                f,
                "Checking passcode for {} ({} attempts left)",
                role, attempts_remaining
            ),
            AuthState::LoggedIn { role } => write!(f, "Logged in as {}", role),
        }
    }
}

/// Outcome of validating a card against the machine configuration
enum Validation {
    Valid { role: Role, passcode_hash: Option<String> },
    Invalid(LoggedOutReason),
}

pub struct AuthGate {
    voter_card_expiration: Duration,
    passcode_length: usize,
    max_passcode_attempts: u32,
    allow_election_managers_other_election: bool,
    allow_unconfigured_login: bool,

    state: AuthState,
    session_id: u64,
    expected_passcode_hash: Option<String>,
    entered_digits: String,
    /// Too many wrong passcodes; cleared when the card is removed
    locked_out: bool,
    /// User logged out with the card still inserted; cleared when the card is removed
    logged_out_with_card: bool,
    cardless_voter: Option<Role>,
}

impl AuthGate {
    pub fn new(config: &AuthConfig) -> Result<Self, StationError> {
        Ok(Self {
            voter_card_expiration: config.voter_card_expiration()?,
            passcode_length: config.passcode_length.max(1),
            max_passcode_attempts: config.max_passcode_attempts.max(1),
            allow_election_managers_other_election: config.allow_election_managers_other_election,
            allow_unconfigured_login: config.allow_unconfigured_login,
            state: AuthState::default(),
            session_id: 0,
            expected_passcode_hash: None,
            entered_digits: String::new(),
            locked_out: false,
            logged_out_with_card: false,
            cardless_voter: None,
        })
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Changes every time a login begins or ends. A write issued under one
    /// session id must not be acted on under another.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Digits typed so far in the passcode challenge
    pub fn passcode_digits_entered(&self) -> usize {
        self.entered_digits.len()
    }

    /// Recompute the auth state from the current card contents
    pub fn resolve(
        &mut self,
        contents: &CardContents,
        definition: Option<&ElectionDefinition>,
        app_precinct: Option<&PrecinctSelection>,
        now: DateTime<Utc>,
    ) -> AuthState {
        let next = match contents {
            CardContents::Empty => {
                self.locked_out = false;
                self.logged_out_with_card = false;
                match &self.cardless_voter {
                    Some(role) => AuthState::LoggedIn { role: role.clone() },
                    None => AuthState::logged_out(LoggedOutReason::NoCard),
                }
            }
            _ if self.locked_out => AuthState::logged_out(LoggedOutReason::CardError),
            _ if self.logged_out_with_card => AuthState::logged_out(LoggedOutReason::NoCard),
            CardContents::Unreadable | CardContents::ParseError => {
                AuthState::logged_out(LoggedOutReason::CardError)
            }
            _ => match self.validate(contents, definition, app_precinct, now) {
                Validation::Invalid(reason) => AuthState::logged_out(reason),
                Validation::Valid {
                    role,
                    passcode_hash,
                } => self.admit(role, passcode_hash),
            },
        };

        self.transition(next);
        self.state.clone()
    }

    fn validate(
        &self,
        contents: &CardContents,
        definition: Option<&ElectionDefinition>,
        app_precinct: Option<&PrecinctSelection>,
        now: DateTime<Utc>,
    ) -> Validation {
        use LoggedOutReason::*;

        match contents {
            CardContents::SystemAdministrator { passcode_hash } => Validation::Valid {
                role: Role::SystemAdministrator,
                passcode_hash: Some(passcode_hash.clone()),
            },
            CardContents::ElectionManager {
                election_hash,
                passcode_hash,
            } => {
                let allowed = match definition {
                    None => self.allow_unconfigured_login,
                    Some(def) if def.election_hash != *election_hash => {
                        if !self.allow_election_managers_other_election {
                            return Validation::Invalid(ElectionManagerWrongElection);
                        }
                        true
                    }
                    Some(_) => true,
                };
                if !allowed {
                    return Validation::Invalid(MachineNotConfigured);
                }
                Validation::Valid {
                    role: Role::ElectionManager {
                        election_hash: election_hash.clone(),
                    },
                    passcode_hash: Some(passcode_hash.clone()),
                }
            }
            CardContents::PollWorker { election_hash, .. } => match definition {
                None if !self.allow_unconfigured_login => Validation::Invalid(MachineNotConfigured),
                Some(def) if def.election_hash != *election_hash => {
                    Validation::Invalid(PollWorkerWrongElection)
                }
                _ => Validation::Valid {
                    role: Role::PollWorker {
                        election_hash: election_hash.clone(),
                    },
                    passcode_hash: None,
                },
            },
            CardContents::Voter { data, .. } => {
                let (Some(def), Some(app_precinct)) = (definition, app_precinct) else {
                    return Validation::Invalid(MachineNotConfigured);
                };
                if data
                    .election_hash
                    .as_ref()
                    .is_some_and(|hash| *hash != def.election_hash)
                {
                    return Validation::Invalid(VoterWrongElection);
                }
                if def.election.ballot_style(&data.ballot_style_id).is_none()
                    || def.election.precinct(&data.precinct_id).is_none()
                {
                    return Validation::Invalid(VoterWrongElection);
                }
                if !app_precinct.admits(&data.precinct_id) {
                    return Validation::Invalid(VoterWrongPrecinct);
                }
                if self.voter_card_expired(data.created_at, now) {
                    return Validation::Invalid(VoterCardExpired);
                }

                let role = Role::Voter {
                    precinct_id: data.precinct_id.clone(),
                    ballot_style_id: data.ballot_style_id.clone(),
                };
                // Printing happens mid-session; only a fresh insertion is refused
                if data.ballot_printed_at.is_some() && self.state.role() != Some(&role) {
                    return Validation::Invalid(VoterCardPrinted);
                }
                if data.voided_at.is_some() {
                    return Validation::Invalid(VoterCardVoided);
                }
                Validation::Valid {
                    role,
                    passcode_hash: None,
                }
            }
            CardContents::Empty | CardContents::Unreadable | CardContents::ParseError => {
                Validation::Invalid(CardError)
            }
        }
    }

    /// `created_at` comes off the card; anything unrepresentable or issued
    /// well in the future counts as expired
    fn voter_card_expired(&self, created_at: i64, now: DateTime<Utc>) -> bool {
        match now.timestamp().checked_sub(created_at) {
            None => true,
            Some(age) if age < -MAX_CARD_CLOCK_SKEW_SECS => true,
            Some(age) => age > self.voter_card_expiration.num_seconds(),
        }
    }

    /// Keep an existing login or challenge for the same role, otherwise start one
    fn admit(&mut self, role: Role, passcode_hash: Option<String>) -> AuthState {
        match &self.state {
            AuthState::LoggedIn { role: current } if *current == role => {
                return self.state.clone();
            }
            AuthState::CheckingPasscode { role: current, .. } if *current == role => {
                return self.state.clone();
            }
            _ => {}
        }

        match passcode_hash {
            Some(hash) => {
                self.expected_passcode_hash = Some(hash);
                self.entered_digits.clear();
                AuthState::CheckingPasscode {
                    role,
                    attempts_remaining: self.max_passcode_attempts,
                }
            }
            None => AuthState::LoggedIn { role },
        }
    }

    /// Enter one passcode digit. The code is checked once all digits are in.
    pub fn submit_passcode_digit(&mut self, digit: char) -> Result<AuthState, AuthError> {
        let AuthState::CheckingPasscode {
            role,
            attempts_remaining,
        } = &self.state
        else {
            return Err(AuthError::NotCheckingPasscode);
        };
        if !digit.is_ascii_digit() {
            return Err(AuthError::InvalidDigit(digit));
        }
        let (role, attempts_remaining) = (role.clone(), *attempts_remaining);

        self.entered_digits.push(digit);
        if self.entered_digits.len() < self.passcode_length {
            return Ok(self.state.clone());
        }

        let matches = self
            .expected_passcode_hash
            .as_deref()
            .is_some_and(|expected| sha256_hex(self.entered_digits.as_bytes()) == expected);
        self.entered_digits.clear();

        let next = if matches {
            tracing::info!("Passcode accepted for {}", role);
            self.expected_passcode_hash = None;
            AuthState::LoggedIn { role }
        } else if attempts_remaining <= 1 {
            tracing::warn!("Passcode rejected for {}, card locked out until removed", role);
            self.expected_passcode_hash = None;
            self.locked_out = true;
            AuthState::logged_out(LoggedOutReason::CardError)
        } else {
            tracing::warn!(
                "Passcode rejected for {}, {} attempts left",
                role,
                attempts_remaining - 1
            );
            AuthState::CheckingPasscode {
                role,
                attempts_remaining: attempts_remaining - 1,
            }
        };

        self.transition(next);
        Ok(self.state.clone())
    }

    /// End the current session. A card user stays logged out until the card is removed.
    pub fn log_out(&mut self) -> AuthState {
        match &self.state {
            AuthState::LoggedIn {
                role: Role::CardlessVoter { .. },
            } => {
                self.cardless_voter = None;
            }
            AuthState::LoggedIn { .. } | AuthState::CheckingPasscode { .. } => {
                self.logged_out_with_card = true;
            }
            AuthState::LoggedOut { .. } => return self.state.clone(),
        }
        self.expected_passcode_hash = None;
        self.entered_digits.clear();
        self.transition(AuthState::logged_out(LoggedOutReason::NoCard));
        self.state.clone()
    }

    /// Let a voter without a card use the machine once the poll worker's card is removed
    pub fn activate_cardless_voter(
        &mut self,
        precinct_id: &str,
        ballot_style_id: &str,
    ) -> Result<(), AuthError> {
        if !matches!(
            self.state,
            AuthState::LoggedIn {
                role: Role::PollWorker { .. }
            }
        ) {
            return Err(AuthError::NotPollWorker);
        }
        tracing::info!(
            "Cardless voter activated for precinct {}, ballot style {}",
            precinct_id,
            ballot_style_id
        );
        self.cardless_voter = Some(Role::CardlessVoter {
            precinct_id: precinct_id.to_string(),
            ballot_style_id: ballot_style_id.to_string(),
        });
        Ok(())
    }

    pub fn deactivate_cardless_voter(&mut self) -> AuthState {
        if self.cardless_voter.take().is_some() {
            tracing::info!("Cardless voter deactivated");
        }
        if matches!(
            self.state,
            AuthState::LoggedIn {
                role: Role::CardlessVoter { .. }
            }
        ) {
            self.transition(AuthState::logged_out(LoggedOutReason::NoCard));
        }
        self.state.clone()
    }

    pub fn has_cardless_voter(&self) -> bool {
        self.cardless_voter.is_some()
    }

    fn transition(&mut self, next: AuthState) {
        if next == self.state {
            return;
        }

        let was_logged_in = matches!(self.state, AuthState::LoggedIn { .. });
        let is_logged_in = matches!(next, AuthState::LoggedIn { .. });
        if was_logged_in || is_logged_in {
            self.session_id += 1;
        }

        match &next {
            AuthState::LoggedIn { role } => tracing::info!("Login: {}", role),
            AuthState::CheckingPasscode { role, .. } => {
                tracing::info!("Passcode required for {}", role)
            }
            AuthState::LoggedOut { reason } if was_logged_in => {
                tracing::info!("Logout: {}", reason)
            }
            AuthState::LoggedOut { reason } => tracing::debug!("Logged out: {}", reason),
        }

        self.state = next;
    }
}
