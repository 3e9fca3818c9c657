//! Station module - main event loop orchestration
//!
//! Coordinates card polling, authentication, the voting session, card
//! sync, device storage and operator/voter commands.

use crate::auth::{AuthGate, AuthState, Role};
use crate::ballot::{encode_ballot, CompletedBallot};
use crate::card::{self, classify, Card, CardContents};
use crate::clock::Clock;
use crate::config::Config;
use crate::election::{Candidate, Contest, ElectionDefinition, PrecinctSelection};
use crate::error::{AuthError, BallotCodecError, CardError, Result, StationError};
use crate::machine::MachineInfo;
use crate::screen::{select_screen, Screen};
use crate::session::{
    Action, PostVotingInstructions, SessionState, SessionStore, StoragePersistence, WriteOutcome,
};
use crate::storage::{self, KeyValueStorage};
use crate::sync::{read_votes_from_card, CardSyncEngine, PendingCardWrite, SyncWake};
use crate::tally::{PollWorkerCardTally, Tally};
use crate::votes::{validate_votes, BallotType, Vote, VotesDict, YesOrNo};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};

/// Write state to file for external integrations
fn write_state_file(path: &PathBuf, state: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create state file directory: {}", e);
            return;
        }
    }

    if let Err(e) = std::fs::write(path, state) {
        tracing::warn!("Failed to write state file: {}", e);
    } else {
        tracing::trace!("State file updated: {}", state);
    }
}

/// Remove state file on shutdown
fn cleanup_state_file(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove state file: {}", e);
        }
    }
}

/// User input delivered to the station
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationCommand {
    /// Digits typed on the passcode keypad
    Passcode(String),
    LogOut,
    /// Choices are candidate ids, `write-in:<name>`, `yes` or `no`. No
    /// choices clears the contest.
    Vote {
        contest_id: String,
        choices: Vec<String>,
    },
    ForceSaveVote,
    PrintBallot,
    VoidBallot,
    HidePostVotingInstructions,
    ActivateCardlessVoter {
        precinct_id: String,
        ballot_style_id: String,
    },
    DeactivateCardlessVoter,
    UpdateAppPrecinct(PrecinctSelection),
    ToggleLiveMode,
    EnableLiveMode,
    TogglePollsOpen,
    /// The scanner report on the poll worker card has been printed
    ScannerReportPrinted,
    LoadElectionFromCard,
    Unconfigure,
    Status,
}

impl StationCommand {
    /// Parse one line of the command protocol, e.g. `vote president barchi-hallaren`
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let missing = |what: &str| StationError::Command(format!("'{}' needs {}", word, what));

        let command = match word {
            "passcode" | "digit" => {
                if rest.is_empty() {
                    return Err(missing("digits"));
                }
                StationCommand::Passcode(rest.to_string())
            }
            "logout" => StationCommand::LogOut,
            "vote" => {
                let (contest_id, choices) =
                    rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if contest_id.is_empty() {
                    return Err(missing("a contest id"));
                }
                StationCommand::Vote {
                    contest_id: contest_id.to_string(),
                    choices: choices
                        .split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(String::from)
                        .collect(),
                }
            }
            "save" => StationCommand::ForceSaveVote,
            "print" => StationCommand::PrintBallot,
            "void" => StationCommand::VoidBallot,
            "done" => StationCommand::HidePostVotingInstructions,
            "cardless" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
                [precinct_id, ballot_style_id] => StationCommand::ActivateCardlessVoter {
                    precinct_id: precinct_id.to_string(),
                    ballot_style_id: ballot_style_id.to_string(),
                },
                _ => return Err(missing("a precinct id and a ballot style id")),
            },
            "end-cardless" => StationCommand::DeactivateCardlessVoter,
            "precinct" => match rest {
                "" => return Err(missing("a precinct id or 'all'")),
                "all" => StationCommand::UpdateAppPrecinct(PrecinctSelection::AllPrecincts),
                id => StationCommand::UpdateAppPrecinct(PrecinctSelection::single(id)),
            },
            "live" => StationCommand::ToggleLiveMode,
            "enable-live" => StationCommand::EnableLiveMode,
            "polls" => StationCommand::TogglePollsOpen,
            "report-printed" => StationCommand::ScannerReportPrinted,
            "load-election" => StationCommand::LoadElectionFromCard,
            "unconfigure" => StationCommand::Unconfigure,
            "status" => StationCommand::Status,
            "" => return Err(StationError::Command("empty command".to_string())),
            other => return Err(StationError::Command(format!("unknown command '{}'", other))),
        };
        Ok(command)
    }
}

/// Turn command-line choices into a vote for one contest
fn vote_from_choices(
    definition: &ElectionDefinition,
    ballot_style_id: &str,
    contest_id: &str,
    choices: &[String],
) -> std::result::Result<Option<Vote>, BallotCodecError> {
    if choices.is_empty() {
        return Ok(None);
    }
    let election = &definition.election;
    let unknown_contest = || BallotCodecError::UnknownContest {
        contest_id: contest_id.to_string(),
        ballot_style_id: ballot_style_id.to_string(),
    };
    let ballot_style = election
        .ballot_style(ballot_style_id)
        .ok_or_else(|| BallotCodecError::UnknownBallotStyle(ballot_style_id.to_string()))?;
    let contest = election
        .contests_for(ballot_style)
        .into_iter()
        .find(|c| c.vote_ids().contains(&contest_id))
        .ok_or_else(unknown_contest)?;

    let vote = match contest {
        Contest::Candidate(c) => Vote::Candidate(
            choices
                .iter()
                .map(|choice| match choice.strip_prefix("write-in:") {
                    Some(name) => Ok(Candidate::write_in(name)),
                    None => c
                        .candidates
                        .iter()
                        .find(|cand| cand.id == *choice)
                        .cloned()
                        .ok_or_else(|| BallotCodecError::UnknownCandidate {
                            contest_id: c.id.clone(),
                            candidate_id: choice.clone(),
                        }),
                })
                .collect::<std::result::Result<_, _>>()?,
        ),
        Contest::Yesno(_) | Contest::MsEitherNeither(_) => Vote::YesNo(
            choices
                .iter()
                .map(|choice| match choice.as_str() {
                    "yes" => Ok(YesOrNo::Yes),
                    "no" => Ok(YesOrNo::No),
                    _ => Err(BallotCodecError::VoteTypeMismatch(contest_id.to_string())),
                })
                .collect::<std::result::Result<_, _>>()?,
        ),
    };

    let mut single = VotesDict::new();
    single.insert(contest_id.to_string(), vote.clone());
    validate_votes(election, ballot_style_id, &single)?;
    Ok(Some(vote))
}

/// Precinct scanner results carried on a poll worker card
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerReport {
    pub payload: PollWorkerCardTally,
    /// All parties and precincts combined
    pub tally: Tally,
}

/// Main station that owns auth, session and card sync
pub struct Station {
    config: Config,
    card: Arc<dyn Card>,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn KeyValueStorage>,
    gate: AuthGate,
    store: SessionStore,
    engine: CardSyncEngine,
    sync_wake: Arc<Notify>,
    contents: CardContents,
    scanner_report: Option<ScannerReport>,
    /// Session whose poll worker card has already been read
    scanner_report_session: Option<u64>,
    state_file_path: Option<PathBuf>,
    last_reported: Option<String>,
    write_done_tx: mpsc::UnboundedSender<(PendingCardWrite, std::result::Result<(), CardError>)>,
    write_done_rx: mpsc::UnboundedReceiver<(PendingCardWrite, std::result::Result<(), CardError>)>,
}

impl Station {
    pub fn new(
        config: Config,
        card: Arc<dyn Card>,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Result<Self> {
        let gate = AuthGate::new(&config.auth)?;
        let sync_wake = Arc::new(Notify::new());
        let mut store = SessionStore::new();
        store.subscribe(Box::new(StoragePersistence::new(Arc::clone(&storage))));
        store.subscribe(Box::new(SyncWake::new(Arc::clone(&sync_wake))));

        let (write_done_tx, write_done_rx) = mpsc::unbounded_channel();

        Ok(Self {
            gate,
            engine: CardSyncEngine::new(config.card.write_delay()),
            state_file_path: config.resolve_state_file(),
            config,
            card,
            clock,
            storage,
            store,
            sync_wake,
            contents: CardContents::Empty,
            scanner_report: None,
            scanner_report_session: None,
            last_reported: None,
            write_done_tx,
            write_done_rx,
        })
    }

    pub fn auth(&self) -> &AuthState {
        self.gate.state()
    }

    pub fn session(&self) -> &SessionState {
        self.store.state()
    }

    pub fn screen(&self) -> Screen {
        select_screen(self.gate.state(), self.store.state())
    }

    /// Scanner results from the logged-in poll worker's card, if it had any
    pub fn scanner_report(&self) -> Option<&ScannerReport> {
        self.scanner_report.as_ref()
    }

    /// Restore device storage and machine identity
    pub fn initialize(&mut self, machine: MachineInfo) {
        self.store.dispatch(Action::SetMachineConfig(machine));

        let definition = storage::load_election_definition(self.storage.as_ref())
            .unwrap_or_else(|e| {
                tracing::warn!("Ignoring stored election definition: {}", e);
                None
            });
        let stored = storage::load_app_state(self.storage.as_ref()).unwrap_or_else(|e| {
            tracing::warn!("Ignoring stored station state: {}", e);
            Default::default()
        });

        if let Some(ref def) = definition {
            tracing::info!("Loaded election '{}' ({})", def.election.title, def.election_hash);
        }
        self.store.dispatch(Action::InitializeAppState {
            election_definition: definition.map(Box::new),
            stored,
        });
        self.report();
    }

    /// Read the card and update auth and session to match
    pub async fn poll_card(&mut self) {
        match self.card.read_summary().await {
            Ok(summary) => self.contents = classify(&summary),
            // Transient read failures leave everything as it was
            Err(e) => {
                tracing::debug!("Card read failed on {}: {}", self.card.name(), e);
                return;
            }
        }
        self.resolve_auth();
        self.restore_votes().await;
        self.load_scanner_report().await;
        self.report();
    }

    fn resolve_auth(&mut self) {
        let was_voter = self.gate.state().role().is_some_and(|r| r.voter_ballot().is_some());
        let state = self.store.state();
        let now = self.clock.now();
        self.gate.resolve(
            &self.contents,
            state.election_definition.as_ref(),
            state.app_precinct.as_ref(),
            now,
        );

        let is_voter = self.gate.state().role().is_some_and(|r| r.voter_ballot().is_some());
        let no_card = matches!(
            self.gate.state(),
            AuthState::LoggedOut {
                reason: crate::auth::LoggedOutReason::NoCard
            }
        );
        if (was_voter && !is_voter) || (no_card && self.store.state().votes.is_some()) {
            let instructions = self.store.state().post_voting_instructions;
            self.store.dispatch(Action::ResetBallot(instructions));
        }
    }

    /// Load the ballot a voter card carries, once per session
    async fn restore_votes(&mut self) {
        let (
            AuthState::LoggedIn {
                role:
                    Role::Voter {
                        precinct_id,
                        ballot_style_id,
                    },
            },
            CardContents::Voter {
                has_stored_data: true,
                ..
            },
        ) = (self.gate.state(), &self.contents)
        else {
            return;
        };
        let state = self.store.state();
        let Some(definition) = state.election_definition.as_ref() else {
            return;
        };
        if state.votes.is_some() || state.writing_vote_to_card {
            return;
        }

        let session_id = self.gate.session_id();
        match read_votes_from_card(
            self.card.as_ref(),
            definition,
            precinct_id,
            ballot_style_id,
        )
        .await
        {
            Ok(votes) if self.gate.session_id() == session_id => {
                self.store.dispatch(Action::LoadVotesFromVoterCard(votes));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Could not read voter card ballot: {}", e),
        }
    }

    /// Read the tally a poll worker card carries, once per session
    async fn load_scanner_report(&mut self) {
        if !matches!(self.logged_in_role(), Some(Role::PollWorker { .. })) {
            self.scanner_report = None;
            self.scanner_report_session = None;
            return;
        }
        let session_id = self.gate.session_id();
        if self.scanner_report_session == Some(session_id)
            || !matches!(
                self.contents,
                CardContents::PollWorker {
                    has_stored_data: true,
                    ..
                }
            )
        {
            return;
        }

        self.scanner_report_session = Some(session_id);
        match self.read_scanner_report().await {
            Ok(report) if self.gate.session_id() == session_id => {
                tracing::info!(
                    "Scanner {} reports {} ballots, polls transition '{}'",
                    report.payload.machine_id,
                    report.tally.number_of_ballots_counted,
                    report.payload.polls_transition
                );
                self.scanner_report = Some(report);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Ignoring tally on poll worker card: {}", e),
        }
    }

    async fn read_scanner_report(&self) -> Result<ScannerReport> {
        let data = self
            .card
            .read_stored_string()
            .await?
            .ok_or(CardError::Malformed("card has no tally".into()))?;
        let payload = PollWorkerCardTally::from_json(&data)?;
        let Some(definition) = self.store.state().election_definition.as_ref() else {
            return Err(self.not_permitted("reading a scanner tally"));
        };
        let tally = payload.combined_tally(&definition.election, None)?;
        Ok(ScannerReport { payload, tally })
    }

    /// Start a card write in the background if one is due
    pub fn run_sync(&mut self) {
        let now = self.clock.now();
        let Some(pending) = self.engine.begin(&self.gate, &mut self.store, now) else {
            return;
        };
        let card = Arc::clone(&self.card);
        let done = self.write_done_tx.clone();
        tokio::spawn(async move {
            let result = card.write_stored_data(&pending.bytes).await;
            let _ = done.send((pending, result));
        });
    }

    fn finish_write(
        &mut self,
        pending: PendingCardWrite,
        result: std::result::Result<(), CardError>,
    ) -> WriteOutcome {
        self.engine
            .complete(&self.gate, &mut self.store, &pending, result)
    }

    /// Wait for an in-flight card write to finish
    pub async fn drain_write(&mut self) {
        while self.store.state().writing_vote_to_card {
            match self.write_done_rx.recv().await {
                Some((pending, result)) => {
                    self.finish_write(pending, result);
                }
                None => break,
            }
        }
    }

    /// Run a sync cycle to completion
    pub async fn sync_now(&mut self) -> Option<WriteOutcome> {
        self.drain_write().await;
        let now = self.clock.now();
        self.engine
            .tick(self.card.as_ref(), &self.gate, &mut self.store, now)
            .await
    }

    fn not_permitted(&self, action: &'static str) -> StationError {
        AuthError::NotPermitted {
            action,
            status: self.gate.state().status(),
        }
        .into()
    }

    fn logged_in_role(&self) -> Option<&Role> {
        self.gate.state().role()
    }

    fn require_poll_worker(&self, action: &'static str) -> Result<()> {
        match self.logged_in_role() {
            Some(Role::PollWorker { .. }) => Ok(()),
            _ => Err(self.not_permitted(action)),
        }
    }

    fn require_election_manager(&self, action: &'static str) -> Result<()> {
        match self.logged_in_role() {
            Some(Role::ElectionManager { .. }) => Ok(()),
            _ => Err(self.not_permitted(action)),
        }
    }

    /// Carry out one command
    pub async fn handle_command(&mut self, command: StationCommand) -> Result<()> {
        tracing::debug!("Command: {:?}", command);
        let result = self.apply_command(command).await;
        // Passcode and logout change auth without a card change
        self.resolve_auth();
        self.load_scanner_report().await;
        self.report();
        result
    }

    async fn apply_command(&mut self, command: StationCommand) -> Result<()> {
        match command {
            StationCommand::Passcode(digits) => {
                for digit in digits.chars() {
                    self.gate.submit_passcode_digit(digit)?;
                }
            }
            StationCommand::LogOut => {
                self.gate.log_out();
            }
            StationCommand::Vote {
                contest_id,
                choices,
            } => {
                let Some((_, ballot_style_id)) =
                    self.logged_in_role().and_then(|r| r.voter_ballot())
                else {
                    return Err(self.not_permitted("voting"));
                };
                let state = self.store.state();
                if !state.is_polls_open {
                    return Err(self.not_permitted("voting with polls closed"));
                }
                if state.post_voting_instructions.is_some() {
                    return Err(self.not_permitted("voting after printing"));
                }
                let Some(definition) = state.election_definition.as_ref() else {
                    return Err(self.not_permitted("voting"));
                };
                let vote = vote_from_choices(definition, ballot_style_id, &contest_id, &choices)?;
                let at = self.clock.now();
                self.store.dispatch(Action::UpdateVote {
                    contest_id,
                    vote,
                    at,
                });
            }
            StationCommand::ForceSaveVote => {
                self.store.dispatch(Action::ForceSaveVote);
            }
            StationCommand::PrintBallot => {
                let bytes = self.record_printed_ballot().await?;
                tracing::info!("Ballot printed: {}", hex::encode(bytes));
            }
            StationCommand::VoidBallot => self.void_ballot().await?,
            StationCommand::HidePostVotingInstructions => {
                if matches!(self.logged_in_role(), Some(Role::CardlessVoter { .. })) {
                    self.gate.log_out();
                }
                self.store.dispatch(Action::ResetBallot(None));
            }
            StationCommand::ActivateCardlessVoter {
                precinct_id,
                ballot_style_id,
            } => {
                let known = self.store.state().election_definition.as_ref().is_some_and(|def| {
                    def.election.ballot_style(&ballot_style_id).is_some()
                        && def.election.precinct(&precinct_id).is_some()
                });
                if !known {
                    return Err(StationError::Command(format!(
                        "no ballot style '{}' for precinct '{}'",
                        ballot_style_id, precinct_id
                    )));
                }
                self.gate
                    .activate_cardless_voter(&precinct_id, &ballot_style_id)?;
                self.store.dispatch(Action::ResetBallot(None));
            }
            StationCommand::DeactivateCardlessVoter => {
                self.require_poll_worker("ending a cardless voter session")?;
                self.gate.deactivate_cardless_voter();
                self.store.dispatch(Action::ResetBallot(None));
            }
            StationCommand::UpdateAppPrecinct(precinct) => {
                self.require_election_manager("changing the precinct")?;
                self.store.dispatch(Action::UpdateAppPrecinct(precinct));
            }
            StationCommand::ToggleLiveMode => {
                self.require_election_manager("toggling live mode")?;
                self.store.dispatch(Action::ToggleLiveMode);
            }
            StationCommand::EnableLiveMode => {
                self.require_poll_worker("enabling live mode")?;
                self.store.dispatch(Action::EnableLiveMode);
            }
            StationCommand::TogglePollsOpen => {
                self.require_poll_worker("opening or closing polls")?;
                self.store.dispatch(Action::TogglePollsOpen);
            }
            StationCommand::ScannerReportPrinted => {
                self.require_poll_worker("printing a scanner report")?;
                let Some(polls_open) = self.scanner_report.as_ref().map(|r| r.payload.polls_open())
                else {
                    return Err(StationError::Command("no scanner report on this card".into()));
                };
                self.card.clear_stored_data().await?;
                self.scanner_report = None;
                if self.store.state().is_polls_open != polls_open {
                    tracing::info!(
                        "{} polls to match the precinct scanner",
                        if polls_open { "Opening" } else { "Closing" }
                    );
                    self.store.dispatch(Action::TogglePollsOpen);
                }
            }
            StationCommand::LoadElectionFromCard => {
                self.require_election_manager("loading an election")?;
                let data = self
                    .card
                    .read_stored_string()
                    .await?
                    .ok_or(CardError::Malformed("card has no election definition".into()))?;
                let definition = ElectionDefinition::from_json(&data)?;
                tracing::info!(
                    "Configured for election '{}' ({})",
                    definition.election.title,
                    definition.election_hash
                );
                self.store
                    .dispatch(Action::UpdateElectionDefinition(Box::new(definition)));
            }
            StationCommand::Unconfigure => {
                match self.logged_in_role() {
                    Some(Role::SystemAdministrator | Role::ElectionManager { .. }) => {}
                    _ => return Err(self.not_permitted("unconfiguring")),
                }
                tracing::info!("Unconfiguring station");
                self.store.dispatch(Action::Unconfigure);
            }
            StationCommand::Status => {
                let state = self.store.state();
                tracing::info!(
                    "{} | screen {} | precinct {:?} | live {} | polls open {} | printed {}",
                    self.gate.state(),
                    self.screen(),
                    state.app_precinct,
                    state.is_live_mode,
                    state.is_polls_open,
                    state.ballots_printed_count
                );
            }
        }
        Ok(())
    }

    /// Finish the current voter's ballot: mark the card printed, count it and
    /// reset the session. Returns the encoded ballot for printing.
    pub async fn record_printed_ballot(&mut self) -> Result<Vec<u8>> {
        let Some((precinct_id, ballot_style_id)) = self
            .logged_in_role()
            .and_then(|r| r.voter_ballot())
            .map(|(p, b)| (p.to_string(), b.to_string()))
        else {
            return Err(self.not_permitted("printing a ballot"));
        };
        if !self.store.state().is_polls_open {
            return Err(self.not_permitted("printing with polls closed"));
        }
        if self.store.state().post_voting_instructions.is_some() {
            return Err(self.not_permitted("printing a second ballot"));
        }

        // Let any in-flight write land before the card is stamped
        self.drain_write().await;

        let state = self.store.state();
        let Some(definition) = state.election_definition.as_ref() else {
            return Err(self.not_permitted("printing a ballot"));
        };
        let ballot = CompletedBallot {
            election_hash: definition.election_hash.clone(),
            ballot_style_id,
            precinct_id,
            votes: state.votes.clone().unwrap_or_default(),
            is_test_mode: !state.is_live_mode,
            ballot_type: BallotType::Standard,
        };
        let bytes = encode_ballot(definition, &ballot)?;

        let instructions = match (&self.contents, self.logged_in_role()) {
            (CardContents::Voter { data, .. }, Some(Role::Voter { .. })) => {
                card::mark_printed(self.card.as_ref(), data, self.clock.now()).await?;
                PostVotingInstructions::Card
            }
            _ => PostVotingInstructions::Cardless,
        };

        self.store.dispatch(Action::UpdateTally);
        self.store.dispatch(Action::ResetBallot(Some(instructions)));
        tracing::info!(
            "Ballot recorded ({} printed)",
            self.store.state().ballots_printed_count
        );
        Ok(bytes)
    }

    /// Abandon the current voter's ballot
    pub async fn void_ballot(&mut self) -> Result<()> {
        let card_data = match (&self.contents, self.logged_in_role()) {
            (_, Some(Role::CardlessVoter { .. })) => None,
            (CardContents::Voter { data, .. }, Some(Role::Voter { .. })) => Some(data.clone()),
            _ => return Err(self.not_permitted("voiding a ballot")),
        };
        match card_data {
            Some(data) => {
                self.drain_write().await;
                card::mark_voided(self.card.as_ref(), &data, self.clock.now()).await?;
            }
            None => {
                self.gate.log_out();
            }
        }
        tracing::info!("Ballot voided");
        self.store.dispatch(Action::ResetBallot(None));
        Ok(())
    }

    /// Update the state file when the visible screen changes
    fn report(&mut self) {
        let screen = self.screen().to_string();
        if self.last_reported.as_deref() == Some(screen.as_str()) {
            return;
        }
        tracing::debug!("Screen: {}", screen);
        if let Some(ref path) = self.state_file_path {
            write_state_file(path, &screen);
        }
        self.last_reported = Some(screen);
    }

    /// Run the station main loop
    pub async fn run(&mut self, mut commands: mpsc::Receiver<StationCommand>) -> Result<()> {
        tracing::info!("Starting markstation on {} card", self.card.name());

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            StationError::Config(format!("Failed to set up SIGTERM handler: {}", e))
        })?;

        if let Some(ref path) = self.state_file_path {
            tracing::info!("State file: {:?}", path);
        }

        let mut poll = tokio::time::interval(self.config.card.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sync = tokio::time::interval(self.config.card.poll_interval());
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let wake = Arc::clone(&self.sync_wake);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.poll_card().await;
                }

                _ = sync.tick() => {
                    self.run_sync();
                }

                _ = wake.notified() => {
                    self.run_sync();
                }

                Some((pending, result)) = self.write_done_rx.recv() => {
                    self.finish_write(pending, result);
                }

                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            if let Err(e) = self.handle_command(command).await {
                                tracing::warn!("{}", e);
                            }
                        }
                        None => {
                            tracing::debug!("Command input closed");
                            commands_open = false;
                        }
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down...");
                    break;
                }

                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down...");
                    break;
                }
            }
        }

        // Never leave a half-written card behind
        self.drain_write().await;

        if let Some(ref path) = self.state_file_path {
            cleanup_state_file(path);
        }

        tracing::info!("Station stopped");
        Ok(())
    }
}
