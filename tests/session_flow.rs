//! End-to-end station tests driven through an in-memory card
//!
//! Time only moves when a test advances the manual clock, and card writes
//! happen inline via `sync_now`, so every run is deterministic.

use chrono::{DateTime, Duration, TimeZone, Utc};
use markstation::auth::{AuthState, LoggedOutReason, Role};
use markstation::ballot::{decode_ballot, encode_ballot, CompletedBallot};
use markstation::card::memory::MemoryCard;
use markstation::card::{
    classify, Card, CardContents, CardData, ElectionManagerCardData, PollWorkerCardData,
    VoterCardData,
};
use markstation::clock::{Clock, ManualClock};
use markstation::config::Config;
use markstation::election::{sha256_hex, ElectionDefinition, PrecinctSelection};
use markstation::error::{AuthError, StationError};
use markstation::machine::{AppMode, MachineInfo};
use markstation::screen::Screen;
use markstation::session::{PostVotingInstructions, WriteOutcome};
use markstation::storage::{self, MemoryStorage, StoredAppState};
use markstation::tally::{VotingMethod, YES_OPTION_ID};
use markstation::votes::{BallotType, Vote, VotesDict};
use markstation::{Station, StationCommand};
use std::path::PathBuf;
use std::sync::Arc;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn election_json() -> String {
    std::fs::read_to_string(fixtures_dir().join("election.json"))
        .unwrap_or_else(|e| panic!("Failed to read election fixture: {}", e))
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 11, 5, 8, 0, 0).unwrap()
}

struct Harness {
    station: Station,
    card: Arc<MemoryCard>,
    clock: Arc<ManualClock>,
    storage: Arc<MemoryStorage>,
    definition: ElectionDefinition,
}

impl Harness {
    fn new(stored: Option<StoredAppState>, machine: MachineInfo) -> Self {
        let definition = ElectionDefinition::from_json(&election_json()).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        if let Some(stored) = stored {
            storage::save_election_definition(storage.as_ref(), Some(&definition)).unwrap();
            storage::save_app_state(storage.as_ref(), &stored).unwrap();
        }

        let mut config = Config::default();
        config.state_file = None;

        let card = Arc::new(MemoryCard::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let mut station =
            Station::new(config, card.clone(), clock.clone(), storage.clone()).unwrap();
        station.initialize(machine);

        Self {
            station,
            card,
            clock,
            storage,
            definition,
        }
    }

    /// Election loaded, precinct p1, polls open
    fn open_polls() -> Self {
        Self::new(
            Some(StoredAppState {
                app_precinct: Some(PrecinctSelection::single("p1")),
                ballots_printed_count: 0,
                is_live_mode: true,
                is_polls_open: true,
            }),
            MachineInfo::default(),
        )
    }

    fn voter_card(&self, precinct_id: &str, created_at: DateTime<Utc>) -> VoterCardData {
        VoterCardData {
            created_at: created_at.timestamp(),
            ballot_style_id: "1".into(),
            precinct_id: precinct_id.into(),
            election_hash: Some(self.definition.election_hash.clone()),
            voided_at: None,
            ballot_printed_at: None,
            updated_at: None,
            mark_machine_id: None,
        }
    }

    async fn insert(&mut self, data: CardData, long_value: Option<Vec<u8>>) {
        self.card.insert(&data, long_value);
        self.station.poll_card().await;
    }

    async fn remove(&mut self) {
        self.card.remove();
        self.station.poll_card().await;
    }

    async fn run(&mut self, line: &str) -> markstation::Result<()> {
        let command = StationCommand::parse_line(line)?;
        self.station.handle_command(command).await
    }

    fn card_votes(&self) -> VotesDict {
        let bytes = self.card.long_value().expect("card has a ballot");
        decode_ballot(&self.definition, &bytes).unwrap().votes
    }

    fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn card_data(&self) -> VoterCardData {
        match classify(&self.card.read_summary().await.unwrap()) {
            CardContents::Voter { data, .. } => data,
            other => panic!("expected voter card, got {:?}", other),
        }
    }
}

/// Tally a precinct scanner leaves on a poll worker card for precinct p1
fn scanner_tally(polls_transition: &str) -> Vec<u8> {
    serde_json::json!({
        "tallyMachineType": "precinct_scanner",
        "tally": [
            [1, 0, 10, 4, 3, 1, 1],
            [2, 1, 10, 5, 6, 7, 2, 3],
            [1, 0, 10, 6, 3],
            [5, 3, 1, 1, 4, 4, 2, 0, 10],
            [0, 0, 4, 3, 1]
        ],
        "totalBallotsScanned": 10,
        "machineId": "0042",
        "timeSaved": 1_730_800_000_000i64,
        "timePollsTransitioned": 1_730_800_000_000i64,
        "precinctSelection": { "kind": "SinglePrecinct", "precinctId": "p1" },
        "isLiveMode": true,
        "pollsTransition": polls_transition,
        "ballotCounts": { "undefined,p1": [4, 6] }
    })
    .to_string()
    .into_bytes()
}

fn logged_out(reason: LoggedOutReason) -> AuthState {
    AuthState::logged_out(reason)
}

fn candidate_ids(vote: &Vote) -> Vec<&str> {
    match vote {
        Vote::Candidate(candidates) => candidates.iter().map(|c| c.id.as_str()).collect(),
        other => panic!("expected candidate vote, got {:?}", other),
    }
}

#[tokio::test]
async fn voter_card_checks_then_debounced_save() {
    let mut h = Harness::open_polls();

    let mut other_election = h.voter_card("p1", t0());
    other_election.election_hash = Some("e2".repeat(32));
    h.insert(CardData::Voter(other_election), None).await;
    assert_eq!(
        *h.station.auth(),
        logged_out(LoggedOutReason::VoterWrongElection)
    );
    assert_eq!(h.station.screen(), Screen::WrongElection { voter_card: true });

    h.insert(CardData::Voter(h.voter_card("p2", t0())), None)
        .await;
    assert_eq!(
        *h.station.auth(),
        logged_out(LoggedOutReason::VoterWrongPrecinct)
    );
    assert_eq!(h.station.screen(), Screen::WrongPrecinct);

    h.insert(CardData::Voter(h.voter_card("p1", t0())), None)
        .await;
    assert!(matches!(
        h.station.auth(),
        AuthState::LoggedIn {
            role: Role::Voter { .. }
        }
    ));
    assert_eq!(h.station.screen(), Screen::Ballot { cardless: false });

    h.run("vote president barchi-hallaren").await.unwrap();
    assert_eq!(h.station.sync_now().await, None);

    h.clock.advance(Duration::milliseconds(999));
    assert_eq!(h.station.sync_now().await, None);
    assert_eq!(h.card.write_count(), 0);

    h.clock.advance(Duration::milliseconds(1));
    assert_eq!(h.station.sync_now().await, Some(WriteOutcome::Saved));
    assert_eq!(h.station.sync_now().await, None);
    assert_eq!(h.card.write_count(), 1);

    let votes = h.card_votes();
    assert_eq!(candidate_ids(&votes["president"]), vec!["barchi-hallaren"]);
    assert!(!h.station.session().has_unsaved_votes());
}

#[tokio::test]
async fn votes_made_in_quick_succession_are_written_once() {
    let mut h = Harness::open_polls();
    h.insert(CardData::Voter(h.voter_card("p1", t0())), None)
        .await;

    for line in [
        "vote city-council eagle",
        "vote city-council eagle,rangel",
        "vote question-a yes",
        "vote city-council eagle,rangel,write-in:ada lovelace",
    ] {
        h.run(line).await.unwrap();
        h.clock.advance(Duration::milliseconds(300));
        assert_eq!(h.station.sync_now().await, None);
    }

    h.clock.advance(Duration::milliseconds(700));
    assert_eq!(h.station.sync_now().await, Some(WriteOutcome::Saved));
    assert_eq!(h.card.write_count(), 1);

    let votes = h.card_votes();
    assert_eq!(
        candidate_ids(&votes["city-council"]),
        vec!["eagle", "rangel", "write-in-ada-lovelace"]
    );
    assert_eq!(votes["question-a"], Vote::yes());
}

#[tokio::test]
async fn forced_save_skips_the_quiet_period() {
    let mut h = Harness::open_polls();
    h.insert(CardData::Voter(h.voter_card("p1", t0())), None)
        .await;

    h.run("save").await.unwrap();
    assert_eq!(h.station.sync_now().await, Some(WriteOutcome::Saved));
    assert!(h.card_votes().is_empty());

    h.run("vote question-a no").await.unwrap();
    h.run("save").await.unwrap();
    assert_eq!(h.station.sync_now().await, Some(WriteOutcome::Saved));
    assert_eq!(h.card_votes()["question-a"], Vote::no());
    assert_eq!(h.card.write_count(), 2);
}

#[tokio::test]
async fn reinserted_card_restores_its_ballot() {
    let mut h = Harness::open_polls();
    let mut votes = VotesDict::new();
    votes.insert("question-a".into(), Vote::no());
    let ballot = CompletedBallot {
        election_hash: h.definition.election_hash.clone(),
        ballot_style_id: "1".into(),
        precinct_id: "p1".into(),
        votes: votes.clone(),
        is_test_mode: false,
        ballot_type: BallotType::Standard,
    };
    let bytes = encode_ballot(&h.definition, &ballot).unwrap();

    h.insert(CardData::Voter(h.voter_card("p1", t0())), Some(bytes))
        .await;
    assert_eq!(h.station.session().votes.as_ref(), Some(&votes));

    // Restored votes are already on the card
    h.clock.advance(Duration::seconds(5));
    assert_eq!(h.station.sync_now().await, None);
    assert_eq!(h.card.write_count(), 0);

    h.remove().await;
    assert_eq!(*h.station.auth(), logged_out(LoggedOutReason::NoCard));
    assert!(h.station.session().votes.is_none());
}

#[tokio::test]
async fn garbage_on_the_card_starts_a_fresh_ballot() {
    let mut h = Harness::open_polls();
    h.insert(
        CardData::Voter(h.voter_card("p1", t0())),
        Some(vec![0xde, 0xad, 0xbe, 0xef]),
    )
    .await;

    assert_eq!(h.station.session().votes, Some(VotesDict::new()));
    assert_eq!(h.station.screen(), Screen::Ballot { cardless: false });
}

#[tokio::test]
async fn expired_card_is_refused() {
    let mut h = Harness::open_polls();

    let issued = t0() - Duration::seconds(60 * 60 + 1);
    h.insert(CardData::Voter(h.voter_card("p1", issued)), None)
        .await;
    assert_eq!(
        *h.station.auth(),
        logged_out(LoggedOutReason::VoterCardExpired)
    );
    assert_eq!(h.station.screen(), Screen::ExpiredCard);

    h.insert(CardData::Voter(h.voter_card("p1", t0())), None)
        .await;
    assert!(h.station.auth().role().is_some());
}

#[tokio::test]
async fn printing_stamps_the_card_and_counts_the_ballot() {
    let mut h = Harness::new(
        Some(StoredAppState {
            app_precinct: Some(PrecinctSelection::single("p1")),
            ballots_printed_count: 3,
            is_live_mode: true,
            is_polls_open: true,
        }),
        MachineInfo {
            app_mode: AppMode::MarkAndPrint,
            ..MachineInfo::default()
        },
    );
    h.insert(CardData::Voter(h.voter_card("p1", t0())), None)
        .await;
    h.run("vote president cramer-vuocolo").await.unwrap();
    h.run("save").await.unwrap();
    h.station.sync_now().await;
    assert!(h.card.long_value().is_some());

    h.clock.advance(Duration::minutes(2));
    let printed = h.station.record_printed_ballot().await.unwrap();
    let ballot = decode_ballot(&h.definition, &printed).unwrap();
    assert_eq!(candidate_ids(&ballot.votes["president"]), vec!["cramer-vuocolo"]);
    assert!(!ballot.is_test_mode);

    let stamped = h.card_data().await;
    assert_eq!(stamped.ballot_printed_at, Some(h.clock_now().timestamp()));
    assert!(h.card.long_value().is_none());

    let session = h.station.session();
    assert_eq!(session.ballots_printed_count, 4);
    assert!(session.votes.is_none());
    assert_eq!(
        storage::load_app_state(h.storage.as_ref())
            .unwrap()
            .ballots_printed_count,
        4
    );

    // Same session keeps going after the stamp lands
    h.station.poll_card().await;
    assert!(h.station.auth().role().is_some());
    assert_eq!(
        h.station.screen(),
        Screen::CastBallotInstructions {
            instructions: PostVotingInstructions::Card
        }
    );
    assert!(h.run("print").await.is_err());

    h.remove().await;
    assert_eq!(
        h.station.screen(),
        Screen::CastBallotInstructions {
            instructions: PostVotingInstructions::Card
        }
    );
    h.run("done").await.unwrap();
    assert_eq!(h.station.screen(), Screen::InsertCard);

    // A printed card cannot start a new session
    h.card.insert(&CardData::Voter(stamped), None);
    h.station.poll_card().await;
    assert_eq!(
        *h.station.auth(),
        logged_out(LoggedOutReason::VoterCardPrinted)
    );
    assert_eq!(h.station.screen(), Screen::UsedCard);
}

#[tokio::test]
async fn voiding_ends_the_session() {
    let mut h = Harness::open_polls();
    h.insert(CardData::Voter(h.voter_card("p1", t0())), None)
        .await;
    h.run("vote question-a yes").await.unwrap();

    h.run("void").await.unwrap();
    assert!(h.card_data().await.voided_at.is_some());

    h.station.poll_card().await;
    assert_eq!(
        *h.station.auth(),
        logged_out(LoggedOutReason::VoterCardVoided)
    );
    assert_eq!(h.station.screen(), Screen::ExpiredCard);
    assert!(h.station.session().votes.is_none());
    assert_eq!(h.station.session().ballots_printed_count, 0);
}

#[tokio::test]
async fn election_manager_configures_and_poll_worker_opens_polls() {
    let mut h = Harness::new(None, MachineInfo::default());
    assert_eq!(h.station.screen(), Screen::Unconfigured);

    let manager = CardData::ElectionManager(ElectionManagerCardData {
        election_hash: h.definition.election_hash.clone(),
        passcode_hash: sha256_hex(b"123456"),
    });
    h.insert(manager, Some(election_json().into_bytes())).await;
    assert_eq!(h.station.screen(), Screen::UnlockMachine);
    assert!(matches!(
        h.run("load-election").await,
        Err(StationError::Auth(AuthError::NotPermitted { .. }))
    ));

    h.run("passcode 123456").await.unwrap();
    assert_eq!(h.station.screen(), Screen::ElectionManager);

    h.run("load-election").await.unwrap();
    h.run("precinct p1").await.unwrap();
    assert_eq!(
        h.station.session().election_definition.as_ref(),
        Some(&h.definition)
    );
    assert_eq!(
        storage::load_election_definition(h.storage.as_ref()).unwrap(),
        Some(h.definition.clone())
    );

    h.remove().await;
    assert_eq!(h.station.screen(), Screen::InsertCard);

    let poll_worker = CardData::PollWorker(PollWorkerCardData {
        election_hash: h.definition.election_hash.clone(),
    });
    h.insert(poll_worker, None).await;
    assert_eq!(h.station.screen(), Screen::PollWorker);
    h.run("polls").await.unwrap();
    assert!(h.station.session().is_polls_open);

    let stored = storage::load_app_state(h.storage.as_ref()).unwrap();
    assert!(stored.is_polls_open);
    assert_eq!(stored.app_precinct, Some(PrecinctSelection::single("p1")));
}

#[tokio::test]
async fn wrong_passcode_locks_the_card_until_removed() {
    let mut h = Harness::open_polls();
    let manager = CardData::ElectionManager(ElectionManagerCardData {
        election_hash: h.definition.election_hash.clone(),
        passcode_hash: sha256_hex(b"123456"),
    });
    h.insert(manager.clone(), None).await;

    for _ in 0..5 {
        h.run("passcode 000000").await.unwrap();
    }
    assert_eq!(*h.station.auth(), logged_out(LoggedOutReason::CardError));
    h.station.poll_card().await;
    assert_eq!(h.station.screen(), Screen::CardError);

    h.remove().await;
    h.insert(manager, None).await;
    assert_eq!(h.station.screen(), Screen::UnlockMachine);
}

#[tokio::test]
async fn cardless_voter_session() {
    let mut h = Harness::open_polls();
    let poll_worker = CardData::PollWorker(PollWorkerCardData {
        election_hash: h.definition.election_hash.clone(),
    });
    h.insert(poll_worker, None).await;
    assert!(h.run("cardless p9 1").await.is_err());
    h.run("cardless p1 1").await.unwrap();
    assert_eq!(h.station.screen(), Screen::PollWorker);

    h.remove().await;
    assert_eq!(h.station.screen(), Screen::Ballot { cardless: true });

    h.run("vote question-a no").await.unwrap();
    h.clock.advance(Duration::seconds(5));
    assert_eq!(h.station.sync_now().await, None);

    let printed = h.station.record_printed_ballot().await.unwrap();
    assert_eq!(
        decode_ballot(&h.definition, &printed).unwrap().votes["question-a"],
        Vote::no()
    );
    assert_eq!(
        h.station.session().post_voting_instructions,
        Some(PostVotingInstructions::Cardless)
    );
    assert_eq!(h.card.write_count(), 0);

    h.run("done").await.unwrap();
    assert_eq!(*h.station.auth(), logged_out(LoggedOutReason::NoCard));
    assert_eq!(h.station.screen(), Screen::InsertCard);
}

#[tokio::test]
async fn voters_cannot_run_operator_commands() {
    let mut h = Harness::open_polls();
    h.insert(CardData::Voter(h.voter_card("p1", t0())), None)
        .await;

    for line in ["polls", "live", "precinct all", "unconfigure", "load-election"] {
        assert!(
            matches!(
                h.run(line).await,
                Err(StationError::Auth(AuthError::NotPermitted { .. }))
            ),
            "{} should be refused",
            line
        );
    }
    assert!(h.station.session().is_polls_open);

    assert!(matches!(
        h.run("vote mayor-dem smith").await,
        Err(StationError::Ballot(_))
    ));
}

#[tokio::test]
async fn unreadable_card_shows_card_error() {
    let mut h = Harness::open_polls();
    h.card.set_fault(true);
    h.station.poll_card().await;
    assert_eq!(h.station.screen(), Screen::CardError);

    h.card.insert_raw(Some("{not json".into()), None);
    h.station.poll_card().await;
    assert_eq!(h.station.screen(), Screen::CardError);

    h.card.insert_raw(Some("".into()), None);
    h.station.poll_card().await;
    assert_eq!(h.station.screen(), Screen::InsertCard);
}

#[tokio::test]
async fn poll_worker_card_tally_is_read_and_syncs_polls() {
    let mut h = Harness::open_polls();
    let poll_worker = CardData::PollWorker(PollWorkerCardData {
        election_hash: h.definition.election_hash.clone(),
    });

    h.insert(poll_worker.clone(), Some(scanner_tally("close_polls")))
        .await;
    assert_eq!(h.station.screen(), Screen::PollWorker);
    let report = h.station.scanner_report().expect("scanner report");
    assert_eq!(report.payload.machine_id, "0042");
    assert_eq!(report.tally.number_of_ballots_counted, 10);
    assert_eq!(
        report.tally.ballot_counts_by_voting_method[&VotingMethod::Precinct],
        4
    );
    assert_eq!(
        report.tally.ballot_counts_by_voting_method[&VotingMethod::Absentee],
        6
    );
    assert_eq!(
        report.tally.contest("question-a").unwrap().tallies[YES_OPTION_ID],
        6
    );

    // Re-polling the same session does not touch the card again
    h.station.poll_card().await;
    assert!(h.station.scanner_report().is_some());

    h.run("report-printed").await.unwrap();
    assert_eq!(h.card.long_value(), None);
    assert!(h.station.scanner_report().is_none());
    assert!(!h.station.session().is_polls_open);
    assert!(!storage::load_app_state(h.storage.as_ref()).unwrap().is_polls_open);
    assert!(matches!(
        h.run("report-printed").await,
        Err(StationError::Command(_))
    ));

    h.remove().await;
    h.insert(poll_worker.clone(), Some(scanner_tally("open_polls")))
        .await;
    h.run("report-printed").await.unwrap();
    assert!(h.station.session().is_polls_open);

    // Polls already match the scanner
    h.remove().await;
    h.insert(poll_worker.clone(), Some(scanner_tally("unpause_polls")))
        .await;
    h.run("report-printed").await.unwrap();
    assert!(h.station.session().is_polls_open);

    h.remove().await;
    h.insert(poll_worker.clone(), Some(scanner_tally("close_polls")))
        .await;
    assert!(h.station.scanner_report().is_some());
    h.run("logout").await.unwrap();
    assert!(h.station.scanner_report().is_none());

    h.remove().await;
    assert!(h.station.scanner_report().is_none());
    h.insert(poll_worker, Some(b"{\"tally\": 1}".to_vec())).await;
    assert_eq!(h.station.screen(), Screen::PollWorker);
    assert!(h.station.scanner_report().is_none());
    assert!(h.card.long_value().is_some());
}

#[tokio::test]
async fn only_poll_workers_see_scanner_reports() {
    let mut h = Harness::open_polls();
    let voter = h.voter_card("p1", t0());
    h.insert(CardData::Voter(voter), None).await;
    assert!(h.station.scanner_report().is_none());
    assert!(matches!(
        h.run("report-printed").await,
        Err(StationError::Auth(AuthError::NotPermitted { .. }))
    ));

    h.remove().await;
    let poll_worker = CardData::PollWorker(PollWorkerCardData {
        election_hash: "0".repeat(64),
    });
    h.insert(poll_worker, Some(scanner_tally("close_polls"))).await;
    assert_eq!(
        *h.station.auth(),
        logged_out(LoggedOutReason::PollWorkerWrongElection)
    );
    assert!(h.station.scanner_report().is_none());
    assert_eq!(h.card.long_value(), Some(scanner_tally("close_polls")));
}
