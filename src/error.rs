//! Error types for markstation
//!
//! Uses thiserror for ergonomic error definitions. Each concern gets its own
//! enum; `StationError` aggregates them for the daemon and CLI.

use thiserror::Error;

/// Top-level error type for the markstation application
#[derive(Error, Debug)]
pub enum StationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Card error: {0}")]
    Card(#[from] CardError),

    #[error("Ballot encoding error: {0}")]
    Ballot(#[from] BallotCodecError),

    #[error("Tally error: {0}")]
    Tally(#[from] TallyError),

    #[error("Election definition error: {0}")]
    Election(#[from] ElectionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Invalid command: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by a card backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CardError {
    #[error("No card in the reader")]
    NoCard,

    #[error("Card reader I/O failed: {0}")]
    Io(String),

    #[error("Card payload is malformed: {0}")]
    Malformed(String),

    #[error("Card short value is not a voter card")]
    NotVoterCard,
}

/// Errors from encoding or decoding a ballot
#[derive(Error, Debug)]
pub enum BallotCodecError {
    #[error("Invalid prelude: {0:?}")]
    InvalidPrelude(Vec<u8>),

    #[error("Ballot was encoded for election {found}, expected {expected}")]
    WrongElection { expected: String, found: String },

    #[error("Ballot style not found: {0}")]
    UnknownBallotStyle(String),

    #[error("Precinct not found: {0}")]
    UnknownPrecinct(String),

    #[error("Contest {contest_id} not found in ballot style {ballot_style_id}")]
    UnknownContest {
        contest_id: String,
        ballot_style_id: String,
    },

    #[error("Candidate {candidate_id} is not in contest {contest_id}")]
    UnknownCandidate {
        contest_id: String,
        candidate_id: String,
    },

    #[error("Candidate {candidate_id} in contest {contest_id} does not match the election's candidate")]
    CandidateMismatch {
        contest_id: String,
        candidate_id: String,
    },

    #[error("Vote for contest {0} has no selections")]
    EmptyVote(String),

    #[error("Contest {contest_id} allows {seats} selections but {found} were made")]
    TooManySelections {
        contest_id: String,
        seats: u32,
        found: usize,
    },

    #[error("Contest {0} does not allow write-ins")]
    WriteInNotAllowed(String),

    #[error("Write-in {0:?} is not in canonical form")]
    InvalidWriteIn(String),

    #[error("Vote for contest {0} has the wrong shape for its contest type")]
    VoteTypeMismatch(String),

    #[error("Yes/no overvote in contest {0}")]
    YesNoOvervote(String),

    #[error("Value {value} does not fit in range 0..={max}")]
    ValueOutOfRange { value: u32, max: u32 },

    #[error("Character {0:?} cannot be encoded")]
    UnencodableChar(char),

    #[error("String of length {length} exceeds maximum of {max}")]
    StringTooLong { length: usize, max: u32 },

    #[error("Invalid UTF-8 in encoded string")]
    InvalidUtf8,

    #[error("Invalid ballot type: {0}")]
    InvalidBallotType(u32),

    #[error("Invalid yes/no marker {marker} in contest {contest_id}")]
    InvalidYesNoMarker { contest_id: String, marker: u32 },

    #[error("Unexpected data found while reading padding, expected EOF")]
    UnexpectedPadding,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from decoding or aggregating compressed tallies
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TallyError {
    #[error("Compressed tally has {found} contests, election has {expected}")]
    ContestCountMismatch { expected: usize, found: usize },

    #[error("Contest {contest_id} expects {expected} tally entries, found {found}")]
    MalformedContest {
        contest_id: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid tally payload: {0}")]
    InvalidPayload(String),

    #[error("Tally count overflow while combining {0}")]
    Overflow(String),

    #[error("Tally payload came from a {0}, not a precinct scanner")]
    UnsupportedMachine(String),
}

/// Errors from parsing or validating an election definition
#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("Election definition is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Election definition is inconsistent:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Errors from the local device storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from user-initiated auth operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Not waiting for a passcode")]
    NotCheckingPasscode,

    #[error("Passcode digit must be 0-9, got {0:?}")]
    InvalidDigit(char),

    #[error("Only a logged-in poll worker can manage cardless voter sessions")]
    NotPollWorker,

    #[error("{action} is not available while {status}")]
    NotPermitted {
        action: &'static str,
        status: &'static str,
    },
}

/// Result type alias using StationError
pub type Result<T> = std::result::Result<T, StationError>;
