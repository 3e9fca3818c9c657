//! Compact binary ballots
//!
//! The same encoding is stored on voter cards while a ballot is in
//! progress and printed as a QR code on the finished ballot.

pub mod bits;
pub mod codec;

pub use codec::{decode_ballot, detect, encode_ballot, PRELUDE};

use crate::votes::{BallotType, VotesDict};
use serde::{Deserialize, Serialize};

/// Everything needed to reproduce a voter's ballot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedBallot {
    pub election_hash: String,
    pub ballot_style_id: String,
    pub precinct_id: String,
    pub votes: VotesDict,
    pub is_test_mode: bool,
    pub ballot_type: BallotType,
}
