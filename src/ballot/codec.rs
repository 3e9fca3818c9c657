//! Completed ballot encoding
//!
//! Layout, most significant bit first:
//!
//! ```text
//! "VX" 0x02                      prelude
//! election hash                  hex string, length max 64
//! ballot style id                UTF-8 string, length max 255
//! precinct id                    UTF-8 string, length max 255
//! per contest, ballot-style order:
//!   candidate                    count (max seats), then one index per selection;
//!                                index == candidate count is a write-in followed
//!                                by its name (write-in charset, length max 40)
//!   yes/no                       2 bits: 0 unset, 1 yes, 2 no
//!   either-neither               two yes/no values (either/neither, pick one)
//! test mode                      1 bit
//! ballot type                    4 bits
//! zero padding to a byte boundary
//! ```

use super::bits::{BitSink, BitSource, StringEncoding};
use super::CompletedBallot;
use crate::election::{Candidate, CandidateContest, Contest, ElectionDefinition};
use crate::error::BallotCodecError;
use crate::votes::{
    validate_votes, BallotType, Vote, VotesDict, YesOrNo, MAXIMUM_WRITE_IN_LENGTH,
    WRITE_IN_CHARSET,
};

/// Leading bytes of every encoded ballot
pub const PRELUDE: [u8; 3] = [b'V', b'X', 2];

const HEX_ENCODING: StringEncoding = StringEncoding::Charset("0123456789abcdef");
const WRITE_IN_ENCODING: StringEncoding = StringEncoding::Charset(WRITE_IN_CHARSET);
const MAXIMUM_HASH_LENGTH: u32 = 64;
const MAXIMUM_ID_LENGTH: u32 = 255;
const BALLOT_TYPE_MAXIMUM_VALUE: u32 = (1 << 4) - 1;

const YES_NO_UNSET: u32 = 0;
const YES_NO_YES: u32 = 1;
const YES_NO_NO: u32 = 2;
const YES_NO_MAXIMUM_VALUE: u32 = 3;

/// Whether `bytes` look like an encoded ballot
pub fn detect(bytes: &[u8]) -> bool {
    bytes.starts_with(&PRELUDE)
}

/// Encode a completed ballot for `definition`
pub fn encode_ballot(
    definition: &ElectionDefinition,
    ballot: &CompletedBallot,
) -> Result<Vec<u8>, BallotCodecError> {
    if ballot.election_hash != definition.election_hash {
        return Err(BallotCodecError::WrongElection {
            expected: definition.election_hash.clone(),
            found: ballot.election_hash.clone(),
        });
    }

    let election = &definition.election;
    let ballot_style = election
        .ballot_style(&ballot.ballot_style_id)
        .ok_or_else(|| BallotCodecError::UnknownBallotStyle(ballot.ballot_style_id.clone()))?;
    if election.precinct(&ballot.precinct_id).is_none() {
        return Err(BallotCodecError::UnknownPrecinct(ballot.precinct_id.clone()));
    }
    validate_votes(election, &ballot.ballot_style_id, &ballot.votes)?;

    let mut bits = BitSink::new();
    bits.write_bytes(&PRELUDE)?;
    bits.write_string(&ballot.election_hash, HEX_ENCODING, MAXIMUM_HASH_LENGTH)?;
    bits.write_string(&ballot.ballot_style_id, StringEncoding::Utf8, MAXIMUM_ID_LENGTH)?;
    bits.write_string(&ballot.precinct_id, StringEncoding::Utf8, MAXIMUM_ID_LENGTH)?;

    for contest in election.contests_for(ballot_style) {
        match contest {
            Contest::Candidate(c) => {
                let selections = match ballot.votes.get(&c.id) {
                    Some(Vote::Candidate(selections)) => selections.as_slice(),
                    _ => &[],
                };
                write_candidate_vote(&mut bits, c, selections)?;
            }
            Contest::Yesno(c) => {
                write_yes_no_vote(&mut bits, ballot.votes.get(&c.id))?;
            }
            Contest::MsEitherNeither(c) => {
                write_yes_no_vote(&mut bits, ballot.votes.get(&c.either_neither_contest_id))?;
                write_yes_no_vote(&mut bits, ballot.votes.get(&c.pick_one_contest_id))?;
            }
        }
    }

    bits.write_bool(ballot.is_test_mode)?;
    bits.write_uint(ballot.ballot_type.as_u32(), BALLOT_TYPE_MAXIMUM_VALUE)?;
    bits.finish()
}

fn max_candidate_index(contest: &CandidateContest) -> u32 {
    let count = contest.candidates.len() as u32;
    if contest.allow_write_ins {
        count
    } else {
        count.saturating_sub(1)
    }
}

fn write_candidate_vote(
    bits: &mut BitSink,
    contest: &CandidateContest,
    selections: &[Candidate],
) -> Result<(), BallotCodecError> {
    bits.write_uint(selections.len() as u32, contest.seats)?;
    let max_index = max_candidate_index(contest);
    let write_in_index = contest.candidates.len() as u32;

    for selection in selections {
        if selection.is_write_in {
            bits.write_uint(write_in_index, max_index)?;
            bits.write_string(
                &selection.name,
                WRITE_IN_ENCODING,
                MAXIMUM_WRITE_IN_LENGTH as u32,
            )?;
        } else {
            let index = contest
                .candidates
                .iter()
                .position(|c| c.id == selection.id)
                .ok_or_else(|| BallotCodecError::UnknownCandidate {
                    contest_id: contest.id.clone(),
                    candidate_id: selection.id.clone(),
                })?;
            bits.write_uint(index as u32, max_index)?;
        }
    }
    Ok(())
}

fn write_yes_no_vote(bits: &mut BitSink, vote: Option<&Vote>) -> Result<(), BallotCodecError> {
    let marker = match vote {
        Some(Vote::YesNo(choices)) => match choices.first() {
            Some(YesOrNo::Yes) => YES_NO_YES,
            Some(YesOrNo::No) => YES_NO_NO,
            None => YES_NO_UNSET,
        },
        _ => YES_NO_UNSET,
    };
    bits.write_uint(marker, YES_NO_MAXIMUM_VALUE)
}

/// Decode a ballot, failing before anything else if it belongs to another election
pub fn decode_ballot(
    definition: &ElectionDefinition,
    bytes: &[u8],
) -> Result<CompletedBallot, BallotCodecError> {
    let mut bits = BitSource::new(bytes);

    let prelude = bits.read_bytes(PRELUDE.len())?;
    if prelude != PRELUDE {
        return Err(BallotCodecError::InvalidPrelude(prelude));
    }

    let election_hash = bits.read_string(HEX_ENCODING, MAXIMUM_HASH_LENGTH)?;
    if election_hash != definition.election_hash {
        return Err(BallotCodecError::WrongElection {
            expected: definition.election_hash.clone(),
            found: election_hash,
        });
    }

    let election = &definition.election;
    let ballot_style_id = bits.read_string(StringEncoding::Utf8, MAXIMUM_ID_LENGTH)?;
    let ballot_style = election
        .ballot_style(&ballot_style_id)
        .ok_or_else(|| BallotCodecError::UnknownBallotStyle(ballot_style_id.clone()))?;
    let precinct_id = bits.read_string(StringEncoding::Utf8, MAXIMUM_ID_LENGTH)?;
    if election.precinct(&precinct_id).is_none() {
        return Err(BallotCodecError::UnknownPrecinct(precinct_id));
    }

    let mut votes = VotesDict::new();
    for contest in election.contests_for(ballot_style) {
        match contest {
            Contest::Candidate(c) => {
                let selections = read_candidate_vote(&mut bits, c)?;
                if !selections.is_empty() {
                    votes.insert(c.id.clone(), Vote::Candidate(selections));
                }
            }
            Contest::Yesno(c) => {
                if let Some(vote) = read_yes_no_vote(&mut bits, &c.id)? {
                    votes.insert(c.id.clone(), vote);
                }
            }
            Contest::MsEitherNeither(c) => {
                for id in [&c.either_neither_contest_id, &c.pick_one_contest_id] {
                    if let Some(vote) = read_yes_no_vote(&mut bits, id)? {
                        votes.insert(id.clone(), vote);
                    }
                }
            }
        }
    }

    let is_test_mode = bits.read_bool()?;
    let raw_ballot_type = bits.read_uint(BALLOT_TYPE_MAXIMUM_VALUE)?;
    let ballot_type = BallotType::from_u32(raw_ballot_type)
        .ok_or(BallotCodecError::InvalidBallotType(raw_ballot_type))?;
    bits.finish()?;

    Ok(CompletedBallot {
        election_hash,
        ballot_style_id,
        precinct_id,
        votes,
        is_test_mode,
        ballot_type,
    })
}

fn read_candidate_vote(
    bits: &mut BitSource<'_>,
    contest: &CandidateContest,
) -> Result<Vec<Candidate>, BallotCodecError> {
    let count = bits.read_uint(contest.seats)?;
    let max_index = max_candidate_index(contest);

    (0..count)
        .map(|_| {
            let index = bits.read_uint(max_index)? as usize;
            match contest.candidates.get(index) {
                Some(candidate) => Ok(candidate.clone()),
                None if contest.allow_write_ins => {
                    let name =
                        bits.read_string(WRITE_IN_ENCODING, MAXIMUM_WRITE_IN_LENGTH as u32)?;
                    Ok(Candidate::write_in(&name))
                }
                None => Err(BallotCodecError::WriteInNotAllowed(contest.id.clone())),
            }
        })
        .collect()
}

fn read_yes_no_vote(
    bits: &mut BitSource<'_>,
    contest_id: &str,
) -> Result<Option<Vote>, BallotCodecError> {
    match bits.read_uint(YES_NO_MAXIMUM_VALUE)? {
        YES_NO_UNSET => Ok(None),
        YES_NO_YES => Ok(Some(Vote::yes())),
        YES_NO_NO => Ok(Some(Vote::no())),
        marker => Err(BallotCodecError::InvalidYesNoMarker {
            contest_id: contest_id.to_string(),
            marker,
        }),
    }
}
