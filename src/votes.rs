//! Voter selections
//!
//! A `VotesDict` maps a contest id to the voter's current choice. Contests the
//! voter has not touched (or cleared) have no entry. Either-neither measures
//! are recorded under their two sub-contest ids.

use crate::election::{Candidate, Contest, Election};
use crate::error::BallotCodecError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Characters a write-in name may contain
pub const WRITE_IN_CHARSET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ '\"-.,";

/// Longest write-in name, in characters
pub const MAXIMUM_WRITE_IN_LENGTH: usize = 40;

pub type ContestId = String;

pub type VotesDict = BTreeMap<ContestId, Vote>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YesOrNo {
    Yes,
    No,
}

/// A single contest's selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Vote {
    Candidate(Vec<Candidate>),
    YesNo(Vec<YesOrNo>),
}

impl Vote {
    pub fn yes() -> Self {
        Vote::YesNo(vec![YesOrNo::Yes])
    }

    pub fn no() -> Self {
        Vote::YesNo(vec![YesOrNo::No])
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Vote::Candidate(c) => c.is_empty(),
            Vote::YesNo(y) => y.is_empty(),
        }
    }
}

/// How the ballot was cast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotType {
    #[default]
    Standard,
    Absentee,
    Provisional,
}

impl BallotType {
    pub fn as_u32(self) -> u32 {
        match self {
            BallotType::Standard => 0,
            BallotType::Absentee => 1,
            BallotType::Provisional => 2,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(BallotType::Standard),
            1 => Some(BallotType::Absentee),
            2 => Some(BallotType::Provisional),
            _ => None,
        }
    }
}

/// Normalize a typed write-in name: upper case, only encodable characters,
/// at most `MAXIMUM_WRITE_IN_LENGTH` characters
pub fn normalize_write_in_name(name: &str) -> String {
    name.chars()
        .flat_map(char::to_uppercase)
        .filter(|c| WRITE_IN_CHARSET.contains(*c))
        .take(MAXIMUM_WRITE_IN_LENGTH)
        .collect()
}

fn write_in_slug(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

impl Candidate {
    /// Build a write-in candidate from free text
    pub fn write_in(name: &str) -> Self {
        let name = normalize_write_in_name(name);
        Candidate {
            id: format!("write-in-{}", write_in_slug(&name)),
            name,
            party_id: None,
            is_write_in: true,
        }
    }

    /// Whether this is a write-in exactly as `Candidate::write_in` produces it
    pub fn is_canonical_write_in(&self) -> bool {
        self.is_write_in && *self == Candidate::write_in(&self.name)
    }
}

/// Check that `votes` fits the contests of a ballot style
pub fn validate_votes(
    election: &Election,
    ballot_style_id: &str,
    votes: &VotesDict,
) -> Result<(), BallotCodecError> {
    let ballot_style = election
        .ballot_style(ballot_style_id)
        .ok_or_else(|| BallotCodecError::UnknownBallotStyle(ballot_style_id.to_string()))?;
    let contests = election.contests_for(ballot_style);

    for (contest_id, vote) in votes {
        let contest = contests
            .iter()
            .find(|c| c.vote_ids().contains(&contest_id.as_str()))
            .ok_or_else(|| BallotCodecError::UnknownContest {
                contest_id: contest_id.clone(),
                ballot_style_id: ballot_style_id.to_string(),
            })?;

        // Absent and empty are the same on the wire; only absent is accepted
        if vote.is_empty() {
            return Err(BallotCodecError::EmptyVote(contest_id.clone()));
        }

        match (contest, vote) {
            (Contest::Candidate(c), Vote::Candidate(selected)) => {
                if selected.len() > c.seats as usize {
                    return Err(BallotCodecError::TooManySelections {
                        contest_id: c.id.clone(),
                        seats: c.seats,
                        found: selected.len(),
                    });
                }
                for candidate in selected {
                    if candidate.is_write_in {
                        if !c.allow_write_ins {
                            return Err(BallotCodecError::WriteInNotAllowed(c.id.clone()));
                        }
                        if !candidate.is_canonical_write_in() {
                            return Err(BallotCodecError::InvalidWriteIn(candidate.name.clone()));
                        }
                    } else {
                        let Some(known) = c.candidates.iter().find(|known| known.id == candidate.id)
                        else {
                            return Err(BallotCodecError::UnknownCandidate {
                                contest_id: c.id.clone(),
                                candidate_id: candidate.id.clone(),
                            });
                        };
                        if known != candidate {
                            return Err(BallotCodecError::CandidateMismatch {
                                contest_id: c.id.clone(),
                                candidate_id: candidate.id.clone(),
                            });
                        }
                    }
                }
            }
            (Contest::Yesno(_) | Contest::MsEitherNeither(_), Vote::YesNo(choices)) => {
                if choices.len() > 1 {
                    return Err(BallotCodecError::YesNoOvervote(contest_id.clone()));
                }
            }
            _ => return Err(BallotCodecError::VoteTypeMismatch(contest_id.clone())),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::fixture;

    fn candidate(election: &Election, contest_id: &str, candidate_id: &str) -> Candidate {
        match election.contest(contest_id) {
            Some(Contest::Candidate(c)) => c
                .candidates
                .iter()
                .find(|cand| cand.id == candidate_id)
                .cloned()
                .unwrap(),
            _ => panic!("no candidate contest {}", contest_id),
        }
    }

    #[test]
    fn test_write_in_normalization() {
        let c = Candidate::write_in("Mickey Mouse! 2024");
        assert_eq!(c.name, "MICKEY MOUSE ");
        assert_eq!(c.id, "write-in-mickey-mouse-");
        assert!(c.is_write_in);
        assert!(c.is_canonical_write_in());

        let long = Candidate::write_in(&"a".repeat(60));
        assert_eq!(long.name.len(), MAXIMUM_WRITE_IN_LENGTH);
    }

    #[test]
    fn test_non_canonical_write_in_detected() {
        let mut c = Candidate::write_in("Jane Doe");
        c.name = "Jane Doe".to_string();
        assert!(!c.is_canonical_write_in());
    }

    #[test]
    fn test_valid_votes() {
        let def = fixture();
        let election = &def.election;
        let mut votes = VotesDict::new();
        votes.insert(
            "president".into(),
            Vote::Candidate(vec![candidate(election, "president", "court-blumhardt")]),
        );
        votes.insert(
            "city-council".into(),
            Vote::Candidate(vec![
                candidate(election, "city-council", "eagle"),
                Candidate::write_in("Pat Doe"),
            ]),
        );
        votes.insert("question-a".into(), Vote::yes());
        votes.insert("measure-1-pick-one".into(), Vote::no());

        assert!(validate_votes(election, "1", &votes).is_ok());
    }

    #[test]
    fn test_seat_overflow_rejected() {
        let def = fixture();
        let election = &def.election;
        let mut votes = VotesDict::new();
        votes.insert(
            "president".into(),
            Vote::Candidate(vec![
                candidate(election, "president", "barchi-hallaren"),
                candidate(election, "president", "cramer-vuocolo"),
            ]),
        );
        assert!(matches!(
            validate_votes(election, "1", &votes),
            Err(BallotCodecError::TooManySelections { seats: 1, found: 2, .. })
        ));
    }

    #[test]
    fn test_contest_not_on_ballot_style_rejected() {
        let def = fixture();
        let mut votes = VotesDict::new();
        votes.insert("mayor-dem".into(), Vote::Candidate(vec![]));
        assert!(matches!(
            validate_votes(&def.election, "1", &votes),
            Err(BallotCodecError::UnknownContest { .. })
        ));
    }

    #[test]
    fn test_yes_no_overvote_and_shape() {
        let def = fixture();
        let mut votes = VotesDict::new();
        votes.insert(
            "question-a".into(),
            Vote::YesNo(vec![YesOrNo::Yes, YesOrNo::No]),
        );
        assert!(matches!(
            validate_votes(&def.election, "1", &votes),
            Err(BallotCodecError::YesNoOvervote(_))
        ));

        votes.insert("question-a".into(), Vote::Candidate(vec![Candidate::write_in("X")]));
        assert!(matches!(
            validate_votes(&def.election, "1", &votes),
            Err(BallotCodecError::VoteTypeMismatch(_))
        ));
    }

    #[test]
    fn test_empty_votes_rejected() {
        let def = fixture();
        let mut votes = VotesDict::new();
        votes.insert("president".into(), Vote::Candidate(vec![]));
        assert!(matches!(
            validate_votes(&def.election, "1", &votes),
            Err(BallotCodecError::EmptyVote(ref id)) if id == "president"
        ));

        let mut votes = VotesDict::new();
        votes.insert("question-a".into(), Vote::YesNo(vec![]));
        assert!(matches!(
            validate_votes(&def.election, "1", &votes),
            Err(BallotCodecError::EmptyVote(_))
        ));
    }

    #[test]
    fn test_candidate_must_match_election() {
        let def = fixture();
        let election = &def.election;
        let mut renamed = candidate(election, "president", "court-blumhardt");
        renamed.name = "Someone Else".to_string();
        let mut votes = VotesDict::new();
        votes.insert("president".into(), Vote::Candidate(vec![renamed]));
        assert!(matches!(
            validate_votes(election, "1", &votes),
            Err(BallotCodecError::CandidateMismatch { .. })
        ));

        let mut switched = candidate(election, "president", "court-blumhardt");
        switched.party_id = Some("dem".to_string());
        votes.insert("president".into(), Vote::Candidate(vec![switched]));
        assert!(matches!(
            validate_votes(election, "1", &votes),
            Err(BallotCodecError::CandidateMismatch { .. })
        ));
    }

    #[test]
    fn test_write_in_not_allowed() {
        let def = fixture();
        let mut votes = VotesDict::new();
        votes.insert(
            "mayor-dem".into(),
            Vote::Candidate(vec![Candidate::write_in("Someone")]),
        );
        assert!(matches!(
            validate_votes(&def.election, "2D", &votes),
            Err(BallotCodecError::WriteInNotAllowed(_))
        ));
    }

    #[test]
    fn test_vote_json_shape() {
        let vote: Vote = serde_json::from_str(r#"["yes"]"#).unwrap();
        assert_eq!(vote, Vote::yes());

        let vote: Vote =
            serde_json::from_str(r#"[{"id":"eagle","name":"Harvey Eagle"}]"#).unwrap();
        assert!(matches!(vote, Vote::Candidate(ref c) if c[0].id == "eagle"));
    }
}
