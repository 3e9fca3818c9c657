//! Election definition model
//!
//! The election definition is the JSON document every device in a polling
//! place is configured with. Its SHA-256 (the election hash) is what cards
//! and encoded ballots carry to prove they belong to the same election.

use crate::error::ElectionError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_write_in: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateContest {
    pub id: String,
    pub district_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<String>,
    #[serde(default)]
    pub section: String,
    pub title: String,
    pub seats: u32,
    pub candidates: Vec<Candidate>,
    pub allow_write_ins: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YesNoContest {
    pub id: String,
    pub district_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<String>,
    #[serde(default)]
    pub section: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Mississippi-style measure: "either or neither" plus "pick one", each
/// voted as an independent yes/no sub-contest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsEitherNeitherContest {
    pub id: String,
    pub district_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<String>,
    #[serde(default)]
    pub section: String,
    pub title: String,
    pub either_neither_contest_id: String,
    pub pick_one_contest_id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Contest {
    Candidate(CandidateContest),
    Yesno(YesNoContest),
    MsEitherNeither(MsEitherNeitherContest),
}

impl Contest {
    pub fn id(&self) -> &str {
        match self {
            Contest::Candidate(c) => &c.id,
            Contest::Yesno(c) => &c.id,
            Contest::MsEitherNeither(c) => &c.id,
        }
    }

    pub fn district_id(&self) -> &str {
        match self {
            Contest::Candidate(c) => &c.district_id,
            Contest::Yesno(c) => &c.district_id,
            Contest::MsEitherNeither(c) => &c.district_id,
        }
    }

    pub fn party_id(&self) -> Option<&str> {
        match self {
            Contest::Candidate(c) => c.party_id.as_deref(),
            Contest::Yesno(c) => c.party_id.as_deref(),
            Contest::MsEitherNeither(c) => c.party_id.as_deref(),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Contest::Candidate(c) => &c.title,
            Contest::Yesno(c) => &c.title,
            Contest::MsEitherNeither(c) => &c.title,
        }
    }

    /// Ids under which votes for this contest are recorded. Either-neither
    /// measures expand to their two yes/no sub-contests.
    pub fn vote_ids(&self) -> Vec<&str> {
        match self {
            Contest::MsEitherNeither(c) => vec![
                c.either_neither_contest_id.as_str(),
                c.pick_one_contest_id.as_str(),
            ],
            other => vec![other.id()],
        }
    }
}

/// The two yes/no sub-contests of an either-neither measure
pub fn expand_either_neither(contest: &MsEitherNeitherContest) -> [YesNoContest; 2] {
    let sub = |id: &str, title: String| YesNoContest {
        id: id.to_string(),
        district_id: contest.district_id.clone(),
        party_id: contest.party_id.clone(),
        section: contest.section.clone(),
        title,
        description: contest.description.clone(),
    };
    [
        sub(
            &contest.either_neither_contest_id,
            format!("{} (either/neither)", contest.title),
        ),
        sub(
            &contest.pick_one_contest_id,
            format!("{} (pick one)", contest.title),
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotStyle {
    pub id: String,
    pub precincts: Vec<String>,
    pub districts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precinct {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct District {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub abbrev: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Election {
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub date: String,
    pub ballot_styles: Vec<BallotStyle>,
    pub contests: Vec<Contest>,
    pub districts: Vec<District>,
    #[serde(default)]
    pub parties: Vec<Party>,
    pub precincts: Vec<Precinct>,
}

impl Election {
    pub fn ballot_style(&self, id: &str) -> Option<&BallotStyle> {
        self.ballot_styles.iter().find(|bs| bs.id == id)
    }

    pub fn precinct(&self, id: &str) -> Option<&Precinct> {
        self.precincts.iter().find(|p| p.id == id)
    }

    pub fn contest(&self, id: &str) -> Option<&Contest> {
        self.contests.iter().find(|c| c.id() == id)
    }

    /// Contests on a ballot style, in election order: those in one of the
    /// style's districts whose party matches the style's party exactly
    pub fn contests_for<'a>(&'a self, ballot_style: &BallotStyle) -> Vec<&'a Contest> {
        self.contests
            .iter()
            .filter(|c| {
                ballot_style.districts.iter().any(|d| d == c.district_id())
                    && ballot_style.party_id.as_deref() == c.party_id()
            })
            .collect()
    }

    /// Distinct ballot style parties in first-seen order; `None` stands for
    /// styles without a party
    pub fn party_ids_in_ballot_styles(&self) -> Vec<Option<&str>> {
        let mut parties = Vec::new();
        for style in &self.ballot_styles {
            let party = style.party_id.as_deref();
            if !parties.contains(&party) {
                parties.push(party);
            }
        }
        parties
    }

    /// Check cross references and id uniqueness, returning one message per problem
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let ballot_style_ids = self.ballot_styles.iter().map(|b| &b.id);
        check_duplicates("ballot style", ballot_style_ids, &mut problems);
        check_duplicates("contest", self.contests.iter().map(|c| c.id()), &mut problems);
        check_duplicates("district", self.districts.iter().map(|d| &d.id), &mut problems);
        check_duplicates("party", self.parties.iter().map(|p| &p.id), &mut problems);
        check_duplicates("precinct", self.precincts.iter().map(|p| &p.id), &mut problems);

        let party_known = |id: &str| self.parties.iter().any(|p| p.id == id);

        for bs in &self.ballot_styles {
            for district in &bs.districts {
                if !self.districts.iter().any(|d| &d.id == district) {
                    problems.push(format!(
                        "Ballot style '{}' has district '{}', but no such district is defined.",
                        bs.id, district
                    ));
                }
            }
            for precinct in &bs.precincts {
                if self.precinct(precinct).is_none() {
                    problems.push(format!(
                        "Ballot style '{}' has precinct '{}', but no such precinct is defined.",
                        bs.id, precinct
                    ));
                }
            }
            if let Some(party) = bs.party_id.as_deref() {
                if !party_known(party) {
                    problems.push(format!(
                        "Ballot style '{}' has party '{}', but no such party is defined.",
                        bs.id, party
                    ));
                }
            }
        }

        for contest in &self.contests {
            if let Some(party) = contest.party_id() {
                if !party_known(party) {
                    problems.push(format!(
                        "Contest '{}' has party '{}', but no such party is defined.",
                        contest.id(),
                        party
                    ));
                }
            }
            if let Contest::Candidate(c) = contest {
                if c.seats == 0 {
                    problems.push(format!("Contest '{}' has no seats.", c.id));
                }
                check_duplicates(
                    &format!("candidate in contest '{}'", c.id),
                    c.candidates.iter().map(|cand| &cand.id),
                    &mut problems,
                );
                for cand in &c.candidates {
                    if let Some(party) = cand.party_id.as_deref() {
                        if !party_known(party) {
                            problems.push(format!(
                                "Candidate '{}' in contest '{}' has party '{}', but no such party is defined.",
                                cand.id, c.id, party
                            ));
                        }
                    }
                }
            }
        }

        problems
    }
}

fn check_duplicates<S: AsRef<str>>(
    what: &str,
    ids: impl Iterator<Item = S>,
    problems: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for id in ids {
        let id = id.as_ref().to_string();
        if !seen.insert(id.clone()) {
            problems.push(format!("Duplicate {} '{}' found.", what, id));
        }
    }
}

/// An election together with its source text and hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionDefinition {
    pub election: Election,
    pub election_data: String,
    pub election_hash: String,
}

impl ElectionDefinition {
    /// Parse and validate election JSON. The hash covers the exact input bytes.
    pub fn from_json(data: &str) -> Result<Self, ElectionError> {
        let election: Election = serde_json::from_str(data)?;
        let problems = election.validate();
        if !problems.is_empty() {
            return Err(ElectionError::Invalid(problems));
        }
        Ok(Self {
            election,
            election_data: data.to_string(),
            election_hash: sha256_hex(data.as_bytes()),
        })
    }

    /// Build a definition from an in-memory election by serializing it
    pub fn from_election(election: Election) -> Result<Self, ElectionError> {
        let data = serde_json::to_string(&election)?;
        Self::from_json(&data)
    }
}

/// Lowercase hex SHA-256
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Which precincts a device serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PrecinctSelection {
    AllPrecincts,
    SinglePrecinct {
        #[serde(rename = "precinctId")]
        precinct_id: String,
    },
}

impl PrecinctSelection {
    pub fn single(precinct_id: impl Into<String>) -> Self {
        PrecinctSelection::SinglePrecinct {
            precinct_id: precinct_id.into(),
        }
    }

    /// Whether a voter from `precinct_id` may vote here
    pub fn admits(&self, precinct_id: &str) -> bool {
        match self {
            PrecinctSelection::AllPrecincts => true,
            PrecinctSelection::SinglePrecinct { precinct_id: p } => p == precinct_id,
        }
    }
}

#[cfg(test)]
pub(crate) fn fixture() -> ElectionDefinition {
    ElectionDefinition::from_json(include_str!("../tests/fixtures/election.json"))
        .expect("fixture election is valid")
}
