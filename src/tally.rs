//! Compressed tallies carried on poll worker cards
//!
//! A compressed tally has one integer array per election contest, in
//! election order:
//!
//! ```text
//! candidate        [undervotes, overvotes, ballots, candidate..., write-in?]
//! yes/no           [undervotes, overvotes, ballots, yes, no]
//! either-neither   [either, neither, en undervotes, en overvotes,
//!                   first, second, po undervotes, po overvotes, ballots]
//! ```
//!
//! Decoded tallies are keyed by contest id. Either-neither measures decode
//! into their two yes/no sub-contests.

use crate::election::{Contest, Election, PrecinctSelection};
use crate::error::TallyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Option key used for aggregated write-in votes
pub const WRITE_IN_OPTION_ID: &str = "__write-in";
pub const YES_OPTION_ID: &str = "yes";
pub const NO_OPTION_ID: &str = "no";
/// Precinct half of a tally identifier that covers every precinct
pub const ALL_PRECINCTS_TALLY_KEY: &str = "__ALL_PRECINCTS";
pub const PRECINCT_SCANNER_MACHINE_TYPE: &str = "precinct_scanner";

pub type CompressedTally = Vec<Vec<u64>>;

/// `[precinct, absentee]` ballot counts for one party and precinct
pub type BallotCountDetails = [u64; 2];

/// Key for a party/precinct sub-tally, e.g. `dem,p1` or `undefined,__ALL_PRECINCTS`
pub fn tally_identifier(party_id: Option<&str>, precinct_id: Option<&str>) -> String {
    format!(
        "{},{}",
        party_id.unwrap_or("undefined"),
        precinct_id.unwrap_or(ALL_PRECINCTS_TALLY_KEY)
    )
}

fn add_count(total: &mut u64, count: u64, what: &str) -> Result<(), TallyError> {
    *total = total
        .checked_add(count)
        .ok_or_else(|| TallyError::Overflow(what.to_string()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VotingMethod {
    Absentee,
    Precinct,
    Unknown,
}

/// Ballot totals that accompany a compressed tally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotCounts {
    pub number_of_ballots: u64,
    #[serde(default)]
    pub by_voting_method: BTreeMap<VotingMethod, u64>,
}

impl BallotCounts {
    pub fn from_details([precinct, absentee]: BallotCountDetails) -> Result<Self, TallyError> {
        let mut number_of_ballots = precinct;
        add_count(&mut number_of_ballots, absentee, "ballot counts")?;
        Ok(Self {
            number_of_ballots,
            by_voting_method: BTreeMap::from([
                (VotingMethod::Precinct, precinct),
                (VotingMethod::Absentee, absentee),
            ]),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestTallyMeta {
    pub undervotes: u64,
    pub overvotes: u64,
    pub ballots: u64,
}

impl ContestTallyMeta {
    fn add(&mut self, contest_id: &str, other: &ContestTallyMeta) -> Result<(), TallyError> {
        add_count(&mut self.undervotes, other.undervotes, contest_id)?;
        add_count(&mut self.overvotes, other.overvotes, contest_id)?;
        add_count(&mut self.ballots, other.ballots, contest_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestTally {
    /// Votes per option id
    pub tallies: BTreeMap<String, u64>,
    pub metadata: ContestTallyMeta,
}

impl ContestTally {
    fn add(&mut self, contest_id: &str, other: &ContestTally) -> Result<(), TallyError> {
        for (option, count) in &other.tallies {
            add_count(self.tallies.entry(option.clone()).or_insert(0), *count, contest_id)?;
        }
        self.metadata.add(contest_id, &other.metadata)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub number_of_ballots_counted: u64,
    pub ballot_counts_by_voting_method: BTreeMap<VotingMethod, u64>,
    pub contest_tallies: BTreeMap<String, ContestTally>,
}

impl Tally {
    pub fn contest(&self, id: &str) -> Option<&ContestTally> {
        self.contest_tallies.get(id)
    }
}

fn expect_len(contest_id: &str, entry: &[u64], expected: usize) -> Result<(), TallyError> {
    if entry.len() != expected {
        return Err(TallyError::MalformedContest {
            contest_id: contest_id.to_string(),
            expected,
            found: entry.len(),
        });
    }
    Ok(())
}

fn yes_no_tally(yes: u64, no: u64, undervotes: u64, overvotes: u64, ballots: u64) -> ContestTally {
    ContestTally {
        tallies: BTreeMap::from([
            (YES_OPTION_ID.to_string(), yes),
            (NO_OPTION_ID.to_string(), no),
        ]),
        metadata: ContestTallyMeta {
            undervotes,
            overvotes,
            ballots,
        },
    }
}

/// Expand a compressed tally into a `Tally`.
///
/// With `party_id`, contests belonging to a different party are left out;
/// contests without a party are always included.
pub fn read_compressed_tally(
    election: &Election,
    compressed: &[Vec<u64>],
    counts: &BallotCounts,
    party_id: Option<&str>,
) -> Result<Tally, TallyError> {
    if compressed.len() != election.contests.len() {
        return Err(TallyError::ContestCountMismatch {
            expected: election.contests.len(),
            found: compressed.len(),
        });
    }

    let mut contest_tallies = BTreeMap::new();
    for (contest, entry) in election.contests.iter().zip(compressed) {
        if let (Some(filter), Some(party)) = (party_id, contest.party_id()) {
            if filter != party {
                continue;
            }
        }

        match contest {
            Contest::Candidate(c) => {
                let write_ins = usize::from(c.allow_write_ins);
                expect_len(&c.id, entry, 3 + c.candidates.len() + write_ins)?;
                let mut tallies: BTreeMap<String, u64> = c
                    .candidates
                    .iter()
                    .zip(&entry[3..])
                    .map(|(cand, count)| (cand.id.clone(), *count))
                    .collect();
                if c.allow_write_ins {
                    tallies.insert(WRITE_IN_OPTION_ID.to_string(), entry[3 + c.candidates.len()]);
                }
                contest_tallies.insert(
                    c.id.clone(),
                    ContestTally {
                        tallies,
                        metadata: ContestTallyMeta {
                            undervotes: entry[0],
                            overvotes: entry[1],
                            ballots: entry[2],
                        },
                    },
                );
            }
            Contest::Yesno(c) => {
                expect_len(&c.id, entry, 5)?;
                contest_tallies.insert(
                    c.id.clone(),
                    yes_no_tally(entry[3], entry[4], entry[0], entry[1], entry[2]),
                );
            }
            Contest::MsEitherNeither(c) => {
                expect_len(&c.id, entry, 9)?;
                let ballots = entry[8];
                contest_tallies.insert(
                    c.either_neither_contest_id.clone(),
                    yes_no_tally(entry[0], entry[1], entry[2], entry[3], ballots),
                );
                contest_tallies.insert(
                    c.pick_one_contest_id.clone(),
                    yes_no_tally(entry[4], entry[5], entry[6], entry[7], ballots),
                );
            }
        }
    }

    Ok(Tally {
        number_of_ballots_counted: counts.number_of_ballots,
        ballot_counts_by_voting_method: counts.by_voting_method.clone(),
        contest_tallies,
    })
}

/// Inverse of `read_compressed_tally`; contests missing from `tally` compress to zeros
pub fn compress_tally(election: &Election, tally: &Tally) -> CompressedTally {
    let option = |contest: Option<&ContestTally>, id: &str| -> u64 {
        contest
            .and_then(|t| t.tallies.get(id))
            .copied()
            .unwrap_or(0)
    };
    let meta = |contest: Option<&ContestTally>| contest.map(|t| t.metadata).unwrap_or_default();

    election
        .contests
        .iter()
        .map(|contest| match contest {
            Contest::Candidate(c) => {
                let t = tally.contest(&c.id);
                let m = meta(t);
                let mut entry = vec![m.undervotes, m.overvotes, m.ballots];
                entry.extend(c.candidates.iter().map(|cand| option(t, &cand.id)));
                if c.allow_write_ins {
                    entry.push(option(t, WRITE_IN_OPTION_ID));
                }
                entry
            }
            Contest::Yesno(c) => {
                let t = tally.contest(&c.id);
                let m = meta(t);
                vec![
                    m.undervotes,
                    m.overvotes,
                    m.ballots,
                    option(t, YES_OPTION_ID),
                    option(t, NO_OPTION_ID),
                ]
            }
            Contest::MsEitherNeither(c) => {
                let en = tally.contest(&c.either_neither_contest_id);
                let po = tally.contest(&c.pick_one_contest_id);
                let (en_meta, po_meta) = (meta(en), meta(po));
                vec![
                    option(en, YES_OPTION_ID),
                    option(en, NO_OPTION_ID),
                    en_meta.undervotes,
                    en_meta.overvotes,
                    option(po, YES_OPTION_ID),
                    option(po, NO_OPTION_ID),
                    po_meta.undervotes,
                    po_meta.overvotes,
                    en_meta.ballots.max(po_meta.ballots),
                ]
            }
        })
        .collect()
}

/// A compressed tally of all zeros shaped for `election`
pub fn zero_compressed_tally(election: &Election) -> CompressedTally {
    compress_tally(election, &Tally::default())
}

/// Sum tallies contest by contest. A contest or option missing from one
/// tally counts as zero there. Fails rather than wrap when a sum exceeds `u64`.
pub fn aggregate(tallies: &[Tally]) -> Result<Tally, TallyError> {
    let mut combined = Tally::default();
    for tally in tallies {
        add_count(
            &mut combined.number_of_ballots_counted,
            tally.number_of_ballots_counted,
            "ballot counts",
        )?;
        for (method, count) in &tally.ballot_counts_by_voting_method {
            add_count(
                combined
                    .ballot_counts_by_voting_method
                    .entry(*method)
                    .or_insert(0),
                *count,
                "ballot counts",
            )?;
        }
        for (contest_id, contest_tally) in &tally.contest_tallies {
            combined
                .contest_tallies
                .entry(contest_id.clone())
                .or_default()
                .add(contest_id, contest_tally)?;
        }
    }
    Ok(combined)
}

/// Tally payload a precinct scanner writes to a poll worker card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollWorkerCardTally {
    pub tally_machine_type: String,
    pub tally: CompressedTally,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tallies_by_precinct: Option<BTreeMap<String, CompressedTally>>,
    pub total_ballots_scanned: u64,
    pub machine_id: String,
    pub time_saved: i64,
    #[serde(default)]
    pub time_polls_transitioned: i64,
    pub precinct_selection: PrecinctSelection,
    pub is_live_mode: bool,
    #[serde(default)]
    pub polls_transition: String,
    /// Counts keyed by `tally_identifier`; a missing key counts as `[0, 0]`
    #[serde(default)]
    pub ballot_counts: BTreeMap<String, BallotCountDetails>,
}

impl PollWorkerCardTally {
    pub fn from_json(json: &str) -> Result<Self, TallyError> {
        serde_json::from_str(json).map_err(|e| TallyError::InvalidPayload(e.to_string()))
    }

    /// Whether the scanner's last polls transition left polls open
    pub fn polls_open(&self) -> bool {
        matches!(self.polls_transition.as_str(), "open_polls" | "unpause_polls")
    }

    fn check_machine_type(&self) -> Result<(), TallyError> {
        if self.tally_machine_type != PRECINCT_SCANNER_MACHINE_TYPE {
            return Err(TallyError::UnsupportedMachine(self.tally_machine_type.clone()));
        }
        Ok(())
    }

    fn precinct_breakdown(&self) -> Option<&BTreeMap<String, CompressedTally>> {
        self.tallies_by_precinct.as_ref().filter(|by| !by.is_empty())
    }

    fn single_precinct_id(&self) -> Option<&str> {
        match &self.precinct_selection {
            PrecinctSelection::SinglePrecinct { precinct_id } => Some(precinct_id),
            PrecinctSelection::AllPrecincts => None,
        }
    }

    fn count_details(&self, party_id: Option<&str>, precinct_id: Option<&str>) -> BallotCountDetails {
        self.ballot_counts
            .get(&tally_identifier(party_id, precinct_id))
            .copied()
            .unwrap_or_default()
    }

    /// One tally per ballot style party and precinct, keyed by
    /// `tally_identifier`. Without a precinct breakdown there is one entry
    /// per party for the scanner's precinct selection.
    pub fn sub_tallies(&self, election: &Election) -> Result<BTreeMap<String, Tally>, TallyError> {
        self.check_machine_type()?;
        let mut sub_tallies = BTreeMap::new();
        for party_id in election.party_ids_in_ballot_styles() {
            match self.precinct_breakdown() {
                Some(by_precinct) => {
                    for (precinct_id, compressed) in by_precinct {
                        let precinct = Some(precinct_id.as_str());
                        let counts =
                            BallotCounts::from_details(self.count_details(party_id, precinct))?;
                        sub_tallies.insert(
                            tally_identifier(party_id, precinct),
                            read_compressed_tally(election, compressed, &counts, party_id)?,
                        );
                    }
                }
                None => {
                    let precinct = self.single_precinct_id();
                    let counts = BallotCounts::from_details(self.count_details(party_id, precinct))?;
                    sub_tallies.insert(
                        tally_identifier(party_id, precinct),
                        read_compressed_tally(election, &self.tally, &counts, party_id)?,
                    );
                }
            }
        }
        Ok(sub_tallies)
    }

    /// Combined tally for the whole payload, or for one party's contests.
    ///
    /// Contest totals come from the per-precinct tallies when present and
    /// from `tally` otherwise. Ballot counts are summed from `ballot_counts`
    /// over every matching party and precinct key.
    pub fn combined_tally(
        &self,
        election: &Election,
        party_id: Option<&str>,
    ) -> Result<Tally, TallyError> {
        self.check_machine_type()?;
        let parties = match party_id {
            Some(party) => vec![Some(party)],
            None => election.party_ids_in_ballot_styles(),
        };

        let precincts: Vec<Option<&str>> = match self.precinct_breakdown() {
            Some(by_precinct) => by_precinct.keys().map(|p| Some(p.as_str())).collect(),
            None => vec![self.single_precinct_id()],
        };
        let mut totals: BallotCountDetails = [0, 0];
        for party in &parties {
            for precinct in &precincts {
                let [on_site, absentee] = self.count_details(*party, *precinct);
                add_count(&mut totals[0], on_site, "ballot counts")?;
                add_count(&mut totals[1], absentee, "ballot counts")?;
            }
        }
        let counts = BallotCounts::from_details(totals)?;

        match self.precinct_breakdown() {
            Some(by_precinct) => {
                let parts = by_precinct
                    .values()
                    .map(|compressed| {
                        read_compressed_tally(election, compressed, &BallotCounts::default(), party_id)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let mut combined = aggregate(&parts)?;
                combined.number_of_ballots_counted = counts.number_of_ballots;
                combined.ballot_counts_by_voting_method = counts.by_voting_method;
                Ok(combined)
            }
            None => read_compressed_tally(election, &self.tally, &counts, party_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::fixture;
    use proptest::prelude::*;

    fn sample_compressed() -> CompressedTally {
        vec![
            vec![1, 0, 10, 4, 3, 1, 1],       // president: 3 candidates + write-in
            vec![2, 1, 10, 5, 6, 7, 2, 3],    // city council: 4 candidates + write-in
            vec![1, 0, 10, 6, 3],             // question-a
            vec![5, 3, 1, 1, 4, 4, 2, 0, 10], // measure-1
            vec![0, 0, 4, 3, 1],              // mayor-dem: 2 candidates
        ]
    }

    fn counts(n: u64) -> BallotCounts {
        BallotCounts {
            number_of_ballots: n,
            by_voting_method: BTreeMap::from([(VotingMethod::Precinct, n)]),
        }
    }

    #[test]
    fn test_read_candidate_and_yes_no() {
        let def = fixture();
        let tally =
            read_compressed_tally(&def.election, &sample_compressed(), &counts(10), None).unwrap();

        assert_eq!(tally.number_of_ballots_counted, 10);
        let president = tally.contest("president").unwrap();
        assert_eq!(president.tallies["barchi-hallaren"], 4);
        assert_eq!(president.tallies["court-blumhardt"], 1);
        assert_eq!(president.tallies[WRITE_IN_OPTION_ID], 1);
        assert_eq!(
            president.metadata,
            ContestTallyMeta {
                undervotes: 1,
                overvotes: 0,
                ballots: 10
            }
        );

        let question = tally.contest("question-a").unwrap();
        assert_eq!(question.tallies[YES_OPTION_ID], 6);
        assert_eq!(question.tallies[NO_OPTION_ID], 3);

        let mayor = tally.contest("mayor-dem").unwrap();
        assert!(!mayor.tallies.contains_key(WRITE_IN_OPTION_ID));
    }

    #[test]
    fn test_read_either_neither_splits_sub_contests() {
        let def = fixture();
        let tally =
            read_compressed_tally(&def.election, &sample_compressed(), &counts(10), None).unwrap();

        assert!(tally.contest("measure-1").is_none());
        let en = tally.contest("measure-1-either-neither").unwrap();
        assert_eq!(en.tallies[YES_OPTION_ID], 5);
        assert_eq!(en.tallies[NO_OPTION_ID], 3);
        assert_eq!(en.metadata.undervotes, 1);
        assert_eq!(en.metadata.ballots, 10);
        let po = tally.contest("measure-1-pick-one").unwrap();
        assert_eq!(po.tallies[YES_OPTION_ID], 4);
        assert_eq!(po.metadata.undervotes, 2);
        assert_eq!(po.metadata.ballots, 10);
    }

    #[test]
    fn test_party_filter_keeps_nonpartisan_contests() {
        let def = fixture();
        let tally = read_compressed_tally(
            &def.election,
            &sample_compressed(),
            &counts(10),
            Some("rep"),
        )
        .unwrap();
        assert!(tally.contest("mayor-dem").is_none());
        assert!(tally.contest("president").is_some());

        let tally = read_compressed_tally(
            &def.election,
            &sample_compressed(),
            &counts(10),
            Some("dem"),
        )
        .unwrap();
        assert!(tally.contest("mayor-dem").is_some());
    }

    #[test]
    fn test_malformed_entries_rejected() {
        let def = fixture();
        let mut compressed = sample_compressed();
        compressed.pop();
        assert_eq!(
            read_compressed_tally(&def.election, &compressed, &counts(0), None),
            Err(TallyError::ContestCountMismatch {
                expected: 5,
                found: 4
            })
        );

        let mut compressed = sample_compressed();
        compressed[2].push(0);
        assert!(matches!(
            read_compressed_tally(&def.election, &compressed, &counts(0), None),
            Err(TallyError::MalformedContest { expected: 5, found: 6, .. })
        ));
    }

    #[test]
    fn test_compress_inverts_read() {
        let def = fixture();
        let compressed = sample_compressed();
        let tally = read_compressed_tally(&def.election, &compressed, &counts(10), None).unwrap();
        assert_eq!(compress_tally(&def.election, &tally), compressed);
    }

    #[test]
    fn test_zero_compressed_tally_shape() {
        let def = fixture();
        let zero = zero_compressed_tally(&def.election);
        let lengths: Vec<usize> = zero.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![7, 8, 5, 9, 5]);
        assert!(zero.iter().flatten().all(|n| *n == 0));
    }

    #[test]
    fn test_aggregate_missing_contest_is_zero() {
        let def = fixture();
        let full =
            read_compressed_tally(&def.election, &sample_compressed(), &counts(10), None).unwrap();
        let mut partial = full.clone();
        partial.contest_tallies.remove("president");

        let combined = aggregate(&[full.clone(), partial]).unwrap();
        assert_eq!(combined.number_of_ballots_counted, 20);
        assert_eq!(
            combined.contest("president"),
            full.contest("president"),
            "president only present in one tally"
        );
        assert_eq!(
            combined.contest("question-a").unwrap().tallies[YES_OPTION_ID],
            12
        );
        assert_eq!(
            combined.ballot_counts_by_voting_method[&VotingMethod::Precinct],
            20
        );
    }

    #[test]
    fn test_poll_worker_payload_combined_tally() {
        let def = fixture();
        let mut by_precinct = BTreeMap::new();
        by_precinct.insert("p1".to_string(), sample_compressed());
        by_precinct.insert("p2".to_string(), sample_compressed());
        let payload = PollWorkerCardTally {
            tally_machine_type: "precinct_scanner".to_string(),
            tally: sample_compressed(),
            tallies_by_precinct: Some(by_precinct),
            total_ballots_scanned: 20,
            machine_id: "0001".to_string(),
            time_saved: 1_700_000_000_000,
            time_polls_transitioned: 1_700_000_000_000,
            precinct_selection: PrecinctSelection::AllPrecincts,
            is_live_mode: true,
            polls_transition: "close_polls".to_string(),
            ballot_counts: BTreeMap::from([
                (tally_identifier(None, Some("p1")), [6, 4]),
                (tally_identifier(None, Some("p2")), [10, 0]),
                (tally_identifier(Some("dem"), Some("p2")), [2, 0]),
            ]),
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"talliesByPrecinct\""));
        let parsed = PollWorkerCardTally::from_json(&json).unwrap();
        assert_eq!(parsed, payload);

        let combined = parsed.combined_tally(&def.election, None).unwrap();
        assert_eq!(combined.number_of_ballots_counted, 22);
        assert_eq!(
            combined.ballot_counts_by_voting_method,
            BTreeMap::from([(VotingMethod::Precinct, 18), (VotingMethod::Absentee, 4)])
        );
        assert_eq!(
            combined.contest("city-council").unwrap().tallies["johnson"],
            14
        );

        let dem = parsed.combined_tally(&def.election, Some("dem")).unwrap();
        assert_eq!(dem.number_of_ballots_counted, 2);
        assert_eq!(dem.contest("mayor-dem").unwrap().tallies.values().sum::<u64>(), 8);
    }

    #[test]
    fn test_sub_tallies_per_party_and_precinct() {
        let def = fixture();
        let json = serde_json::json!({
            "tallyMachineType": "precinct_scanner",
            "tally": sample_compressed(),
            "talliesByPrecinct": { "p1": sample_compressed(), "p2": zero_compressed_tally(&def.election) },
            "totalBallotsScanned": 10,
            "machineId": "0003",
            "timeSaved": 0,
            "precinctSelection": { "kind": "AllPrecincts" },
            "isLiveMode": true,
            "pollsTransition": "close_polls",
            "ballotCounts": { "undefined,p1": [7, 3] }
        })
        .to_string();
        let payload = PollWorkerCardTally::from_json(&json).unwrap();
        assert!(!payload.polls_open());

        let subs = payload.sub_tallies(&def.election).unwrap();
        let keys: Vec<&str> = subs.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["dem,p1", "dem,p2", "undefined,p1", "undefined,p2"]);

        let nonpartisan_p1 = &subs["undefined,p1"];
        assert_eq!(nonpartisan_p1.number_of_ballots_counted, 10);
        assert_eq!(
            nonpartisan_p1.ballot_counts_by_voting_method[&VotingMethod::Absentee],
            3
        );
        assert_eq!(nonpartisan_p1.contest("question-a").unwrap().tallies[YES_OPTION_ID], 6);

        let dem_p1 = &subs["dem,p1"];
        assert_eq!(dem_p1.number_of_ballots_counted, 0);
        assert!(dem_p1.contest("mayor-dem").is_some());
        assert_eq!(subs["undefined,p2"].contest("question-a").unwrap().tallies[YES_OPTION_ID], 0);
    }

    #[test]
    fn test_tally_identifier_defaults() {
        assert_eq!(tally_identifier(Some("dem"), Some("p1")), "dem,p1");
        assert_eq!(tally_identifier(None, Some("p1")), "undefined,p1");
        assert_eq!(tally_identifier(Some("dem"), None), "dem,__ALL_PRECINCTS");
        assert_eq!(tally_identifier(None, None), "undefined,__ALL_PRECINCTS");
    }

    #[test]
    fn test_ballot_count_details_split_by_voting_method() {
        let counts = BallotCounts::from_details([15, 5]).unwrap();
        assert_eq!(counts.number_of_ballots, 20);
        assert_eq!(
            counts.by_voting_method,
            BTreeMap::from([(VotingMethod::Precinct, 15), (VotingMethod::Absentee, 5)])
        );
        assert_eq!(
            BallotCounts::from_details([u64::MAX, 1]),
            Err(TallyError::Overflow("ballot counts".to_string()))
        );
    }

    #[test]
    fn test_aggregate_overflow_is_error() {
        let def = fixture();
        let mut huge =
            read_compressed_tally(&def.election, &sample_compressed(), &counts(u64::MAX), None)
                .unwrap();
        assert!(matches!(
            aggregate(&[huge.clone(), huge.clone()]),
            Err(TallyError::Overflow(_))
        ));

        huge.number_of_ballots_counted = 0;
        huge.ballot_counts_by_voting_method.clear();
        let question = huge.contest_tallies.get_mut("question-a").unwrap();
        question.tallies.insert(YES_OPTION_ID.to_string(), u64::MAX);
        let other =
            read_compressed_tally(&def.election, &sample_compressed(), &counts(0), None).unwrap();
        assert_eq!(
            aggregate(&[huge, other]),
            Err(TallyError::Overflow("question-a".to_string()))
        );
    }

    #[test]
    fn test_combined_tally_overflow_is_error() {
        let def = fixture();
        let max = u64::MAX;
        let json = serde_json::json!({
            "tallyMachineType": "precinct_scanner",
            "tally": sample_compressed(),
            "talliesByPrecinct": {
                "p1": [[max, 0, 0, 0, 0, 0, 0], [0, 0, 0, 0, 0, 0, 0, 0], [0, 0, 0, 0, 0], [0, 0, 0, 0, 0, 0, 0, 0, 0], [0, 0, 0, 0, 0]],
                "p2": sample_compressed()
            },
            "totalBallotsScanned": 0,
            "machineId": "0004",
            "timeSaved": 0,
            "precinctSelection": { "kind": "AllPrecincts" },
            "isLiveMode": true
        })
        .to_string();
        let payload = PollWorkerCardTally::from_json(&json).unwrap();
        assert_eq!(
            payload.combined_tally(&def.election, None),
            Err(TallyError::Overflow("president".to_string()))
        );
    }

    #[test]
    fn test_poll_worker_payload_without_precinct_breakdown() {
        let def = fixture();
        let json = serde_json::json!({
            "tallyMachineType": "precinct_scanner",
            "tally": sample_compressed(),
            "totalBallotsScanned": 10,
            "machineId": "0002",
            "timeSaved": 0,
            "precinctSelection": { "kind": "SinglePrecinct", "precinctId": "p1" },
            "isLiveMode": false,
            "pollsTransition": "unpause_polls",
            "ballotCounts": { "undefined,p1": [4, 6], "undefined,p2": [100, 100] }
        })
        .to_string();

        let payload = PollWorkerCardTally::from_json(&json).unwrap();
        assert!(payload.polls_open());
        let combined = payload.combined_tally(&def.election, None).unwrap();
        assert_eq!(combined.contest("question-a").unwrap().tallies[NO_OPTION_ID], 3);
        assert_eq!(combined.number_of_ballots_counted, 10);
        assert_eq!(
            combined.ballot_counts_by_voting_method,
            BTreeMap::from([(VotingMethod::Precinct, 4), (VotingMethod::Absentee, 6)])
        );
        assert!(PollWorkerCardTally::from_json("{}").is_err());
    }

    #[test]
    fn test_payload_from_other_machine_rejected() {
        let def = fixture();
        let mut payload = PollWorkerCardTally::from_json(
            &serde_json::json!({
                "tallyMachineType": "bmd",
                "tally": sample_compressed(),
                "totalBallotsScanned": 10,
                "machineId": "0005",
                "timeSaved": 0,
                "precinctSelection": { "kind": "AllPrecincts" },
                "isLiveMode": true
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(
            payload.combined_tally(&def.election, None),
            Err(TallyError::UnsupportedMachine("bmd".to_string()))
        );
        assert!(payload.sub_tallies(&def.election).is_err());

        payload.tally_machine_type = PRECINCT_SCANNER_MACHINE_TYPE.to_string();
        assert_eq!(payload.combined_tally(&def.election, None).unwrap().number_of_ballots_counted, 0);
    }

    fn arbitrary_compressed() -> impl Strategy<Value = CompressedTally> {
        let entry = |len: usize| proptest::collection::vec(0u64..1000, len);
        (entry(7), entry(8), entry(5), entry(9), entry(5))
            .prop_map(|(a, b, c, d, e)| vec![a, b, c, d, e])
    }

    proptest! {
        #[test]
        fn prop_aggregate_commutes(
            a in arbitrary_compressed(),
            b in arbitrary_compressed(),
            na in 0u64..1000,
            nb in 0u64..1000,
        ) {
            let def = fixture();
            let a = read_compressed_tally(&def.election, &a, &counts(na), None).unwrap();
            let b = read_compressed_tally(&def.election, &b, &counts(nb), None).unwrap();

            prop_assert_eq!(
                aggregate(&[a.clone(), b.clone()]).unwrap(),
                aggregate(&[b.clone(), a.clone()]).unwrap()
            );

            let zero = read_compressed_tally(
                &def.election,
                &zero_compressed_tally(&def.election),
                &counts(0),
                None,
            )
            .unwrap();
            prop_assert_eq!(aggregate(&[a.clone(), zero]).unwrap(), a.clone());

            let c = aggregate(&[a.clone(), b.clone()]).unwrap();
            let ba = aggregate(&[b, a.clone()]).unwrap();
            prop_assert_eq!(aggregate(&[c, a.clone()]).unwrap(), aggregate(&[a, ba]).unwrap());
        }
    }
}
