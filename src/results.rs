//! Results aggregation for live tallies
//!
//! Pure arithmetic over a [`Results`] value: adding a ballot's selections
//! into per-question tally vectors with weight, subtracting overwritten
//! ballots, and validating ballot packages against the process vote options.
//! Nothing here touches storage; the indexer drives these functions inside
//! the per-block write transaction.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{BigNum, EnvelopeType, VoteOptions};

/// Partial or final tally of a voting process.
///
/// `votes[q][v]` accumulates the weight of every ballot that selected value
/// `v` for question `q`; `weight` accumulates each ballot's weight once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Results {
    /// Process identifier the tally belongs to.
    pub process_id: Vec<u8>,
    /// Tally cells, one vector per question, one cell per choice value.
    pub votes: Vec<Vec<BigNum>>,
    /// Total accumulated ballot weight.
    pub weight: BigNum,
    /// Ballot validation schema used to size and check the tally.
    pub vote_opts: VoteOptions,
    /// Envelope type of the process.
    pub envelope: EnvelopeType,
    /// Height of the block that last touched the tally.
    pub block_height: u32,
}

/// Zeroed tally cells sized by the vote options: one vector per question,
/// `max_value + 1` cells each (0 is always a valid choice).
pub fn empty_votes(opts: &VoteOptions) -> Vec<Vec<BigNum>> {
    let cells = opts.max_value as usize + 1;
    (0..opts.max_count)
        .map(|_| vec![BigNum::zero(); cells])
        .collect()
}

impl Results {
    /// A zeroed tally for a process.
    pub fn empty(process_id: Vec<u8>, opts: &VoteOptions, envelope: &EnvelopeType) -> Results {
        Results {
            process_id,
            votes: empty_votes(opts),
            weight: BigNum::zero(),
            vote_opts: opts.clone(),
            envelope: envelope.clone(),
            block_height: 0,
        }
    }

    /// Add one ballot into the tally.
    ///
    /// The package is decoded and validated against the vote options; an
    /// invalid ballot leaves the tally untouched and returns the error so
    /// the caller can drop-and-log it.
    pub fn add_vote(&mut self, package: &[u8], weight: &BigNum) -> Result<()> {
        let choices = decode_package(package)?;
        validate_choices(&choices, &self.vote_opts)?;
        for (question, &value) in choices.iter().enumerate() {
            self.votes[question][value as usize].add_assign(weight);
        }
        self.weight.add_assign(weight);
        Ok(())
    }

    /// Subtract one ballot from the tally, undoing a previous `add_vote`.
    pub fn sub_vote(&mut self, package: &[u8], weight: &BigNum) -> Result<()> {
        let choices = decode_package(package)?;
        validate_choices(&choices, &self.vote_opts)?;
        for (question, &value) in choices.iter().enumerate() {
            self.votes[question][value as usize].sub_assign(weight);
        }
        self.weight.sub_assign(weight);
        Ok(())
    }

    /// Merge another tally into this one cell-by-cell.
    pub fn add(&mut self, other: &Results) -> Result<()> {
        self.check_dimensions(other)?;
        for (mine, theirs) in self.votes.iter_mut().zip(&other.votes) {
            for (cell, delta) in mine.iter_mut().zip(theirs) {
                cell.add_assign(delta);
            }
        }
        self.weight.add_assign(&other.weight);
        Ok(())
    }

    /// Subtract another tally from this one cell-by-cell.
    pub fn sub(&mut self, other: &Results) -> Result<()> {
        self.check_dimensions(other)?;
        for (mine, theirs) in self.votes.iter_mut().zip(&other.votes) {
            for (cell, delta) in mine.iter_mut().zip(theirs) {
                cell.sub_assign(delta);
            }
        }
        self.weight.sub_assign(&other.weight);
        Ok(())
    }

    fn check_dimensions(&self, other: &Results) -> Result<()> {
        if self.votes.len() != other.votes.len()
            || self
                .votes
                .first()
                .map(Vec::len)
                .unwrap_or(0)
                != other.votes.first().map(Vec::len).unwrap_or(0)
        {
            return Err(Error::Payload(format!(
                "tally dimensions do not match: {}x{} vs {}x{}",
                self.votes.len(),
                self.votes.first().map(Vec::len).unwrap_or(0),
                other.votes.len(),
                other.votes.first().map(Vec::len).unwrap_or(0),
            )));
        }
        Ok(())
    }
}

impl crate::types::Process {
    /// The tally currently embedded in the process row.
    pub fn results(&self) -> Results {
        Results {
            process_id: self.id.clone(),
            votes: self.results_votes.clone(),
            weight: self.results_weight.clone(),
            vote_opts: self.vote_opts.clone(),
            envelope: self.envelope.clone(),
            block_height: self.results_block_height,
        }
    }
}

/// Decode a ballot package: a JSON array of unsigned choice values, one per
/// question.
pub fn decode_package(package: &[u8]) -> Result<Vec<u64>> {
    serde_json::from_slice(package)
        .map_err(|e| Error::Payload(format!("cannot decode vote package: {e}")))
}

/// Validate a decoded ballot against the process vote options.
pub fn validate_choices(choices: &[u64], opts: &VoteOptions) -> Result<()> {
    if choices.len() != opts.max_count as usize {
        return Err(Error::Payload(format!(
            "wrong number of choices: got {}, process has {} questions",
            choices.len(),
            opts.max_count
        )));
    }
    for &value in choices {
        if value > u64::from(opts.max_value) {
            return Err(Error::Payload(format!(
                "choice value {} above maximum {}",
                value, opts.max_value
            )));
        }
    }
    if opts.unique_values {
        let mut seen = std::collections::HashSet::new();
        for &value in choices {
            if !seen.insert(value) {
                return Err(Error::Payload(format!("repeated choice value {value}")));
            }
        }
    }
    // The exponent is scaled by 10000, so 10000 means linear cost.
    if opts.max_total_cost > 0 {
        let exponent = f64::from(opts.cost_exponent) / 10000.0;
        let total: f64 = choices.iter().map(|&v| (v as f64).powf(exponent)).sum();
        if total > opts.max_total_cost as f64 {
            return Err(Error::Payload(format!(
                "total ballot cost {} above maximum {}",
                total, opts.max_total_cost
            )));
        }
    }
    Ok(())
}
