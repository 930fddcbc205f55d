//! Indexed entity types
//!
//! These are the row-level data types served by the query surface. They are
//! optimized for querying and JSON rendering, and are intentionally separate
//! from the chain application's consensus state types (see [`crate::chain`]).

use std::fmt;
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Arbitrary-precision integer used for ballot weights and tally cells.
///
/// Serialized as a decimal string (`"5"`) so that embedded JSON blobs stay
/// readable and portable across implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BigNum(BigInt);

impl BigNum {
    /// Zero value.
    pub fn zero() -> Self {
        BigNum(BigInt::zero())
    }

    /// Construct from a u64.
    pub fn from_u64(v: u64) -> Self {
        BigNum(BigInt::from(v))
    }

    /// Construct from canonical big-endian unsigned bytes.
    ///
    /// An empty slice decodes as zero.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        BigNum(BigInt::from_bytes_be(num_bigint::Sign::Plus, bytes))
    }

    /// Whether the value is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// In-place addition.
    pub fn add_assign(&mut self, other: &BigNum) {
        self.0 += &other.0;
    }

    /// In-place subtraction. The result may go negative; tally merging
    /// relies on add/subtract commuting within a block.
    pub fn sub_assign(&mut self, other: &BigNum) {
        self.0 -= &other.0;
    }
}

impl fmt::Display for BigNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BigNum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let v = BigInt::from_str(s)
            .map_err(|e| Error::Payload(format!("invalid bignum {s:?}: {e}")))?;
        Ok(BigNum(v))
    }
}

impl Serialize for BigNum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BigNum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigNum::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Ballot validation schema of a voting process: question count, per-question
/// value bounds, uniqueness and cost limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOptions {
    /// Number of questions in the ballot.
    pub max_count: u32,
    /// Maximum value a single choice may take (0 is always a valid choice).
    pub max_value: u32,
    /// Maximum number of times a ballot may be overwritten.
    pub max_vote_overwrites: u32,
    /// Upper bound for the summed choice cost; 0 disables the check.
    pub max_total_cost: u64,
    /// Cost exponent, scaled by 10000 (10000 means exponent 1).
    pub cost_exponent: u32,
    /// Whether choice values must be pairwise distinct.
    pub unique_values: bool,
}

/// Envelope type flags of a voting process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeType {
    /// Ballots must be cast in question order.
    pub serial: bool,
    /// Ballots are cast with zero-knowledge census proofs.
    pub anonymous: bool,
    /// Ballot packages are encrypted until keys are revealed.
    pub encrypted_votes: bool,
    /// Ballot cost is taken from the voter weight.
    pub cost_from_weight: bool,
}

/// Process mode flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMode {
    /// The process starts automatically at its start block.
    pub auto_start: bool,
    /// The process can be paused and resumed.
    pub interruptible: bool,
    /// The census can be updated while the process is live.
    pub dynamic_census: bool,
    /// The metadata blob is encrypted.
    pub encrypted_metadata: bool,
    /// Voters must pre-register before the process starts.
    pub pre_register: bool,
}

/// Lifecycle status of a voting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    /// Status not known to the chain.
    Unknown = 0,
    /// Accepting ballots.
    Ready = 1,
    /// Voting period over, results not yet computed.
    Ended = 2,
    /// Canceled before completion.
    Canceled = 3,
    /// Temporarily not accepting ballots.
    Paused = 4,
    /// Final results available.
    Results = 5,
}

impl ProcessStatus {
    /// Decode from the stored integer representation.
    pub fn from_i64(v: i64) -> ProcessStatus {
        match v {
            1 => ProcessStatus::Ready,
            2 => ProcessStatus::Ended,
            3 => ProcessStatus::Canceled,
            4 => ProcessStatus::Paused,
            5 => ProcessStatus::Results,
            _ => ProcessStatus::Unknown,
        }
    }
}

/// Transaction type tag, stored as a string in the transactions table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxType {
    /// Ballot submission.
    Vote,
    /// New voting process creation.
    NewProcess,
    /// Mutation of an existing process (status, census, duration).
    SetProcess,
    /// Token transfer between accounts.
    SendTokens,
    /// Token minting.
    MintTokens,
    /// Account creation or update.
    SetAccount,
    /// Voter key registration.
    RegisterKey,
    /// Chain administration.
    Admin,
    /// Anything the decoder does not recognize.
    Unknown,
}

impl TxType {
    /// Wire tag used in the transactions table.
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Vote => "vote",
            TxType::NewProcess => "newProcess",
            TxType::SetProcess => "setProcess",
            TxType::SendTokens => "sendTokens",
            TxType::MintTokens => "mintTokens",
            TxType::SetAccount => "setAccount",
            TxType::RegisterKey => "registerKey",
            TxType::Admin => "admin",
            TxType::Unknown => "unknown",
        }
    }

    /// Lowercased name used in token-fee rows.
    pub fn fee_label(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A voting process (election) as indexed for querying.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Process identifier.
    pub id: Vec<u8>,
    /// Organizer entity identifier.
    pub entity_id: Vec<u8>,
    /// First block accepting ballots.
    pub start_block: u32,
    /// Last block accepting ballots.
    pub end_block: u32,
    /// Number of distinct nullifiers with at least one ballot.
    pub vote_count: u64,
    /// Whether live results are being computed for this process.
    pub have_results: bool,
    /// Whether results are final and immutable.
    pub final_results: bool,
    /// Census merkle root.
    pub census_root: Vec<u8>,
    /// Rolling census merkle root (pre-register processes).
    pub rolling_census_root: Vec<u8>,
    /// Rolling census size.
    pub rolling_census_size: u64,
    /// Maximum census size.
    pub max_census_size: u64,
    /// Census URI.
    pub census_uri: String,
    /// Metadata URI.
    pub metadata: String,
    /// Census origin tag.
    pub census_origin: i32,
    /// Lifecycle status.
    pub status: ProcessStatus,
    /// Envelope type flags.
    pub envelope: EnvelopeType,
    /// Process mode flags.
    pub mode: ProcessMode,
    /// Ballot validation schema.
    pub vote_opts: VoteOptions,
    /// Revealed private keys, hex-encoded.
    pub private_keys: Vec<String>,
    /// Published public keys, hex-encoded.
    pub public_keys: Vec<String>,
    /// Unix timestamp of process creation.
    pub creation_time: i64,
    /// Block height on the source network, for bridged processes.
    pub source_block_height: u64,
    /// Source network identifier, for bridged processes.
    pub source_network_id: String,
    /// Tally cells: one vector per question, one cell per choice value.
    pub results_votes: Vec<Vec<BigNum>>,
    /// Total accumulated ballot weight.
    pub results_weight: BigNum,
    /// Height of the block that last touched the results.
    pub results_block_height: u32,
}

/// A single ballot row. Every overwrite is retained; the effective ballot
/// for a nullifier is the row with the highest overwrite counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    /// Ballot nullifier.
    pub nullifier: Vec<u8>,
    /// Process the ballot belongs to.
    pub process_id: Vec<u8>,
    /// Height of the block carrying the ballot.
    pub block_height: u32,
    /// Transaction index within the block.
    pub block_index: i32,
    /// Ballot weight.
    pub weight: BigNum,
    /// Overwrite counter, monotonic per (process, nullifier).
    pub overwrite_count: u32,
    /// Optional voter identifier.
    pub voter_id: Vec<u8>,
    /// Indexes of the encryption keys used for this ballot.
    pub encryption_key_indexes: Vec<u32>,
    /// Opaque ballot package (JSON text).
    pub package: String,
}

/// An account row, replaced in place on each set-account event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account address.
    pub address: Vec<u8>,
    /// Token balance.
    pub balance: u64,
    /// Transaction nonce.
    pub nonce: u32,
}

/// A token transfer row. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    /// Hash of the transaction carrying the transfer.
    pub tx_hash: Vec<u8>,
    /// Height of the block carrying the transfer.
    pub block_height: u32,
    /// Sender address.
    pub from: Vec<u8>,
    /// Recipient address.
    pub to: Vec<u8>,
    /// Transferred amount.
    pub amount: u64,
    /// Unix timestamp of the carrying block.
    pub timestamp: i64,
}

/// A token fee row. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenFee {
    /// Paying account address.
    pub from: Vec<u8>,
    /// Lowercased transaction type that caused the fee.
    pub tx_type: String,
    /// Fee amount.
    pub cost: u64,
    /// Free-form reference (usually the affected entity id).
    pub reference: String,
    /// Unix timestamp of the carrying block.
    pub timestamp: i64,
    /// Height of the carrying block.
    pub block_height: u32,
}

/// A block metadata row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Chain identifier.
    pub chain_id: String,
    /// Block height.
    pub height: u32,
    /// Unix timestamp of the block.
    pub time: i64,
    /// Block hash.
    pub hash: Vec<u8>,
    /// Proposer address.
    pub proposer_address: Vec<u8>,
    /// Hash of the previous block.
    pub last_block_hash: Vec<u8>,
}

/// A transaction metadata row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Monotonic row id, used as the query tiebreaker.
    pub id: u64,
    /// Transaction hash.
    pub hash: Vec<u8>,
    /// Height of the containing block.
    pub block_height: u32,
    /// Index within the containing block.
    pub block_index: i32,
    /// Type tag.
    pub tx_type: String,
}

/// Encode a value as a JSON string for an embedded blob column.
pub(crate) fn encode_json<T: Serialize>(v: &T) -> Result<String> {
    Ok(serde_json::to_string(v)?)
}
