//! Chain-application interface consumed by the indexer
//!
//! The indexer never owns consensus state. It observes a chain application
//! through [`ChainApplication`] and receives per-block mutation callbacks
//! through [`StateEventSink`], which the indexer itself implements.

use std::sync::Arc;

use crate::error::Result;
use crate::results::Results;
use crate::types::{BigNum, Process, ProcessStatus, TxType};

/// A ballot as stored in the chain application's state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateVote {
    /// Process the ballot belongs to.
    pub process_id: Vec<u8>,
    /// Ballot nullifier.
    pub nullifier: Vec<u8>,
    /// Height of the block carrying the ballot.
    pub height: u32,
    /// Opaque ballot package bytes (JSON).
    pub vote_package: Vec<u8>,
    /// Ballot weight; `None` means weight 1.
    pub weight: Option<BigNum>,
    /// Indexes of the encryption keys used for this ballot.
    pub encryption_key_indexes: Vec<u32>,
    /// Overwrite counter, monotonic per (process, nullifier).
    pub overwrites: u32,
    /// Optional voter identifier.
    pub voter_id: Vec<u8>,
}

impl StateVote {
    /// Ballot weight, defaulting to 1 when absent.
    pub fn weight_or_default(&self) -> BigNum {
        self.weight.clone().unwrap_or_else(|| BigNum::from_u64(1))
    }
}

/// An account as stored in the chain application's state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateAccount {
    /// Token balance.
    pub balance: u64,
    /// Transaction nonce.
    pub nonce: u32,
}

/// A voting process as stored in the chain application's state.
///
/// This is the authoritative record the indexer mirrors; the indexed
/// [`Process`] row is derived from it.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateProcess {
    /// Organizer entity identifier.
    pub entity_id: Vec<u8>,
    /// First block accepting ballots.
    pub start_block: u32,
    /// Last block accepting ballots.
    pub end_block: u32,
    /// Census merkle root.
    pub census_root: Vec<u8>,
    /// Rolling census merkle root.
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
    pub status: i32,
    /// Envelope type flags.
    pub envelope: crate::types::EnvelopeType,
    /// Process mode flags.
    pub mode: crate::types::ProcessMode,
    /// Ballot validation schema.
    pub vote_opts: crate::types::VoteOptions,
    /// Revealed private keys, hex-encoded.
    pub private_keys: Vec<String>,
    /// Published public keys, hex-encoded.
    pub public_keys: Vec<String>,
    /// Unix timestamp of process creation.
    pub creation_time: i64,
    /// Block height on the source network, for bridged processes.
    pub source_block_height: u64,
    /// Source network identifier.
    pub source_network_id: String,
    /// Consensus-final tally, present once the chain has sealed results.
    pub final_results: Option<StateProcessResults>,
}

/// Consensus-final tally attached to a [`StateProcess`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateProcessResults {
    /// Tally cells: one vector per question, one cell per choice value.
    pub votes: Vec<Vec<BigNum>>,
    /// Total accumulated ballot weight.
    pub weight: BigNum,
}

/// A token transfer observed by the chain application.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransferEvent {
    /// Hash of the carrying transaction.
    pub tx_hash: Vec<u8>,
    /// Sender address.
    pub from: Vec<u8>,
    /// Recipient address.
    pub to: Vec<u8>,
    /// Transferred amount.
    pub amount: u64,
}

/// A block as served by the chain application's block store.
#[derive(Debug, Clone)]
pub struct ChainBlock {
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
    /// Raw transaction bytes, in block order.
    pub txs: Vec<Vec<u8>>,
}

/// A decoded chain transaction: its identity plus the typed state events it
/// produced, mirroring the [`StateEventSink`] callbacks one-to-one so that a
/// block replay drives the same code paths as live ingestion.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    /// Transaction hash.
    pub hash: Vec<u8>,
    /// Type tag.
    pub tx_type: TxType,
    /// Typed state events carried by the transaction.
    pub events: Vec<TxEvent>,
}

/// A typed state event carried by a decoded transaction.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TxEvent {
    /// A new voting process was created.
    Process {
        /// Identifier of the new process.
        process_id: Vec<u8>,
    },
    /// A ballot was cast.
    Vote(StateVote),
    /// A process changed status (ready, paused, ended, canceled, results).
    ProcessStatusChange {
        /// Identifier of the affected process.
        process_id: Vec<u8>,
    },
    /// A process census was updated.
    CensusUpdate {
        /// Identifier of the affected process.
        process_id: Vec<u8>,
    },
    /// Process encryption keys were revealed.
    RevealKeys {
        /// Identifier of the affected process.
        process_id: Vec<u8>,
    },
    /// An account was created or replaced.
    SetAccount {
        /// Account address.
        address: Vec<u8>,
        /// New account state.
        account: StateAccount,
    },
    /// Tokens moved between accounts.
    TransferTokens(TokenTransferEvent),
    /// Tokens were spent as a transaction fee.
    SpendTokens {
        /// Paying account address.
        from: Vec<u8>,
        /// Transaction type that caused the fee.
        tx_type: TxType,
        /// Fee amount.
        cost: u64,
        /// Free-form reference.
        reference: String,
    },
}

/// Interface the chain application exposes to the indexer.
///
/// Implementations must be cheap to call concurrently; the indexer invokes
/// these from the callback thread, from query threads and from background
/// bootstrap/reindex tasks.
pub trait ChainApplication: Send + Sync {
    /// Current chain height.
    fn height(&self) -> u32;

    /// Unix timestamp of the latest block.
    fn timestamp(&self) -> i64;

    /// Chain identifier.
    fn chain_id(&self) -> String;

    /// Whether the chain has caught up with the network.
    fn is_synced(&self) -> bool;

    /// Block until the chain reports synced.
    fn wait_until_synced(&self);

    /// Fetch a block from the block store, if present.
    fn block_by_height(&self, height: u32) -> Option<ChainBlock>;

    /// Lowest height retained by the block store.
    fn block_store_base(&self) -> u32;

    /// Highest height retained by the block store.
    fn block_store_head(&self) -> u32;

    /// Fetch a process from state. `committed` selects the last committed
    /// version instead of the in-flight one.
    fn process(&self, process_id: &[u8], committed: bool) -> Result<StateProcess>;

    /// Fetch a ballot from state, if present. `committed` selects the last
    /// committed version instead of the in-flight one.
    fn vote(&self, process_id: &[u8], nullifier: &[u8], committed: bool)
        -> Result<Option<StateVote>>;

    /// Cursor over all ballots of a process. The callback returns `true` to
    /// stop iteration early.
    fn iterate_votes(
        &self,
        process_id: &[u8],
        committed: bool,
        callback: &mut dyn FnMut(&StateVote) -> bool,
    ) -> Result<()>;

    /// Decode raw transaction bytes into the typed events they carry.
    fn decode_transaction(&self, raw: &[u8], chain_id: &str) -> Result<ChainTransaction>;

    /// Register the indexer's callback set with the state machine.
    fn add_event_sink(&self, sink: Arc<dyn StateEventSink>);
}

/// Per-block mutation callbacks the chain application invokes on the indexer.
///
/// All callbacks are invoked single-threaded between a block's first
/// mutation and its commit; `commit` and `rollback` close the block.
pub trait StateEventSink: Send + Sync {
    /// A new voting process was created.
    fn on_process(&self, process_id: &[u8], tx_index: i32);

    /// A ballot was cast.
    fn on_vote(&self, vote: &StateVote, tx_index: i32);

    /// A process was canceled.
    fn on_cancel(&self, process_id: &[u8], tx_index: i32);

    /// Process encryption keys were published.
    fn on_process_keys(&self, process_id: &[u8], tx_index: i32);

    /// Process encryption keys were revealed.
    fn on_reveal_keys(&self, process_id: &[u8], tx_index: i32);

    /// A process changed status.
    fn on_process_status_change(&self, process_id: &[u8], status: ProcessStatus, tx_index: i32);

    /// A process changed duration.
    fn on_process_duration_change(&self, process_id: &[u8], duration: u32, tx_index: i32);

    /// The chain sealed results for a process.
    fn on_process_results(&self, process_id: &[u8], tx_index: i32);

    /// A set of processes started.
    fn on_processes_start(&self, process_ids: &[Vec<u8>]);

    /// A process census was updated.
    fn on_census_update(&self, process_id: &[u8]);

    /// An account was created or replaced.
    fn on_set_account(&self, address: &[u8], account: &StateAccount);

    /// Tokens moved between accounts.
    fn on_transfer_tokens(&self, transfer: &TokenTransferEvent);

    /// Tokens were spent as a transaction fee.
    fn on_spend_tokens(&self, address: &[u8], tx_type: TxType, cost: u64, reference: &str);

    /// A transaction was included in the in-flight block.
    fn on_new_tx(&self, tx: &ChainTransaction, raw: &[u8], block_height: u32, tx_index: i32);

    /// The block at `height` was confirmed; make all of its effects visible
    /// atomically.
    fn commit(&self, height: u32) -> Result<()>;

    /// The in-flight block was aborted; discard all of its effects.
    fn rollback(&self);
}

/// Callback invoked when a process reaches final results.
pub trait EventListener: Send + Sync {
    /// Called synchronously, within the block lock, each time final results
    /// are stored for a process.
    fn on_compute_results(&self, results: &Results, process: &Process, height: u32);
}
