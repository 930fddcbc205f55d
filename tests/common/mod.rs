//! Test helpers: an in-memory chain application and an ingestion harness.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use vote_indexer::chain::{
    ChainApplication, ChainBlock, ChainTransaction, StateEventSink, StateProcess, StateVote,
    TxEvent,
};
use vote_indexer::types::{ProcessStatus, TxType, VoteOptions};
use vote_indexer::{BigNum, Indexer, IndexerOptions, Result};

#[derive(Default)]
struct MockChainInner {
    chain_id: String,
    height: u32,
    timestamp: i64,
    synced: bool,
    processes: HashMap<Vec<u8>, StateProcess>,
    committed_votes: HashMap<(Vec<u8>, Vec<u8>), StateVote>,
    blocks: BTreeMap<u32, ChainBlock>,
}

/// In-memory chain application driving the indexer in tests.
#[derive(Default)]
pub struct MockChain {
    inner: Mutex<MockChainInner>,
    sink: Mutex<Option<Arc<dyn StateEventSink>>>,
}

impl MockChain {
    pub fn new() -> Arc<MockChain> {
        let chain = MockChain::default();
        {
            let mut inner = chain.inner.lock();
            inner.chain_id = "test-chain".to_string();
            inner.synced = true;
        }
        Arc::new(chain)
    }

    pub fn set_process(&self, process_id: &[u8], process: StateProcess) {
        self.inner.lock().processes.insert(process_id.to_vec(), process);
    }

    pub fn update_process_state(&self, process_id: &[u8], f: impl FnOnce(&mut StateProcess)) {
        let mut inner = self.inner.lock();
        let process = inner
            .processes
            .get_mut(process_id)
            .expect("process not present in mock state");
        f(process);
    }

    /// Promote a ballot into the committed state, replacing any previous
    /// ballot with the same nullifier.
    pub fn commit_vote(&self, vote: StateVote) {
        self.inner
            .lock()
            .committed_votes
            .insert((vote.process_id.clone(), vote.nullifier.clone()), vote);
    }

    pub fn put_block(&self, block: ChainBlock) {
        let mut inner = self.inner.lock();
        inner.height = block.height;
        inner.timestamp = block.time;
        inner.blocks.insert(block.height, block);
    }

    pub fn blocks(&self) -> Vec<ChainBlock> {
        self.inner.lock().blocks.values().cloned().collect()
    }
}

impl ChainApplication for MockChain {
    fn height(&self) -> u32 {
        self.inner.lock().height
    }

    fn timestamp(&self) -> i64 {
        self.inner.lock().timestamp
    }

    fn chain_id(&self) -> String {
        self.inner.lock().chain_id.clone()
    }

    fn is_synced(&self) -> bool {
        self.inner.lock().synced
    }

    fn wait_until_synced(&self) {
        // Background bootstrap/reindex tasks are driven explicitly in tests
        // (with in_test = true); anything that waits here parks for good so
        // it cannot interleave with a test's in-flight block.
        loop {
            std::thread::park();
        }
    }

    fn block_by_height(&self, height: u32) -> Option<ChainBlock> {
        self.inner.lock().blocks.get(&height).cloned()
    }

    fn block_store_base(&self) -> u32 {
        self.inner.lock().blocks.keys().next().copied().unwrap_or(0)
    }

    fn block_store_head(&self) -> u32 {
        self.inner.lock().blocks.keys().last().copied().unwrap_or(0)
    }

    fn process(&self, process_id: &[u8], _committed: bool) -> Result<StateProcess> {
        self.inner
            .lock()
            .processes
            .get(process_id)
            .cloned()
            .ok_or_else(|| {
                vote_indexer::Error::NotFound(format!("process {}", hex::encode(process_id)))
            })
    }

    fn vote(
        &self,
        process_id: &[u8],
        nullifier: &[u8],
        _committed: bool,
    ) -> Result<Option<StateVote>> {
        Ok(self
            .inner
            .lock()
            .committed_votes
            .get(&(process_id.to_vec(), nullifier.to_vec()))
            .cloned())
    }

    fn iterate_votes(
        &self,
        process_id: &[u8],
        _committed: bool,
        callback: &mut dyn FnMut(&StateVote) -> bool,
    ) -> Result<()> {
        let votes: Vec<StateVote> = {
            let inner = self.inner.lock();
            inner
                .committed_votes
                .iter()
                .filter(|((pid, _), _)| pid.as_slice() == process_id)
                .map(|(_, v)| v.clone())
                .collect()
        };
        for vote in &votes {
            if callback(vote) {
                break;
            }
        }
        Ok(())
    }

    fn decode_transaction(&self, raw: &[u8], _chain_id: &str) -> Result<ChainTransaction> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn add_event_sink(&self, sink: Arc<dyn StateEventSink>) {
        *self.sink.lock() = Some(sink);
    }
}

/// A mock chain wired to an indexer over a temporary database.
pub struct Harness {
    pub chain: Arc<MockChain>,
    pub idx: Arc<Indexer>,
    pub dir: TempDir,
    pending_votes: Vec<StateVote>,
}

impl Harness {
    pub fn new() -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let chain = MockChain::new();
        let dir = TempDir::new().expect("failed to create temp directory");
        let idx = Indexer::new(
            chain.clone() as Arc<dyn ChainApplication>,
            IndexerOptions {
                data_dir: dir.path().to_path_buf(),
                ..IndexerOptions::default()
            },
        )
        .expect("failed to create indexer");
        Harness {
            chain,
            idx,
            dir,
            pending_votes: Vec::new(),
        }
    }

    /// Start a block: register it in the mock block store and move the
    /// chain head to it.
    pub fn begin_block(&self, height: u32) {
        let last_block_hash = self
            .chain
            .block_by_height(height.saturating_sub(1))
            .map(|b| b.hash)
            .unwrap_or_default();
        self.chain.put_block(ChainBlock {
            chain_id: "test-chain".to_string(),
            height,
            time: 1_000_000 + i64::from(height),
            hash: vec![height as u8; 32],
            proposer_address: vec![0x11; 20],
            last_block_hash,
            txs: Vec::new(),
        });
    }

    /// Cast a ballot through the event sink; it becomes part of the chain's
    /// committed state once the block commits.
    pub fn cast_vote(&mut self, vote: StateVote, tx_index: i32) {
        self.idx.on_vote(&vote, tx_index);
        self.pending_votes.push(vote);
    }

    /// Commit the block at `height` and promote pending ballots into the
    /// chain's committed state.
    pub fn commit(&mut self, height: u32) {
        self.idx.commit(height).expect("block commit failed");
        for vote in self.pending_votes.drain(..) {
            self.chain.commit_vote(vote);
        }
    }

    /// Abort the in-flight block, discarding pending ballots.
    pub fn rollback(&mut self) {
        self.idx.rollback();
        self.pending_votes.clear();
    }

    /// Replay a block's transactions through the live event sink, then
    /// commit, the way the chain application drives the indexer.
    pub fn live_ingest(&mut self, block: &ChainBlock) {
        self.chain.put_block(block.clone());
        for (index, raw) in block.txs.iter().enumerate() {
            let index = index as i32;
            let tx = self
                .chain
                .decode_transaction(raw, &block.chain_id)
                .expect("invalid test transaction");
            self.idx.on_new_tx(&tx, raw, block.height, index);
            for event in tx.events {
                match event {
                    TxEvent::Process { process_id } => self.idx.on_process(&process_id, index),
                    TxEvent::Vote(vote) => self.cast_vote(vote, index),
                    TxEvent::ProcessStatusChange { process_id } => {
                        self.idx
                            .on_process_status_change(&process_id, ProcessStatus::Ready, index)
                    }
                    TxEvent::CensusUpdate { process_id } => {
                        self.idx.on_census_update(&process_id)
                    }
                    TxEvent::RevealKeys { process_id } => {
                        self.idx.on_reveal_keys(&process_id, index)
                    }
                    TxEvent::SetAccount { address, account } => {
                        self.idx.on_set_account(&address, &account)
                    }
                    TxEvent::TransferTokens(transfer) => self.idx.on_transfer_tokens(&transfer),
                    TxEvent::SpendTokens {
                        from,
                        tx_type,
                        cost,
                        reference,
                    } => self.idx.on_spend_tokens(&from, tx_type, cost, &reference),
                }
            }
        }
        self.commit(block.height);
    }
}

/// A ready, unencrypted process with the given ballot schema.
pub fn state_process(entity_id: &[u8], questions: u32, max_value: u32) -> StateProcess {
    StateProcess {
        entity_id: entity_id.to_vec(),
        start_block: 1,
        end_block: 1000,
        census_root: vec![0xcc; 32],
        census_uri: "ipfs://census".to_string(),
        metadata: "ipfs://metadata".to_string(),
        status: ProcessStatus::Ready as i32,
        vote_opts: VoteOptions {
            max_count: questions,
            max_value,
            ..VoteOptions::default()
        },
        creation_time: 1_000_000,
        ..StateProcess::default()
    }
}

/// A ballot for `process_id` with the given nullifier, counter and choices.
pub fn ballot(
    process_id: &[u8],
    nullifier: &[u8],
    overwrites: u32,
    weight: u64,
    package: &str,
    height: u32,
) -> StateVote {
    StateVote {
        process_id: process_id.to_vec(),
        nullifier: nullifier.to_vec(),
        height,
        vote_package: package.as_bytes().to_vec(),
        weight: Some(BigNum::from_u64(weight)),
        encryption_key_indexes: Vec::new(),
        overwrites,
        voter_id: Vec::new(),
    }
}

/// Encode a transaction carrying the given events for the mock decoder.
pub fn encode_tx(hash: &[u8], tx_type: TxType, events: Vec<TxEvent>) -> Vec<u8> {
    serde_json::to_vec(&ChainTransaction {
        hash: hash.to_vec(),
        tx_type,
        events,
    })
    .expect("failed to encode test transaction")
}

/// Expected tally cells from a JSON literal like `[["0","5"],["5","0"]]`.
pub fn tally(json: &str) -> Vec<Vec<BigNum>> {
    serde_json::from_str(json).expect("invalid tally literal")
}
