//! Voting process indexer
//!
//! The [`Indexer`] observes a chain application and maintains a queryable
//! secondary index of its voting processes, ballots, accounts and token
//! movements, together with live tallies for ongoing elections. All
//! write-side state — the per-block SQL transaction and the scratch maps —
//! lives behind a single block lock so that every block's effects become
//! visible atomically at commit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::chain::{
    ChainApplication, ChainBlock, ChainTransaction, EventListener, StateAccount, StateEventSink,
    StateVote, TokenTransferEvent, TxEvent,
};
use crate::db;
use crate::error::{Error, Result};
use crate::queries::{process_from_row, PROCESS_COLS};
use crate::results::Results;
use crate::types::{encode_json, BigNum, Process, ProcessStatus, TxType};

static BACKUP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Options for [`Indexer::new`].
#[derive(Debug, Clone, Default)]
pub struct IndexerOptions {
    /// Directory holding the database file; created if missing.
    pub data_dir: PathBuf,
    /// Set when [`Indexer::restore_backup`] will be called shortly after
    /// construction, before any indexing or queries happen. If the database
    /// file already exists on disk this flag is ignored.
    pub expect_backup_restore: bool,
    /// Disable live tallies; only final results are stored.
    pub ignore_live_results: bool,
}

/// Write-side state guarded by the block lock: the writer connection, the
/// lazily-opened block transaction and the per-block scratch maps.
pub(crate) struct WriterState {
    pub(crate) conn: rusqlite::Connection,
    pub(crate) in_tx: bool,
    /// Processes whose rows must be re-read from chain state at commit.
    pub(crate) update_procs: BTreeSet<Vec<u8>>,
    /// Processes whose vote count must be recomputed at commit.
    pub(crate) update_proc_vote_counts: HashSet<Vec<u8>>,
    /// Ballots to live-count, grouped by process, keyed by nullifier.
    /// Keeping one ballot per nullifier matters for overwrites: only the
    /// latest one may enter the live tally.
    pub(crate) vote_pool: HashMap<Vec<u8>, HashMap<Vec<u8>, StateVote>>,
}

impl WriterState {
    fn new(conn: rusqlite::Connection) -> WriterState {
        WriterState {
            conn,
            in_tx: false,
            update_procs: BTreeSet::new(),
            update_proc_vote_counts: HashSet::new(),
            vote_pool: HashMap::new(),
        }
    }

    /// Open the block transaction if it is not already open. Holding
    /// `&mut self` proves the caller holds the block lock.
    pub(crate) fn ensure_tx(&mut self) -> Result<()> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_tx = true;
        }
        Ok(())
    }

    /// Commit the block transaction, if open.
    pub(crate) fn commit_tx(&mut self) -> Result<()> {
        if self.in_tx {
            self.in_tx = false;
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Roll back the block transaction, if open.
    pub(crate) fn rollback_tx(&mut self) -> Result<()> {
        if self.in_tx {
            self.in_tx = false;
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn clear_scratch(&mut self) {
        self.update_procs.clear();
        self.update_proc_vote_counts.clear();
        self.vote_pool.clear();
    }
}

pub(crate) struct BlockInner {
    pub(crate) writer: Option<WriterState>,
}

impl BlockInner {
    /// Access the writer state.
    ///
    /// # Panics
    /// Panics if the database has not been opened yet (programmer error:
    /// indexing before `new` finished or before `restore_backup`).
    pub(crate) fn writer(&mut self) -> &mut WriterState {
        self.writer
            .as_mut()
            .expect("indexer database is not initialized")
    }
}

/// Block-synchronous index over a chain application's voting state.
///
/// One instance owns one database. Construction wires the instance into the
/// chain application's event callbacks; see [`StateEventSink`] for the
/// callback contract.
pub struct Indexer {
    pub(crate) app: Arc<dyn ChainApplication>,
    pub(crate) db_path: PathBuf,
    pub(crate) ignore_live_results: bool,
    /// The block lock. Guards the writer connection, the open block
    /// transaction and all per-block scratch maps.
    pub(crate) block: Mutex<BlockInner>,
    pub(crate) read_pool: OnceCell<r2d2::Pool<SqliteConnectionManager>>,
    /// Processes whose ballots are live-counted on arrival.
    pub(crate) live_results: DashMap<Vec<u8>, ()>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl Indexer {
    /// Create an indexer over `app`, storing the index under
    /// `options.data_dir`, and register it for state events.
    ///
    /// If the database file exists it is always opened; if it does not and
    /// `expect_backup_restore` is set, opening is deferred until
    /// [`Indexer::restore_backup`]. When pending schema migrations were
    /// applied on open, a full block reindex is scheduled on a background
    /// thread (it waits for chain sync before touching the database).
    pub fn new(app: Arc<dyn ChainApplication>, options: IndexerOptions) -> Result<Arc<Indexer>> {
        std::fs::create_dir_all(&options.data_dir)?;
        let idx = Arc::new(Indexer {
            app: Arc::clone(&app),
            db_path: options.data_dir.join(db::DB_FILENAME),
            ignore_live_results: options.ignore_live_results,
            block: Mutex::new(BlockInner { writer: None }),
            read_pool: OnceCell::new(),
            live_results: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
        });
        info!(
            data_dir = %options.data_dir.display(),
            live_results = !options.ignore_live_results,
            "indexer initialization"
        );

        if idx.db_path.exists() || !options.expect_backup_restore {
            if idx.start_db()? {
                idx.spawn_deferred_reindex();
            }
        }

        app.add_event_sink(Arc::clone(&idx) as Arc<dyn StateEventSink>);
        Ok(idx)
    }

    /// Open the database, run migrations and build the read pool. Returns
    /// whether any migrations were pending before the run.
    fn start_db(&self) -> Result<bool> {
        let mut block = self.block.lock();
        assert!(block.writer.is_none(), "Indexer::start_db called twice");

        let conn = db::open_read_write(&self.db_path)?;
        let pending = db::migrations_pending(&conn)?;
        if pending {
            info!("indexer db needs migration, scheduling a reindex after sync");
        }
        db::run_migrations(&conn)?;
        db::analyze(&conn)?;
        block.writer = Some(WriterState::new(conn));
        drop(block);

        let pool = db::open_read_pool(&self.db_path)?;
        if self.read_pool.set(pool).is_err() {
            panic!("Indexer::start_db called twice");
        }
        Ok(pending)
    }

    fn spawn_deferred_reindex(self: &Arc<Self>) {
        let idx = Arc::clone(self);
        std::thread::spawn(move || idx.reindex_blocks(false));
    }

    /// Restore the database from a backup created via
    /// [`Indexer::save_backup`], then open it.
    ///
    /// # Panics
    /// Panics if the database was already opened; construct the indexer
    /// with `expect_backup_restore` set and call this before any indexing
    /// or queries.
    pub fn restore_backup(self: &Arc<Self>, source: &Path) -> Result<()> {
        {
            let block = self.block.lock();
            assert!(
                block.writer.is_none(),
                "Indexer::restore_backup called after the database was initialized"
            );
        }
        std::fs::copy(source, &self.db_path)?;
        if self.start_db()? {
            self.spawn_deferred_reindex();
        }
        Ok(())
    }

    /// Back up the database to a file at `path`.
    ///
    /// Writes may be blocked until the backup finishes, and an error occurs
    /// if a file at `path` already exists. The output is itself a database
    /// file.
    pub fn save_backup(&self, path: &Path) -> Result<()> {
        let conn = self.read_conn()?;
        db::vacuum_into(&conn, path)
    }

    /// Back up the database and return its contents as bytes.
    pub fn export_backup_bytes(&self) -> Result<Vec<u8>> {
        let tmp_path = self.db_path.with_file_name(format!(
            "export-{}-{}.sqlite",
            std::process::id(),
            BACKUP_COUNTER.fetch_add(1, Ordering::Relaxed),
        ));
        self.save_backup(&tmp_path)?;
        let bytes = std::fs::read(&tmp_path);
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            warn!(path = %tmp_path.display(), error = %e, "error removing backup temp file");
        }
        Ok(bytes?)
    }

    /// Roll back any open block transaction and release the writer
    /// connection. Queries keep working until the instance is dropped.
    pub fn close(&self) -> Result<()> {
        let mut block = self.block.lock();
        if let Some(mut ws) = block.writer.take() {
            ws.rollback_tx()?;
        }
        Ok(())
    }

    /// Register a listener for final-results computations.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn read_conn(
        &self,
    ) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        let pool = self
            .read_pool
            .get()
            .expect("indexer database is not initialized");
        Ok(pool.get()?)
    }

    pub(crate) fn add_process_to_live_results(&self, process_id: &[u8]) {
        self.live_results.insert(process_id.to_vec(), ());
    }

    fn is_process_live_results(&self, process_id: &[u8]) -> bool {
        self.live_results.contains_key(process_id)
    }

    // ---- row-level indexing, called with the block lock held ----

    /// Insert a fresh process row with a zeroed tally sized by its vote
    /// options, reading the authoritative record from chain state.
    pub(crate) fn index_process(&self, ws: &mut WriterState, process_id: &[u8]) -> Result<()> {
        let state_proc = self.app.process(process_id, false)?;
        let zeroed = crate::results::empty_votes(&state_proc.vote_opts);
        // Encrypted processes have no live results until keys are revealed.
        let have_results = !state_proc.envelope.encrypted_votes;
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "INSERT INTO processes (
                id, entity_id, start_block, end_block, vote_count,
                have_results, final_results,
                census_root, rolling_census_root, rolling_census_size, max_census_size,
                census_uri, metadata, census_origin, status,
                envelope, mode, vote_opts, private_keys, public_keys,
                creation_time, source_block_height, source_network_id,
                results_votes, results_weight, results_block_height
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5, 0, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, 0)",
        )?;
        stmt.execute(params![
            process_id,
            state_proc.entity_id,
            state_proc.start_block,
            state_proc.end_block,
            have_results,
            state_proc.census_root,
            state_proc.rolling_census_root,
            state_proc.rolling_census_size as i64,
            state_proc.max_census_size as i64,
            state_proc.census_uri,
            state_proc.metadata,
            state_proc.census_origin,
            state_proc.status,
            encode_json(&state_proc.envelope)?,
            encode_json(&state_proc.mode)?,
            encode_json(&state_proc.vote_opts)?,
            encode_json(&state_proc.private_keys)?,
            encode_json(&state_proc.public_keys)?,
            state_proc.creation_time,
            state_proc.source_block_height as i64,
            state_proc.source_network_id,
            encode_json(&zeroed)?,
            BigNum::zero().to_string(),
        ])?;
        Ok(())
    }

    /// Insert a ballot row, optionally pooling it for the live tally, and
    /// mark its process vote-count-dirty.
    pub(crate) fn index_vote(
        &self,
        ws: &mut WriterState,
        vote: &StateVote,
        tx_index: i32,
        pool: bool,
    ) -> Result<()> {
        if pool && !self.ignore_live_results && self.is_process_live_results(&vote.process_id) {
            let by_nullifier = ws
                .vote_pool
                .entry(vote.process_id.clone())
                .or_default();
            // Keep only the ballot with the highest overwrite counter.
            match by_nullifier.get(&vote.nullifier) {
                Some(prev) if vote.overwrites < prev.overwrites => {
                    warn!(
                        previous = prev.overwrites,
                        latest = vote.overwrites,
                        "ballot arrived with a lower overwrite counter than before"
                    );
                }
                _ => {
                    by_nullifier.insert(vote.nullifier.clone(), vote.clone());
                }
            }
        }

        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "INSERT OR REPLACE INTO votes (
                nullifier, process_id, block_height, block_index, weight,
                overwrite_count, voter_id, encryption_key_indexes, package
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        stmt.execute(params![
            vote.nullifier,
            vote.process_id,
            vote.height,
            tx_index,
            vote.weight_or_default().to_string(),
            vote.overwrites,
            vote.voter_id,
            encode_json(&vote.encryption_key_indexes)?,
            String::from_utf8_lossy(&vote.vote_package).into_owned(),
        ])?;
        ws.update_proc_vote_counts.insert(vote.process_id.clone());
        Ok(())
    }

    pub(crate) fn index_account(
        &self,
        ws: &mut WriterState,
        address: &[u8],
        account: &StateAccount,
    ) -> Result<()> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "INSERT OR REPLACE INTO accounts (account, balance, nonce) VALUES (?1, ?2, ?3)",
        )?;
        stmt.execute(params![address, account.balance as i64, account.nonce])?;
        Ok(())
    }

    pub(crate) fn index_token_transfer(
        &self,
        ws: &mut WriterState,
        transfer: &TokenTransferEvent,
        height: u32,
        time: i64,
    ) -> Result<()> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "INSERT OR REPLACE INTO token_transfers (
                tx_hash, block_height, from_account, to_account, amount, transfer_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![
            transfer.tx_hash,
            height,
            transfer.from,
            transfer.to,
            transfer.amount as i64,
            time,
        ])?;
        Ok(())
    }

    pub(crate) fn index_token_fee(
        &self,
        ws: &mut WriterState,
        from: &[u8],
        tx_type: TxType,
        cost: u64,
        reference: &str,
        height: u32,
        time: i64,
    ) -> Result<()> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "INSERT OR IGNORE INTO token_fees (
                from_account, tx_type, cost, reference, spend_time, block_height
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        stmt.execute(params![
            from,
            tx_type.fee_label(),
            cost as i64,
            reference,
            time,
            height,
        ])?;
        Ok(())
    }

    pub(crate) fn insert_block_row(&self, ws: &mut WriterState, b: &ChainBlock) -> Result<()> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "INSERT INTO blocks (height, chain_id, time, hash, proposer_address, last_block_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(height) DO NOTHING",
        )?;
        stmt.execute(params![
            b.height,
            b.chain_id,
            b.time,
            b.hash,
            b.proposer_address,
            b.last_block_hash,
        ])?;
        Ok(())
    }

    pub(crate) fn insert_transaction_row(
        &self,
        ws: &mut WriterState,
        tx: &ChainTransaction,
        raw: &[u8],
        height: u32,
        index: i32,
    ) -> Result<()> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "INSERT OR IGNORE INTO transactions (hash, block_height, block_index, type, raw)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        stmt.execute(params![tx.hash, height, index, tx.tx_type.as_str(), raw])?;
        Ok(())
    }

    /// Fetch a process row through the writer connection so that rows
    /// written earlier in the open block transaction are visible.
    pub(crate) fn get_process_locked(
        &self,
        ws: &mut WriterState,
        process_id: &[u8],
    ) -> Result<Process> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(&format!(
            "SELECT {PROCESS_COLS} FROM processes WHERE id = ?1"
        ))?;
        stmt.query_row([process_id], process_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("process {}", hex::encode(process_id))))
    }

    /// Persist a tally into its process row.
    pub(crate) fn store_results(
        &self,
        ws: &mut WriterState,
        process_id: &[u8],
        results: &Results,
    ) -> Result<()> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "UPDATE processes SET results_votes = ?2, results_weight = ?3,
                results_block_height = ?4 WHERE id = ?1",
        )?;
        stmt.execute(params![
            process_id,
            encode_json(&results.votes)?,
            results.weight.to_string(),
            results.block_height,
        ])?;
        Ok(())
    }

    /// Merge a block's tally delta into the persisted results:
    /// `current + added - subtracted`, stamped with `height`.
    pub(crate) fn commit_votes(
        &self,
        ws: &mut WriterState,
        process_id: &[u8],
        mut current: Results,
        added: &Results,
        subtracted: Option<&Results>,
        height: u32,
    ) -> Result<()> {
        current.add(added)?;
        if let Some(sub) = subtracted {
            current.sub(sub)?;
        }
        current.block_height = height;
        self.store_results(ws, process_id, &current)
    }

    /// Re-read a process from chain state and refresh its mutable columns.
    /// When the state has sealed final results that the row does not yet
    /// carry, store them, freeze the row and notify listeners.
    pub(crate) fn update_process(
        &self,
        ws: &mut WriterState,
        process_id: &[u8],
        height: u32,
    ) -> Result<()> {
        let state_proc = self.app.process(process_id, false)?;
        let stored = self.get_process_locked(ws, process_id)?;

        ws.ensure_tx()?;
        {
            let mut stmt = ws.conn.prepare_cached(
                "UPDATE processes SET
                    end_block = ?2, census_root = ?3, rolling_census_root = ?4,
                    rolling_census_size = ?5, max_census_size = ?6, census_uri = ?7,
                    metadata = ?8, status = ?9, private_keys = ?10, public_keys = ?11,
                    source_block_height = ?12
                 WHERE id = ?1",
            )?;
            stmt.execute(params![
                process_id,
                state_proc.end_block,
                state_proc.census_root,
                state_proc.rolling_census_root,
                state_proc.rolling_census_size as i64,
                state_proc.max_census_size as i64,
                state_proc.census_uri,
                state_proc.metadata,
                state_proc.status,
                encode_json(&state_proc.private_keys)?,
                encode_json(&state_proc.public_keys)?,
                state_proc.source_block_height as i64,
            ])?;
        }

        let Some(final_res) = &state_proc.final_results else {
            return Ok(());
        };
        if stored.final_results {
            // Results are immutable once final.
            return Ok(());
        }
        let results = Results {
            process_id: process_id.to_vec(),
            votes: final_res.votes.clone(),
            weight: final_res.weight.clone(),
            vote_opts: state_proc.vote_opts.clone(),
            envelope: state_proc.envelope.clone(),
            block_height: height,
        };
        {
            let mut stmt = ws.conn.prepare_cached(
                "UPDATE processes SET have_results = 1, final_results = 1,
                    results_votes = ?2, results_weight = ?3, results_block_height = ?4
                 WHERE id = ?1",
            )?;
            stmt.execute(params![
                process_id,
                encode_json(&results.votes)?,
                results.weight.to_string(),
                height,
            ])?;
        }
        self.live_results.remove(process_id);
        info!(
            process_id = %hex::encode(process_id),
            height,
            "stored final results for process"
        );

        let process = self.get_process_locked(ws, process_id)?;
        for listener in self.listeners.read().iter() {
            listener.on_compute_results(&results, &process, height);
        }
        Ok(())
    }

    /// Recompute a process vote count from the votes table. A simple
    /// increment would be wrong under ballot overwrites.
    pub(crate) fn compute_vote_count(
        &self,
        ws: &mut WriterState,
        process_id: &[u8],
    ) -> Result<()> {
        ws.ensure_tx()?;
        let mut stmt = ws.conn.prepare_cached(
            "UPDATE processes SET vote_count =
                (SELECT COUNT(DISTINCT nullifier) FROM votes WHERE process_id = ?1)
             WHERE id = ?1",
        )?;
        stmt.execute([process_id])?;
        Ok(())
    }

    // ---- per-block scratch draining, shared by commit and reindex ----

    /// Drain `update_procs` in sorted order, refreshing each row from state.
    pub(crate) fn apply_process_updates(&self, ws: &mut WriterState, height: u32) {
        let pending: Vec<Vec<u8>> = std::mem::take(&mut ws.update_procs).into_iter().collect();
        for pid in pending {
            if let Err(e) = self.update_process(ws, &pid, height) {
                error!(process_id = %hex::encode(&pid), error = %e, "cannot update process");
                continue;
            }
            debug!(process_id = %hex::encode(&pid), "updated process");
        }
    }

    /// Drain the vote-count-dirty set.
    pub(crate) fn apply_vote_counts(&self, ws: &mut WriterState) {
        let pending: Vec<Vec<u8>> =
            std::mem::take(&mut ws.update_proc_vote_counts).into_iter().collect();
        for pid in pending {
            if let Err(e) = self.compute_vote_count(ws, &pid) {
                error!(process_id = %hex::encode(&pid), error = %e, "could not compute process vote count");
            }
        }
    }

    /// Drain the vote pool into the live tallies. Returns counts of new and
    /// overwritten ballots.
    fn tally_vote_pool(&self, ws: &mut WriterState, height: u32) -> (usize, usize) {
        let pool = std::mem::take(&mut ws.vote_pool);
        let mut new_votes = 0;
        let mut overwritten_votes = 0;

        for (pid, by_nullifier) in pool {
            let proc = match self.get_process_locked(ws, &pid) {
                Ok(p) => p,
                Err(e) => {
                    warn!(process_id = %hex::encode(&pid), error = %e, "cannot get process");
                    continue;
                }
            };
            if proc.final_results {
                // The tally is frozen; late pooled ballots are dropped.
                continue;
            }

            let mut added = Results::empty(pid.clone(), &proc.vote_opts, &proc.envelope);
            let mut subtracted = Results::empty(pid.clone(), &proc.vote_opts, &proc.envelope);

            // Iteration order is not deterministic; additions and
            // subtractions commute within a block.
            for vote in by_nullifier.into_values() {
                let mut previous = None;
                if vote.overwrites > 0 {
                    // Fetch the last committed ballot for this nullifier. If
                    // it was never committed it was never counted, so there
                    // is nothing to subtract.
                    match self.app.vote(&vote.process_id, &vote.nullifier, true) {
                        Ok(prev) => previous = prev,
                        Err(e) => warn!(
                            nullifier = %hex::encode(&vote.nullifier),
                            process_id = %hex::encode(&vote.process_id),
                            error = %e,
                            "cannot get previous ballot"
                        ),
                    }
                }
                if let Some(prev) = previous {
                    debug!(
                        overwrites = vote.overwrites,
                        package = %String::from_utf8_lossy(&prev.vote_package),
                        "ballot overwrite, previous ballot"
                    );
                    if vote.overwrites <= prev.overwrites {
                        error!(
                            current = vote.overwrites,
                            stored = prev.overwrites,
                            "committed overwrite counter is equal or larger than the new ballot's"
                        );
                        continue;
                    }
                    if let Err(e) =
                        subtracted.add_vote(&prev.vote_package, &prev.weight_or_default())
                    {
                        error!(error = %e, "previous ballot cannot be added to the subtracted tally");
                        continue;
                    }
                    overwritten_votes += 1;
                } else {
                    new_votes += 1;
                }
                if let Err(e) = added.add_vote(&vote.vote_package, &vote.weight_or_default()) {
                    warn!(
                        nullifier = %hex::encode(&vote.nullifier),
                        error = %e,
                        "ballot dropped from live tally"
                    );
                    continue;
                }
            }

            let current = proc.results();
            if let Err(e) = self.commit_votes(ws, &pid, current, &added, Some(&subtracted), height)
            {
                error!(block = height, error = %e, "cannot commit live ballots");
            }
        }
        (new_votes, overwritten_votes)
    }
}

impl StateEventSink for Indexer {
    fn on_process(&self, process_id: &[u8], _tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        if let Err(e) = self.index_process(ws, process_id) {
            error!(error = %e, "cannot create new empty process");
        }
        if self.app.is_synced() {
            self.add_process_to_live_results(process_id);
        }
        debug!(process_id = %hex::encode(process_id), "new process");
    }

    fn on_vote(&self, vote: &StateVote, tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        if let Err(e) = self.index_vote(ws, vote, tx_index, true) {
            error!(error = %e, "could not index ballot");
        }
    }

    fn on_cancel(&self, process_id: &[u8], _tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.update_procs.insert(process_id.to_vec());
    }

    fn on_process_keys(&self, process_id: &[u8], _tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.update_procs.insert(process_id.to_vec());
    }

    fn on_reveal_keys(&self, process_id: &[u8], _tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.update_procs.insert(process_id.to_vec());
    }

    fn on_process_status_change(
        &self,
        process_id: &[u8],
        _status: ProcessStatus,
        _tx_index: i32,
    ) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.update_procs.insert(process_id.to_vec());
    }

    fn on_process_duration_change(&self, process_id: &[u8], _duration: u32, _tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.update_procs.insert(process_id.to_vec());
    }

    fn on_process_results(&self, process_id: &[u8], _tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.update_procs.insert(process_id.to_vec());
    }

    fn on_processes_start(&self, process_ids: &[Vec<u8>]) {
        let mut block = self.block.lock();
        let ws = block.writer();
        for pid in process_ids {
            ws.update_procs.insert(pid.clone());
        }
    }

    fn on_census_update(&self, process_id: &[u8]) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.update_procs.insert(process_id.to_vec());
    }

    fn on_set_account(&self, address: &[u8], account: &StateAccount) {
        let mut block = self.block.lock();
        let ws = block.writer();
        if let Err(e) = self.index_account(ws, address, account) {
            error!(error = %e, "cannot index new account");
        }
    }

    fn on_transfer_tokens(&self, transfer: &TokenTransferEvent) {
        let mut block = self.block.lock();
        let ws = block.writer();
        let height = self.app.height();
        let time = self.app.timestamp();
        if let Err(e) = self.index_token_transfer(ws, transfer, height, time) {
            error!(error = %e, "cannot index token transfer");
        }
    }

    fn on_spend_tokens(&self, address: &[u8], tx_type: TxType, cost: u64, reference: &str) {
        let mut block = self.block.lock();
        let ws = block.writer();
        let height = self.app.height();
        let time = self.app.timestamp();
        if let Err(e) =
            self.index_token_fee(ws, address, tx_type, cost, reference, height, time)
        {
            error!(error = %e, "cannot index token spending");
        }
    }

    fn on_new_tx(&self, tx: &ChainTransaction, raw: &[u8], block_height: u32, tx_index: i32) {
        let mut block = self.block.lock();
        let ws = block.writer();
        if let Err(e) = self.insert_transaction_row(ws, tx, raw, block_height, tx_index) {
            error!(error = %e, "cannot index transaction");
        }
    }

    fn commit(&self, height: u32) -> Result<()> {
        let mut block = self.block.lock();
        let ws = block.writer();
        let start = Instant::now();

        if let Some(b) = self.app.block_by_height(height) {
            if let Err(e) = self.insert_block_row(ws, &b) {
                error!(error = %e, "cannot index new block");
            }
        }

        self.apply_process_updates(ws, height);
        let (new_votes, overwritten_votes) = self.tally_vote_pool(ws, self.app.height());
        self.apply_vote_counts(ws);

        ws.commit_tx()?;
        if height % 1000 == 0 {
            // Ask sqlite whether another optimization analysis is worth it;
            // block times make a thousand blocks a matter of hours.
            ws.conn.execute_batch("PRAGMA optimize")?;
        }

        if new_votes + overwritten_votes > 0 {
            info!(
                block = height,
                new_votes,
                overwritten_votes,
                elapsed = ?start.elapsed(),
                "added live ballots to results"
            );
        }
        Ok(())
    }

    fn rollback(&self) {
        let mut block = self.block.lock();
        let ws = block.writer();
        ws.clear_scratch();
        if let Err(e) = ws.rollback_tx() {
            error!(error = %e, "could not roll back block transaction");
        }
    }
}

impl Indexer {
    /// Dispatch a decoded transaction's typed events through the same
    /// handlers used for live ingestion. Ballots are not pooled: live
    /// tallies are rebuilt by the after-sync bootstrap.
    pub(crate) fn dispatch_tx_events(
        &self,
        ws: &mut WriterState,
        tx: &ChainTransaction,
        height: u32,
        block_time: i64,
        tx_index: i32,
    ) {
        for event in &tx.events {
            let result = match event {
                TxEvent::Process { process_id } => self.index_process(ws, process_id),
                TxEvent::Vote(vote) => self.index_vote(ws, vote, tx_index, false),
                TxEvent::ProcessStatusChange { process_id }
                | TxEvent::CensusUpdate { process_id }
                | TxEvent::RevealKeys { process_id } => {
                    ws.update_procs.insert(process_id.clone());
                    Ok(())
                }
                TxEvent::SetAccount { address, account } => {
                    self.index_account(ws, address, account)
                }
                TxEvent::TransferTokens(transfer) => {
                    self.index_token_transfer(ws, transfer, height, block_time)
                }
                TxEvent::SpendTokens {
                    from,
                    tx_type,
                    cost,
                    reference,
                } => self.index_token_fee(
                    ws,
                    from,
                    *tx_type,
                    *cost,
                    reference,
                    height,
                    block_time,
                ),
            };
            if let Err(e) = result {
                error!(
                    height,
                    tx_index,
                    error = %e,
                    "cannot index transaction event"
                );
            }
        }
    }
}
