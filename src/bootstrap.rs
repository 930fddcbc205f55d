//! After-sync bootstrap and full block reindex
//!
//! Both operations hold the block lock for their whole duration, so live
//! ingestion cannot interleave with them. Both wait for the chain to report
//! synced before touching the database (skipped in tests).

use std::time::Instant;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::chain::ChainBlock;
use crate::indexer::{Indexer, WriterState};
use crate::results::Results;

impl Indexer {
    /// Recompute live results for every process that is not final yet.
    ///
    /// Each stored tally is reset to zero and rebuilt by iterating all
    /// committed ballots of the process in chain state: the history is
    /// rebuilt from scratch, so nothing is subtracted. Recovered processes
    /// are added to the live-results set so new ballots keep counting.
    pub fn after_sync_bootstrap(&self, in_test: bool) {
        // Without live results there is nothing to recover.
        if self.ignore_live_results {
            return;
        }
        if !in_test {
            self.app.wait_until_synced();
        }
        info!("running indexer after-sync bootstrap");

        // Holding the block lock means new ballots aren't added until the
        // recovery finishes.
        let mut block = self.block.lock();
        let ws = block.writer();

        let process_ids: Vec<Vec<u8>> = match (|| -> crate::Result<_> {
            ws.ensure_tx()?;
            let mut stmt = ws
                .conn
                .prepare_cached("SELECT id FROM processes WHERE final_results = 0")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
            Ok(ids)
        })() {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "cannot list live processes");
                return;
            }
        };

        info!(count = process_ids.len(), "recovered live results processes");
        let start = Instant::now();
        for pid in process_ids {
            debug!(process_id = %hex::encode(&pid), "recovering live process");
            let proc = match self.get_process_locked(ws, &pid) {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "cannot fetch process");
                    continue;
                }
            };

            // Reset the stored tally before recounting; we cannot know
            // whether ballots are missing from it.
            let zeroed = Results::empty(pid.clone(), &proc.vote_opts, &proc.envelope);
            if let Err(e) = self.store_results(ws, &pid, &zeroed) {
                error!(error = %e, "cannot reset process results");
                continue;
            }

            let mut partial = Results::empty(pid.clone(), &proc.vote_opts, &proc.envelope);
            let iterated = self.app.iterate_votes(&pid, true, &mut |vote| {
                if let Err(e) = partial.add_vote(&vote.vote_package, &vote.weight_or_default()) {
                    error!(error = %e, "could not add live ballot");
                }
                false
            });
            if let Err(e) = iterated {
                warn!(process_id = %hex::encode(&pid), error = %e, "could not iterate ballots");
                continue;
            }

            if let Err(e) =
                self.commit_votes(ws, &pid, zeroed, &partial, None, self.app.height())
            {
                error!(error = %e, "could not commit live ballots");
                continue;
            }
            if let Err(e) = self.compute_vote_count(ws, &pid) {
                error!(error = %e, "could not compute process vote count");
            }
            self.add_process_to_live_results(&pid);
        }

        // Don't wait for the next block commit to close the transaction.
        if let Err(e) = ws.commit_tx() {
            error!(error = %e, "could not commit transaction");
        }
        info!(elapsed = ?start.elapsed(), "live results recovery computation finished");
    }

    /// Replay every block in the block store, rebuilding block, transaction
    /// and derived rows. Rows whose stored hash already matches are left
    /// alone; mismatching timestamps or hashes are logged and the stored
    /// data wins. The open transaction is committed every 10,000 heights to
    /// bound memory.
    pub fn reindex_blocks(&self, in_test: bool) {
        if !in_test {
            self.app.wait_until_synced();
        }

        // Holding the block lock means new ballots aren't added until the
        // reindex finishes.
        let mut block = self.block.lock();
        let ws = block.writer();

        let base = self.app.block_store_base();
        let head = self.app.block_store_head();
        info!(
            block_store_base = base,
            block_store_head = head,
            "start reindexing"
        );

        for height in base..=head {
            let Some(b) = self.app.block_by_height(height) else {
                continue;
            };

            if height % 10_000 == 1 {
                info!(height, "reindexing progress");
                if let Err(e) = ws.commit_tx() {
                    error!(error = %e, "could not commit transaction");
                }
            }

            self.reindex_block_row(ws, &b);
            self.reindex_block_txs(ws, &b);
            self.apply_process_updates(ws, height);
            self.apply_vote_counts(ws);
        }

        if let Err(e) = ws.commit_tx() {
            error!(error = %e, "could not commit transaction");
        }
        info!(
            block_store_base = base,
            block_store_head = head,
            "finished reindexing"
        );
    }

    fn reindex_block_row(&self, ws: &mut WriterState, b: &ChainBlock) {
        let existing: Option<i64> = match (|| -> crate::Result<_> {
            ws.ensure_tx()?;
            let mut stmt = ws
                .conn
                .prepare_cached("SELECT time FROM blocks WHERE height = ?1")?;
            Ok(stmt
                .query_row(params![b.height], |row| row.get(0))
                .optional()?)
        })() {
            Ok(v) => v,
            Err(e) => {
                error!(height = b.height, error = %e, "cannot read indexed block");
                return;
            }
        };
        if let Some(stored_time) = existing {
            if stored_time != b.time {
                error!(
                    height = b.height,
                    stored = stored_time,
                    block_store = b.time,
                    "block timestamp in db differs from block store, leaving untouched"
                );
                return;
            }
        }
        if let Err(e) = self.insert_block_row(ws, b) {
            error!(height = b.height, error = %e, "cannot index block");
        }
    }

    fn reindex_block_txs(&self, ws: &mut WriterState, b: &ChainBlock) {
        for (index, raw) in b.txs.iter().enumerate() {
            let index = index as i32;
            let tx = match self.app.decode_transaction(raw, &b.chain_id) {
                Ok(tx) => tx,
                Err(e) => {
                    error!(
                        height = b.height,
                        index,
                        error = %e,
                        "cannot decode transaction"
                    );
                    continue;
                }
            };

            let existing: Option<Vec<u8>> = match (|| -> crate::Result<_> {
                ws.ensure_tx()?;
                let mut stmt = ws.conn.prepare_cached(
                    "SELECT hash FROM transactions WHERE block_height = ?1 AND block_index = ?2",
                )?;
                Ok(stmt
                    .query_row(params![b.height, index], |row| row.get(0))
                    .optional()?)
            })() {
                Ok(v) => v,
                Err(e) => {
                    error!(height = b.height, index, error = %e, "cannot read indexed transaction");
                    continue;
                }
            };
            if let Some(stored_hash) = existing {
                if stored_hash != tx.hash {
                    error!(
                        height = b.height,
                        index,
                        stored = %hex::encode(&stored_hash),
                        block_store = %hex::encode(&tx.hash),
                        "transaction hash in db differs from block store, leaving untouched"
                    );
                    return;
                }
            }

            if let Err(e) = self.insert_transaction_row(ws, &tx, raw, b.height, index) {
                error!(height = b.height, index, error = %e, "cannot index transaction");
                continue;
            }
            self.dispatch_tx_events(ws, &tx, b.height, b.time, index);
        }
    }
}
