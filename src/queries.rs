//! Read-only query surface
//!
//! Listing operations run against the read-only pool and never open write
//! transactions, so they cannot contend with the single writer under WAL.
//! Every listing takes `limit > 0` and `offset >= 0`, applies its optional
//! filters, and returns `(rows, total_count)`; the total count is carried
//! as a window-function column on the first result row rather than issued
//! as a second query.

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use tracing::error;

use crate::error::{Error, Result};
use crate::indexer::Indexer;
use crate::types::{
    Account, BigNum, Block, Process, ProcessStatus, TokenFee, TokenTransfer, Transaction, Vote,
};

/// Hex width of a full account address (20 bytes).
const ACCOUNT_HEX_LEN: usize = 40;

/// Column list matching [`process_from_row`].
pub(crate) const PROCESS_COLS: &str = "id, entity_id, start_block, end_block, vote_count, \
     have_results, final_results, census_root, rolling_census_root, rolling_census_size, \
     max_census_size, census_uri, metadata, census_origin, status, envelope, mode, vote_opts, \
     private_keys, public_keys, creation_time, source_block_height, source_network_id, \
     results_votes, results_weight, results_block_height";

/// Column list matching [`vote_from_row`].
pub(crate) const VOTE_COLS: &str = "nullifier, process_id, block_height, block_index, weight, \
     overwrite_count, voter_id, encryption_key_indexes, package";

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bignum_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<BigNum> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn process_from_row(row: &Row<'_>) -> rusqlite::Result<Process> {
    Ok(Process {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        start_block: row.get(2)?,
        end_block: row.get(3)?,
        vote_count: row.get::<_, i64>(4)? as u64,
        have_results: row.get(5)?,
        final_results: row.get(6)?,
        census_root: row.get(7)?,
        rolling_census_root: row.get(8)?,
        rolling_census_size: row.get::<_, i64>(9)? as u64,
        max_census_size: row.get::<_, i64>(10)? as u64,
        census_uri: row.get(11)?,
        metadata: row.get(12)?,
        census_origin: row.get(13)?,
        status: ProcessStatus::from_i64(row.get(14)?),
        envelope: json_col(row, 15)?,
        mode: json_col(row, 16)?,
        vote_opts: json_col(row, 17)?,
        private_keys: json_col(row, 18)?,
        public_keys: json_col(row, 19)?,
        creation_time: row.get(20)?,
        source_block_height: row.get::<_, i64>(21)? as u64,
        source_network_id: row.get(22)?,
        results_votes: json_col(row, 23)?,
        results_weight: bignum_col(row, 24)?,
        results_block_height: row.get(25)?,
    })
}

pub(crate) fn vote_from_row(row: &Row<'_>) -> rusqlite::Result<Vote> {
    Ok(Vote {
        nullifier: row.get(0)?,
        process_id: row.get(1)?,
        block_height: row.get(2)?,
        block_index: row.get(3)?,
        weight: bignum_col(row, 4)?,
        overwrite_count: row.get(5)?,
        voter_id: row.get(6)?,
        encryption_key_indexes: json_col(row, 7)?,
        package: row.get(8)?,
    })
}

fn check_pagination(limit: i64, offset: i64) -> Result<()> {
    if offset < 0 {
        return Err(Error::BadInput(format!("offset cannot be {offset}")));
    }
    if limit <= 0 {
        return Err(Error::BadInput(format!("limit cannot be {limit}")));
    }
    Ok(())
}

fn check_hex_filter(name: &str, value: &str) -> Result<()> {
    if !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::BadInput(format!("{name} must be a hex string")));
    }
    Ok(())
}

fn split_total<T>(rows: Vec<(T, i64)>) -> (Vec<T>, u64) {
    let total = rows.first().map(|(_, t)| *t as u64).unwrap_or(0);
    (rows.into_iter().map(|(v, _)| v).collect(), total)
}

impl Indexer {
    /// List accounts, optionally filtered by a partial hex address,
    /// ordered by balance. Returns the page and the total match count.
    pub fn account_list(
        &self,
        limit: i64,
        offset: i64,
        account_id_substr: &str,
    ) -> Result<(Vec<Account>, u64)> {
        check_pagination(limit, offset)?;
        check_hex_filter("accountId", account_id_substr)?;
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT account, balance, nonce, COUNT(*) OVER() AS total_count
             FROM accounts
             WHERE (?3 = '' OR INSTR(LOWER(HEX(account)), LOWER(?3)) > 0)
             ORDER BY balance DESC, HEX(account) ASC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset, account_id_substr], |row| {
                Ok((
                    Account {
                        address: row.get(0)?,
                        balance: row.get::<_, i64>(1)? as u64,
                        nonce: row.get(2)?,
                    },
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(split_total(rows))
    }

    /// Whether the given full hex address exists in the index. Partial
    /// addresses always return false.
    pub fn account_exists(&self, account_id: &str) -> bool {
        if account_id.len() != ACCOUNT_HEX_LEN {
            return false;
        }
        match self.account_list(1, 0, account_id) {
            Ok((_, total)) => total > 0,
            Err(e) => {
                error!(error = %e, "indexer query failed");
                false
            }
        }
    }

    /// Total number of indexed accounts.
    pub fn count_total_accounts(&self) -> Result<u64> {
        let conn = self.read_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// List token fees filtered by transaction type, reference and paying
    /// account (all optional), newest block first.
    pub fn token_fees_list(
        &self,
        limit: i64,
        offset: i64,
        tx_type: &str,
        reference: &str,
        from_account: &str,
    ) -> Result<(Vec<TokenFee>, u64)> {
        check_pagination(limit, offset)?;
        check_hex_filter("fromAccount", from_account)?;
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT from_account, tx_type, cost, reference, spend_time, block_height,
                    COUNT(*) OVER() AS total_count
             FROM token_fees
             WHERE (?3 = '' OR tx_type = ?3)
               AND (?4 = '' OR reference = ?4)
               AND (?5 = '' OR LOWER(HEX(from_account)) = LOWER(?5))
             ORDER BY block_height DESC, id DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(
                params![limit, offset, tx_type, reference, from_account],
                |row| {
                    Ok((
                        TokenFee {
                            from: row.get(0)?,
                            tx_type: row.get(1)?,
                            cost: row.get::<_, i64>(2)? as u64,
                            reference: row.get(3)?,
                            timestamp: row.get(4)?,
                            block_height: row.get(5)?,
                        },
                        row.get::<_, i64>(6)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(split_total(rows))
    }

    /// List token transfers touching the given accounts (all filters
    /// optional; `from_or_to` matches either side), newest block first.
    pub fn token_transfers_list(
        &self,
        limit: i64,
        offset: i64,
        from_or_to: &str,
        from: &str,
        to: &str,
    ) -> Result<(Vec<TokenTransfer>, u64)> {
        check_pagination(limit, offset)?;
        check_hex_filter("fromOrToAccount", from_or_to)?;
        check_hex_filter("fromAccount", from)?;
        check_hex_filter("toAccount", to)?;
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT tx_hash, block_height, from_account, to_account, amount, transfer_time,
                    COUNT(*) OVER() AS total_count
             FROM token_transfers
             WHERE (?3 = '' OR LOWER(HEX(from_account)) = LOWER(?3)
                            OR LOWER(HEX(to_account)) = LOWER(?3))
               AND (?4 = '' OR LOWER(HEX(from_account)) = LOWER(?4))
               AND (?5 = '' OR LOWER(HEX(to_account)) = LOWER(?5))
             ORDER BY block_height DESC, ROWID DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset, from_or_to, from, to], |row| {
                Ok((
                    TokenTransfer {
                        tx_hash: row.get(0)?,
                        block_height: row.get(1)?,
                        from: row.get(2)?,
                        to: row.get(3)?,
                        amount: row.get::<_, i64>(4)? as u64,
                        timestamp: row.get(5)?,
                    },
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(split_total(rows))
    }

    /// Number of token transfers made from or to the given account.
    pub fn count_token_transfers_by_account(&self, account: &[u8]) -> Result<u64> {
        let conn = self.read_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM token_transfers WHERE from_account = ?1 OR to_account = ?1",
            [account],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// List process ids filtered by entity (partial hex), status and
    /// whether live results are available, newest first.
    pub fn process_list(
        &self,
        limit: i64,
        offset: i64,
        entity_id_substr: &str,
        status: Option<ProcessStatus>,
        with_results: bool,
    ) -> Result<(Vec<Vec<u8>>, u64)> {
        check_pagination(limit, offset)?;
        check_hex_filter("entityId", entity_id_substr)?;
        let status_filter = status.map(|s| s as i64).unwrap_or(-1);
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, COUNT(*) OVER() AS total_count
             FROM processes
             WHERE (?3 = '' OR INSTR(LOWER(HEX(entity_id)), LOWER(?3)) > 0)
               AND (?4 < 0 OR status = ?4)
               AND (?5 = 0 OR have_results = 1)
             ORDER BY creation_time DESC, HEX(id) ASC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(
                params![limit, offset, entity_id_substr, status_filter, with_results],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(split_total(rows))
    }

    /// Fetch a full process row.
    pub fn process_info(&self, process_id: &[u8]) -> Result<Process> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PROCESS_COLS} FROM processes WHERE id = ?1"
        ))?;
        stmt.query_row([process_id], process_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("process {}", hex::encode(process_id))))
    }

    /// List ballots of a process, optionally filtered by a partial hex
    /// nullifier. Every retained overwrite is listed.
    pub fn vote_list(
        &self,
        limit: i64,
        offset: i64,
        process_id: &[u8],
        nullifier_substr: &str,
    ) -> Result<(Vec<Vote>, u64)> {
        check_pagination(limit, offset)?;
        check_hex_filter("nullifier", nullifier_substr)?;
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {VOTE_COLS}, COUNT(*) OVER() AS total_count
             FROM votes
             WHERE process_id = ?3
               AND (?4 = '' OR INSTR(LOWER(HEX(nullifier)), LOWER(?4)) > 0)
             ORDER BY block_height DESC, block_index DESC, HEX(nullifier) ASC,
                      overwrite_count DESC
             LIMIT ?1 OFFSET ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![limit, offset, process_id, nullifier_substr],
                |row| Ok((vote_from_row(row)?, row.get::<_, i64>(9)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(split_total(rows))
    }

    /// Fetch the effective ballot for a nullifier: the retained row with
    /// the highest overwrite counter.
    pub fn get_vote(&self, process_id: &[u8], nullifier: &[u8]) -> Result<Vote> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {VOTE_COLS} FROM votes
             WHERE process_id = ?1 AND nullifier = ?2
             ORDER BY overwrite_count DESC LIMIT 1"
        ))?;
        stmt.query_row(params![process_id, nullifier], vote_from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("ballot {}", hex::encode(nullifier))))
    }

    /// List indexed blocks, newest first, with optional chain, hash and
    /// proposer filters.
    pub fn block_list(
        &self,
        limit: i64,
        offset: i64,
        chain_id: &str,
        hash_substr: &str,
        proposer_substr: &str,
    ) -> Result<(Vec<Block>, u64)> {
        check_pagination(limit, offset)?;
        check_hex_filter("hash", hash_substr)?;
        check_hex_filter("proposerAddress", proposer_substr)?;
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT chain_id, height, time, hash, proposer_address, last_block_hash,
                    COUNT(*) OVER() AS total_count
             FROM blocks
             WHERE (?3 = '' OR chain_id = ?3)
               AND (?4 = '' OR INSTR(LOWER(HEX(hash)), LOWER(?4)) > 0)
               AND (?5 = '' OR INSTR(LOWER(HEX(proposer_address)), LOWER(?5)) > 0)
             ORDER BY height DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(
                params![limit, offset, chain_id, hash_substr, proposer_substr],
                |row| {
                    Ok((
                        Block {
                            chain_id: row.get(0)?,
                            height: row.get(1)?,
                            time: row.get(2)?,
                            hash: row.get(3)?,
                            proposer_address: row.get(4)?,
                            last_block_hash: row.get(5)?,
                        },
                        row.get::<_, i64>(6)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(split_total(rows))
    }

    /// Fetch an indexed block by height.
    pub fn block_by_height(&self, height: u32) -> Result<Option<Block>> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT chain_id, height, time, hash, proposer_address, last_block_hash
             FROM blocks WHERE height = ?1",
        )?;
        Ok(stmt
            .query_row([height], |row| {
                Ok(Block {
                    chain_id: row.get(0)?,
                    height: row.get(1)?,
                    time: row.get(2)?,
                    hash: row.get(3)?,
                    proposer_address: row.get(4)?,
                    last_block_hash: row.get(5)?,
                })
            })
            .optional()?)
    }

    /// Total number of indexed blocks.
    pub fn count_blocks(&self) -> Result<u64> {
        let conn = self.read_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// List indexed transactions, newest first, with optional height and
    /// type filters.
    pub fn transaction_list(
        &self,
        limit: i64,
        offset: i64,
        block_height: Option<u32>,
        tx_type: &str,
    ) -> Result<(Vec<Transaction>, u64)> {
        check_pagination(limit, offset)?;
        let height_filter = block_height.map(i64::from).unwrap_or(-1);
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, hash, block_height, block_index, type,
                    COUNT(*) OVER() AS total_count
             FROM transactions
             WHERE (?3 < 0 OR block_height = ?3)
               AND (?4 = '' OR type = ?4)
             ORDER BY id DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![limit, offset, height_filter, tx_type], |row| {
                Ok((
                    Transaction {
                        id: row.get::<_, i64>(0)? as u64,
                        hash: row.get(1)?,
                        block_height: row.get(2)?,
                        block_index: row.get(3)?,
                        tx_type: row.get(4)?,
                    },
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(split_total(rows))
    }

    /// Fetch a transaction by its position in a block.
    pub fn transaction_by_height_and_index(
        &self,
        block_height: u32,
        block_index: i32,
    ) -> Result<Transaction> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, hash, block_height, block_index, type
             FROM transactions WHERE block_height = ?1 AND block_index = ?2",
        )?;
        stmt.query_row(params![block_height, block_index], |row| {
            Ok(Transaction {
                id: row.get::<_, i64>(0)? as u64,
                hash: row.get(1)?,
                block_height: row.get(2)?,
                block_index: row.get(3)?,
                tx_type: row.get(4)?,
            })
        })
        .optional()?
        .ok_or_else(|| {
            Error::NotFound(format!("transaction {block_height}/{block_index}"))
        })
    }

    /// Total number of indexed transactions.
    pub fn count_transactions(&self) -> Result<u64> {
        let conn = self.read_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_bounds() {
        assert!(check_pagination(10, 0).is_ok());
        assert!(check_pagination(0, 0).unwrap_err().is_bad_input());
        assert!(check_pagination(-1, 0).unwrap_err().is_bad_input());
        assert!(check_pagination(10, -1).unwrap_err().is_bad_input());
    }

    #[test]
    fn hex_filters() {
        assert!(check_hex_filter("f", "").is_ok());
        assert!(check_hex_filter("f", "00ffAA").is_ok());
        assert!(check_hex_filter("f", "zz").unwrap_err().is_bad_input());
        assert!(check_hex_filter("f", "0x00").unwrap_err().is_bad_input());
    }
}
