//! # Vote Indexer
//!
//! Block-synchronous indexer for a consensus-driven voting chain.
//!
//! This crate provides:
//! - A queryable secondary index of voting processes, ballots, accounts,
//!   token transfers and fees, and block/transaction metadata
//! - Live tally computation for ongoing elections, with correct handling
//!   of ballot overwrites
//! - Per-block atomicity between the chain commit and the index write
//! - Full index rebuild from the chain block store and hot backups
//!
//! The index lives in a single SQLite file with WAL journaling: one writer
//! guarded by the block lock, and a pool of read-only connections serving
//! queries concurrently.

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod bootstrap;
pub mod chain;
mod db;
pub mod error;
pub mod indexer;
mod queries;
pub mod results;
pub mod types;

pub use chain::{
    ChainApplication, ChainBlock, ChainTransaction, EventListener, StateAccount, StateEventSink,
    StateProcess, StateProcessResults, StateVote, TokenTransferEvent, TxEvent,
};
pub use error::{Error, Result};
pub use indexer::{Indexer, IndexerOptions};
pub use results::Results;
pub use types::{
    Account, BigNum, Block, EnvelopeType, Process, ProcessMode, ProcessStatus, TokenFee,
    TokenTransfer, Transaction, TxType, Vote, VoteOptions,
};
