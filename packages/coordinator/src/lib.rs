//! Bridge coordinator
//!
//! Tracks cross-chain transfers from the moment a watcher reports a deposit until the
//! target chain pays out (or the transfer fails closed). Transfers move through the
//! status machine in `bridge_common::TransactionStatus`; a validator quorum has to sign the
//! payload hash before anything is executed on the target chain.
//!
//! The pieces, bottom-up:
//! - [`db`]: persistence behind [`db::PersistenceStore`] (Postgres or in-memory)
//! - [`registry`], [`validators`], [`tokens`]: bridge configuration
//! - [`coordinator`]: every transaction operation
//! - [`transport`], [`executor`]: the two outbound collaborators
//! - [`processor`]: background loop that drives confirmed and validated transfers
//! - [`api`]: HTTP surface

pub mod api;
pub mod audit;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod executor;
pub mod keys;
pub mod metrics;
pub mod models;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod tokens;
pub mod transport;
pub mod validators;

pub use coordinator::TransactionCoordinator;
pub use error::{BridgeError, BridgeResult};
