//! The wire events exchanged between nodes, plus the miner's internal
//! cooperative-yield signal.

use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

/// `(kind, payload)` carried over [`crate::network::Network`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// node -> all: a newly signed transaction.
    PostTransaction(Transaction),
    /// miner -> all, or node -> requester: a serialized block.
    ProofFound(String),
    /// node -> all: `{from, missing}`, requesting a block this node
    /// doesn't have the parent of.
    MissingBlock { from: String, missing: String },
    /// miner -> self: internal cooperative-yield signal, never sent
    /// over a real wire.
    StartMining,
}
