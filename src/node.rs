//! A chain participant: block store, pending-block graph, fork choice,
//! confirmation depth, and transaction posting.
//!
//! Chain state and a pending-transaction set live behind a lock the
//! way a runtime owns them, and incoming blocks get the same
//! parent-hash/index/signature checks before being applied — reshaped
//! so each `Block` owns its own derived state, rather than a separate
//! ledger object.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::crypto::{self, KeyPair};
use crate::network::Network;
use crate::protocol::Message;
use crate::transaction::{Output, Transaction};

/// Number of blocks after which a block is considered confirmed.
pub const CONFIRMATION_DEPTH: u64 = 6;
pub const DEFAULT_TX_FEE: u64 = 1;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("insufficient funds: have {available}, need {requested}")]
    InsufficientFunds { available: u64, requested: u64 },
    #[error("malformed block: {0}")]
    MalformedBlock(#[from] crate::block::BlockError),
}

/// Either a structured block or its wire-serialized form; `receive_block`
/// accepts both.
pub enum ReceivedBlock {
    Structured(Block),
    Serialized(String),
}

impl From<Block> for ReceivedBlock {
    fn from(b: Block) -> Self {
        ReceivedBlock::Structured(b)
    }
}

impl From<String> for ReceivedBlock {
    fn from(s: String) -> Self {
        ReceivedBlock::Serialized(s)
    }
}

pub struct Node<N: Network> {
    pub keypair: KeyPair,
    pub address: String,
    pub(crate) net: Rc<N>,

    outbound_nonce: RefCell<u64>,
    pending_spent: RefCell<u64>,

    blocks: RefCell<HashMap<String, Block>>,
    pending_blocks: RefCell<HashMap<String, Vec<Block>>>,
    last_block_id: RefCell<String>,
    last_confirmed_block_id: RefCell<String>,
}

impl<N: Network> Node<N> {
    pub fn new(keypair: KeyPair, genesis: Block, net: Rc<N>) -> Rc<Self> {
        let address = crypto::calc_address(&keypair.public);
        let genesis_id = genesis.hash_val();
        let mut blocks = HashMap::new();
        blocks.insert(genesis_id.clone(), genesis);

        Rc::new(Node {
            keypair,
            address,
            net,
            outbound_nonce: RefCell::new(0),
            pending_spent: RefCell::new(0),
            blocks: RefCell::new(blocks),
            pending_blocks: RefCell::new(HashMap::new()),
            last_block_id: RefCell::new(genesis_id.clone()),
            last_confirmed_block_id: RefCell::new(genesis_id),
        })
    }

    pub fn net(&self) -> &N {
        &self.net
    }

    /// Register this node's inbox-reading loop onto the local task set.
    /// Must be called from within a `tokio::task::LocalSet`: dispatch
    /// is single-threaded and cooperative, one message handled at a
    /// time.
    pub fn spawn(self: &Rc<Self>, mut rx: tokio::sync::mpsc::UnboundedReceiver<Message>)
    where
        N: 'static,
    {
        let node = Rc::clone(self);
        tokio::task::spawn_local(async move {
            while let Some(msg) = rx.recv().await {
                node.handle(msg).await;
            }
        });
    }

    pub fn last_block(&self) -> Block {
        let id = self.last_block_id.borrow().clone();
        self.blocks.borrow().get(&id).cloned().expect("last_block always stored")
    }

    pub fn last_confirmed_block(&self) -> Block {
        let id = self.last_confirmed_block_id.borrow().clone();
        self.blocks.borrow().get(&id).cloned().expect("last_confirmed_block always stored")
    }

    pub fn get_block(&self, id: &str) -> Option<Block> {
        self.blocks.borrow().get(id).cloned()
    }

    fn confirmed_balance(&self) -> u64 {
        self.last_confirmed_block().balance_of(&self.address)
    }

    fn available_gold(&self) -> u64 {
        self.confirmed_balance()
            .saturating_sub(*self.pending_spent.borrow())
    }

    /// Sign and broadcast a transfer. Fails without broadcasting if the
    /// sender doesn't have `fee + sum(outputs)` available, counting
    /// transactions already posted but not yet confirmed. `fee`
    /// defaults to [`DEFAULT_TX_FEE`] when `None`.
    pub async fn post_transaction(
        &self,
        outputs: Vec<Output>,
        fee: Option<u64>,
    ) -> Result<Transaction, NodeError> {
        let fee = fee.unwrap_or(DEFAULT_TX_FEE);
        let total: u64 = fee + outputs.iter().map(|o| o.amount).sum::<u64>();
        let available = self.available_gold();
        if total > available {
            return Err(NodeError::InsufficientFunds {
                available,
                requested: total,
            });
        }

        let nonce = *self.outbound_nonce.borrow();
        let mut tx = Transaction::new(self.address.clone(), nonce, self.keypair.public, outputs, fee);
        tx.sign(&self.keypair);

        *self.outbound_nonce.borrow_mut() = nonce + 1;
        *self.pending_spent.borrow_mut() += total;

        self.net.broadcast(Message::PostTransaction(tx.clone())).await;
        Ok(tx)
    }

    /// Validate, link, and fork-choose an incoming block, recursively
    /// resolving any orphans it unblocks. Returns the accepted block,
    /// or `None` if it was rejected, already known, or queued as an
    /// orphan awaiting its parent.
    pub async fn receive_block(&self, input: impl Into<ReceivedBlock>) -> Option<Block> {
        let root = match self.decode_and_accept_one(input).await {
            Some(block) => block,
            None => return None,
        };
        self.drain_orphans(root.hash_val()).await;
        Some(root)
    }

    async fn decode_and_accept_one(&self, input: impl Into<ReceivedBlock>) -> Option<Block> {
        let block = match input.into() {
            ReceivedBlock::Structured(b) => b,
            ReceivedBlock::Serialized(s) => match Block::deserialize(&s) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "received an unparseable block");
                    return None;
                }
            },
        };

        let id = block.hash_val();
        if self.blocks.borrow().contains_key(&id) {
            debug!(block_id = %id, "already have this block");
            return None;
        }
        if !block.has_valid_proof() {
            warn!(block_id = %id, "block does not satisfy its proof-of-work target");
            return None;
        }

        let prev = self.blocks.borrow().get(&block.prev_block_hash).cloned();
        let prev = match prev {
            Some(p) => p,
            None => {
                self.request_missing_parent(&block).await;
                return None;
            }
        };

        let mut block = block;
        if let Err(e) = block.rerun(&prev) {
            warn!(block_id = %id, error = %e, "block failed replay against its parent");
            return None;
        }

        self.blocks.borrow_mut().insert(id.clone(), block.clone());
        info!(block_id = %id, chain_length = block.chain_length, "accepted block");

        if block.chain_length > self.last_block().chain_length {
            *self.last_block_id.borrow_mut() = id.clone();
            self.recompute_last_confirmed();
        }

        Some(block)
    }

    async fn request_missing_parent(&self, block: &Block) {
        let parent = block.prev_block_hash.clone();
        let is_first_orphan = !self.pending_blocks.borrow().contains_key(&parent);
        self.pending_blocks
            .borrow_mut()
            .entry(parent.clone())
            .or_default()
            .push(block.clone());

        if is_first_orphan {
            debug!(missing = %parent, "requesting missing parent block");
            self.net
                .broadcast(Message::MissingBlock {
                    from: self.address.clone(),
                    missing: parent,
                })
                .await;
        }
    }

    /// Resolve orphans unblocked by the arrival of `parent_id`, using
    /// an explicit work queue rather than recursion so the depth is
    /// bounded only by available memory, not stack frames.
    async fn drain_orphans(&self, parent_id: String) {
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(parent_id);

        while let Some(id) = queue.pop_front() {
            let orphans = self.pending_blocks.borrow_mut().remove(&id);
            let Some(orphans) = orphans else { continue };
            for orphan in orphans {
                if let Some(accepted) = self.decode_and_accept_one(orphan).await {
                    queue.push_back(accepted.hash_val());
                }
            }
        }
    }

    fn recompute_last_confirmed(&self) {
        let last = self.last_block();
        let target_len = last.chain_length.saturating_sub(CONFIRMATION_DEPTH);

        let blocks = self.blocks.borrow();
        let mut cursor = last;
        while cursor.chain_length > target_len && !cursor.is_genesis() {
            cursor = blocks
                .get(&cursor.prev_block_hash)
                .cloned()
                .expect("ancestors of a stored block are stored");
        }
        drop(blocks);
        *self.last_confirmed_block_id.borrow_mut() = cursor.hash_val();
    }

    /// Answer a `MISSING_BLOCK` request directly to its requester.
    pub async fn provide_missing_block(&self, from: &str, missing: &str) {
        let Some(block) = self.get_block(missing) else {
            return;
        };
        let _ = self
            .net
            .send_message(from, Message::ProofFound(block.serialize()))
            .await;
    }

    /// Base dispatch: a plain `Node` only reacts to blocks and
    /// missing-block requests. `Miner` layers `PostTransaction`/
    /// `StartMining` handling on top of this.
    pub async fn handle(&self, msg: Message) {
        match msg {
            Message::ProofFound(serialized) => {
                self.receive_block(serialized).await;
            }
            Message::MissingBlock { from, missing } => {
                self.provide_missing_block(&from, &missing).await;
            }
            Message::PostTransaction(_) | Message::StartMining => {}
        }
    }
}
