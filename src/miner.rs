//! A `Node` that additionally assembles a candidate block and searches
//! for a proof in bounded cooperative bursts.
//!
//! Block assembly follows from pending transactions and reshapes a
//! "produce on demand" loop into a continuous bounded-burst search.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{info, warn};

use crate::block::Block;
use crate::network::Network;
use crate::node::Node;
use crate::protocol::Message;
use crate::transaction::Transaction;

/// Default batch size for one proof-search burst — also the knob used
/// to simulate relative hash power between miners in tests.
pub const DEFAULT_MINING_ROUNDS: u64 = 2000;

pub struct Miner<N: Network> {
    pub node: Rc<Node<N>>,
    current_block: RefCell<Block>,
    mining_rounds: u64,
}

impl<N: Network> std::ops::Deref for Miner<N> {
    type Target = Node<N>;
    fn deref(&self) -> &Node<N> {
        &self.node
    }
}

impl<N: Network> Miner<N> {
    pub fn new(node: Rc<Node<N>>, mining_rounds: u64) -> Rc<Self> {
        let current_block = Block::extending(node.address.clone(), Some(&node.last_block()));
        Rc::new(Miner {
            node,
            current_block: RefCell::new(current_block),
            mining_rounds,
        })
    }

    pub fn current_block(&self) -> Block {
        self.current_block.borrow().clone()
    }

    /// Register this miner's inbox loop and kick off its first mining
    /// burst by sending itself a start-mining message.
    pub fn spawn(self: &Rc<Self>, mut rx: tokio::sync::mpsc::UnboundedReceiver<Message>)
    where
        N: 'static,
    {
        let miner = Rc::clone(self);
        tokio::task::spawn_local(async move {
            while let Some(msg) = rx.recv().await {
                miner.handle(msg).await;
            }
        });

        let starter = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let _ = starter
                .node
                .net()
                .send_message(&starter.node.address, Message::StartMining)
                .await;
        });
    }

    async fn handle(self: &Rc<Self>, msg: Message) {
        match msg {
            Message::PostTransaction(tx) => self.add_transaction(tx),
            Message::StartMining => self.find_proof(false).await,
            Message::ProofFound(serialized) => {
                self.receive_block(serialized).await;
            }
            Message::MissingBlock { from, missing } => {
                self.node.provide_missing_block(&from, &missing).await;
            }
        }
    }

    /// Admit a transaction into the in-progress candidate block. There
    /// is no separate mempool: a transaction arriving after this miner
    /// seals a block and before `start_new_search` rebuilds
    /// `current_block` can be lost.
    pub fn add_transaction(&self, tx: Transaction) {
        if let Err(e) = self.current_block.borrow_mut().add_transaction(tx) {
            warn!(error = %e, "candidate block rejected transaction");
        }
    }

    fn start_new_search(&self) {
        let fresh = Block::extending(self.node.address.clone(), Some(&self.node.last_block()));
        // TODO: transactions abandoned on the old candidate are not
        // migrated forward onto `fresh`; a proper implementation would
        // reconcile them into the new candidate.
        *self.current_block.borrow_mut() = fresh;
    }

    /// `Node::receive_block`, plus: if the accepted block is strictly
    /// longer than our current candidate, abandon it and start fresh
    /// atop the new head.
    pub async fn receive_block(&self, input: impl Into<crate::node::ReceivedBlock>) -> Option<Block> {
        let accepted = self.node.receive_block(input).await;
        if let Some(block) = &accepted {
            if block.chain_length > self.current_block.borrow().chain_length {
                self.start_new_search();
            }
        }
        accepted
    }

    /// Search for a valid proof in a burst of at most `mining_rounds`
    /// increments. On success, seal the block, announce it, apply it
    /// to our own store, and start a new search. Either way, unless
    /// `one_and_done`, schedule another burst on the next tick.
    pub async fn find_proof(self: &Rc<Self>, one_and_done: bool) {
        let pause_point = self.current_block.borrow().proof + self.mining_rounds;

        loop {
            if self.current_block.borrow().proof >= pause_point {
                break;
            }
            let found = {
                let mut block = self.current_block.borrow_mut();
                block.proof += 1;
                block.has_valid_proof()
            };
            if found {
                let serialized = self.current_block.borrow().serialize();
                info!(
                    block_id = %self.current_block.borrow().hash_val(),
                    chain_length = self.current_block.borrow().chain_length,
                    "found a valid proof"
                );
                self.node.net().broadcast(Message::ProofFound(serialized.clone())).await;
                self.receive_block(serialized).await;
                self.start_new_search();
                break;
            }
        }

        if !one_and_done {
            let _ = self
                .node
                .net()
                .send_message(&self.node.address, Message::StartMining)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::crypto::{calc_address, generate_keypair};
    use crate::network::FakeNet;
    use crate::node::Node;
    use crate::transaction::Output;
    use std::collections::HashMap;

    fn make_miner(mining_rounds: u64) -> Rc<Miner<FakeNet>> {
        let net = Rc::new(FakeNet::new());
        let kp = generate_keypair();
        let addr = calc_address(&kp.public);
        let mut balances = HashMap::new();
        balances.insert(addr.clone(), 1_000);
        let genesis = Block::make_genesis(balances);
        net.register(addr);
        let node = Node::new(kp, genesis, net);
        Miner::new(node, mining_rounds)
    }

    #[tokio::test]
    async fn one_and_done_search_seals_and_self_accepts_a_block() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let miner = make_miner(2_000_000);
                let starting_length = miner.node.last_block().chain_length;
                miner.find_proof(true).await;
                assert_eq!(miner.node.last_block().chain_length, starting_length + 1);
                assert!(miner.node.last_block().has_valid_proof());
            })
            .await;
    }

    #[tokio::test]
    async fn candidate_block_admits_transactions() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let miner = make_miner(2_000_000);
                let sender = generate_keypair();
                let sender_addr = calc_address(&sender.public);
                miner
                    .current_block
                    .borrow_mut()
                    .balances
                    .insert(sender_addr.clone(), 100);

                let mut tx = Transaction::new(
                    sender_addr,
                    0,
                    sender.public,
                    vec![Output { amount: 10, address: "somebody".to_string() }],
                    1,
                );
                tx.sign(&sender);
                miner.add_transaction(tx);

                assert_eq!(miner.current_block().transactions.len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn longer_chain_resets_the_candidate() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let miner = make_miner(2_000_000);
                let genesis = miner.node.last_block();

                let mut rival = Block::extending("rival", Some(&genesis));
                for proof in 0..2_000_000u64 {
                    rival.proof = proof;
                    if rival.has_valid_proof() {
                        break;
                    }
                }

                miner.receive_block(rival.clone()).await;
                assert_eq!(miner.current_block().prev_block_hash, rival.hash_val());
                assert_eq!(miner.current_block().chain_length, rival.chain_length + 1);
            })
            .await;
    }
}
