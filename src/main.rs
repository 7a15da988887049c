//! Demo binary: wires a small in-process network of miners and a
//! plain observing node, posts a transaction, and lets the miners race
//! to extend the chain.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use goldchain::block::Block;
use goldchain::crypto::{self, generate_keypair};
use goldchain::miner::{Miner, DEFAULT_MINING_ROUNDS};
use goldchain::network::FakeNet;
use goldchain::node::Node;
use goldchain::transaction::Output;

#[derive(Parser, Debug)]
#[command(about = "Run a small simulated goldchain network")]
struct Cli {
    /// Number of miners to run.
    #[arg(long, default_value_t = 3)]
    miners: usize,

    /// Proof-search burst size per miner (simulates relative hash power).
    #[arg(long, default_value_t = DEFAULT_MINING_ROUNDS)]
    mining_rounds: u64,

    /// How long to let the network run before reporting and exiting.
    #[arg(long, default_value_t = 2)]
    run_seconds: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let local = tokio::task::LocalSet::new();
    local.run_until(run(cli)).await;
}

async fn run(cli: Cli) {
    let net = Rc::new(FakeNet::new());

    let funded_keypair = generate_keypair();
    let funded_address = crypto::calc_address(&funded_keypair.public);

    let mut genesis_balances = HashMap::new();
    genesis_balances.insert(funded_address.clone(), 10_000u64);
    let genesis = Block::make_genesis(genesis_balances);

    let mut miners = Vec::new();
    for i in 0..cli.miners {
        let kp = generate_keypair();
        let addr = crypto::calc_address(&kp.public);
        let rx = net.register(addr.clone());
        let node = Node::new(kp, genesis.clone(), net.clone());
        let miner = Miner::new(node, cli.mining_rounds);
        miner.spawn(rx);
        info!(miner = i, address = %addr, "miner online");
        miners.push(miner);
    }

    // A funded node that only observes and posts one transaction; it
    // never mines.
    let observer_rx = net.register(funded_address.clone());
    let observer = Node::new(funded_keypair, genesis, net.clone());
    observer.spawn(observer_rx);

    tokio::time::sleep(Duration::from_millis(50)).await;

    match observer
        .post_transaction(
            vec![Output {
                amount: 100,
                address: miners[0].address.clone(),
            }],
            None,
        )
        .await
    {
        Ok(tx) => info!(tx_id = %tx.id(), "posted transaction"),
        Err(e) => info!(error = %e, "failed to post transaction"),
    }

    tokio::time::sleep(Duration::from_secs(cli.run_seconds)).await;

    let head = observer.last_block();
    let confirmed = observer.last_confirmed_block();
    info!(
        chain_length = head.chain_length,
        confirmed_length = confirmed.chain_length,
        "network settled"
    );
    for (i, miner) in miners.iter().enumerate() {
        info!(
            miner = i,
            address = %miner.address,
            balance = confirmed.balance_of(&miner.address),
            "miner balance at confirmed head"
        );
    }
}
