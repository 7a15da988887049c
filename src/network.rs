//! In-process simulated broadcast/direct-send bus.
//!
//! Follows the async dispatch idiom of a `SyncLayer` trait but carries
//! an in-process `Message` instead of bytes over a `TcpStream` — real
//! transport is treated as an external collaborator; this is the
//! test/demo stand-in for it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Message;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no participant registered at address {0}")]
    UnknownAddress(String),
}

#[async_trait(?Send)]
pub trait Network {
    /// Deliver `msg` to every registered participant, including the
    /// sender.
    async fn broadcast(&self, msg: Message);

    /// Deliver `msg` to exactly the participant at `address`.
    async fn send_message(&self, address: &str, msg: Message) -> Result<(), NetworkError>;
}

/// A fake network: each registered address gets an unbounded channel.
/// Messages are queued and picked up on the receiver's next poll,
/// which gives delivery its "subsequent scheduling tick" property
/// without an explicit callback queue.
#[derive(Default)]
pub struct FakeNet {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl FakeNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` and return the receiver end of its inbox.
    pub fn register(&self, address: String) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(address, tx);
        rx
    }
}

#[async_trait(?Send)]
impl Network for FakeNet {
    async fn broadcast(&self, msg: Message) {
        let senders = self.senders.lock().unwrap().clone();
        for tx in senders.values() {
            let _ = tx.send(msg.clone());
        }
    }

    async fn send_message(&self, address: &str, msg: Message) -> Result<(), NetworkError> {
        let sender = self.senders.lock().unwrap().get(address).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(msg);
                Ok(())
            }
            None => Err(NetworkError::UnknownAddress(address.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_message_to_unknown_address_errors() {
        let net = FakeNet::new();
        let err = net
            .send_message("nobody", Message::StartMining)
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::UnknownAddress(_)));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_address() {
        let net = FakeNet::new();
        let mut rx_a = net.register("a".to_string());
        let mut rx_b = net.register("b".to_string());

        net.broadcast(Message::StartMining).await;

        assert!(matches!(rx_a.recv().await, Some(Message::StartMining)));
        assert!(matches!(rx_b.recv().await, Some(Message::StartMining)));
    }
}
