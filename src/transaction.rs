//! Signed value transfer, the unit of state change admitted into a block.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, Encoding, PublicKey, Signature};

/// One recipient of a transaction's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub address: String,
}

/// A signed transfer from `from` to one or more `outputs`, guarded by a
/// monotone per-sender `nonce`.
///
/// Field order here is the canonical order hashed into the transaction
/// id (see [`Transaction::id`]) and the order serialized on the wire —
/// do not reorder without updating both signer and verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: String,
    pub nonce: u64,
    #[serde(rename = "pubKey")]
    pub pub_key: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
    #[serde(default)]
    pub fee: u64,
    pub outputs: Vec<Output>,
}

/// Fields hashed into a transaction id, in the exact order required by
/// the wire format. A separate struct (rather than reusing
/// `Transaction`) keeps the id preimage independent of `sig` even if
/// `Transaction`'s own field order ever changes.
#[derive(Serialize)]
struct IdPreimage<'a> {
    from: &'a str,
    nonce: u64,
    #[serde(rename = "pubKey")]
    pub_key: &'a PublicKey,
    outputs: &'a [Output],
    fee: u64,
}

impl Transaction {
    pub fn new(
        from: impl Into<String>,
        nonce: u64,
        pub_key: PublicKey,
        outputs: Vec<Output>,
        fee: u64,
    ) -> Self {
        Transaction {
            from: from.into(),
            nonce,
            pub_key,
            outputs,
            fee,
            sig: None,
        }
    }

    /// Content hash over `(from, nonce, pubKey, outputs, fee)`. The
    /// signature is deliberately excluded so ids are stable pre-signing
    /// and a replayed transaction keeps the same id.
    pub fn id(&self) -> String {
        let preimage = IdPreimage {
            from: &self.from,
            nonce: self.nonce,
            pub_key: &self.pub_key,
            outputs: &self.outputs,
            fee: self.fee,
        };
        let json = serde_json::to_string(&preimage).expect("transaction preimage always encodes");
        let mut bytes = Vec::with_capacity(json.len() + 2);
        bytes.extend_from_slice(b"TX");
        bytes.extend_from_slice(json.as_bytes());
        crypto::hash(&bytes, Encoding::Hex)
    }

    /// Sign `self.id()` with `private_key`, setting `sig`.
    pub fn sign(&mut self, keypair: &crypto::KeyPair) {
        let id = self.id();
        self.sig = Some(keypair.private_sign(&id));
    }

    /// True iff a signature is present, the sender address matches
    /// `pubKey`, and the signature verifies over `id()`.
    pub fn valid_signature(&self) -> bool {
        let Some(sig) = &self.sig else {
            return false;
        };
        if !crypto::address_matches_key(&self.from, &self.pub_key) {
            return false;
        }
        crypto::verify_signature(&self.pub_key, &self.id(), sig)
    }

    /// `balances.get(from) >= total_output()`; a missing sender has no
    /// funds.
    pub fn sufficient_funds(&self, balances: &std::collections::HashMap<String, u64>) -> bool {
        balances
            .get(&self.from)
            .copied()
            .unwrap_or(0)
            >= self.total_output()
    }

    /// `fee + sum(outputs[i].amount)`.
    pub fn total_output(&self) -> u64 {
        self.fee + self.outputs.iter().map(|o| o.amount).sum::<u64>()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::crypto::generate_keypair;
    use proptest::prelude::*;

    fn arb_outputs() -> impl Strategy<Value = Vec<Output>> {
        prop::collection::vec(("[a-f0-9]{4,16}", 0u64..1_000_000), 0..4)
            .prop_map(|v| v.into_iter().map(|(address, amount)| Output { amount, address }).collect())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn id_is_independent_of_signature_for_arbitrary_inputs(
            nonce in 0u64..1_000_000,
            fee in 0u64..1_000,
            outputs in arb_outputs(),
        ) {
            let kp = generate_keypair();
            let addr = crypto::calc_address(&kp.public);
            let mut tx = Transaction::new(addr, nonce, kp.public, outputs, fee);
            let id_before = tx.id();
            tx.sign(&kp);
            prop_assert_eq!(tx.id(), id_before);
        }

        #[test]
        fn mutating_any_hashed_field_invalidates_the_signature(
            nonce in 0u64..1_000_000,
            fee in 0u64..1_000,
            outputs in arb_outputs(),
            nonce_bump in 1u64..1_000,
        ) {
            let kp = generate_keypair();
            let addr = crypto::calc_address(&kp.public);
            let mut tx = Transaction::new(addr, nonce, kp.public, outputs, fee);
            tx.sign(&kp);
            prop_assert!(tx.valid_signature());
            tx.nonce += nonce_bump;
            prop_assert!(!tx.valid_signature());
        }
    }
}
