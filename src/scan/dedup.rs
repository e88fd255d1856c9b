use std::collections::HashMap;

use crate::models::Transaction;

/// Transactions already delivered to every observer, keyed both by hash and
/// by `(from, nonce)`, each remembering the height it was delivered at.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    by_hash: HashMap<String, u64>,
    by_sender_nonce: HashMap<String, u64>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_delivered(&self, tx: &Transaction) -> bool {
        self.by_hash.contains_key(&tx.hash) || self.by_sender_nonce.contains_key(&tx.sender_nonce_key())
    }

    pub fn mark_delivered(&mut self, tx_hash: &str, sender_nonce_key: &str, height: u64) {
        self.by_hash.insert(tx_hash.to_string(), height);
        self.by_sender_nonce.insert(sender_nonce_key.to_string(), height);
    }

    /// Forgets deliveries at `height` and above, e.g. after those blocks were
    /// invalidated.
    pub fn forget_from(&mut self, height: u64) {
        self.by_hash.retain(|_, h| *h < height);
        self.by_sender_nonce.retain(|_, h| *h < height);
    }

    pub fn prune_below(&mut self, height: u64) {
        self.by_hash.retain(|_, h| *h >= height);
        self.by_sender_nonce.retain(|_, h| *h >= height);
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}
