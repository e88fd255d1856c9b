//! [`ChainClient`] backed by a Lotus full node.
//!
//! A tipset is folded into one logical [`Block`]:
//! - `hash` is `hex(sha256(concat(tip block CIDs)))`
//! - `previous_hash` is the same digest over the de-duplicated parent CIDs
//! - transactions are the plain transfers (method 0) of every tip block,
//!   de-duplicated by message CID and by `(from, nonce)`.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};
use num_bigint::BigUint;
use serde_json::json;
use sha2::{Digest, Sha256};
use url::Url;

use super::{
    AddressBalance, ChainClient, TransactionReceipt,
    error::RpcError,
    http_client::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, JsonRpcClient},
    types::{Actor, BlockMessages, Cid, Message, MessageReceipt, TipSet},
};
use crate::amount::parse_integer;
use crate::models::{Block, Transaction, TxStatus, UnresolvedTransaction};

/// Plain value transfer.
pub const METHOD_SEND: u64 = 0;

const TIPSET_INDEX_CAPACITY: usize = 2048;

/// Lotus error message for an address that never received funds.
const ACTOR_NOT_FOUND: &str = "actor not found";

/// Recently seen block hashes mapped back to their tipset keys, since the
/// hash is a digest and cannot be inverted.
struct TipsetIndex {
    by_hash: HashMap<String, Vec<String>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl TipsetIndex {
    fn new(capacity: usize) -> Self {
        Self {
            by_hash: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn remember(&mut self, hash: &str, key: &[String]) {
        if self.by_hash.insert(hash.to_string(), key.to_vec()).is_none() {
            self.order.push_back(hash.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.by_hash.remove(&oldest);
            }
        }
    }

    fn lookup(&self, hash: &str) -> Option<Vec<String>> {
        self.by_hash.get(hash).cloned()
    }
}

pub struct LotusClient {
    rpc: JsonRpcClient,
    tipset_index: Mutex<TipsetIndex>,
}

impl LotusClient {
    pub fn new(endpoint: &str, access_token: Option<String>) -> Result<Self, RpcError> {
        Self::with_config(
            endpoint,
            access_token,
            DEFAULT_MAX_RETRIES,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn with_config(
        endpoint: &str,
        access_token: Option<String>,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Self, RpcError> {
        let endpoint = Url::parse(endpoint)?;
        Ok(Self {
            rpc: JsonRpcClient::with_config(endpoint, access_token, max_retries, timeout)?,
            tipset_index: Mutex::new(TipsetIndex::new(TIPSET_INDEX_CAPACITY)),
        })
    }

    pub fn endpoint(&self) -> &Url {
        self.rpc.endpoint()
    }

    fn remember_tipset(&self, block: &Block) {
        if let Ok(mut index) = self.tipset_index.lock() {
            index.remember(&block.hash, &block.tipset_key);
        }
    }

    fn lookup_tipset(&self, hash: &str) -> Option<Vec<String>> {
        self.tipset_index.lock().ok().and_then(|index| index.lookup(hash))
    }

    async fn tipset_by_height(&self, height: u64) -> Result<TipSet, RpcError> {
        self.rpc
            .call("Filecoin.ChainGetTipSetByHeight", json!([height, null]))
            .await
    }

    async fn block_messages(&self, block_cid: &str) -> Result<Vec<(String, Message)>, RpcError> {
        let messages: BlockMessages = self
            .rpc
            .call("Filecoin.ChainGetBlockMessages", json!([Cid::new(block_cid)]))
            .await?;
        pair_messages_with_cids(messages)
    }

    /// Collects the block's plain transfers and resolves their receipts. A
    /// transfer whose receipt lookup fails is moved to `block.unresolved`
    /// instead of failing the whole block.
    async fn load_transactions(&self, tipset: &TipSet, block: &mut Block) -> Result<(), RpcError> {
        let mut seen_cids = HashSet::new();
        let mut seen_nonces = HashSet::new();
        let mut transactions = Vec::new();
        let mut unresolved = Vec::new();

        for tip_cid in &block.tipset_key {
            for (cid, msg) in self.block_messages(tip_cid).await? {
                if msg.method != METHOD_SEND || seen_cids.contains(&cid) {
                    continue;
                }
                let mut tx = transaction_from_message(cid, msg);
                if !seen_nonces.insert(tx.sender_nonce_key()) {
                    warn!(tx_id = &*tx.hash, nonce = tx.nonce; "Duplicate sender nonce in tipset, skipping message");
                    continue;
                }
                seen_cids.insert(tx.hash.clone());
                tx.backfill(tipset.height, &block.hash, block.timestamp);

                if parse_integer(&tx.value).map(|v| v > BigUint::from(0u8)).unwrap_or(false) {
                    match self.get_transaction_receipt(&tx.hash).await {
                        Ok(receipt) => {
                            tx.status = TxStatus::from_exit_code(receipt.exit_code);
                            tx.gas = receipt.gas_used.max(0).to_string();
                        },
                        Err(e) => {
                            warn!(tx_id = &*tx.hash, height = tipset.height, error:% = e; "Cannot get transaction receipt");
                            unresolved.push(UnresolvedTransaction {
                                tx_id: tx.hash,
                                reason: e.to_string(),
                            });
                            continue;
                        },
                    }
                }
                transactions.push(tx);
            }
        }

        debug!(
            height = block.height,
            tips = block.tipset_key.len(),
            transfers = transactions.len(),
            unresolved = unresolved.len();
            "Loaded tipset transfers"
        );
        block.transactions = transactions;
        block.unresolved = unresolved;
        Ok(())
    }
}

#[async_trait]
impl ChainClient for LotusClient {
    async fn get_max_height(&self) -> Result<u64, RpcError> {
        let head: TipSet = self.rpc.call("Filecoin.ChainHead", json!([])).await?;
        Ok(head.height)
    }

    async fn get_block_by_height(&self, height: u64, include_transactions: bool) -> Result<Block, RpcError> {
        let tipset = self.tipset_by_height(height).await?;
        let mut block = block_from_tipset(&tipset)?;
        self.remember_tipset(&block);

        // A null round returns the closest earlier tipset; its messages belong to that height.
        if include_transactions && tipset.height == height {
            self.load_transactions(&tipset, &mut block).await?;
        }
        Ok(block)
    }

    async fn get_block_by_hash(&self, hash: &str) -> Result<Block, RpcError> {
        let key = self
            .lookup_tipset(hash)
            .ok_or_else(|| RpcError::UnknownBlockHash(hash.to_string()))?;
        let cids: Vec<Cid> = key.iter().map(Cid::new).collect();
        let tipset: TipSet = self.rpc.call("Filecoin.ChainGetTipSet", json!([cids])).await?;
        block_from_tipset(&tipset)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<TransactionReceipt, RpcError> {
        let receipt: Option<MessageReceipt> = self
            .rpc
            .call_optional("Filecoin.StateGetReceipt", json!([Cid::new(tx_hash), null]))
            .await
            .map_err(|e| RpcError::ReceiptUnavailable(format!("{}: {}", tx_hash, e)))?;
        let receipt = receipt.ok_or_else(|| RpcError::ReceiptUnavailable(tx_hash.to_string()))?;
        Ok(TransactionReceipt {
            exit_code: receipt.exit_code,
            gas_used: receipt.gas_used,
        })
    }

    async fn get_address_balance(&self, address: &str) -> Result<AddressBalance, RpcError> {
        let actor: Option<Actor> = match self
            .rpc
            .call_optional("Filecoin.StateGetActor", json!([address, null]))
            .await
        {
            Ok(actor) => actor,
            Err(RpcError::Node { message, .. }) if message.contains(ACTOR_NOT_FOUND) => None,
            Err(e) => return Err(e),
        };
        let (balance, nonce) = match actor {
            Some(actor) => {
                parse_integer(&actor.balance)
                    .map_err(|e| RpcError::Malformed(format!("balance of {}: {}", address, e)))?;
                (actor.balance, actor.nonce)
            },
            None => ("0".to_string(), 0),
        };
        Ok(AddressBalance {
            address: address.to_string(),
            balance,
            nonce,
        })
    }
}

fn digest_cids<'a>(cids: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for cid in cids {
        hasher.update(cid.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Builds the logical block header for a tipset, without transactions.
pub(crate) fn block_from_tipset(tipset: &TipSet) -> Result<Block, RpcError> {
    if tipset.blocks.is_empty() || tipset.cids.len() != tipset.blocks.len() {
        return Err(RpcError::Malformed(format!(
            "tipset at height {} has {} cids for {} blocks",
            tipset.height,
            tipset.cids.len(),
            tipset.blocks.len()
        )));
    }

    let tipset_key: Vec<String> = tipset.cids.iter().map(|c| c.root.clone()).collect();

    let mut seen = HashSet::new();
    let parents: Vec<&str> = tipset
        .blocks
        .iter()
        .flat_map(|b| b.parents.iter())
        .map(|c| c.root.as_str())
        .filter(|c| seen.insert(*c))
        .collect();

    let timestamp = tipset.blocks.iter().map(|b| b.timestamp).max().unwrap_or_default();

    Ok(Block {
        height: tipset.height,
        hash: digest_cids(tipset_key.iter().map(String::as_str)),
        previous_hash: digest_cids(parents),
        timestamp,
        transactions: Vec::new(),
        tipset_key,
        unresolved: Vec::new(),
    })
}

/// BLS messages come first, then secp messages; `Cids` lists both in that order.
fn pair_messages_with_cids(messages: BlockMessages) -> Result<Vec<(String, Message)>, RpcError> {
    let all: Vec<Message> = messages
        .bls_messages
        .into_iter()
        .chain(messages.secpk_messages.into_iter().map(|m| m.message))
        .collect();
    if all.len() != messages.cids.len() {
        return Err(RpcError::Malformed(format!(
            "{} messages but {} cids",
            all.len(),
            messages.cids.len()
        )));
    }
    Ok(messages.cids.into_iter().map(|c| c.root).zip(all).collect())
}

fn transaction_from_message(cid: String, msg: Message) -> Transaction {
    Transaction {
        hash: cid,
        from: msg.from,
        to: msg.to,
        value: msg.value,
        nonce: msg.nonce,
        gas: msg.gas_limit.max(0).to_string(),
        gas_price: msg.gas_fee_cap,
        method: msg.method,
        status: TxStatus::Unknown,
        block_height: 0,
        block_hash: String::new(),
        timestamp: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tipset_json(height: u64, cids: &[&str], parents: &[&str]) -> Value {
        json!({
            "Cids": cids.iter().map(|c| json!({"/": c})).collect::<Vec<_>>(),
            "Blocks": cids.iter().map(|_| json!({
                "Miner": "f01000",
                "Parents": parents.iter().map(|p| json!({"/": p})).collect::<Vec<_>>(),
                "Height": height,
                "Timestamp": 1_700_000_000u64 + height * 30,
            })).collect::<Vec<_>>(),
            "Height": height,
        })
    }

    fn message_json(from: &str, to: &str, value: &str, nonce: u64, method: u64) -> Value {
        json!({
            "Version": 0, "To": to, "From": from, "Nonce": nonce, "Value": value,
            "GasLimit": 600000, "GasFeeCap": "100000", "GasPremium": "1000", "Method": method, "Params": null
        })
    }

    async fn mount_result(server: &MockServer, body_match: Value, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(body_match))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result})))
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> LotusClient {
        LotusClient::with_config(&server.uri(), None, 0, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_block_from_tipset_hashes() {
        let tipset: TipSet = serde_json::from_value(tipset_json(10, &["bafyA", "bafyB"], &["bafyP1", "bafyP2"])).unwrap();
        let block = block_from_tipset(&tipset).unwrap();
        assert_eq!(block.height, 10);
        assert_eq!(block.hash, hex::encode(Sha256::digest(b"bafyAbafyB")));
        // Both tips share the parents; they are only hashed once
        assert_eq!(block.previous_hash, hex::encode(Sha256::digest(b"bafyP1bafyP2")));
        assert_eq!(block.timestamp, 1_700_000_300);
        assert_eq!(block.tipset_key, vec!["bafyA".to_string(), "bafyB".to_string()]);

        let parent: TipSet = serde_json::from_value(tipset_json(9, &["bafyP1", "bafyP2"], &["bafyQ"])).unwrap();
        assert_eq!(block_from_tipset(&parent).unwrap().hash, block.previous_hash);
    }

    #[test]
    fn test_empty_tipset_is_malformed() {
        let tipset: TipSet = serde_json::from_value(json!({"Cids": [], "Blocks": [], "Height": 3})).unwrap();
        assert!(matches!(block_from_tipset(&tipset), Err(RpcError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_get_block_by_height_collects_deduplicated_transfers() {
        let server = MockServer::start().await;
        mount_result(&server, json!({"method": "Filecoin.ChainGetTipSetByHeight", "params": [100, null]}),
            tipset_json(100, &["bafyTipA", "bafyTipB"], &["bafyParent"])).await;
        // Tip A: transfer, non-transfer method, zero-value transfer
        mount_result(&server, json!({"method": "Filecoin.ChainGetBlockMessages", "params": [{"/": "bafyTipA"}]}), json!({
            "BlsMessages": [message_json("f1alice", "f1bob", "5000", 1, 0), message_json("f1alice", "f2actor", "1", 2, 3)],
            "SecpkMessages": [{"Message": message_json("f1carol", "f1dave", "0", 7, 0), "Signature": {"Type": 1, "Data": ""}}],
            "Cids": [{"/": "bafyMsg1"}, {"/": "bafyMsg2"}, {"/": "bafyMsg3"}],
        })).await;
        // Tip B re-lists msg1 and a different CID reusing alice's nonce 1
        mount_result(&server, json!({"method": "Filecoin.ChainGetBlockMessages", "params": [{"/": "bafyTipB"}]}), json!({
            "BlsMessages": [message_json("f1alice", "f1bob", "5000", 1, 0), message_json("f1alice", "f1eve", "9", 1, 0)],
            "SecpkMessages": null,
            "Cids": [{"/": "bafyMsg1"}, {"/": "bafyMsg4"}],
        })).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.StateGetReceipt", "params": [{"/": "bafyMsg1"}, null]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": {"ExitCode": 0, "Return": null, "GasUsed": 480000}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        let block = c.get_block_by_height(100, true).await.unwrap();
        let hashes: Vec<&str> = block.transactions.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, vec!["bafyMsg1", "bafyMsg3"]);

        let first = &block.transactions[0];
        assert_eq!(first.status, TxStatus::Success);
        assert_eq!(first.gas, "480000");
        assert_eq!(first.gas_price, "100000");
        assert_eq!(first.block_height, 100);
        assert_eq!(first.block_hash, block.hash);
        assert_eq!(block.transactions[1].status, TxStatus::Unknown);

        // The hash index now resolves back to the tipset
        mount_result(&server, json!({"method": "Filecoin.ChainGetTipSet"}), tipset_json(100, &["bafyTipA", "bafyTipB"], &["bafyParent"])).await;
        let by_hash = c.get_block_by_hash(&block.hash).await.unwrap();
        assert_eq!(by_hash.height, 100);
        assert!(matches!(c.get_block_by_hash("deadbeef").await, Err(RpcError::UnknownBlockHash(_))));
    }

    #[tokio::test]
    async fn test_missing_receipt_leaves_transfer_unresolved_and_null_round_skips_messages() {
        let server = MockServer::start().await;
        mount_result(&server, json!({"method": "Filecoin.ChainGetTipSetByHeight", "params": [200, null]}),
            tipset_json(200, &["bafyTip"], &["bafyParent"])).await;
        mount_result(&server, json!({"method": "Filecoin.ChainGetTipSetByHeight", "params": [202, null]}),
            tipset_json(201, &["bafyTip201"], &["bafyTip"])).await;
        mount_result(&server, json!({"method": "Filecoin.ChainGetBlockMessages"}), json!({
            "BlsMessages": [message_json("f1alice", "f1bob", "10", 1, 0), message_json("f1carol", "f1bob", "20", 4, 0)],
            "SecpkMessages": [],
            "Cids": [{"/": "bafyPending"}, {"/": "bafyKnown"}],
        })).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.StateGetReceipt", "params": [{"/": "bafyPending"}, null]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "error": {"code": -5, "message": "No information available about transaction"}
            })))
            .mount(&server)
            .await;
        mount_result(&server, json!({"method": "Filecoin.StateGetReceipt", "params": [{"/": "bafyKnown"}, null]}),
            json!({"ExitCode": 0, "Return": null, "GasUsed": 1000})).await;

        let c = client(&server);
        let block = c.get_block_by_height(200, true).await.unwrap();
        let hashes: Vec<&str> = block.transactions.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, vec!["bafyKnown"]);
        assert_eq!(block.unresolved.len(), 1);
        assert_eq!(block.unresolved[0].tx_id, "bafyPending");
        assert!(block.unresolved[0].reason.starts_with("block has no receipt yet"));
        assert!(block.unresolved[0].reason.contains("No information available about transaction"));

        let skipped = c.get_block_by_height(202, true).await.unwrap();
        assert_eq!(skipped.height, 201);
        assert!(skipped.transactions.is_empty());
        assert!(skipped.unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_get_address_balance() {
        let server = MockServer::start().await;
        mount_result(&server, json!({"method": "Filecoin.StateGetActor", "params": ["f1alice", null]}), json!({
            "Code": {"/": "bafkqadlgnfwc6mjpmfrwg33vnz2a"},
            "Head": {"/": "bafy2bzaceaok4ygzwpbhvxilmtazy66shipkm3p5ko6t2eu6ymi63pf55wvui"},
            "Nonce": 8,
            "Balance": "242838089036848770421",
        })).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.StateGetActor", "params": ["f1fresh", null]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": 1, "message": "resolution lookup failed (f1fresh): actor not found"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "Filecoin.StateGetActor", "params": ["f1broken", null]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "error": {"code": 1, "message": "state tree unavailable"}
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        let alice = c.get_address_balance("f1alice").await.unwrap();
        assert_eq!(alice.balance, "242838089036848770421");
        assert_eq!(alice.nonce, 8);

        let fresh = c.get_address_balance("f1fresh").await.unwrap();
        assert_eq!(fresh.balance, "0");
        assert_eq!(fresh.nonce, 0);

        assert!(matches!(c.get_address_balance("f1broken").await, Err(RpcError::Node { code: 1, .. })));
    }

    #[tokio::test]
    async fn test_get_max_height() {
        let server = MockServer::start().await;
        mount_result(&server, json!({"method": "Filecoin.ChainHead"}), tipset_json(3_000_000, &["bafyHead"], &["bafyP"])).await;
        assert_eq!(client(&server).get_max_height().await.unwrap(), 3_000_000);
    }
}
