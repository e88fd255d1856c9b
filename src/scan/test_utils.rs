//! In-memory chain and observers shared by the scanner tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{
    events::{BlockScanObserver, ObserverError},
    extractor::{ScanTargetFunc, TransactionExtractor},
    targets::WatchList,
};
use crate::{
    models::{Block, BlockHeader, ScanTarget, Transaction, TxExtractData, TxStatus, UnresolvedTransaction},
    rpc::{AddressBalance, ChainClient, METHOD_SEND, RpcError, TransactionReceipt},
};

pub(crate) const GENESIS_TIME: u64 = 1_598_306_400;

pub(crate) fn block_hash(height: u64, branch: u32) -> String {
    format!("h{}-{}", height, branch)
}

/// A 1 FIL plain transfer at `height`.
pub(crate) fn transfer(hash: &str, from: &str, to: &str, nonce: u64, height: u64) -> Transaction {
    Transaction {
        hash: hash.to_string(),
        from: from.to_string(),
        to: to.to_string(),
        value: "1000000000000000000".to_string(),
        nonce,
        gas: "1000000".to_string(),
        gas_price: "100".to_string(),
        method: METHOD_SEND,
        status: TxStatus::Success,
        block_height: height,
        block_hash: String::new(),
        timestamp: GENESIS_TIME + height * 30,
    }
}

pub(crate) fn watching(pairs: &[(&str, &str)]) -> ScanTargetFunc {
    let list = WatchList::from_map(
        pairs
            .iter()
            .map(|(address, key)| (address.to_string(), key.to_string()))
            .collect::<HashMap<_, _>>(),
    );
    list.scan_target_func()
}

/// Predicate watching `f1watched` that measures how many calls overlap.
#[derive(Default)]
pub(crate) struct OverlapGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl OverlapGauge {
    pub fn target_func(self: &Arc<Self>) -> ScanTargetFunc {
        let gauge = self.clone();
        Arc::new(move |target: &ScanTarget| {
            let now = gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
            gauge.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            gauge.active.fetch_sub(1, Ordering::SeqCst);
            (target.address == "f1watched").then(|| "acct".to_string())
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Extracted data of a watched incoming transfer.
pub(crate) fn extract_data(tx_id: &str) -> TxExtractData {
    let tx = transfer(tx_id, "f1sender", "f1watched", 0, 100);
    let mut result = TransactionExtractor::new("FIL", 18).extract(&tx, Some(&watching(&[("f1watched", "acct")])));
    result.extract_data.remove("acct").expect("watched transfer")
}

#[derive(Default)]
struct MockState {
    blocks: BTreeMap<u64, Block>,
    /// Blocks replaced by a reorg, still resolvable by hash.
    orphans: HashMap<String, Block>,
    failing_heights: HashSet<u64>,
    head_fails: bool,
    requests: Vec<u64>,
    balances: HashMap<String, String>,
}

/// Chain of blocks keyed by height. A height without a block behaves like a
/// null round: the closest earlier block is returned.
#[derive(Default)]
pub(crate) struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    /// Empty blocks at heights `0..=tip` on branch 0.
    pub fn linear(tip: u64) -> Arc<Self> {
        let chain = Self::default();
        {
            let mut state = chain.state.lock().unwrap();
            for height in 0..=tip {
                state.blocks.insert(height, empty_block(height, 0));
            }
            relink(&mut state.blocks, 0);
        }
        Arc::new(chain)
    }

    pub fn set_transactions(&self, height: u64, transactions: Vec<Transaction>) {
        let mut state = self.state.lock().unwrap();
        let block = state.blocks.get_mut(&height).expect("block exists");
        block.transactions = transactions;
        backfill(block);
    }

    /// Replaces every block from `height` up with a block of `branch`.
    pub fn reorg_from(&self, height: u64, branch: u32) {
        let mut state = self.state.lock().unwrap();
        let replaced: Vec<Block> = state.blocks.range(height..).map(|(_, b)| b.clone()).collect();
        for block in replaced {
            state.orphans.insert(block.hash.clone(), block);
        }
        for (h, block) in state.blocks.range_mut(height..) {
            block.hash = block_hash(*h, branch);
        }
        relink(&mut state.blocks, height);
    }

    /// Moves `tx_id` of the block at `height` to its unresolved transfers.
    pub fn miss_receipt(&self, height: u64, tx_id: &str, reason: &str) {
        let mut state = self.state.lock().unwrap();
        let block = state.blocks.get_mut(&height).expect("block exists");
        block.transactions.retain(|tx| tx.hash != tx_id);
        block.unresolved.push(UnresolvedTransaction {
            tx_id: tx_id.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn set_balance(&self, address: &str, balance: &str) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(address.to_string(), balance.to_string());
    }

    pub fn extend_to(&self, tip: u64, branch: u32) {
        let mut state = self.state.lock().unwrap();
        let from = state.blocks.keys().next_back().map_or(0, |h| h + 1);
        for height in from..=tip {
            state.blocks.insert(height, empty_block(height, branch));
        }
        relink(&mut state.blocks, from);
    }

    pub fn make_null_round(&self, height: u64) {
        let mut state = self.state.lock().unwrap();
        state.blocks.remove(&height);
        relink(&mut state.blocks, height);
    }

    pub fn fail_height(&self, height: u64) {
        self.state.lock().unwrap().failing_heights.insert(height);
    }

    pub fn heal_height(&self, height: u64) {
        self.state.lock().unwrap().failing_heights.remove(&height);
    }

    pub fn fail_head(&self, fails: bool) {
        self.state.lock().unwrap().head_fails = fails;
    }

    /// Heights requested through `get_block_by_height`, in call order.
    pub fn requests(&self) -> Vec<u64> {
        self.state.lock().unwrap().requests.clone()
    }
}

fn empty_block(height: u64, branch: u32) -> Block {
    Block {
        height,
        hash: block_hash(height, branch),
        previous_hash: String::new(),
        timestamp: GENESIS_TIME + height * 30,
        transactions: Vec::new(),
        tipset_key: vec![format!("bafy{}-{}", height, branch)],
        unresolved: Vec::new(),
    }
}

fn backfill(block: &mut Block) {
    let (height, hash, timestamp) = (block.height, block.hash.clone(), block.timestamp);
    for tx in &mut block.transactions {
        tx.backfill(height, &hash, timestamp);
    }
}

/// Points every block from `from` up at its closest earlier block.
fn relink(blocks: &mut BTreeMap<u64, Block>, from: u64) {
    let mut previous = blocks
        .range(..from)
        .next_back()
        .map_or_else(|| "genesis".to_string(), |(_, b)| b.hash.clone());
    for (_, block) in blocks.range_mut(from..) {
        block.previous_hash = previous.clone();
        backfill(block);
        previous = block.hash.clone();
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_max_height(&self) -> Result<u64, RpcError> {
        let state = self.state.lock().unwrap();
        if state.head_fails {
            return Err(RpcError::EmptyResponse("Filecoin.ChainHead".to_string()));
        }
        Ok(state.blocks.keys().next_back().copied().unwrap_or_default())
    }

    async fn get_block_by_height(&self, height: u64, include_transactions: bool) -> Result<Block, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(height);
        if state.failing_heights.contains(&height) {
            return Err(RpcError::Node {
                code: 1,
                message: format!("tipset at {} unavailable", height),
            });
        }
        let mut block = state
            .blocks
            .range(..=height)
            .next_back()
            .map(|(_, b)| b.clone())
            .ok_or_else(|| RpcError::EmptyResponse("Filecoin.ChainGetTipSetByHeight".to_string()))?;
        if !include_transactions || block.height != height {
            block.transactions.clear();
            block.unresolved.clear();
        }
        Ok(block)
    }

    async fn get_block_by_hash(&self, hash: &str) -> Result<Block, RpcError> {
        let state = self.state.lock().unwrap();
        state
            .blocks
            .values()
            .find(|b| b.hash == hash)
            .or_else(|| state.orphans.get(hash))
            .map(|b| Block {
                transactions: Vec::new(),
                unresolved: Vec::new(),
                ..b.clone()
            })
            .ok_or_else(|| RpcError::UnknownBlockHash(hash.to_string()))
    }

    async fn get_transaction_receipt(&self, _tx_hash: &str) -> Result<TransactionReceipt, RpcError> {
        Ok(TransactionReceipt {
            exit_code: 0,
            gas_used: 0,
        })
    }

    async fn get_address_balance(&self, address: &str) -> Result<AddressBalance, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(AddressBalance {
            address: address.to_string(),
            balance: state.balances.get(address).cloned().unwrap_or_else(|| "0".to_string()),
            nonce: 0,
        })
    }
}

/// Observer that records everything it sees and rejects chosen transactions.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    reject: HashSet<String>,
    delivered: Mutex<Vec<(String, TxExtractData)>>,
    headers: Mutex<Vec<BlockHeader>>,
}

impl RecordingObserver {
    pub fn failing_on(tx_ids: &[&str]) -> Self {
        Self {
            reject: tx_ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn delivered_tx_ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, data)| data.transaction.tx_id.clone())
            .collect()
    }

    pub fn headers(&self) -> Vec<BlockHeader> {
        self.headers.lock().unwrap().clone()
    }

    pub fn fork_heights(&self) -> Vec<u64> {
        self.headers().iter().filter(|h| h.fork).map(|h| h.height).collect()
    }

    pub fn new_block_heights(&self) -> Vec<u64> {
        self.headers().iter().filter(|h| !h.fork).map(|h| h.height).collect()
    }
}

impl BlockScanObserver for RecordingObserver {
    fn block_scan_notify(&self, header: &BlockHeader) {
        self.headers.lock().unwrap().push(header.clone());
    }

    fn block_extract_data_notify(&self, source_key: &str, data: &TxExtractData) -> Result<(), ObserverError> {
        if self.reject.contains(&data.transaction.tx_id) {
            return Err(ObserverError::Rejected(data.transaction.tx_id.clone()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((source_key.to_string(), data.clone()));
        Ok(())
    }
}
