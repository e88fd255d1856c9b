//! Lotus JSON-RPC wire types (only the fields the scanner reads).

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// IPLD link, serialized by Lotus as `{"/": "bafy..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cid {
    #[serde(rename = "/")]
    pub root: String,
}

impl Cid {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TipSet {
    #[serde(deserialize_with = "null_as_empty")]
    pub cids: Vec<Cid>,
    #[serde(deserialize_with = "null_as_empty")]
    pub blocks: Vec<LotusBlockHeader>,
    pub height: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LotusBlockHeader {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub parents: Vec<Cid>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockMessages {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub bls_messages: Vec<Message>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub secpk_messages: Vec<SignedMessage>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub cids: Vec<Cid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignedMessage {
    pub message: Message,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub to: String,
    pub from: String,
    pub nonce: u64,
    pub value: String,
    pub gas_limit: i64,
    pub gas_fee_cap: String,
    pub method: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageReceipt {
    pub exit_code: i64,
    pub gas_used: i64,
}

/// Result of `Filecoin.StateGetActor`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Actor {
    pub balance: String,
    pub nonce: u64,
}
