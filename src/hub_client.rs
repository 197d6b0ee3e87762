// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Async JSON-RPC client for the hub settlement ledger. Replaces a heavy SDK
//! with plain HTTP JSON-RPC: queries for heights, headers, proofs, events and
//! native-contract storage, plus signed invocations of the two native
//! contracts the relayer writes to (header sync and cross chain manager).

use crate::error::{RelayerError, RelayerResult};
use crate::types::ZeroCopySink;
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H256;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Native contract hosting synced side chain headers.
pub const HEADER_SYNC_CONTRACT: &str = "0400000000000000000000000000000000000000";
/// Native contract tracking executed cross-chain transfers.
pub const CROSS_CHAIN_MANAGER_CONTRACT: &str = "0300000000000000000000000000000000000000";

const CURRENT_HEADER_HEIGHT: &[u8] = b"currentHeight";
const MAIN_CHAIN: &[u8] = b"mainChain";
const DONE_TX: &[u8] = b"doneTx";

/// Storage key of the latest side chain height the hub has a header for.
pub fn current_height_key(side_chain_id: u64) -> Vec<u8> {
    let mut key = CURRENT_HEADER_HEIGHT.to_vec();
    key.extend_from_slice(&side_chain_id.to_le_bytes());
    key
}

/// Storage key of the canonical side chain header hash at `height`.
pub fn main_chain_key(side_chain_id: u64, height: u64) -> Vec<u8> {
    let mut key = MAIN_CHAIN.to_vec();
    key.extend_from_slice(&side_chain_id.to_le_bytes());
    key.extend_from_slice(&height.to_le_bytes());
    key
}

/// Storage key marking a cross-chain id as executed on the hub.
pub fn done_tx_key(side_chain_id: u64, cross_chain_id: &[u8]) -> Vec<u8> {
    let mut key = DONE_TX.to_vec();
    key.extend_from_slice(&side_chain_id.to_le_bytes());
    key.extend_from_slice(cross_chain_id);
    key
}

fn dec_hex(s: &str) -> RelayerResult<Vec<u8>> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|e| RelayerError::SerializationError(format!("invalid hex: {e}")))
}

/// A hub block header as returned by `getheaderbyheight`. `raw` is the
/// serialization the destination contracts verify; the relayer treats it as
/// opaque bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HubHeader {
    pub version: u32,
    pub height: u32,
    pub hash: String,
    /// Address of the first book-keeper of the next epoch, all zeros while no
    /// rotation is scheduled.
    pub next_bookkeeper: String,
    /// Hex-encoded JSON consensus payload.
    pub consensus_payload: String,
    /// Hex signatures of the current book-keepers over this header.
    pub sig_data: Vec<String>,
    pub raw: String,
}

impl HubHeader {
    pub fn raw_bytes(&self) -> RelayerResult<Vec<u8>> {
        dec_hex(&self.raw)
    }

    pub fn sig_bytes(&self) -> RelayerResult<Vec<Vec<u8>>> {
        self.sig_data.iter().map(|s| dec_hex(s)).collect()
    }

    pub fn next_bookkeeper_set(&self) -> bool {
        match dec_hex(&self.next_bookkeeper) {
            Ok(bytes) => !bytes.is_empty() && bytes.iter().any(|b| *b != 0),
            Err(_) => false,
        }
    }

    pub fn vbft_info(&self) -> RelayerResult<VbftBlockInfo> {
        let payload = dec_hex(&self.consensus_payload)?;
        serde_json::from_slice(&payload).map_err(|e| {
            RelayerError::SerializationError(format!("undecodable consensus payload: {e}"))
        })
    }
}

/// Consensus metadata carried in each hub header. Only the new-chain-config
/// announcement matters to the relayer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VbftBlockInfo {
    #[serde(default)]
    pub last_config_block_num: Option<u32>,
    #[serde(default)]
    pub new_chain_config: Option<ChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainConfig {
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub index: u32,
    /// Hex-encoded compressed public key.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MerkleProof {
    pub audit_path: String,
}

/// One executed hub transaction with its notification list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    pub tx_hash: String,
    /// 1 on success.
    pub state: u8,
    #[serde(default)]
    pub notify: Vec<NotifyEntry>,
}

impl HubEvent {
    pub const STATE_SUCCESS: u8 = 1;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyEntry {
    pub contract_address: String,
    /// Heterogeneous notification payload; `makeProof` notifications carry
    /// [method, _, to_chain_id, _, _, proof_key].
    pub states: Value,
}

/// Hub signer decrypted from an encrypted keystore file.
#[derive(Clone)]
pub struct HubAccount {
    wallet: LocalWallet,
}

impl std::fmt::Debug for HubAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubAccount")
            .field("address", &self.address_hex())
            .finish()
    }
}

impl HubAccount {
    pub fn load<P: AsRef<Path>>(path: P, password: &str) -> RelayerResult<Self> {
        let wallet = LocalWallet::decrypt_keystore(path.as_ref(), password)
            .map_err(|e| RelayerError::KeyStoreError(format!("hub wallet decrypt failed: {e}")))?;
        Ok(Self { wallet })
    }

    #[cfg(test)]
    pub fn random() -> Self {
        Self {
            wallet: LocalWallet::new(&mut rand::thread_rng()),
        }
    }

    pub fn address_bytes(&self) -> Vec<u8> {
        self.wallet.address().as_bytes().to_vec()
    }

    pub fn address_hex(&self) -> String {
        hex::encode(self.wallet.address().as_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> RelayerResult<Vec<u8>> {
        let signature = self
            .wallet
            .sign_hash(H256::from(keccak256(data)))
            .map_err(|e| RelayerError::KeyStoreError(format!("hub signing failed: {e}")))?;
        Ok(signature.to_vec())
    }
}

/// The hub operations both relay directions depend on. Split into a trait so
/// engines can run against an in-process mock.
#[async_trait]
pub trait HubRpc: Send + Sync + 'static {
    async fn get_current_block_height(&self) -> RelayerResult<u32>;
    async fn get_header_by_height(&self, height: u32) -> RelayerResult<HubHeader>;
    async fn get_block_height_by_tx_hash(&self, tx_hash: &str) -> RelayerResult<u32>;
    async fn get_storage(&self, contract: &str, key: &[u8]) -> RelayerResult<Option<Vec<u8>>>;
    async fn get_merkle_proof(&self, from: u32, to: u32) -> RelayerResult<MerkleProof>;
    async fn get_cross_states_proof(&self, height: u32, key: &str) -> RelayerResult<MerkleProof>;
    async fn get_smart_contract_event(&self, tx_hash: &str) -> RelayerResult<Option<HubEvent>>;
    async fn get_smart_contract_event_by_block(&self, height: u32)
        -> RelayerResult<Vec<HubEvent>>;
    /// Commits a batch of raw side chain headers; returns the hub tx hash.
    async fn sync_block_header(
        &self,
        side_chain_id: u64,
        headers: &[Vec<u8>],
    ) -> RelayerResult<String>;
    /// Relays a proven side chain transfer; returns the hub tx hash.
    async fn import_outer_transfer(
        &self,
        side_chain_id: u64,
        value: &[u8],
        height: u32,
        proof: &[u8],
        extra: &[u8],
    ) -> RelayerResult<String>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    // a null result is meaningful (e.g. a not-yet-indexed transaction)
    #[serde(default)]
    result: Value,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct NativeTxPayload<'a> {
    contract: &'a str,
    method: &'a str,
    args: String,
    signer: String,
}

#[derive(Clone)]
pub struct HubClient {
    http_client: reqwest::Client,
    rpc_url: String,
    request_id: Arc<AtomicU64>,
    account: HubAccount,
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("rpc_url", &self.rpc_url)
            .finish()
    }
}

impl HubClient {
    pub fn new(rpc_url: impl Into<String>, account: HubAccount) -> Self {
        fn shared_http_client() -> reqwest::Client {
            static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
            CLIENT
                .get_or_init(|| {
                    reqwest::Client::builder()
                        .pool_max_idle_per_host(16)
                        .tcp_keepalive(Some(Duration::from_secs(30)))
                        .connect_timeout(Duration::from_secs(2))
                        .timeout(Duration::from_secs(30))
                        .build()
                        .expect("failed to build reqwest client")
                })
                .clone()
        }

        Self {
            http_client: shared_http_client(),
            rpc_url: rpc_url.into(),
            request_id: Arc::new(AtomicU64::new(1)),
            account,
        }
    }

    pub fn account(&self) -> &HubAccount {
        &self.account
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> RelayerResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        };
        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await?
            .json::<JsonRpcResponse>()
            .await?;
        if let Some(err) = response.error {
            return Err(RelayerError::HubRpcError(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }
        Ok(response.result)
    }

    fn parse<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> RelayerResult<T> {
        serde_json::from_value(value)
            .map_err(|e| RelayerError::HubRpcError(format!("{method}: undecodable result: {e}")))
    }

    /// Signs and submits an invocation of a hub native contract.
    async fn send_native_transaction(
        &self,
        contract: &str,
        method: &str,
        args: &[u8],
    ) -> RelayerResult<String> {
        let payload = NativeTxPayload {
            contract,
            method,
            args: hex::encode(args),
            signer: self.account.address_hex(),
        };
        let payload_json = serde_json::to_vec(&payload)
            .map_err(|e| RelayerError::SerializationError(format!("native payload: {e}")))?;
        let signature = self.account.sign(&payload_json)?;
        let result = self
            .call(
                "sendnativetransaction",
                vec![
                    json!(hex::encode(&payload_json)),
                    json!(hex::encode(signature)),
                ],
            )
            .await?;
        Self::parse("sendnativetransaction", result)
    }
}

#[async_trait]
impl HubRpc for HubClient {
    async fn get_current_block_height(&self) -> RelayerResult<u32> {
        let result = self.call("getcurrentblockheight", vec![]).await?;
        Self::parse("getcurrentblockheight", result)
    }

    async fn get_header_by_height(&self, height: u32) -> RelayerResult<HubHeader> {
        let result = self.call("getheaderbyheight", vec![json!(height)]).await?;
        Self::parse("getheaderbyheight", result)
    }

    async fn get_block_height_by_tx_hash(&self, tx_hash: &str) -> RelayerResult<u32> {
        let result = self
            .call("getblockheightbytxhash", vec![json!(tx_hash)])
            .await?;
        Self::parse("getblockheightbytxhash", result)
    }

    async fn get_storage(&self, contract: &str, key: &[u8]) -> RelayerResult<Option<Vec<u8>>> {
        let result = self
            .call(
                "getstorage",
                vec![json!(contract), json!(hex::encode(key))],
            )
            .await?;
        match result {
            Value::Null => Ok(None),
            Value::String(s) if s.is_empty() => Ok(None),
            Value::String(s) => Ok(Some(dec_hex(&s)?)),
            other => Err(RelayerError::HubRpcError(format!(
                "getstorage: unexpected result {other}"
            ))),
        }
    }

    async fn get_merkle_proof(&self, from: u32, to: u32) -> RelayerResult<MerkleProof> {
        let result = self
            .call("getmerkleproof", vec![json!(from), json!(to)])
            .await?;
        Self::parse("getmerkleproof", result)
    }

    async fn get_cross_states_proof(&self, height: u32, key: &str) -> RelayerResult<MerkleProof> {
        let result = self
            .call("getcrossstatesproof", vec![json!(height), json!(key)])
            .await?;
        Self::parse("getcrossstatesproof", result)
    }

    async fn get_smart_contract_event(&self, tx_hash: &str) -> RelayerResult<Option<HubEvent>> {
        let result = self
            .call("getsmartcontractevent", vec![json!(tx_hash)])
            .await?;
        match result {
            Value::Null => Ok(None),
            value => Ok(Some(Self::parse("getsmartcontractevent", value)?)),
        }
    }

    async fn get_smart_contract_event_by_block(
        &self,
        height: u32,
    ) -> RelayerResult<Vec<HubEvent>> {
        let result = self
            .call("getsmartcontracteventbyblock", vec![json!(height)])
            .await?;
        match result {
            Value::Null => Ok(vec![]),
            value => Self::parse("getsmartcontracteventbyblock", value),
        }
    }

    async fn sync_block_header(
        &self,
        side_chain_id: u64,
        headers: &[Vec<u8>],
    ) -> RelayerResult<String> {
        let mut sink = ZeroCopySink::new();
        sink.write_u64(side_chain_id);
        sink.write_var_bytes(&self.account.address_bytes());
        sink.write_var_uint(headers.len() as u64);
        for header in headers {
            sink.write_var_bytes(header);
        }
        self.send_native_transaction(HEADER_SYNC_CONTRACT, "syncBlockHeader", sink.bytes())
            .await
    }

    async fn import_outer_transfer(
        &self,
        side_chain_id: u64,
        value: &[u8],
        height: u32,
        proof: &[u8],
        extra: &[u8],
    ) -> RelayerResult<String> {
        let mut sink = ZeroCopySink::new();
        sink.write_u64(side_chain_id);
        sink.write_var_bytes(value);
        sink.write_u32(height);
        sink.write_var_bytes(proof);
        sink.write_var_bytes(&self.account.address_bytes());
        sink.write_var_bytes(extra);
        self.send_native_transaction(
            CROSS_CHAIN_MANAGER_CONTRACT,
            "importOuterTransfer",
            sink.bytes(),
        )
        .await
    }
}
