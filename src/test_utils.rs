// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mock chain clients for engine tests. The eth mock answers JSON-RPC
//! requests from per-method queues (the last queued response repeats); the
//! hub mock keeps keyed response maps plus call logs so tests can assert on
//! what was submitted.

use crate::error::{RelayerError, RelayerResult};
use crate::eth_client::EthClient;
use crate::fee_check::{CheckFeeReq, CheckFeeRsp, FeeCheck, PayState};
use crate::hub_client::{HubEvent, HubHeader, HubRpc, MerkleProof};
use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, JsonRpcError, Provider, ProviderError, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum MockEthError {
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("(code: {}, message: {}, data: None)", .0.code, .0.message)]
    JsonRpc(JsonRpcError),
    #[error("no mock response queued for method {0}")]
    EmptyResponse(String),
}

impl RpcError for MockEthError {
    fn as_error_response(&self) -> Option<&JsonRpcError> {
        match self {
            MockEthError::JsonRpc(e) => Some(e),
            _ => None,
        }
    }

    fn as_serde_error(&self) -> Option<&serde_json::Error> {
        match self {
            MockEthError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MockEthError> for ProviderError {
    fn from(e: MockEthError) -> Self {
        ProviderError::JsonRpcClientError(Box::new(e))
    }
}

type ResponseQueue = VecDeque<Result<Value, (i64, String)>>;

/// JSON-RPC mock keyed by method name. Every request is recorded so tests
/// can inspect submitted payloads.
#[derive(Clone, Debug, Default)]
pub struct MockEthProvider {
    responses: Arc<Mutex<HashMap<String, ResponseQueue>>>,
    keyed: Arc<Mutex<HashMap<(String, String), Value>>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockEthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, method: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(Ok(value));
    }

    /// Response matched on exact request params, consulted before the
    /// per-method queue.
    pub fn add_keyed_response(&self, method: &str, params: Value, value: Value) {
        self.keyed
            .lock()
            .unwrap()
            .insert((method.to_string(), params.to_string()), value);
    }

    pub fn add_error(&self, method: &str, code: i64, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(Err((code, message.to_string())));
    }

    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl JsonRpcClient for MockEthProvider {
    type Error = MockEthError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        let params_value = serde_json::to_value(&params).unwrap_or(Value::Null);
        self.requests
            .lock()
            .unwrap()
            .push((method.to_string(), params_value.clone()));
        if let Some(value) = self
            .keyed
            .lock()
            .unwrap()
            .get(&(method.to_string(), params_value.to_string()))
        {
            return Ok(serde_json::from_value(value.clone())?);
        }
        let next = {
            let mut responses = self.responses.lock().unwrap();
            let queue = responses
                .get_mut(method)
                .ok_or_else(|| MockEthError::EmptyResponse(method.to_string()))?;
            if queue.is_empty() {
                return Err(MockEthError::EmptyResponse(method.to_string()));
            }
            if queue.len() > 1 {
                queue.pop_front().expect("non-empty queue")
            } else {
                queue.front().expect("non-empty queue").clone()
            }
        };
        match next {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err((code, message)) => Err(MockEthError::JsonRpc(JsonRpcError {
                code,
                message,
                data: None,
            })),
        }
    }
}

pub fn mock_eth_client(mock: &MockEthProvider) -> EthClient<MockEthProvider> {
    EthClient::from_provider(Provider::new(mock.clone()))
}

type SubmitQueue = Mutex<VecDeque<RelayerResult<String>>>;

/// Keyed in-process stand-in for the hub node.
#[derive(Default)]
pub struct MockHubClient {
    pub current_height: Mutex<u32>,
    pub headers: Mutex<HashMap<u32, HubHeader>>,
    pub storage: Mutex<HashMap<(String, Vec<u8>), Vec<u8>>>,
    pub merkle_proofs: Mutex<HashMap<(u32, u32), MerkleProof>>,
    pub cross_states_proofs: Mutex<HashMap<(u32, String), MerkleProof>>,
    pub events_by_tx: Mutex<HashMap<String, HubEvent>>,
    pub events_by_block: Mutex<HashMap<u32, Vec<HubEvent>>>,
    pub height_by_tx: Mutex<HashMap<String, u32>>,
    sync_header_results: SubmitQueue,
    import_results: SubmitQueue,
    /// Every committed header batch, in submission order.
    pub synced_batches: Mutex<Vec<Vec<Vec<u8>>>>,
    /// Every relayed transfer: (value, height, proof).
    pub imports: Mutex<Vec<(Vec<u8>, u32, Vec<u8>)>>,
}

impl MockHubClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_height(&self, height: u32) {
        *self.current_height.lock().unwrap() = height;
    }

    pub fn add_header(&self, header: HubHeader) {
        self.headers.lock().unwrap().insert(header.height, header);
    }

    pub fn set_storage(&self, contract: &str, key: Vec<u8>, value: Vec<u8>) {
        self.storage
            .lock()
            .unwrap()
            .insert((contract.to_string(), key), value);
    }

    pub fn clear_storage(&self, contract: &str, key: &[u8]) {
        self.storage
            .lock()
            .unwrap()
            .remove(&(contract.to_string(), key.to_vec()));
    }

    pub fn queue_sync_header_result(&self, result: RelayerResult<String>) {
        self.sync_header_results.lock().unwrap().push_back(result);
    }

    pub fn queue_import_result(&self, result: RelayerResult<String>) {
        self.import_results.lock().unwrap().push_back(result);
    }

    fn next_submit(queue: &SubmitQueue, default_hash: &str) -> RelayerResult<String> {
        match queue.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(default_hash.to_string()),
        }
    }
}

#[async_trait]
impl HubRpc for MockHubClient {
    async fn get_current_block_height(&self) -> RelayerResult<u32> {
        Ok(*self.current_height.lock().unwrap())
    }

    async fn get_header_by_height(&self, height: u32) -> RelayerResult<HubHeader> {
        self.headers
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or_else(|| RelayerError::HubRpcError(format!("no header at {height}")))
    }

    async fn get_block_height_by_tx_hash(&self, tx_hash: &str) -> RelayerResult<u32> {
        self.height_by_tx
            .lock()
            .unwrap()
            .get(tx_hash)
            .copied()
            .ok_or_else(|| RelayerError::HubRpcError(format!("unknown tx {tx_hash}")))
    }

    async fn get_storage(&self, contract: &str, key: &[u8]) -> RelayerResult<Option<Vec<u8>>> {
        Ok(self
            .storage
            .lock()
            .unwrap()
            .get(&(contract.to_string(), key.to_vec()))
            .cloned())
    }

    async fn get_merkle_proof(&self, from: u32, to: u32) -> RelayerResult<MerkleProof> {
        self.merkle_proofs
            .lock()
            .unwrap()
            .get(&(from, to))
            .cloned()
            .ok_or_else(|| RelayerError::HubRpcError(format!("no merkle proof {from}->{to}")))
    }

    async fn get_cross_states_proof(&self, height: u32, key: &str) -> RelayerResult<MerkleProof> {
        self.cross_states_proofs
            .lock()
            .unwrap()
            .get(&(height, key.to_string()))
            .cloned()
            .ok_or_else(|| {
                RelayerError::HubRpcError(format!("no cross states proof at {height} for {key}"))
            })
    }

    async fn get_smart_contract_event(&self, tx_hash: &str) -> RelayerResult<Option<HubEvent>> {
        Ok(self.events_by_tx.lock().unwrap().get(tx_hash).cloned())
    }

    async fn get_smart_contract_event_by_block(
        &self,
        height: u32,
    ) -> RelayerResult<Vec<HubEvent>> {
        Ok(self
            .events_by_block
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .unwrap_or_default())
    }

    async fn sync_block_header(
        &self,
        _side_chain_id: u64,
        headers: &[Vec<u8>],
    ) -> RelayerResult<String> {
        let result = Self::next_submit(&self.sync_header_results, "0xheadersync");
        if result.is_ok() {
            self.synced_batches
                .lock()
                .unwrap()
                .push(headers.to_vec());
        }
        result
    }

    async fn import_outer_transfer(
        &self,
        _side_chain_id: u64,
        value: &[u8],
        height: u32,
        proof: &[u8],
        _extra: &[u8],
    ) -> RelayerResult<String> {
        let result = Self::next_submit(&self.import_results, "0ximport");
        if result.is_ok() {
            self.imports
                .lock()
                .unwrap()
                .push((value.to_vec(), height, proof.to_vec()));
        }
        result
    }
}

/// Fee oracle answering from a queue; the last queued state repeats.
#[derive(Default)]
pub struct MockFeeOracle {
    states: Mutex<VecDeque<PayState>>,
    pub queries: Mutex<Vec<CheckFeeReq>>,
}

impl MockFeeOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_state(&self, state: PayState) {
        self.states.lock().unwrap().push_back(state);
    }
}

#[async_trait]
impl FeeCheck for MockFeeOracle {
    async fn check_fee(&self, requests: &[CheckFeeReq]) -> RelayerResult<Vec<CheckFeeRsp>> {
        self.queries.lock().unwrap().extend(requests.iter().cloned());
        let state = {
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                states.pop_front().expect("non-empty queue")
            } else {
                states
                    .front()
                    .copied()
                    .ok_or_else(|| RelayerError::FeeOracleError("no state queued".to_string()))?
            }
        };
        Ok(requests
            .iter()
            .map(|req| CheckFeeRsp {
                hash: req.hash.clone(),
                pay_state: state,
            })
            .collect())
    }
}

/// JSON encoding of a side chain block header with the given hash, shaped
/// like an `eth_getBlockByNumber` response.
pub fn make_block_json(height: u64, hash: [u8; 32]) -> Value {
    serde_json::json!({
        "hash": format!("0x{}", hex::encode(hash)),
        "parentHash": format!("0x{}", hex::encode([height as u8 - 1; 32])),
        "sha3Uncles": format!("0x{}", "00".repeat(32)),
        "miner": format!("0x{}", "00".repeat(20)),
        "stateRoot": format!("0x{}", "33".repeat(32)),
        "transactionsRoot": format!("0x{}", "44".repeat(32)),
        "receiptsRoot": format!("0x{}", "55".repeat(32)),
        "logsBloom": format!("0x{}", "00".repeat(256)),
        "difficulty": "0x2",
        "number": format!("0x{height:x}"),
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x5208",
        "timestamp": "0x64000000",
        "extraData": "0x",
        "mixHash": format!("0x{}", "00".repeat(32)),
        "nonce": "0x0000000000000000",
        "totalDifficulty": "0x2",
        "size": "0x220",
        "uncles": [],
        "transactions": []
    })
}

/// Minimal hub header for tests; `consensus_payload` carries the given peers
/// as a new chain config when present.
pub fn make_hub_header(height: u32, next_bookkeeper_set: bool, peers: Option<Vec<&str>>) -> HubHeader {
    let payload = match peers {
        Some(ids) => serde_json::json!({
            "last_config_block_num": height,
            "new_chain_config": {
                "peers": ids
                    .iter()
                    .enumerate()
                    .map(|(i, id)| serde_json::json!({"index": i as u32 + 1, "id": id}))
                    .collect::<Vec<_>>()
            }
        }),
        None => serde_json::json!({"last_config_block_num": height}),
    };
    HubHeader {
        version: 0,
        height,
        hash: hex::encode([height as u8; 32]),
        next_bookkeeper: if next_bookkeeper_set {
            "11".repeat(20)
        } else {
            "00".repeat(20)
        },
        consensus_payload: hex::encode(serde_json::to_vec(&payload).unwrap()),
        sig_data: vec!["aa".repeat(64) + "1b"],
        raw: hex::encode([height as u8, 0xFE, 0xED]),
    }
}
