// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Side chain transaction senders. Each keystore account backs one sender;
//! tasks are routed onto per-key capacity-1 channels whose workers serialize
//! submission, so transactions sharing a router key never race while distinct
//! keys proceed in parallel. Gas price escalates ×1.1 per retry, capped at
//! 1.5× the initial price, always reusing the nonce of the first attempt.

use crate::abi::{EthCrossChainData, EthCrossChainManager};
use crate::error::{RelayerError, RelayerResult};
use crate::eth_client::EthClient;
use crate::hub_client::HubHeader;
use crate::keystore::EthKeyStore;
use crate::nonce::NonceManager;
use crate::types::{convert_sig_to_eth_compatible, ToMerkleValue};
use ethers::providers::JsonRpcClient;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Bytes, TransactionRequest, TxHash, U256};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const ROUTER_CHANNEL_CAPACITY: usize = 1;
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(20);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(180);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A fully prepared destination call waiting for a router worker.
#[derive(Debug, Clone)]
pub struct EthTxInfo {
    pub tx_data: Bytes,
    pub gas_limit: U256,
    pub gas_price: U256,
    pub contract_addr: EthAddress,
    pub hub_tx_hash: String,
}

pub struct EthSender<P> {
    pub address: EthAddress,
    keystore: Arc<EthKeyStore>,
    client: Arc<EthClient<P>>,
    nonce_manager: Arc<NonceManager<P>>,
    eccm: EthAddress,
    eccd: EthAddress,
    routine_num: u64,
    routers: Mutex<HashMap<u64, mpsc::Sender<EthTxInfo>>>,
    cancel: CancellationToken,
    broadcast_timeout: Duration,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl<P> EthSender<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        address: EthAddress,
        keystore: Arc<EthKeyStore>,
        client: Arc<EthClient<P>>,
        nonce_manager: Arc<NonceManager<P>>,
        eccm: EthAddress,
        eccd: EthAddress,
        routine_num: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            address,
            keystore,
            client,
            nonce_manager,
            eccm,
            eccd,
            routine_num,
            routers: Mutex::new(HashMap::new()),
            cancel,
            broadcast_timeout: BROADCAST_TIMEOUT,
            confirm_timeout: CONFIRM_TIMEOUT,
            poll_interval: RECEIPT_POLL_INTERVAL,
        }
    }

    /// Shrinks the broadcast/confirmation windows; test-only knob.
    pub fn with_timings(
        mut self,
        broadcast_timeout: Duration,
        confirm_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        self.broadcast_timeout = broadcast_timeout;
        self.confirm_timeout = confirm_timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub async fn balance(&self) -> RelayerResult<U256> {
        self.client.get_balance(self.address).await
    }

    /// Signs, broadcasts and confirms one task, escalating the gas price on
    /// underpriced rejections and confirmation timeouts. The nonce acquired
    /// up front is reused across every attempt; it is returned only when
    /// signing itself fails.
    pub async fn send_tx_to_side(&self, mut info: EthTxInfo) -> RelayerResult<()> {
        let nonce = self.nonce_manager.get_address_nonce(self.address).await?;
        let origin = info.gas_price * 12u64 / 10u64;
        info.gas_price = origin;
        let max_price = origin * 15u64 / 10u64;

        loop {
            let tx: TypedTransaction = TransactionRequest::new()
                .from(self.address)
                .to(info.contract_addr)
                .value(0u64)
                .gas(info.gas_limit)
                .gas_price(info.gas_price)
                .nonce(nonce)
                .data(info.tx_data.clone())
                .chain_id(self.keystore.chain_id())
                .into();
            let raw = match self.keystore.sign_transaction(&tx, self.address) {
                Ok(raw) => raw,
                Err(e) => {
                    self.nonce_manager.return_nonce(self.address, nonce).await;
                    return Err(e);
                }
            };

            tracing::info!(
                account = ?self.address,
                hub_tx = %info.hub_tx_hash,
                nonce,
                gas_price = %info.gas_price,
                "relaying hub tx to side chain"
            );
            let submitted = match tokio::time::timeout(
                self.broadcast_timeout,
                self.client.send_raw_transaction(raw),
            )
            .await
            {
                Ok(Ok(hash)) => Some(hash),
                Ok(Err(e)) => {
                    let msg = e.to_string();
                    if msg.contains("transaction underpriced") {
                        tracing::warn!(nonce, "side chain rejected tx as underpriced");
                        None
                    } else {
                        tracing::error!(
                            account = ?self.address,
                            nonce,
                            error = %msg,
                            "unexpected send failure, shutting the relayer down"
                        );
                        self.cancel.cancel();
                        return Err(e);
                    }
                }
                Err(_) => {
                    tracing::error!(
                        account = ?self.address,
                        nonce,
                        "broadcast timed out, shutting the relayer down"
                    );
                    self.cancel.cancel();
                    return Err(RelayerError::ConfirmationTimeout(info.hub_tx_hash));
                }
            };

            if let Some(hash) = submitted {
                if self.wait_transaction_confirm(&info.hub_tx_hash, hash).await {
                    tracing::info!(
                        side_tx = ?hash,
                        nonce,
                        hub_tx = %info.hub_tx_hash,
                        gas_price = %info.gas_price,
                        "relayed hub tx to side chain"
                    );
                    return Ok(());
                }
                tracing::error!(
                    side_tx = ?hash,
                    nonce,
                    hub_tx = %info.hub_tx_hash,
                    gas_price = %info.gas_price,
                    "tx not confirmed in time"
                );
            }

            if info.gas_price == max_price {
                tracing::error!(nonce, "gas price escalation exhausted, shutting down");
                self.cancel.cancel();
                return Err(RelayerError::GasPriceExhausted { nonce });
            }
            let bumped = info.gas_price * 11u64 / 10u64;
            info.gas_price = if bumped > max_price { max_price } else { bumped };
        }
    }

    /// Polls for inclusion and a successful receipt, one poll per interval,
    /// giving up after the confirmation window.
    async fn wait_transaction_confirm(&self, hub_tx_hash: &str, hash: TxHash) -> bool {
        let start = Instant::now();
        loop {
            if start.elapsed() > self.confirm_timeout {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
            let tx = match self.client.get_transaction(hash).await {
                Ok(Some(tx)) => tx,
                _ => continue,
            };
            tracing::debug!(side_tx = ?hash, hub_tx = %hub_tx_hash, pending = tx.block_number.is_none(), "confirmation poll");
            if tx.block_number.is_none() {
                continue;
            }
            match self.client.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => return receipt.status == Some(1u64.into()),
                _ => continue,
            }
        }
    }

    /// Builds and enqueues a `verifyHeaderAndExecuteTx` call for one proven
    /// hub transfer. Returns true when the task is queued (or the transfer
    /// turns out to be already relayed), false when it must be retried.
    pub async fn commit_deposit_events_with_header(
        self: &Arc<Self>,
        header: &HubHeader,
        param: &ToMerkleValue,
        header_proof: &str,
        anchor_header: Option<&HubHeader>,
        hub_tx_hash: &str,
        raw_audit_path: &[u8],
    ) -> bool {
        let sig_source = if anchor_header.is_some() && !header_proof.is_empty() {
            anchor_header.expect("anchor checked above")
        } else {
            header
        };
        let sigs = match self.collect_sigs(sig_source) {
            Ok(sigs) => sigs,
            Err(e) => {
                tracing::error!(error = ?e, "undecodable header signatures");
                return false;
            }
        };

        // skip transfers the data contract already knows
        let eccd = EthCrossChainData::new(self.eccd, self.client.provider());
        let mut from_tx = [0u8; 32];
        let len = param.tx_hash.len().min(32);
        from_tx[..len].copy_from_slice(&param.tx_hash[..len]);
        if let Ok(true) = eccd
            .check_if_from_chain_tx_exist(param.from_chain_id, from_tx)
            .call()
            .await
        {
            tracing::debug!(
                from_chain_id = param.from_chain_id,
                from_tx = %hex::encode(param.tx_hash.as_slice()),
                "already relayed to side chain"
            );
            return true;
        }

        let header_data = match header.raw_bytes() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = ?e, "undecodable header raw bytes");
                return false;
            }
        };
        let raw_proof = hex::decode(header_proof).unwrap_or_default();
        let raw_anchor = anchor_header
            .and_then(|a| a.raw_bytes().ok())
            .unwrap_or_default();

        let eccm = EthCrossChainManager::new(self.eccm, self.client.provider());
        let call = eccm.verify_header_and_execute_tx(
            raw_audit_path.to_vec().into(),
            header_data.into(),
            raw_proof.into(),
            raw_anchor.into(),
            sigs.into(),
        );
        let Some(tx_data) = call.calldata() else {
            tracing::error!("verifyHeaderAndExecuteTx encoding failed");
            return false;
        };

        let gas_price = match self.client.suggest_gas_price().await {
            Ok(price) => price,
            Err(e) => {
                tracing::error!(error = ?e, "suggest gas price failed");
                return false;
            }
        };
        let estimate_tx: TypedTransaction = TransactionRequest::new()
            .from(self.address)
            .to(self.eccm)
            .value(0u64)
            .gas_price(gas_price)
            .data(tx_data.clone())
            .into();
        let gas_limit = match self.client.estimate_gas(&estimate_tx).await {
            Ok(limit) => limit,
            Err(e) => {
                tracing::error!(error = ?e, "gas estimation failed");
                return false;
            }
        };

        let info = EthTxInfo {
            tx_data,
            gas_limit,
            gas_price,
            contract_addr: self.eccm,
            hub_tx_hash: hub_tx_hash.to_string(),
        };
        let key = rand::thread_rng().gen_range(0..self.routine_num);
        if let Err(e) = self.dispatch(key, info).await {
            tracing::error!(error = ?e, "router dispatch failed");
            return false;
        }
        true
    }

    /// Rotates the book-keeper set on the side chain. Submitted inline with a
    /// single price (no escalation) and a full confirmation wait.
    pub async fn commit_header(&self, header: &HubHeader, pubk_list: &[u8]) -> bool {
        let gas_price = match self.client.suggest_gas_price().await {
            Ok(price) => price,
            Err(e) => {
                tracing::error!(error = ?e, "suggest gas price failed");
                return false;
            }
        };
        let sigs = match self.collect_sigs(header) {
            Ok(sigs) => sigs,
            Err(e) => {
                tracing::error!(error = ?e, "undecodable header signatures");
                return false;
            }
        };
        let header_data = match header.raw_bytes() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = ?e, "undecodable header raw bytes");
                return false;
            }
        };

        let eccm = EthCrossChainManager::new(self.eccm, self.client.provider());
        let call = eccm.change_book_keeper(
            header_data.into(),
            pubk_list.to_vec().into(),
            sigs.into(),
        );
        let Some(tx_data) = call.calldata() else {
            tracing::error!("changeBookKeeper encoding failed");
            return false;
        };

        let estimate_tx: TypedTransaction = TransactionRequest::new()
            .from(self.address)
            .to(self.eccm)
            .value(0u64)
            .gas_price(gas_price)
            .data(tx_data.clone())
            .into();
        let gas_limit = match self.client.estimate_gas(&estimate_tx).await {
            Ok(limit) => limit,
            Err(e) => {
                tracing::error!(error = ?e, "gas estimation failed");
                return false;
            }
        };

        let nonce = match self.nonce_manager.get_address_nonce(self.address).await {
            Ok(nonce) => nonce,
            Err(e) => {
                tracing::error!(error = ?e, "nonce allocation failed");
                return false;
            }
        };
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.address)
            .to(self.eccm)
            .value(0u64)
            .gas(gas_limit)
            .gas_price(gas_price)
            .nonce(nonce)
            .data(tx_data)
            .chain_id(self.keystore.chain_id())
            .into();
        let raw = match self.keystore.sign_transaction(&tx, self.address) {
            Ok(raw) => raw,
            Err(e) => {
                self.nonce_manager.return_nonce(self.address, nonce).await;
                tracing::error!(error = ?e, "book-keeper tx signing failed");
                return false;
            }
        };
        let hash = match self.client.send_raw_transaction(raw).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!(error = ?e, "book-keeper tx broadcast failed");
                return false;
            }
        };

        let label = format!("header: {}", header.height);
        if self.wait_transaction_confirm(&label, hash).await {
            tracing::info!(height = header.height, side_tx = ?hash, nonce, "book-keepers rotated on side chain");
        } else {
            tracing::error!(height = header.height, side_tx = ?hash, nonce, "book-keeper rotation not confirmed");
        }
        true
    }

    fn collect_sigs(&self, header: &HubHeader) -> RelayerResult<Vec<u8>> {
        let mut sigs = Vec::new();
        for sig in header.sig_bytes()? {
            sigs.extend_from_slice(&convert_sig_to_eth_compatible(&sig)?);
        }
        Ok(sigs)
    }

    /// Hands the task to the worker owning `key`, lazily starting it. The
    /// capacity-1 channel applies backpressure when the worker is busy.
    async fn dispatch(self: &Arc<Self>, key: u64, info: EthTxInfo) -> RelayerResult<()> {
        let tx = {
            let mut routers = self.routers.lock().await;
            match routers.get(&key) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, mut rx) = mpsc::channel::<EthTxInfo>(ROUTER_CHANNEL_CAPACITY);
                    routers.insert(key, tx.clone());
                    let sender = Arc::clone(self);
                    tokio::spawn(async move {
                        while let Some(task) = rx.recv().await {
                            if let Err(e) = sender.send_tx_to_side(task).await {
                                tracing::error!(error = ?e, account = ?sender.address, "failed to send tx to side chain");
                            }
                        }
                    });
                    tx
                }
            }
        };
        tx.send(info)
            .await
            .map_err(|_| RelayerError::Generic("router worker terminated".to_string()))
    }
}

pub struct SenderPool<P> {
    senders: Vec<Arc<EthSender<P>>>,
}

impl<P> SenderPool<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(senders: Vec<Arc<EthSender<P>>>) -> Self {
        assert!(!senders.is_empty(), "sender pool cannot be empty");
        Self { senders }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Picks a sender with probability proportional to its balance, so
    /// drained accounts naturally stop being chosen. Balance queries are
    /// retried until they succeed.
    pub async fn select(&self) -> Arc<EthSender<P>> {
        let mut balances = Vec::with_capacity(self.senders.len());
        for sender in &self.senders {
            loop {
                match sender.balance().await {
                    Ok(balance) => {
                        balances.push(balance);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(account = ?sender.address, error = ?e, "balance query failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        let total: U256 = balances.iter().fold(U256::zero(), |acc, b| acc + *b);
        if total.is_zero() {
            return self.senders[0].clone();
        }
        let sample = U256::from(rand::thread_rng().gen::<u128>()) % total;
        let index = pick_by_weight(&balances, sample);
        self.senders[index].clone()
    }
}

/// First index whose cumulative balance exceeds `sample`; `sample` must be
/// uniform on `[0, total)` for the selection to be balance-proportional.
pub fn pick_by_weight(balances: &[U256], sample: U256) -> usize {
    let mut cumulative = U256::zero();
    for (i, balance) in balances.iter().enumerate() {
        cumulative = cumulative + *balance;
        if sample < cumulative {
            return i;
        }
    }
    0
}
