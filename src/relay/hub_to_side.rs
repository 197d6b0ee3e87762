// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hub → side chain pipeline. Follows hub blocks one behind the tip,
//! extracts `makeProof` notifications targeting the side chain, proves them
//! against the cross-states root and hands them to the sender pool. When a
//! block announces a book-keeper rotation that the side chain has not
//! recorded yet and carries no transfers, a bare `changeBookKeeper` call is
//! submitted instead.

use crate::abi::EthCrossChainData;
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::eth_client::EthClient;
use crate::fee_check::{CheckFeeReq, FeeCheck, PayState};
use crate::hub_client::{HubHeader, HubRpc};
use crate::metrics::RelayerMetrics;
use crate::relay::sender::SenderPool;
use crate::store::RelayerStore;
use crate::types::{parse_audit_path_value, ToMerkleValue, ZeroCopySink};
use ethers::core::k256::ecdsa::VerifyingKey;
use ethers::providers::JsonRpcClient;
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound on blocks handled per tick so height persistence and shutdown
/// checks keep happening during long catch-ups.
const MAX_BLOCKS_PER_TICK: u32 = 1000;
const DISPATCH_RETRY_LIMIT: usize = 10;

/// Comparison encoding of a book-keeper set: count as LE u64, then per key
/// (sorted by uncompressed encoding) the trailing 20 bytes of
/// keccak256(uncompressed[1..]). Must stay byte-identical to what the side
/// chain data contract records, otherwise rotation detection never settles.
/// Also returns the concatenated uncompressed keys for `changeBookKeeper`.
pub fn bookkeeper_encoding(peer_ids: &[String]) -> RelayerResult<(Vec<u8>, Vec<u8>)> {
    let mut keys = Vec::with_capacity(peer_ids.len());
    for id in peer_ids {
        let compressed = hex::decode(id)
            .map_err(|e| RelayerError::SerializationError(format!("peer key hex: {e}")))?;
        let key = VerifyingKey::from_sec1_bytes(&compressed)
            .map_err(|e| RelayerError::SerializationError(format!("peer key: {e}")))?;
        keys.push(key.to_encoded_point(false).as_bytes().to_vec());
    }
    keys.sort();
    let mut sink = ZeroCopySink::new();
    sink.write_u64(keys.len() as u64);
    let mut comparison = sink.into_bytes();
    let mut pubk_list = Vec::new();
    for key in &keys {
        pubk_list.extend_from_slice(key);
        comparison.extend_from_slice(&keccak256(&key[1..])[12..]);
    }
    Ok((comparison, pubk_list))
}

pub struct HubToSideRelay<P, H> {
    config: Arc<RelayerConfig>,
    hub: Arc<H>,
    eth_client: Arc<EthClient<P>>,
    store: Arc<RelayerStore>,
    pool: Arc<SenderPool<P>>,
    fee: Option<Arc<dyn FeeCheck>>,
    force_height: u32,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl<P, H> HubToSideRelay<P, H>
where
    P: JsonRpcClient + 'static,
    H: HubRpc,
{
    pub fn new(
        config: Arc<RelayerConfig>,
        hub: Arc<H>,
        eth_client: Arc<EthClient<P>>,
        store: Arc<RelayerStore>,
        pool: Arc<SenderPool<P>>,
        fee: Option<Arc<dyn FeeCheck>>,
        force_height: u32,
    ) -> Self {
        Self {
            config,
            hub,
            eth_client,
            store,
            pool,
            fee,
            force_height,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.monitor_chain(cancel).await;
        })
    }

    /// Side chain's current epoch start height, read from the data contract.
    async fn find_epoch_start_height(&self) -> RelayerResult<u32> {
        let eccd = EthCrossChainData::new(self.config.eccd_address(), self.eth_client.provider());
        let height = eccd
            .get_cur_epoch_start_height()
            .call()
            .await
            .map_err(|e| RelayerError::ProviderError(format!("getCurEpochStartHeight: {e}")))?;
        Ok(height as u32)
    }

    /// Start height precedence: forced flag, then the stored follower
    /// height, then the epoch start recorded on the side chain.
    pub async fn init_height(&self) -> u32 {
        if self.force_height > 0 {
            tracing::info!(height = self.force_height, "hub follower starts from flag");
            return self.force_height;
        }
        let stored = self.store.get_hub_height().unwrap_or(0);
        let epoch_start = self.find_epoch_start_height().await.unwrap_or_else(|e| {
            tracing::error!(error = ?e, "cannot read epoch start height");
            0
        });
        let height = stored.max(epoch_start);
        tracing::info!(height, stored, epoch_start, "hub follower initialized");
        height
    }

    async fn monitor_chain(&self, cancel: CancellationToken) {
        let mut cursor = self.init_height().await;
        let mut interval = time::interval(Duration::from_secs(self.config.hub.poll_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("hub follower shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }
            let latest = match self.hub.get_current_block_height().await {
                Ok(latest) => latest.saturating_sub(1),
                Err(e) => {
                    tracing::error!(error = ?e, "cannot get hub height");
                    continue;
                }
            };
            if let Some(m) = &self.metrics {
                m.hub_chain_height.set(latest as i64);
            }
            let confirmations = self.config.hub.block_config;
            if latest < confirmations || latest.saturating_sub(cursor) < confirmations {
                continue;
            }
            tracing::debug!(latest, cursor, "hub follower round");
            let mut processed = 0u32;
            while cursor <= latest - confirmations && processed < MAX_BLOCKS_PER_TICK {
                if let Err(e) = self.handle_deposit_events(cursor).await {
                    tracing::error!(height = cursor, error = ?e, "hub block handling failed");
                    break;
                }
                cursor += 1;
                processed += 1;
            }
            if let Err(e) = self.store.update_hub_height(cursor.saturating_sub(1)) {
                tracing::error!(error = ?e, "cannot persist hub height");
            }
        }
    }

    /// Processes one hub block: dispatches every provable transfer aimed at
    /// the side chain, or a bare book-keeper rotation when the epoch turned
    /// over with no transfers to carry it.
    pub async fn handle_deposit_events(&self, height: u32) -> RelayerResult<()> {
        let last_epoch = self.find_epoch_start_height().await?;
        let header = self.hub.get_header_by_height(height + 1).await?;
        let is_curr = last_epoch <= height;
        let (is_epoch, pubk_list) = self.is_epoch(&header).await?;

        let (anchor, header_proof) = if !is_curr {
            let anchor = self.hub.get_header_by_height(last_epoch + 1).await?;
            let proof = self.hub.get_merkle_proof(height + 1, last_epoch + 1).await?;
            (Some(anchor), proof.audit_path)
        } else if is_epoch {
            let anchor = self.hub.get_header_by_height(height + 2).await?;
            let proof = self.hub.get_merkle_proof(height + 1, height + 2).await?;
            (Some(anchor), proof.audit_path)
        } else {
            (None, String::new())
        };

        let mut cnt = 0usize;
        for event in self.hub.get_smart_contract_event_by_block(height).await? {
            for notify in &event.notify {
                if notify.contract_address != self.config.hub.entrance_contract_address {
                    continue;
                }
                let Some(states) = notify.states.as_array() else {
                    continue;
                };
                if states.first().and_then(|s| s.as_str()) != Some("makeProof") {
                    continue;
                }
                if states.get(2).and_then(|s| s.as_u64()) != Some(self.config.side.side_chain_id) {
                    continue;
                }
                let Some(key) = states.get(5).and_then(|s| s.as_str()) else {
                    continue;
                };
                let proof = match self.hub.get_cross_states_proof(height, key).await {
                    Ok(proof) => proof,
                    Err(e) => {
                        tracing::error!(%key, error = ?e, "cross states proof fetch failed");
                        continue;
                    }
                };
                let audit_path = match hex::decode(&proof.audit_path) {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::error!(error = %e, "audit path is not hex");
                        continue;
                    }
                };
                let value = match parse_audit_path_value(&audit_path) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::error!(error = ?e, "audit path without leaf value");
                        continue;
                    }
                };
                let param = match ToMerkleValue::from_bytes(&value) {
                    Ok(param) => param,
                    Err(e) => {
                        tracing::error!(error = ?e, "undecodable merkle value");
                        continue;
                    }
                };
                if !self
                    .config
                    .is_whitelist_method(&param.make_tx_param.method)
                {
                    tracing::error!(method = %param.make_tx_param.method, "target method not whitelisted");
                    continue;
                }
                if !self.is_paid(&param).await {
                    tracing::info!(hub_tx = %event.tx_hash, "skipped: relay fee not paid");
                    continue;
                }
                let to_contract = format!("0x{}", hex::encode(&param.make_tx_param.to_contract));
                if !self
                    .config
                    .is_target_inbound(&to_contract, param.from_chain_id)
                {
                    continue;
                }
                cnt += 1;
                let sender = self.pool.select().await;
                tracing::info!(
                    account = ?sender.address,
                    hub_tx = %event.tx_hash,
                    height,
                    "dispatching hub transfer"
                );
                let mut attempts = 0;
                loop {
                    if sender
                        .commit_deposit_events_with_header(
                            &header,
                            &param,
                            &header_proof,
                            anchor.as_ref(),
                            &event.tx_hash,
                            &audit_path,
                        )
                        .await
                    {
                        if let Some(m) = &self.metrics {
                            m.transfers_dispatched.inc();
                        }
                        break;
                    }
                    attempts += 1;
                    if attempts > DISPATCH_RETRY_LIMIT {
                        tracing::error!(hub_tx = %event.tx_hash, "dispatch kept failing, skipping");
                        break;
                    }
                    tracing::error!(hub_tx = %event.tx_hash, attempts, "dispatch failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        if cnt == 0 && is_epoch && is_curr {
            let sender = self.pool.select().await;
            let pubk_list = pubk_list.unwrap_or_default();
            if !sender.commit_header(&header, &pubk_list).await {
                return Err(RelayerError::Generic(format!(
                    "book-keeper rotation at hub height {height} failed"
                )));
            }
            if let Some(m) = &self.metrics {
                m.bookkeeper_rotations.inc();
            }
        }
        Ok(())
    }

    /// A header starts a new epoch iff it announces a book-keeper set that
    /// differs from the one the side chain currently records.
    pub async fn is_epoch(&self, header: &HubHeader) -> RelayerResult<(bool, Option<Vec<u8>>)> {
        if !header.next_bookkeeper_set() {
            return Ok((false, None));
        }
        let info = header.vbft_info()?;
        let Some(chain_config) = info.new_chain_config else {
            return Ok((false, None));
        };

        let eccd = EthCrossChainData::new(self.config.eccd_address(), self.eth_client.provider());
        let recorded = eccd
            .get_cur_epoch_con_pub_key_bytes()
            .call()
            .await
            .map_err(|e| RelayerError::ProviderError(format!("getCurEpochConPubKeyBytes: {e}")))?;

        let ids: Vec<String> = chain_config.peers.iter().map(|p| p.id.clone()).collect();
        let (comparison, pubk_list) = bookkeeper_encoding(&ids)?;
        if comparison == recorded.to_vec() {
            return Ok((false, None));
        }
        Ok((true, Some(pubk_list)))
    }

    /// Blocks until the fee oracle gives a decisive answer; `NotCheck` and
    /// transport errors back off for a second and ask again.
    async fn is_paid(&self, param: &ToMerkleValue) -> bool {
        if self.config.free {
            return true;
        }
        let Some(fee) = &self.fee else {
            return true;
        };
        let request = CheckFeeReq {
            hash: hex::encode(&param.make_tx_param.tx_hash),
            chain_id: param.from_chain_id,
        };
        loop {
            let responses = match fee.check_fee(std::slice::from_ref(&request)).await {
                Ok(responses) => responses,
                Err(e) => {
                    tracing::error!(hash = %request.hash, error = ?e, "fee check failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            match responses.first().map(|r| r.pay_state) {
                Some(PayState::HasPay) => return true,
                Some(PayState::NotPay) => return false,
                Some(PayState::NotCheck) => {
                    tracing::info!(hash = %request.hash, "fee not checked yet, waiting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                None => {
                    tracing::error!(hash = %request.hash, "empty fee check response");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
