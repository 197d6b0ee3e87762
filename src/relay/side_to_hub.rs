// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Side chain → hub pipeline. A header follower mirrors finalized side chain
//! headers onto the hub (rolling back to the common ancestor after a fork),
//! an event extractor persists whitelisted lock events into the retry
//! bucket, a deposit loop proves and submits them, and a check loop verifies
//! hub receipts, returning failures to the retry bucket.

use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::eth_client::EthClient;
use crate::hub_client::{
    current_height_key, done_tx_key, main_chain_key, HubEvent, HubRpc,
    CROSS_CHAIN_MANAGER_CONTRACT, HEADER_SYNC_CONTRACT,
};
use crate::metrics::RelayerMetrics;
use crate::retry_with_max_elapsed_time;
use crate::store::RelayerStore;
use crate::types::{encode_big_int, mapping_key_at, CrossTransfer};
use ethers::providers::JsonRpcClient;
use ethers::types::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_FETCH_RETRY_WINDOW: Duration = Duration::from_secs(60);
/// Bound on the post-commit wait for hub inclusion. If it elapses, the batch
/// is dropped; the follower's hash comparison re-adds any header that did
/// not actually land.
const COMMIT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(300);

enum CommitOutcome {
    Committed,
    RolledBack { cursor: u64 },
}

pub struct SideToHubRelay<P, H> {
    config: Arc<RelayerConfig>,
    eth_client: Arc<EthClient<P>>,
    hub: Arc<H>,
    store: Arc<RelayerStore>,
    force_height: u64,
    metrics: Option<Arc<RelayerMetrics>>,
}

impl<P, H> SideToHubRelay<P, H>
where
    P: JsonRpcClient + 'static,
    H: HubRpc,
{
    pub fn new(
        config: Arc<RelayerConfig>,
        eth_client: Arc<EthClient<P>>,
        hub: Arc<H>,
        store: Arc<RelayerStore>,
        force_height: u64,
    ) -> Self {
        Self {
            config,
            eth_client,
            hub,
            store,
            force_height,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawns the three pipeline loops; they run until `cancel` fires.
    pub fn run(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let relay = self.clone();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            relay.monitor_chain(token).await;
        }));
        let relay = self.clone();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            relay.monitor_deposit(token).await;
        }));
        let relay = self;
        handles.push(tokio::spawn(async move {
            relay.check_deposit(cancel).await;
        }));
        handles
    }

    /// Side chain height the hub has synced headers up to, 0 when the
    /// genesis header was never committed.
    pub async fn find_synced_height(&self) -> RelayerResult<u64> {
        let key = current_height_key(self.config.side.side_chain_id);
        match self.hub.get_storage(HEADER_SYNC_CONTRACT, &key).await? {
            Some(raw) if raw.len() >= 8 => {
                Ok(u64::from_le_bytes(raw[..8].try_into().expect("8 bytes")))
            }
            _ => Ok(0),
        }
    }

    /// Start cursor for the header follower: the force flag when it points
    /// below the synced tip, otherwise `synced - confirmations`.
    pub async fn init_cursor(&self) -> RelayerResult<u64> {
        let synced = self.find_synced_height().await?;
        if synced == 0 {
            return Err(RelayerError::Generic(
                "the genesis side chain header has not been synced to the hub".to_string(),
            ));
        }
        let cursor = if self.force_height > 0 && self.force_height < synced {
            self.force_height
        } else {
            synced.saturating_sub(self.config.side.block_config)
        };
        tracing::info!(cursor, synced, "side chain follower initialized");
        Ok(cursor)
    }

    async fn monitor_chain(&self, cancel: CancellationToken) {
        let mut interval = time::interval(Duration::from_secs(self.config.side.poll_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cursor = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            match self.init_cursor().await {
                Ok(cursor) => break cursor,
                Err(e) => tracing::error!(error = ?e, "follower init failed, will retry"),
            }
        };
        let mut header_batch: Vec<Vec<u8>> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("side chain follower shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }
            let head = match self.eth_client.get_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::warn!(error = ?e, "cannot get side chain height");
                    continue;
                }
            };
            if let Some(m) = &self.metrics {
                m.side_chain_height.set(head as i64);
            }
            if head.saturating_sub(cursor) <= self.config.side.block_config {
                continue;
            }
            self.advance_chain(&mut cursor, head, &mut header_batch)
                .await;
        }
    }

    /// One follower round: walk `cursor` toward the finality boundary,
    /// batching headers and persisting candidate transfers.
    pub async fn advance_chain(&self, cursor: &mut u64, head: u64, batch: &mut Vec<Vec<u8>>) {
        let mut healthy = true;
        while *cursor < head - self.config.side.block_config {
            tracing::debug!(height = *cursor + 1, "handling side chain block");
            if let Err(e) = self.handle_new_block(*cursor + 1, batch).await {
                tracing::error!(height = *cursor + 1, error = ?e, "block handling failed");
                healthy = false;
                break;
            }
            *cursor += 1;
            if batch.len() >= self.config.side.headers_per_batch {
                match self.commit_header(batch, *cursor).await {
                    Ok(CommitOutcome::Committed) => {}
                    Ok(CommitOutcome::RolledBack { cursor: ancestor }) => {
                        *cursor = ancestor;
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "header commit failed");
                        healthy = false;
                        break;
                    }
                }
            }
        }
        if healthy && !batch.is_empty() {
            match self.commit_header(batch, *cursor).await {
                Ok(CommitOutcome::RolledBack { cursor: ancestor }) => *cursor = ancestor,
                Ok(CommitOutcome::Committed) => {}
                Err(e) => tracing::error!(error = ?e, "header commit failed"),
            }
        }
    }

    async fn handle_new_block(&self, height: u64, batch: &mut Vec<Vec<u8>>) -> RelayerResult<()> {
        self.handle_block_header(height, batch).await?;
        retry_with_max_elapsed_time!(
            self.fetch_lock_deposit_events(height),
            EVENT_FETCH_RETRY_WINDOW
        )
        .map_err(|e| {
            RelayerError::Generic(format!("event extraction kept failing at {height}: {e:?}"))
        })??;
        Ok(())
    }

    /// Appends the header at `height` to the batch unless the hub already
    /// records the same hash for it.
    async fn handle_block_header(
        &self,
        height: u64,
        batch: &mut Vec<Vec<u8>>,
    ) -> RelayerResult<()> {
        let block = self.eth_client.get_block(height).await?;
        let hash = block
            .hash
            .ok_or_else(|| RelayerError::ProviderError(format!("block {height} has no hash")))?;
        let raw = serde_json::to_vec(&block)
            .map_err(|e| RelayerError::SerializationError(format!("header encoding: {e}")))?;
        let key = main_chain_key(self.config.side.side_chain_id, height);
        let recorded = self.hub.get_storage(HEADER_SYNC_CONTRACT, &key).await?;
        if recorded.as_deref() != Some(hash.as_bytes()) {
            batch.push(raw);
        }
        Ok(())
    }

    /// Persists every whitelisted, not-yet-done lock event of the block into
    /// the retry bucket.
    async fn fetch_lock_deposit_events(&self, height: u64) -> RelayerResult<()> {
        let events = self
            .eth_client
            .get_cross_chain_events(self.config.eccm_address(), height)
            .await?;
        for (event, log) in events {
            let proxy = format!("{:?}", event.proxy_or_asset_contract);
            if !self.config.is_target_outbound(&proxy, event.to_chain_id) {
                continue;
            }
            let param = match crate::types::MakeTxParam::from_bytes(&event.rawdata) {
                Ok(param) => param,
                Err(e) => {
                    tracing::warn!(height, error = ?e, "undecodable cross chain payload, dropping");
                    continue;
                }
            };
            if !self.config.is_whitelist_method(&param.method) {
                tracing::error!(method = %param.method, "cross chain method not whitelisted");
                continue;
            }
            let done_key = done_tx_key(self.config.side.side_chain_id, &param.cross_chain_id);
            let done = self
                .hub
                .get_storage(CROSS_CHAIN_MANAGER_CONTRACT, &done_key)
                .await?;
            if done.map_or(false, |v| !v.is_empty()) {
                tracing::debug!(
                    cross_chain_id = %hex::encode(&param.cross_chain_id),
                    "transfer already recorded on hub"
                );
                continue;
            }
            let tx_hash = log.transaction_hash.ok_or_else(|| {
                RelayerError::ProviderError("event log without transaction hash".to_string())
            })?;
            let transfer = CrossTransfer {
                tx_index: encode_big_int(U256::from_big_endian(&event.tx_id)),
                tx_id: tx_hash.as_bytes().to_vec(),
                value: event.rawdata.to_vec(),
                to_chain: event.to_chain_id as u32,
                height,
            };
            self.store.put_retry(&transfer.to_bytes())?;
            if let Some(m) = &self.metrics {
                m.transfers_observed.inc();
            }
            tracing::info!(height, side_tx = ?tx_hash, "lock event recorded for relay");
        }
        Ok(())
    }

    /// Submits the pending header batch. On a parent mismatch the follower
    /// rolls back to the common ancestor instead of failing.
    async fn commit_header(
        &self,
        batch: &mut Vec<Vec<u8>>,
        cursor: u64,
    ) -> RelayerResult<CommitOutcome> {
        let count = batch.len();
        let tx_hash = match self
            .hub
            .sync_block_header(self.config.side.side_chain_id, batch)
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(RelayerError::HubRpcError(msg))
                if RelayerConfig::hub_rpc_error_is_parent_missing(&msg) =>
            {
                tracing::warn!(%msg, "hub rejected header batch, rolling back");
                let ancestor = self.rollback_to_common_ancestor(cursor).await;
                batch.clear();
                return Ok(CommitOutcome::RolledBack { cursor: ancestor });
            }
            Err(e) => return Err(e),
        };

        let deadline = tokio::time::Instant::now() + COMMIT_CONFIRM_TIMEOUT;
        loop {
            let committed_at = self
                .hub
                .get_block_height_by_tx_hash(&tx_hash)
                .await
                .unwrap_or(0);
            let current = self.hub.get_current_block_height().await.unwrap_or(0);
            if committed_at > 0 && current > committed_at {
                tracing::info!(
                    hub_tx = %tx_hash,
                    hub_height = committed_at,
                    headers = count,
                    synced_to = cursor,
                    "header batch committed"
                );
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(hub_tx = %tx_hash, "header batch confirmation timed out");
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if let Some(m) = &self.metrics {
            m.headers_committed.inc_by(count as u64);
        }
        batch.clear();
        Ok(CommitOutcome::Committed)
    }

    /// Walks backward from `from` until the live side chain hash matches the
    /// hub-recorded hash. Heights without a hub record are skipped; a failed
    /// live fetch is retried at the same height after one second.
    pub async fn rollback_to_common_ancestor(&self, from: u64) -> u64 {
        let mut height = from;
        loop {
            if height == 0 {
                return 0;
            }
            let key = main_chain_key(self.config.side.side_chain_id, height);
            let recorded = match self.hub.get_storage(HEADER_SYNC_CONTRACT, &key).await {
                Ok(Some(raw)) if !raw.is_empty() => raw,
                _ => {
                    height -= 1;
                    continue;
                }
            };
            let block = match self.eth_client.get_block(height).await {
                Ok(block) => block,
                Err(e) => {
                    tracing::error!(height, error = ?e, "header fetch failed during rollback, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if block.hash.map(|h| h.as_bytes().to_vec()) == Some(recorded) {
                tracing::info!(height, "found common ancestor");
                return height;
            }
            height -= 1;
        }
    }

    async fn monitor_deposit(&self, cancel: CancellationToken) {
        let mut interval = time::interval(Duration::from_secs(self.config.side.poll_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("deposit monitor shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }
            let head = match self.eth_client.get_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::warn!(error = ?e, "cannot get side chain height");
                    continue;
                }
            };
            let synced = match self.find_synced_height().await {
                Ok(synced) => synced,
                Err(e) => {
                    tracing::warn!(error = ?e, "cannot get hub-synced height");
                    continue;
                }
            };
            if head < synced {
                tracing::info!(head, synced, "hub ahead of side chain node, waiting");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            tracing::debug!(head, synced, lag = head - synced, "deposit round");
            if let Err(e) = self.handle_lock_deposit_events(synced).await {
                tracing::error!(error = ?e, "deposit round failed");
            }
        }
    }

    /// Walks the retry bucket: proves every record that is final relative to
    /// `ref_height` and submits it to the hub.
    pub async fn handle_lock_deposit_events(&self, ref_height: u64) -> RelayerResult<()> {
        let retry_list = self.store.get_all_retry()?;
        if let Some(m) = &self.metrics {
            m.retry_bucket_size.set(retry_list.len() as i64);
        }
        for raw in retry_list {
            let transfer = match CrossTransfer::from_bytes(&raw) {
                Ok(transfer) => transfer,
                Err(e) => {
                    tracing::error!(error = ?e, "undecodable retry record");
                    continue;
                }
            };
            let key = match mapping_key_at(&transfer.tx_index, "01") {
                Ok(key) => key,
                Err(e) => {
                    tracing::error!(error = ?e, "storage key derivation failed");
                    continue;
                }
            };
            if ref_height <= transfer.height + self.config.side.block_config {
                // not buried deep enough yet
                continue;
            }
            let proof_height = ref_height - self.config.side.block_config;
            let proof = match self
                .eth_client
                .get_storage_proof(self.config.eccd_address(), key, proof_height)
                .await
            {
                Ok(proof) => proof,
                Err(e) => {
                    tracing::error!(error = ?e, "storage proof fetch failed");
                    continue;
                }
            };
            match self
                .hub
                .import_outer_transfer(
                    self.config.side.side_chain_id,
                    &transfer.value,
                    proof_height as u32,
                    &proof,
                    &[],
                )
                .await
            {
                Ok(hub_tx_hash) => {
                    self.store.put_check(&hub_tx_hash, &raw)?;
                    self.store.delete_retry(&raw)?;
                    if let Some(m) = &self.metrics {
                        m.proofs_submitted.inc();
                    }
                    tracing::info!(hub_tx = %hub_tx_hash, height = transfer.height, "transfer proof submitted");
                }
                Err(RelayerError::HubRpcError(msg))
                    if msg.contains("chooseUtxos, current utxo is not enough") =>
                {
                    tracing::info!(%msg, "hub cannot fund submission yet, keeping record");
                }
                Err(RelayerError::HubRpcError(msg)) if msg.contains("tx already done") => {
                    tracing::debug!(
                        side_tx = %hex::encode(transfer.tx_id.as_slice()),
                        "transfer already executed on hub"
                    );
                    self.store.delete_retry(&raw)?;
                }
                Err(e) => {
                    tracing::error!(
                        side_tx = %hex::encode(transfer.tx_id.as_slice()),
                        error = ?e,
                        "transfer submission failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn check_deposit(&self, cancel: CancellationToken) {
        let mut interval = time::interval(Duration::from_secs(self.config.side.poll_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("deposit checker shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }
            if let Err(e) = self.check_lock_deposit_events().await {
                tracing::error!(error = ?e, "check round failed");
            }
        }
    }

    /// Resolves submitted transfers: confirmed entries are dropped, failed
    /// ones are put back into the retry bucket.
    pub async fn check_lock_deposit_events(&self) -> RelayerResult<()> {
        let check_list = self.store.get_all_check()?;
        if let Some(m) = &self.metrics {
            m.check_bucket_size.set(check_list.len() as i64);
        }
        for (hub_tx_hash, record) in check_list {
            let event = match self.hub.get_smart_contract_event(&hub_tx_hash).await {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(hub_tx = %hub_tx_hash, error = ?e, "event lookup failed");
                    continue;
                }
            };
            let Some(event) = event else {
                // not indexed yet
                continue;
            };
            if event.state != HubEvent::STATE_SUCCESS {
                tracing::info!(hub_tx = %hub_tx_hash, state = event.state, "hub tx failed, re-queueing transfer");
                self.store.put_retry(&record)?;
            }
            self.store.delete_check(&hub_tx_hash)?;
        }
        Ok(())
    }
}
