// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wires clients, store, keystore and both relay pipelines together and
//! supervises their long-running loops. Everything selects on one
//! cancellation token: ctrl-c cancels it, and so do fatal sender states, so
//! an external supervisor can restart the process.

use crate::config::RelayerConfig;
use crate::eth_client::EthClient;
use crate::fee_check::{FeeCheck, FeeOracleClient};
use crate::hub_client::{HubAccount, HubClient};
use crate::keystore::EthKeyStore;
use crate::metrics::RelayerMetrics;
use crate::nonce::NonceManager;
use crate::relay::hub_to_side::HubToSideRelay;
use crate::relay::sender::{EthSender, SenderPool};
use crate::relay::side_to_hub::SideToHubRelay;
use crate::store::RelayerStore;
use ethers::providers::Http;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Start height overrides from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartHeights {
    pub side_force_height: u64,
    pub hub_height: u32,
}

pub async fn run_relayer_node(
    config: RelayerConfig,
    heights: StartHeights,
    registry: &prometheus::Registry,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let config = Arc::new(config);
    let metrics = Arc::new(RelayerMetrics::new(registry));
    let cancel = CancellationToken::new();

    let store = Arc::new(
        RelayerStore::open(&config.store_path)
            .map_err(|e| anyhow::anyhow!("cannot open store at {:?}: {e:?}", config.store_path))?,
    );
    let eth_client = Arc::new(
        EthClient::new(&config.side.rpc_url)
            .map_err(|e| anyhow::anyhow!("side chain client: {e:?}"))?,
    );
    let side_chain_id = eth_client
        .get_chain_id()
        .await
        .map_err(|e| anyhow::anyhow!("cannot reach side chain node: {e:?}"))?;
    tracing::info!(side_chain_id, "connected to side chain node");

    let hub_account = HubAccount::load(&config.hub.wallet_path, &config.hub.wallet_password)
        .map_err(|e| anyhow::anyhow!("hub wallet: {e:?}"))?;
    tracing::info!(address = %hub_account.address_hex(), "hub signer loaded");
    let hub = Arc::new(HubClient::new(&config.hub.rpc_url, hub_account));

    let keystore = Arc::new(
        EthKeyStore::load(
            &config.side.keystore_path,
            &config.side.keystore_pwd_set,
            side_chain_id,
        )
        .map_err(|e| anyhow::anyhow!("side chain keystore: {e:?}"))?,
    );
    let nonce_manager = Arc::new(NonceManager::new(eth_client.clone()));
    let senders: Vec<Arc<EthSender<Http>>> = keystore
        .accounts()
        .into_iter()
        .map(|address| {
            Arc::new(EthSender::new(
                address,
                keystore.clone(),
                eth_client.clone(),
                nonce_manager.clone(),
                config.eccm_address(),
                config.eccd_address(),
                config.side.routine_num,
                cancel.clone(),
            ))
        })
        .collect();
    tracing::info!(senders = senders.len(), "sender pool ready");
    let pool = Arc::new(SenderPool::new(senders));

    let fee: Option<Arc<dyn FeeCheck>> = config
        .fee_oracle_url
        .as_ref()
        .map(|url| Arc::new(FeeOracleClient::new(url)) as Arc<dyn FeeCheck>);

    let side_to_hub = Arc::new(
        SideToHubRelay::new(
            config.clone(),
            eth_client.clone(),
            hub.clone(),
            store.clone(),
            heights.side_force_height,
        )
        .with_metrics(metrics.clone()),
    );
    let hub_to_side = Arc::new(
        HubToSideRelay::new(
            config.clone(),
            hub,
            eth_client,
            store,
            pool,
            fee,
            heights.hub_height,
        )
        .with_metrics(metrics.clone()),
    );

    let mut handles = side_to_hub.run(cancel.clone());
    handles.push(hub_to_side.run(cancel.clone()));

    let shutdown = cancel.clone();
    handles.push(tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "ctrl-c handler failed");
                }
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        }
    }));

    Ok(handles)
}
