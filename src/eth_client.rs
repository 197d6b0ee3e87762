// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Thin adapter over an ethers provider for everything the relayer needs
//! from the side chain: heights, headers, cross-chain event logs, storage
//! proofs and raw transaction plumbing.

use crate::abi::CrossChainEventFilter;
use crate::error::{RelayerError, RelayerResult};
use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, Block, BlockId, Bytes, Filter, Log, Transaction, TransactionReceipt,
    TxHash, H256, U256,
};
use std::sync::Arc;

pub struct EthClient<P> {
    provider: Arc<Provider<P>>,
}

impl EthClient<Http> {
    pub fn new(provider_url: &str) -> RelayerResult<Self> {
        let provider = Provider::<Http>::try_from(provider_url)
            .map_err(|e| RelayerError::ProviderError(format!("invalid provider url: {e}")))?;
        Ok(Self {
            provider: Arc::new(provider),
        })
    }
}

impl<P> EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn from_provider(provider: Provider<P>) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    pub fn provider(&self) -> Arc<Provider<P>> {
        self.provider.clone()
    }

    pub async fn get_chain_id(&self) -> RelayerResult<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }

    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    /// Full header of the block at `height`. Errors when the node does not
    /// have the block (e.g. behind a pruning boundary or during a reorg).
    pub async fn get_block(&self, height: u64) -> RelayerResult<Block<TxHash>> {
        self.provider
            .get_block(height)
            .await?
            .ok_or_else(|| RelayerError::ProviderError(format!("block {height} not found")))
    }

    /// `CrossChainEvent` logs emitted by the manager contract in one block,
    /// paired with the raw log for tx-hash attribution.
    pub async fn get_cross_chain_events(
        &self,
        eccm: EthAddress,
        height: u64,
    ) -> RelayerResult<Vec<(CrossChainEventFilter, Log)>> {
        let filter = Filter::new()
            .address(eccm)
            .topic0(CrossChainEventFilter::signature())
            .from_block(height)
            .to_block(height);
        let logs = self.provider.get_logs(&filter).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let raw = RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            };
            let event = CrossChainEventFilter::decode_log(&raw).map_err(|e| {
                RelayerError::SerializationError(format!("undecodable CrossChainEvent log: {e}"))
            })?;
            events.push((event, log));
        }
        Ok(events)
    }

    /// EIP-1186 storage proof for `key` of `contract` at `height`, encoded as
    /// the JSON blob the hub's side-chain verifier consumes.
    pub async fn get_storage_proof(
        &self,
        contract: EthAddress,
        key: [u8; 32],
        height: u64,
    ) -> RelayerResult<Vec<u8>> {
        let proof = self
            .provider
            .get_proof(contract, vec![H256::from(key)], Some(BlockId::from(height)))
            .await?;
        serde_json::to_vec(&proof)
            .map_err(|e| RelayerError::SerializationError(format!("proof encoding failed: {e}")))
    }

    pub async fn get_balance(&self, address: EthAddress) -> RelayerResult<U256> {
        Ok(self.provider.get_balance(address, None).await?)
    }

    pub async fn suggest_gas_price(&self) -> RelayerResult<U256> {
        Ok(self.provider.get_gas_price().await?)
    }

    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        Ok(self.provider.estimate_gas(tx, None).await?)
    }

    /// Pending-inclusive transaction count, the seed for nonce allocation.
    pub async fn get_pending_nonce(&self, address: EthAddress) -> RelayerResult<u64> {
        let count = self
            .provider
            .get_transaction_count(address, Some(ethers::types::BlockNumber::Pending.into()))
            .await?;
        Ok(count.as_u64())
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<TxHash> {
        let pending = self.provider.send_raw_transaction(raw).await?;
        Ok(pending.tx_hash())
    }

    pub async fn get_transaction(&self, hash: TxHash) -> RelayerResult<Option<Transaction>> {
        Ok(self.provider.get_transaction(hash).await?)
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        Ok(self.provider.get_transaction_receipt(hash).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mock_eth_client, MockEthProvider};
    use ethers::abi::Token;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_block_number() {
        let mock = MockEthProvider::new();
        mock.add_response("eth_blockNumber", json!("0x64"));
        let client = mock_eth_client(&mock);
        assert_eq!(client.get_block_number().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_get_cross_chain_events_decodes_logs() {
        let mock = MockEthProvider::new();
        let sender = EthAddress::repeat_byte(0x11);
        let mut sender_topic = [0u8; 32];
        sender_topic[12..].copy_from_slice(sender.as_bytes());
        let proxy = EthAddress::repeat_byte(0x22);
        let data = ethers::abi::encode(&[
            Token::Bytes(vec![0x01, 0x02]),
            Token::Address(proxy),
            Token::Uint(U256::from(6u64)),
            Token::Bytes(vec![0x03]),
            Token::Bytes(vec![0x04, 0x05, 0x06]),
        ]);
        let log = json!([{
            "address": "0x7d7f2b4b5e5cbe6b708ba4eb43b4cf1e9d1c8b96",
            "topics": [
                format!("0x{}", hex::encode(CrossChainEventFilter::signature())),
                format!("0x{}", hex::encode(sender_topic)),
            ],
            "data": format!("0x{}", hex::encode(data)),
            "blockNumber": "0x37",
            "transactionHash": format!("0x{}", hex::encode([0xaau8; 32])),
            "transactionIndex": "0x0",
            "blockHash": format!("0x{}", hex::encode([0xbbu8; 32])),
            "logIndex": "0x0",
            "removed": false
        }]);
        mock.add_response("eth_getLogs", log);

        let client = mock_eth_client(&mock);
        let events = client
            .get_cross_chain_events(
                "0x7d7f2b4b5e5cbe6b708ba4eb43b4cf1e9d1c8b96"
                    .parse()
                    .unwrap(),
                55,
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let (event, raw_log) = &events[0];
        assert_eq!(event.sender, sender);
        assert_eq!(event.proxy_or_asset_contract, proxy);
        assert_eq!(event.to_chain_id, 6);
        assert_eq!(event.rawdata.to_vec(), vec![0x04, 0x05, 0x06]);
        assert_eq!(raw_log.transaction_hash, Some(TxHash::from([0xaau8; 32])));
    }
}
