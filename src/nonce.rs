// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-address nonce allocation shared by all workers of a sender. Allocation
//! is strictly monotone except that returned nonces are re-issued
//! lowest-first, so `next = min(returned ∪ {highest_allocated + 1})` holds at
//! every step.

use crate::error::RelayerResult;
use crate::eth_client::EthClient;
use ethers::providers::JsonRpcClient;
use ethers::types::Address as EthAddress;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

struct AddressNonce {
    next: u64,
    returned: BinaryHeap<Reverse<u64>>,
}

pub struct NonceManager<P> {
    client: Arc<EthClient<P>>,
    inner: Mutex<HashMap<EthAddress, AddressNonce>>,
}

impl<P> NonceManager<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(client: Arc<EthClient<P>>) -> Self {
        Self {
            client,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Next nonce for `address`. The first call per address seeds the counter
    /// from the chain's pending transaction count.
    pub async fn get_address_nonce(&self, address: EthAddress) -> RelayerResult<u64> {
        let mut inner = self.inner.lock().await;
        if !inner.contains_key(&address) {
            let start = self.client.get_pending_nonce(address).await?;
            inner.insert(
                address,
                AddressNonce {
                    next: start,
                    returned: BinaryHeap::new(),
                },
            );
        }
        let entry = inner.get_mut(&address).expect("entry just ensured");
        if let Some(Reverse(nonce)) = entry.returned.pop() {
            return Ok(nonce);
        }
        let nonce = entry.next;
        entry.next += 1;
        Ok(nonce)
    }

    /// Hands a nonce back after a failed signing so a later allocation reuses
    /// it before any fresh value.
    pub async fn return_nonce(&self, address: EthAddress, nonce: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.get_mut(&address) {
            entry.returned.push(Reverse(nonce));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mock_eth_client, MockEthProvider};
    use serde_json::json;

    fn manager_with_start(start: u64) -> NonceManager<MockEthProvider> {
        let mock = MockEthProvider::new();
        mock.add_response("eth_getTransactionCount", json!(format!("0x{start:x}")));
        NonceManager::new(Arc::new(mock_eth_client(&mock)))
    }

    #[tokio::test]
    async fn test_monotonic_allocation() {
        let manager = manager_with_start(5);
        let address = EthAddress::repeat_byte(0x01);
        for expected in 5..10 {
            assert_eq!(manager.get_address_nonce(address).await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_returned_nonce_is_reissued_first() {
        let manager = manager_with_start(0);
        let address = EthAddress::repeat_byte(0x01);
        for expected in 0..4 {
            assert_eq!(manager.get_address_nonce(address).await.unwrap(), expected);
        }
        manager.return_nonce(address, 2).await;
        // the lowest available value comes back before any fresh one
        assert_eq!(manager.get_address_nonce(address).await.unwrap(), 2);
        assert_eq!(manager.get_address_nonce(address).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_multiple_returns_come_back_lowest_first() {
        let manager = manager_with_start(0);
        let address = EthAddress::repeat_byte(0x01);
        for _ in 0..5 {
            manager.get_address_nonce(address).await.unwrap();
        }
        manager.return_nonce(address, 3).await;
        manager.return_nonce(address, 1).await;
        assert_eq!(manager.get_address_nonce(address).await.unwrap(), 1);
        assert_eq!(manager.get_address_nonce(address).await.unwrap(), 3);
        assert_eq!(manager.get_address_nonce(address).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let mock = MockEthProvider::new();
        mock.add_response("eth_getTransactionCount", json!("0x0"));
        mock.add_response("eth_getTransactionCount", json!("0x0"));
        let manager = NonceManager::new(Arc::new(mock_eth_client(&mock)));

        let a = EthAddress::repeat_byte(0x01);
        let b = EthAddress::repeat_byte(0x02);
        assert_eq!(manager.get_address_nonce(a).await.unwrap(), 0);
        assert_eq!(manager.get_address_nonce(b).await.unwrap(), 0);
        manager.return_nonce(a, 0).await;
        assert_eq!(manager.get_address_nonce(b).await.unwrap(), 1);
        assert_eq!(manager.get_address_nonce(a).await.unwrap(), 0);
    }
}
