// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SideChainConfig {
    // Rpc url for the side chain fullnode, used for queries and submissions.
    pub rpc_url: String,
    // Chain id the hub knows this side chain by.
    pub side_chain_id: u64,
    // Number of blocks a header/tx must be buried before the relayer acts.
    pub block_config: u64,
    // Header batch size for hub commits.
    #[serde(default = "default_headers_per_batch")]
    pub headers_per_batch: usize,
    // The cross chain manager proxy contract.
    pub eccm_contract_address: String,
    // The cross chain data contract.
    pub eccd_contract_address: String,
    // Directory holding the sender keystore files.
    pub keystore_path: PathBuf,
    // Keystore passwords keyed by lower-case hex address.
    #[serde(default)]
    pub keystore_pwd_set: BTreeMap<String, String>,
    #[serde(default = "default_side_poll_interval")]
    pub poll_interval_secs: u64,
    // Router partitions per sender.
    #[serde(default = "default_routine_num")]
    pub routine_num: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HubConfig {
    // Rpc url of a hub node.
    pub rpc_url: String,
    // Confirmation depth on the hub.
    #[serde(default = "default_hub_block_config")]
    pub block_config: u32,
    // Contract emitting makeProof notifications.
    pub entrance_contract_address: String,
    // Keystore file for the hub signer.
    pub wallet_path: PathBuf,
    pub wallet_password: String,
    #[serde(default = "default_hub_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Per-contract chain-id allowances. An empty list in a direction admits
/// every chain id for that direction.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DirectionFilter {
    #[serde(default)]
    pub inbound: Vec<u64>,
    #[serde(default)]
    pub outbound: Vec<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerConfig {
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    // Directory of the embedded durable store.
    pub store_path: PathBuf,
    pub side: SideChainConfig,
    pub hub: HubConfig,
    // When empty, every contract is accepted in both directions.
    #[serde(default)]
    pub target_contracts: Vec<BTreeMap<String, DirectionFilter>>,
    // Accepted cross-chain methods.
    #[serde(default = "default_whitelist_methods")]
    pub whitelist_methods: Vec<String>,
    // Skip the fee oracle entirely.
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub fee_oracle_url: Option<String>,
}

fn default_headers_per_batch() -> usize {
    50
}

fn default_side_poll_interval() -> u64 {
    15
}

fn default_hub_poll_interval() -> u64 {
    1
}

fn default_hub_block_config() -> u32 {
    1
}

fn default_routine_num() -> u64 {
    4
}

fn default_metrics_port() -> u16 {
    9184
}

fn default_whitelist_methods() -> Vec<String> {
    vec![
        "add".to_string(),
        "remove".to_string(),
        "swap".to_string(),
        "unlock".to_string(),
    ]
}

impl RelayerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: RelayerConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        EthAddress::from_str(&self.side.eccm_contract_address)
            .map_err(|e| anyhow::anyhow!("invalid eccm address: {e}"))?;
        EthAddress::from_str(&self.side.eccd_contract_address)
            .map_err(|e| anyhow::anyhow!("invalid eccd address: {e}"))?;
        if self.side.headers_per_batch == 0 {
            return Err(anyhow::anyhow!("headers-per-batch must be positive"));
        }
        if self.side.routine_num == 0 {
            return Err(anyhow::anyhow!("routine-num must be positive"));
        }
        if !self.free && self.fee_oracle_url.is_none() {
            return Err(anyhow::anyhow!(
                "fee-oracle-url is required unless the relayer runs free"
            ));
        }
        Ok(())
    }

    pub fn eccm_address(&self) -> EthAddress {
        EthAddress::from_str(&self.side.eccm_contract_address).expect("validated eccm address")
    }

    pub fn eccd_address(&self) -> EthAddress {
        EthAddress::from_str(&self.side.eccd_contract_address).expect("validated eccd address")
    }

    pub fn is_whitelist_method(&self, method: &str) -> bool {
        self.whitelist_methods.iter().any(|m| m == method)
    }

    fn is_target(&self, contract: &str, chain_id: u64, outbound: bool) -> bool {
        if self.target_contracts.is_empty() {
            return true;
        }
        let wanted = contract.to_lowercase();
        for group in &self.target_contracts {
            for (addr, filter) in group {
                if addr.to_lowercase() != wanted {
                    continue;
                }
                let ids = if outbound {
                    &filter.outbound
                } else {
                    &filter.inbound
                };
                if ids.is_empty() || ids.contains(&chain_id) {
                    return true;
                }
            }
        }
        false
    }

    /// Side→hub direction: is `contract` allowed to send to `to_chain_id`?
    pub fn is_target_outbound(&self, contract: &str, to_chain_id: u64) -> bool {
        self.is_target(contract, to_chain_id, true)
    }

    /// Hub→side direction: is `contract` allowed to receive from `from_chain_id`?
    pub fn is_target_inbound(&self, contract: &str, from_chain_id: u64) -> bool {
        self.is_target(contract, from_chain_id, false)
    }

    pub fn hub_rpc_error_is_parent_missing(msg: &str) -> bool {
        msg.contains("get the parent block failed") || msg.contains("missing required field")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> RelayerConfig {
        let raw = r#"{
            "store-path": "/tmp/relayer-db",
            "side": {
                "rpc-url": "http://127.0.0.1:8545",
                "side-chain-id": 79,
                "block-config": 10,
                "headers-per-batch": 50,
                "eccm-contract-address": "0x7d7f2b4b5e5cbe6b708ba4eb43b4cf1e9d1c8b96",
                "eccd-contract-address": "0x32d5a3bd271bcc1a5a3a0cdd5915894c7a4b8a0a",
                "keystore-path": "/tmp/keystore",
                "keystore-pwd-set": {
                    "0x0000000000000000000000000000000000000001": "pwd"
                }
            },
            "hub": {
                "rpc-url": "http://127.0.0.1:40336",
                "entrance-contract-address": "0300000000000000000000000000000000000000",
                "wallet-path": "/tmp/hub-wallet.json",
                "wallet-password": "pwd"
            },
            "target-contracts": [
                {
                    "0xAb5801a7D398351b8bE11C439e05C5b3259aec9B": {
                        "outbound": [2, 6],
                        "inbound": [6]
                    }
                },
                {
                    "0x0000000000000000000000000000000000000002": {}
                }
            ],
            "whitelist-methods": ["unlock"],
            "free": true
        }"#;
        let config: RelayerConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_parse_and_defaults() {
        let config = sample_config();
        assert_eq!(config.side.poll_interval_secs, 15);
        assert_eq!(config.hub.poll_interval_secs, 1);
        assert_eq!(config.hub.block_config, 1);
        assert_eq!(config.side.routine_num, 4);
        assert_eq!(config.metrics_port, 9184);
    }

    #[test]
    fn test_whitelist_methods() {
        let config = sample_config();
        assert!(config.is_whitelist_method("unlock"));
        assert!(!config.is_whitelist_method("lock"));
    }

    #[test]
    fn test_outbound_filter() {
        let config = sample_config();
        let listed = "0xab5801a7d398351b8be11c439e05c5b3259aec9b";
        assert!(config.is_target_outbound(listed, 2));
        assert!(config.is_target_outbound(listed, 6));
        assert!(!config.is_target_outbound(listed, 9));
        // empty direction list admits everything
        assert!(config.is_target_outbound("0x0000000000000000000000000000000000000002", 9));
        // unknown contract is rejected once a whitelist exists
        assert!(!config.is_target_outbound("0x0000000000000000000000000000000000000003", 2));
    }

    #[test]
    fn test_inbound_filter() {
        let config = sample_config();
        let listed = "0xab5801a7d398351b8be11c439e05c5b3259aec9b";
        assert!(config.is_target_inbound(listed, 6));
        assert!(!config.is_target_inbound(listed, 2));
    }

    #[test]
    fn test_empty_target_contracts_admits_all() {
        let mut config = sample_config();
        config.target_contracts.clear();
        assert!(config.is_target_outbound("0xffffffffffffffffffffffffffffffffffffffff", 1));
        assert!(config.is_target_inbound("0xffffffffffffffffffffffffffffffffffffffff", 1));
    }

    #[test]
    fn test_parent_missing_matcher() {
        assert!(RelayerConfig::hub_rpc_error_is_parent_missing(
            "block sync failed: get the parent block failed at 92"
        ));
        assert!(RelayerConfig::hub_rpc_error_is_parent_missing(
            "codec: missing required field"
        ));
        assert!(!RelayerConfig::hub_rpc_error_is_parent_missing(
            "tx already done"
        ));
    }
}
