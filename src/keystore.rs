// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Side chain sender accounts. Every JSON keystore in the configured
//! directory is decrypted at startup with the password configured for its
//! address; the relayer refuses to start with a partially usable key set.

use crate::error::{RelayerError, RelayerResult};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Bytes};
use std::collections::BTreeMap;
use std::path::Path;

pub struct EthKeyStore {
    wallets: BTreeMap<EthAddress, LocalWallet>,
    chain_id: u64,
}

impl std::fmt::Debug for EthKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthKeyStore")
            .field("accounts", &self.wallets.keys().collect::<Vec<_>>())
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

fn normalize_address(addr: &str) -> String {
    addr.trim_start_matches("0x").to_lowercase()
}

impl EthKeyStore {
    pub fn load<P: AsRef<Path>>(
        keystore_path: P,
        pwd_set: &BTreeMap<String, String>,
        chain_id: u64,
    ) -> RelayerResult<Self> {
        let mut wallets = BTreeMap::new();
        let entries = std::fs::read_dir(keystore_path.as_ref()).map_err(|e| {
            RelayerError::KeyStoreError(format!(
                "cannot read keystore dir {:?}: {e}",
                keystore_path.as_ref()
            ))
        })?;
        let passwords: BTreeMap<String, &String> = pwd_set
            .iter()
            .map(|(k, v)| (normalize_address(k), v))
            .collect();
        for entry in entries {
            let path = entry
                .map_err(|e| RelayerError::KeyStoreError(e.to_string()))?
                .path();
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|e| RelayerError::KeyStoreError(format!("read {path:?}: {e}")))?;
            let parsed: serde_json::Value = match serde_json::from_str(&content) {
                Ok(v) => v,
                // non-keystore files in the directory are ignored
                Err(_) => continue,
            };
            if parsed.get("crypto").is_none() && parsed.get("Crypto").is_none() {
                continue;
            }
            let wallet = match parsed.get("address").and_then(|a| a.as_str()) {
                Some(address) => {
                    let address = normalize_address(address);
                    let password = passwords.get(&address).ok_or_else(|| {
                        RelayerError::KeyStoreError(format!(
                            "no password configured for 0x{address}"
                        ))
                    })?;
                    LocalWallet::decrypt_keystore(&path, password.as_bytes()).map_err(|e| {
                        RelayerError::KeyStoreError(format!("decrypt {path:?}: {e}"))
                    })?
                }
                // older keystore files omit the address; probe the
                // configured passwords instead
                None => passwords
                    .values()
                    .find_map(|password| {
                        LocalWallet::decrypt_keystore(&path, password.as_bytes()).ok()
                    })
                    .ok_or_else(|| {
                        RelayerError::KeyStoreError(format!(
                            "no configured password decrypts {path:?}"
                        ))
                    })?,
            };
            let wallet = wallet.with_chain_id(chain_id);
            wallets.insert(wallet.address(), wallet);
        }
        if wallets.is_empty() {
            return Err(RelayerError::KeyStoreError(format!(
                "no usable keystore accounts in {:?}",
                keystore_path.as_ref()
            )));
        }
        Ok(Self { wallets, chain_id })
    }

    #[cfg(test)]
    pub fn from_wallets(wallets: Vec<LocalWallet>, chain_id: u64) -> Self {
        Self {
            wallets: wallets
                .into_iter()
                .map(|w| (w.address(), w.with_chain_id(chain_id)))
                .collect(),
            chain_id,
        }
    }

    pub fn accounts(&self) -> Vec<EthAddress> {
        self.wallets.keys().copied().collect()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// RLP-encodes `tx` signed by `address`.
    pub fn sign_transaction(
        &self,
        tx: &TypedTransaction,
        address: EthAddress,
    ) -> RelayerResult<Bytes> {
        let wallet = self.wallets.get(&address).ok_or_else(|| {
            RelayerError::KeyStoreError(format!("unknown sender account {address:?}"))
        })?;
        let signature = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| RelayerError::KeyStoreError(format!("signing failed: {e}")))?;
        Ok(tx.rlp_signed(&signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::TransactionRequest;

    #[test]
    fn test_load_decrypts_configured_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let (wallet, _uuid) =
            LocalWallet::new_keystore(dir.path(), &mut rand::thread_rng(), "s3cret", None)
                .unwrap();
        let mut pwd_set = BTreeMap::new();
        pwd_set.insert(
            format!("0x{}", hex::encode(wallet.address().as_bytes())),
            "s3cret".to_string(),
        );

        let keystore = EthKeyStore::load(dir.path(), &pwd_set, 79).unwrap();
        assert_eq!(keystore.accounts(), vec![wallet.address()]);
    }

    #[test]
    fn test_load_fails_without_password() {
        let dir = tempfile::tempdir().unwrap();
        LocalWallet::new_keystore(dir.path(), &mut rand::thread_rng(), "s3cret", None).unwrap();
        let err = EthKeyStore::load(dir.path(), &BTreeMap::new(), 79).unwrap_err();
        assert_eq!(err.error_type(), "keystore_error");
    }

    #[test]
    fn test_sign_transaction_round_trip() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let sender = wallet.address();
        let keystore = EthKeyStore::from_wallets(vec![wallet], 79);

        let tx: TypedTransaction = TransactionRequest::new()
            .to(EthAddress::repeat_byte(0x22))
            .nonce(7u64)
            .gas(100_000u64)
            .gas_price(1_000_000_000u64)
            .data(vec![1, 2, 3])
            .chain_id(79u64)
            .into();
        let raw = keystore.sign_transaction(&tx, sender).unwrap();
        let (decoded, sig) = TypedTransaction::decode_signed(&ethers::utils::rlp::Rlp::new(&raw))
            .unwrap();
        assert_eq!(decoded.nonce(), Some(&7u64.into()));
        sig.verify(decoded.sighash(), sender).unwrap();
    }

    #[test]
    fn test_sign_with_unknown_account() {
        let keystore =
            EthKeyStore::from_wallets(vec![LocalWallet::new(&mut rand::thread_rng())], 79);
        let tx: TypedTransaction = TransactionRequest::new().into();
        assert!(keystore
            .sign_transaction(&tx, EthAddress::repeat_byte(0x99))
            .is_err());
    }
}
