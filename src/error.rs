// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayerError {
    // Side chain provider error (transient or otherwise)
    ProviderError(String),
    // Hub JSON-RPC transport or server error; carries the raw message so
    // callers can match on hub-side failure phrases
    HubRpcError(String),
    // Submitting a header batch failed because the hub is missing our parent
    // or rejects the encoding; the follower must roll back
    HubHeaderMismatch(String),
    // The destination reports the transfer as already executed
    AlreadyDone,
    // The hub cannot fund the submission yet
    UtxoNotEnough,
    // Failure to encode or decode a wire structure
    SerializationError(String),
    // Local durable store failure
    StorageError(String),
    // Keystore decryption / signing failure
    KeyStoreError(String),
    // Fee oracle transport failure
    FeeOracleError(String),
    // The side chain rejected a broadcast as underpriced
    UnderpricedTransaction,
    // Gas price escalation reached its cap without a confirmation
    GasPriceExhausted { nonce: u64 },
    // No receipt arrived within the confirmation window
    ConfirmationTimeout(String),
    // Invalid or unexpected configuration value
    ConfigError(String),
    // Uncategorized error
    Generic(String),
}

impl RelayerError {
    /// Short identifier used as a metrics label.
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayerError::ProviderError(_) => "provider_error",
            RelayerError::HubRpcError(_) => "hub_rpc_error",
            RelayerError::HubHeaderMismatch(_) => "hub_header_mismatch",
            RelayerError::AlreadyDone => "already_done",
            RelayerError::UtxoNotEnough => "utxo_not_enough",
            RelayerError::SerializationError(_) => "serialization_error",
            RelayerError::StorageError(_) => "storage_error",
            RelayerError::KeyStoreError(_) => "keystore_error",
            RelayerError::FeeOracleError(_) => "fee_oracle_error",
            RelayerError::UnderpricedTransaction => "underpriced_transaction",
            RelayerError::GasPriceExhausted { .. } => "gas_price_exhausted",
            RelayerError::ConfirmationTimeout(_) => "confirmation_timeout",
            RelayerError::ConfigError(_) => "config_error",
            RelayerError::Generic(_) => "generic",
        }
    }

    /// Whether this error means the relayer state machine can no longer make
    /// progress and the process should be restarted by its supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayerError::GasPriceExhausted { .. } | RelayerError::ConfirmationTimeout(_)
        )
    }
}

impl std::fmt::Display for RelayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayerError::ProviderError(msg) => write!(f, "provider error: {msg}"),
            RelayerError::HubRpcError(msg) => write!(f, "hub rpc error: {msg}"),
            RelayerError::HubHeaderMismatch(msg) => write!(f, "hub header mismatch: {msg}"),
            RelayerError::AlreadyDone => write!(f, "transfer already done"),
            RelayerError::UtxoNotEnough => write!(f, "hub cannot fund the submission yet"),
            RelayerError::SerializationError(msg) => write!(f, "serialization error: {msg}"),
            RelayerError::StorageError(msg) => write!(f, "storage error: {msg}"),
            RelayerError::KeyStoreError(msg) => write!(f, "keystore error: {msg}"),
            RelayerError::FeeOracleError(msg) => write!(f, "fee oracle error: {msg}"),
            RelayerError::UnderpricedTransaction => write!(f, "transaction underpriced"),
            RelayerError::GasPriceExhausted { nonce } => {
                write!(f, "gas price exhausted for nonce {nonce}")
            }
            RelayerError::ConfirmationTimeout(msg) => write!(f, "confirmation timeout: {msg}"),
            RelayerError::ConfigError(msg) => write!(f, "config error: {msg}"),
            RelayerError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RelayerError {}

impl From<sled::Error> for RelayerError {
    fn from(e: sled::Error) -> Self {
        RelayerError::StorageError(format!("{e:?}"))
    }
}

impl From<ethers::providers::ProviderError> for RelayerError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        RelayerError::ProviderError(e.to_string())
    }
}

impl From<reqwest::Error> for RelayerError {
    fn from(e: reqwest::Error) -> Self {
        RelayerError::HubRpcError(e.to_string())
    }
}

pub type RelayerResult<T> = Result<T, RelayerError>;
