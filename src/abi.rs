// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed bindings for the two side chain cross-chain contracts: the manager
//! (ECCM) that emits lock events and executes verified transfers, and the
//! data contract (ECCD) that records epochs and processed transfers.

use ethers::prelude::abigen;

abigen!(
    EthCrossChainManager,
    r#"[
        event CrossChainEvent(address indexed sender, bytes txId, address proxyOrAssetContract, uint64 toChainId, bytes toContract, bytes rawdata)
        function verifyHeaderAndExecuteTx(bytes proof, bytes rawHeader, bytes headerProof, bytes curRawHeader, bytes headerSig) returns (bool)
        function changeBookKeeper(bytes rawHeader, bytes pubKeyList, bytes sigList) returns (bool)
    ]"#
);

abigen!(
    EthCrossChainData,
    r#"[
        function getCurEpochStartHeight() view returns (uint64)
        function getCurEpochConPubKeyBytes() view returns (bytes)
        function checkIfFromChainTxExist(uint64 fromChainID, bytes32 fromChainTx) view returns (bool)
    ]"#
);
