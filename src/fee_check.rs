// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! REST client for the relay-fee oracle. The oracle answers whether the user
//! has paid the relay fee for a given source transaction; `NotCheck` means
//! the oracle has not indexed the transaction yet and the caller should ask
//! again.

use crate::error::{RelayerError, RelayerResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayState {
    NotCheck = 0,
    HasPay = 1,
    NotPay = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckFeeReq {
    pub hash: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckFeeRsp {
    pub hash: String,
    pub pay_state: PayState,
}

/// Fee oracle seam; the production implementation talks REST, tests answer
/// from a queue.
#[async_trait]
pub trait FeeCheck: Send + Sync {
    async fn check_fee(&self, requests: &[CheckFeeReq]) -> RelayerResult<Vec<CheckFeeRsp>>;
}

#[derive(Clone, Debug)]
pub struct FeeOracleClient {
    http_client: reqwest::Client,
    url: String,
}

impl FeeOracleClient {
    pub fn new(url: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            http_client,
            url: url.into(),
        }
    }

    async fn check_fee_inner(&self, requests: &[CheckFeeReq]) -> RelayerResult<Vec<CheckFeeRsp>> {
        let responses: Vec<CheckFeeRsp> = self
            .http_client
            .post(&self.url)
            .json(requests)
            .send()
            .await
            .map_err(|e| RelayerError::FeeOracleError(e.to_string()))?
            .json()
            .await
            .map_err(|e| RelayerError::FeeOracleError(e.to_string()))?;
        if responses.len() != requests.len() {
            return Err(RelayerError::FeeOracleError(format!(
                "expected {} responses, got {}",
                requests.len(),
                responses.len()
            )));
        }
        Ok(responses)
    }
}

#[async_trait]
impl FeeCheck for FeeOracleClient {
    async fn check_fee(&self, requests: &[CheckFeeReq]) -> RelayerResult<Vec<CheckFeeRsp>> {
        self.check_fee_inner(requests).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pay_state_serialization() {
        let rsp = CheckFeeRsp {
            hash: "0xabc".to_string(),
            pay_state: PayState::HasPay,
        };
        let value = serde_json::to_value(&rsp).unwrap();
        assert_eq!(value["pay-state"], "HasPay");
        let parsed: CheckFeeRsp = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.pay_state, PayState::HasPay);
    }
}
