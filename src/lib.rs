// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod abi;
pub mod config;
pub mod error;
pub mod eth_client;
pub mod fee_check;
pub mod hub_client;
pub mod keystore;
pub mod metrics;
pub mod node;
pub mod nonce;
pub mod relay;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod test_utils;

/// Retries an async operation with exponential backoff until it succeeds or
/// `max_elapsed_time` passes. Every error is treated as transient.
#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // Delay sequence (secs, jittered): 0.4, 0.8, 1.6, 3.2, 6.4, ... capped at 120.
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => Ok(result),
                    Err(e) => {
                        tracing::debug!("retrying due to error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
