// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct RelayerMetrics {
    /// Side chain head as last observed by the follower.
    pub side_chain_height: IntGauge,
    /// Hub head as last observed by the follower.
    pub hub_chain_height: IntGauge,
    pub retry_bucket_size: IntGauge,
    pub check_bucket_size: IntGauge,
    /// Lock events persisted for relay.
    pub transfers_observed: IntCounter,
    /// Side chain headers committed to the hub.
    pub headers_committed: IntCounter,
    /// Transfer proofs submitted to the hub.
    pub proofs_submitted: IntCounter,
    /// Hub transfers handed to the sender pool.
    pub transfers_dispatched: IntCounter,
    pub bookkeeper_rotations: IntCounter,
    pub errors: IntCounterVec,
}

impl RelayerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            side_chain_height: register_int_gauge_with_registry!(
                "relayer_side_chain_height",
                "Latest observed side chain height",
                registry
            )
            .unwrap(),
            hub_chain_height: register_int_gauge_with_registry!(
                "relayer_hub_chain_height",
                "Latest observed hub height",
                registry
            )
            .unwrap(),
            retry_bucket_size: register_int_gauge_with_registry!(
                "relayer_retry_bucket_size",
                "Transfers awaiting (re)submission",
                registry
            )
            .unwrap(),
            check_bucket_size: register_int_gauge_with_registry!(
                "relayer_check_bucket_size",
                "Transfers awaiting hub receipt confirmation",
                registry
            )
            .unwrap(),
            transfers_observed: register_int_counter_with_registry!(
                "relayer_transfers_observed_total",
                "Lock events persisted for relay",
                registry
            )
            .unwrap(),
            headers_committed: register_int_counter_with_registry!(
                "relayer_headers_committed_total",
                "Side chain headers committed to the hub",
                registry
            )
            .unwrap(),
            proofs_submitted: register_int_counter_with_registry!(
                "relayer_proofs_submitted_total",
                "Transfer proofs submitted to the hub",
                registry
            )
            .unwrap(),
            transfers_dispatched: register_int_counter_with_registry!(
                "relayer_transfers_dispatched_total",
                "Hub transfers handed to the sender pool",
                registry
            )
            .unwrap(),
            bookkeeper_rotations: register_int_counter_with_registry!(
                "relayer_bookkeeper_rotations_total",
                "Book-keeper rotations relayed to the side chain",
                registry
            )
            .unwrap(),
            errors: register_int_counter_vec_with_registry!(
                "relayer_errors_total",
                "Errors by type",
                &["error_type"],
                registry
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }

    pub fn record_error(&self, error: &crate::error::RelayerError) {
        self.errors.with_label_values(&[error.error_type()]).inc();
    }
}

/// Serves the registry in the Prometheus text format at `/metrics`.
pub fn start_prometheus_server(addr: SocketAddr, registry: Registry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let registry = registry.clone();
                async move {
                    TextEncoder::new()
                        .encode_to_string(&registry.gather())
                        .unwrap_or_else(|e| format!("metrics encoding failed: {e}"))
                }
            }),
        );
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "metrics server stopped");
                }
            }
            Err(e) => tracing::error!(error = %e, %addr, "cannot bind metrics server"),
        }
    })
}
