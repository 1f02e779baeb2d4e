// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    IntCounterVec, IntGauge, Registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry,
};

#[derive(Clone)]
pub struct ConsumerMetrics {
    pub records_processed: IntCounterVec,
    pub records_skipped: IntCounterVec,
    pub checkpoints_persisted: IntCounterVec,
    pub heartbeats_emitted: IntCounterVec,
    pub active_workers: IntGauge,
}

impl ConsumerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            records_processed: register_int_counter_vec_with_registry!(
                "consumer_records_processed",
                "Number of records successfully handed to the processor.",
                &["shard"],
                registry,
            )
            .unwrap(),
            records_skipped: register_int_counter_vec_with_registry!(
                "consumer_records_skipped",
                "Number of records skipped after exhausting processor retries.",
                &["shard"],
                registry,
            )
            .unwrap(),
            checkpoints_persisted: register_int_counter_vec_with_registry!(
                "consumer_checkpoints_persisted",
                "Number of checkpoint writes acknowledged by the state store.",
                &["shard"],
                registry,
            )
            .unwrap(),
            heartbeats_emitted: register_int_counter_vec_with_registry!(
                "consumer_heartbeats_emitted",
                "Number of heartbeat writes acknowledged by the state store.",
                &["shard"],
                registry,
            )
            .unwrap(),
            active_workers: register_int_gauge_with_registry!(
                "consumer_active_workers",
                "Number of shard workers currently running.",
                registry,
            )
            .unwrap(),
        }
    }
}
