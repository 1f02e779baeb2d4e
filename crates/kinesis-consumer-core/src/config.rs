// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Options for configuring a consumer application.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Provisioned read capacity of the state table, applied when the table
    /// is first created.
    ///
    /// Default: 10.
    pub state_store_read_capacity: i64,
    /// Provisioned write capacity of the state table, applied when the table
    /// is first created.
    ///
    /// Default: 10.
    pub state_store_write_capacity: i64,
    /// Suffix appended to the application name to form the state table name.
    ///
    /// Default: `KinesisState`.
    pub table_suffix: String,
    /// How often each shard worker refreshes its heartbeat timestamp in the
    /// state store.
    ///
    /// Default: 30 seconds.
    pub heartbeat: Duration,
    /// A state row whose heartbeat is older than this is considered
    /// abandoned and eligible for takeover.
    ///
    /// Default: 3 minutes.
    pub heartbeat_timeout: Duration,
    /// Back-off before the next fetch when a fetch returned no records.
    ///
    /// Default: 3 seconds.
    pub empty_receive_delay: Duration,
    /// Internal retry budget for transient state-store errors.
    ///
    /// Default: 3.
    pub max_state_store_retries: u32,
    /// Internal retry budget for transient stream-service errors.
    ///
    /// Default: 3.
    pub max_stream_retries: u32,
    /// How often the controller reconciles the shard topology with the set
    /// of running workers.
    ///
    /// Default: 1 minute.
    pub check_stream_changes_frequency: Duration,
    /// Maximum number of records requested per fetch.
    ///
    /// Default: 1000.
    pub max_batch_records: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            state_store_read_capacity: 10,
            state_store_write_capacity: 10,
            table_suffix: "KinesisState".to_owned(),
            heartbeat: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(3 * 60),
            empty_receive_delay: Duration::from_secs(3),
            max_state_store_retries: 3,
            max_stream_retries: 3,
            check_stream_changes_frequency: Duration::from_secs(60),
            max_batch_records: 1000,
        }
    }
}
