// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Core of a client library that consumes records from a partitioned,
//! append-only stream, dispatches each record to a user-supplied
//! [`Processor`], and persists per-shard progress in an external key/value
//! store so that processing can be resumed and coordinated across worker
//! nodes.
//! <br>
//!
//! ## Delivery contract
//!
//! Records are delivered at least once, in ascending sequence-number order
//! within a shard. There is no ordering and no de-duplication across shards.
//! A shard's checkpoint advances monotonically, and the next fetch for a
//! shard is issued only after the previous batch's checkpoint has been
//! persisted.
//!
//! ## Graceful shutdown
//!
//! Shutdown is initiated via a
//! [CancellationToken](tokio_util::sync::CancellationToken) hierarchy rooted
//! in the [`Coordinator`]:
//! 1. Each shard worker receives a child token. On cancellation it finishes
//!    its in-flight batch, persists that batch's checkpoint, stops its
//!    heartbeat emitter, and reports termination to the controller.
//! 2. Losing shard ownership (a rejected conditional state-store update)
//!    bypasses the graceful path: the worker disposes immediately without
//!    further state-store writes.
//! 3. The controller stops accepting commands, waits for every worker, and
//!    exits. After disposal the state table is consistent, and the next
//!    startup resumes from the last persisted checkpoint.

mod config;
mod controller;
mod errors;
mod gateway;
mod memory_store;
mod metrics;
mod registry;
#[cfg(test)]
mod tests;
mod types;
mod worker;

use async_trait::async_trait;
pub use config::ConsumerConfig;
pub use controller::Coordinator;
pub use errors::{ConsumerError, ConsumerResult};
pub use gateway::{StateStore, StreamGateway};
pub use memory_store::MemoryStateStore;
pub use metrics::ConsumerMetrics;
pub use registry::{AppRegistration, register_app};
pub use types::{
    AppName, ErrorHandlingMode, IteratorPosition, ProcessResult, Record, RecordBatch,
    SequenceNumber, ShardId, ShardRow, ShardStatus, StreamName, TableName, WorkerId,
};

/// Error type returned by [`Processor::process`].
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The user-supplied record handling capability set.
///
/// `process` is invoked once per record per attempt, in ascending
/// sequence-number order within a shard. A processing error is never fatal to
/// the worker: the processor decides per record, through
/// [`error_handling_mode`](Processor::error_handling_mode), whether the
/// worker retries and skips it or retries and stops the shard at it.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle one record.
    async fn process(&self, record: &Record) -> Result<(), ProcessorError>;

    /// Decide how the worker reacts to `error` raised while processing
    /// `record`.
    fn error_handling_mode(&self, record: &Record, error: &ProcessorError) -> ErrorHandlingMode;

    /// Called after the final failed attempt for `record`, before it is
    /// skipped or the shard is stopped. Must not panic; the worker makes no
    /// attempt to contain a panicking callback.
    fn on_max_retry_exceeded(&self, _record: &Record, _mode: &ErrorHandlingMode) {}
}
