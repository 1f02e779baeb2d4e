// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::{
    errors::ConsumerResult,
    types::{
        AppName, IteratorPosition, RecordBatch, SequenceNumber, ShardId, ShardStatus, StreamName,
        TableName, WorkerId,
    },
};

/// Semantic wrapper over the upstream stream service.
///
/// Implementations are shared across shard workers and must be safe for
/// concurrent use. Transient service errors are retried internally up to the
/// configured stream retry budget; callers never retry.
#[async_trait]
pub trait StreamGateway: Send + Sync + 'static {
    /// List the identifiers of all shards of `stream`.
    async fn list_shards(&self, stream: &StreamName) -> ConsumerResult<Vec<ShardId>>;

    /// Obtain an opaque iterator token for `shard` positioned at `position`.
    async fn get_iterator(
        &self,
        stream: &StreamName,
        shard: &ShardId,
        position: &IteratorPosition,
    ) -> ConsumerResult<String>;

    /// Fetch the next batch of records. The batch's `next_token` is the only
    /// legal continuation of `iterator`; a `None` token means the shard is
    /// closed.
    async fn get_records(&self, iterator: &str, limit: u32) -> ConsumerResult<RecordBatch>;
}

/// Semantic wrapper over the external key/value store holding per-shard
/// progress rows.
///
/// All mutating operations are conditional on worker ownership; a rejected
/// condition surfaces as [`ConsumerError::ConditionalCheckFailed`] and must
/// cause the calling worker to stop. Other transient errors are retried
/// internally up to the configured state-store retry budget.
///
/// [`ConsumerError::ConditionalCheckFailed`]: crate::ConsumerError::ConditionalCheckFailed
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Create the application's state table if it does not exist and wait
    /// until it is ready for use. Idempotent.
    async fn ensure_table(
        &self,
        app: &AppName,
        read_capacity: i64,
        write_capacity: i64,
        suffix: &str,
    ) -> ConsumerResult<TableName>;

    /// Claim the row for `shard`, creating it if missing. Conditional on the
    /// row not existing or its heartbeat being stale; on success `worker` is
    /// the owner. An existing checkpoint survives a takeover.
    async fn create_shard_row(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()>;

    /// Read and classify the row for `shard` from the point of view of
    /// `caller`. Returns `None` when no row exists yet.
    async fn read_shard_status(
        &self,
        table: &TableName,
        caller: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<Option<ShardStatus>>;

    /// Refresh the heartbeat timestamp. Conditional on `worker` owning the
    /// row.
    async fn update_heartbeat(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()>;

    /// Persist a checkpoint and refresh the heartbeat. Conditional on
    /// `worker` owning the row.
    async fn update_checkpoint(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> ConsumerResult<()>;
}
