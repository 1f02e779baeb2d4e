// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    errors::{ConsumerError, ConsumerResult},
    gateway::StateStore,
    types::{AppName, SequenceNumber, ShardId, ShardRow, ShardStatus, TableName, WorkerId},
};

/// An in-process [`StateStore`] with the same conditional-update semantics as
/// the external store: rows are claimed by workers, takeover requires a stale
/// heartbeat, and all updates are keyed on the current owner.
///
/// Useful for tests and for embedded runs that do not need cross-process
/// coordination.
pub struct MemoryStateStore {
    heartbeat_timeout: Duration,
    rows: Mutex<HashMap<(TableName, ShardId), ShardRow>>,
}

impl MemoryStateStore {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout,
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the row for `shard`, if any.
    pub fn row(&self, table: &TableName, shard: &ShardId) -> Option<ShardRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.clone(), shard.clone()))
            .cloned()
    }

    /// Insert or replace a row verbatim, bypassing the conditional checks.
    pub fn put_row(&self, table: &TableName, shard: &ShardId, row: ShardRow) {
        self.rows
            .lock()
            .unwrap()
            .insert((table.clone(), shard.clone()), row);
    }

    fn is_stale(&self, row: &ShardRow) -> bool {
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        Utc::now().signed_duration_since(row.last_heartbeat) > timeout
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn ensure_table(
        &self,
        app: &AppName,
        _read_capacity: i64,
        _write_capacity: i64,
        suffix: &str,
    ) -> ConsumerResult<TableName> {
        Ok(TableName::from(format!("{app}{suffix}")))
    }

    async fn create_shard_row(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&(table.clone(), shard.clone())) {
            None => {
                rows.insert(
                    (table.clone(), shard.clone()),
                    ShardRow {
                        worker: worker.clone(),
                        last_heartbeat: Utc::now(),
                        checkpoint: None,
                    },
                );
                Ok(())
            }
            Some(row) if self.is_stale(row) => {
                // Takeover keeps the previous owner's checkpoint.
                row.worker = worker.clone();
                row.last_heartbeat = Utc::now();
                Ok(())
            }
            Some(_) => Err(ConsumerError::ConditionalCheckFailed),
        }
    }

    async fn read_shard_status(
        &self,
        table: &TableName,
        caller: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<Option<ShardStatus>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&(table.clone(), shard.clone()))
            .map(|row| row.classify(caller, Utc::now(), self.heartbeat_timeout)))
    }

    async fn update_heartbeat(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&(table.clone(), shard.clone())) {
            Some(row) if row.worker == *worker => {
                row.last_heartbeat = Utc::now();
                Ok(())
            }
            _ => Err(ConsumerError::ConditionalCheckFailed),
        }
    }

    async fn update_checkpoint(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> ConsumerResult<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&(table.clone(), shard.clone())) {
            Some(row) if row.worker == *worker => {
                row.checkpoint = Some(sequence_number.clone());
                row.last_heartbeat = Utc::now();
                Ok(())
            }
            _ => Err(ConsumerError::ConditionalCheckFailed),
        }
    }
}
