// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{fmt, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};

macro_rules! tagged_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

tagged_string!(
    /// Name of a stream as known to the upstream stream service.
    StreamName
);
tagged_string!(
    /// Identifier of one partition (shard) of a stream.
    ShardId
);
tagged_string!(
    /// Identifier of a worker node; the ownership key for state-store rows.
    WorkerId
);
tagged_string!(
    /// Name of the application's state table.
    TableName
);
tagged_string!(
    /// Opaque, per-shard, strictly-increasing record identifier assigned by
    /// the stream service. The library never interprets its contents.
    SequenceNumber
);
tagged_string!(
    /// Name of a consumer application; at most one application per name may
    /// run in a process.
    AppName
);

/// Where to position a freshly obtained shard iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// The oldest record still retained by the stream service.
    TrimHorizon,
    /// The record with the given sequence number.
    AtSequenceNumber(SequenceNumber),
    /// The record immediately after the given sequence number.
    AfterSequenceNumber(SequenceNumber),
    /// An opaque continuation token previously returned by the stream
    /// gateway.
    ContinuationToken(String),
}

/// A single stream record. Immutable; ordered within a shard by ascending
/// sequence number.
#[derive(Debug, Clone)]
pub struct Record {
    pub partition_key: String,
    pub sequence_number: SequenceNumber,
    pub data: Bytes,
}

/// One `get_records` result. `next_token == None` means the shard is closed
/// (end of life after a split or merge) and no further records will appear.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub next_token: Option<String>,
}

/// The state-store row image for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRow {
    pub worker: WorkerId,
    pub last_heartbeat: DateTime<Utc>,
    pub checkpoint: Option<SequenceNumber>,
}

impl ShardRow {
    /// Classify this row from the point of view of `caller` at time `now`.
    ///
    /// A row without a checkpoint that is owned by the caller is `New`;
    /// otherwise a row whose heartbeat is within `heartbeat_timeout` is
    /// `Processing` and anything else is `NotProcessing` (eligible for
    /// takeover).
    pub fn classify(
        &self,
        caller: &WorkerId,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
    ) -> ShardStatus {
        if self.checkpoint.is_none() && self.worker == *caller {
            return ShardStatus::New {
                worker: self.worker.clone(),
                created_at: self.last_heartbeat,
            };
        }
        let timeout = chrono::Duration::from_std(heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        if now.signed_duration_since(self.last_heartbeat) <= timeout {
            ShardStatus::Processing {
                worker: self.worker.clone(),
                checkpoint: self.checkpoint.clone(),
            }
        } else {
            ShardStatus::NotProcessing {
                worker: self.worker.clone(),
                heartbeat_at: self.last_heartbeat,
                checkpoint: self.checkpoint.clone(),
            }
        }
    }
}

/// Processing state of a shard as derived from its state-store row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    /// The row exists, is owned by the caller, and has never been
    /// checkpointed.
    New {
        worker: WorkerId,
        created_at: DateTime<Utc>,
    },
    /// The row is claimed and its owner heartbeated within the timeout.
    Processing {
        worker: WorkerId,
        checkpoint: Option<SequenceNumber>,
    },
    /// The row is claimed but its heartbeat is stale.
    NotProcessing {
        worker: WorkerId,
        heartbeat_at: DateTime<Utc>,
        checkpoint: Option<SequenceNumber>,
    },
}

/// Outcome of running one record through the processor, retries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    /// The record was processed (or skipped after exhausting retries) and
    /// counts toward the checkpoint.
    Success(SequenceNumber),
    /// The record exhausted its retries under `RetryAndStop`; batch
    /// processing halts at this record.
    Failure(SequenceNumber, String),
}

/// How a worker reacts to a processor error, as decided by the processor
/// itself per record and error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandlingMode {
    /// Retry up to the given number of additional attempts, then skip the
    /// record and continue with the rest of the batch.
    RetryAndSkip(u32),
    /// Retry up to the given number of additional attempts, then stop
    /// processing this shard at the failing record.
    RetryAndStop(u32),
}

impl ErrorHandlingMode {
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::RetryAndSkip(retries) | Self::RetryAndStop(retries) => *retries,
        }
    }
}
