// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-shard worker state machine.
//!
//! A worker is a small pipeline of three tasks:
//!
//! - a **fetch task** that owns the shard iterator. It blocks on a command
//!   channel carrying the next fetch position and answers every command with
//!   exactly one [`WorkerEvent`]. Because the worker issues the next command
//!   only after the previous batch's checkpoint has been persisted, the
//!   checkpoint never lags the most recent processed batch by more than one
//!   batch and a slow processor back-pressures its shard only.
//! - a **heartbeat task** that periodically refreshes the state-store
//!   heartbeat. A rejected conditional update means another worker took the
//!   shard over; the task cancels the worker-local ownership token and the
//!   worker disposes without further state-store writes.
//! - the **worker task** itself, which runs initialization, drains the event
//!   channel, processes records in order under the processor's
//!   retry/skip/stop policy, and persists checkpoints.

use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use backoff::{ExponentialBackoff, backoff::Backoff};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Processor,
    config::ConsumerConfig,
    errors::ConsumerError,
    gateway::{StateStore, StreamGateway},
    metrics::ConsumerMetrics,
    types::{
        ErrorHandlingMode, IteratorPosition, ProcessResult, Record, SequenceNumber, ShardId,
        ShardStatus, StreamName, TableName, WorkerId,
    },
};

/// Spacing between checkpoint persistence attempts.
const CHECKPOINT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Capacity of the worker event channel.
const EVENT_PIPELINE_DEPTH: usize = 4;

/// The current record processor, swappable while workers are running. Read
/// once per record, so a swap takes effect on the next record.
pub(crate) type SharedProcessor = Arc<RwLock<Arc<dyn Processor>>>;

/// Everything a shard worker shares with its controller and sibling workers.
pub(crate) struct WorkerContext<S, T> {
    pub(crate) stream: Arc<S>,
    pub(crate) store: Arc<T>,
    pub(crate) processor: SharedProcessor,
    pub(crate) stream_name: StreamName,
    pub(crate) worker_id: WorkerId,
    pub(crate) table: TableName,
    pub(crate) config: ConsumerConfig,
    pub(crate) metrics: ConsumerMetrics,
}

/// Events flowing from the fetch and heartbeat tasks into the worker task.
enum WorkerEvent {
    BatchReceived {
        records: Vec<Record>,
        next_token: Option<String>,
    },
    EmptyReceive {
        next_token: Option<String>,
    },
    FetchFailed,
    OwnershipLost,
}

/// The next fetch, handed to the fetch task once the previous batch's
/// checkpoint has been persisted.
enum FetchCommand {
    /// Continue with the token returned by the previous fetch.
    Token(String),
    /// Obtain a fresh iterator at the given position.
    Position(IteratorPosition),
}

/// Why a worker terminated, reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    ShardClosed,
    OwnershipLost,
    Requested,
    ChannelClosed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ShardClosed => "shard closed by the stream service",
            Self::OwnershipLost => "shard ownership lost",
            Self::Requested => "stop requested",
            Self::ChannelClosed => "internal channel closed",
        })
    }
}

/// Terminal notice a worker sends to its controller.
pub(crate) struct WorkerStopped {
    pub(crate) shard: ShardId,
    pub(crate) reason: StopReason,
}

struct BatchOutcome {
    processed: usize,
    checkpoint: Option<SequenceNumber>,
    /// Index of the record at which a `RetryAndStop` fired, if any.
    stopped_at: Option<usize>,
    ownership_lost: bool,
}

pub(crate) struct ShardWorker<S, T> {
    ctx: Arc<WorkerContext<S, T>>,
    shard: ShardId,
    /// External stop request; the in-flight batch and its checkpoint are
    /// allowed to complete before the worker observes it.
    stop: CancellationToken,
    /// Cancelled the moment a conditional state-store update is rejected;
    /// terminates the worker without further state-store writes.
    owned: CancellationToken,
    status_tx: mpsc::Sender<WorkerStopped>,
    last_checkpoint: Option<SequenceNumber>,
}

impl<S: StreamGateway, T: StateStore> ShardWorker<S, T> {
    pub(crate) fn new(
        ctx: Arc<WorkerContext<S, T>>,
        shard: ShardId,
        stop: CancellationToken,
        status_tx: mpsc::Sender<WorkerStopped>,
    ) -> Self {
        Self {
            ctx,
            shard,
            stop,
            owned: CancellationToken::new(),
            status_tx,
            last_checkpoint: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(shard = %self.shard, "starting shard worker");
        let reason = self.run_inner().await;
        info!(shard = %self.shard, %reason, "shard worker terminated");
        let _ = self
            .status_tx
            .send(WorkerStopped {
                shard: self.shard.clone(),
                reason,
            })
            .await;
    }

    async fn run_inner(&mut self) -> StopReason {
        let start = match self.initialize().await {
            Ok(position) => position,
            Err(reason) => return reason,
        };
        info!(shard = %self.shard, position = ?start, "shard worker initialized");

        let (fetch_tx, fetch_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_PIPELINE_DEPTH);
        let fetcher = self.spawn_fetcher(fetch_rx, event_tx.clone());
        let heartbeat = self.spawn_heartbeat(event_tx);

        let reason = self.pump(start, fetch_tx, &mut event_rx).await;

        // Dropping `fetch_tx` (inside pump) ends the fetch task; the
        // heartbeat task observes the stop or ownership token.
        event_rx.close();
        let _ = fetcher.await;
        let _ = heartbeat.await;
        reason
    }

    /// Claim the shard row and determine the starting iterator position.
    ///
    /// Retried until it succeeds, the worker is stopped, or ownership cannot
    /// be obtained because a live worker holds the shard (in which case the
    /// row is re-checked after a heartbeat timeout).
    async fn initialize(&mut self) -> Result<IteratorPosition, StopReason> {
        let mut backoff = ExponentialBackoff {
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        loop {
            if self.stop.is_cancelled() {
                return Err(StopReason::Requested);
            }
            match self
                .ctx
                .store
                .create_shard_row(&self.ctx.table, &self.ctx.worker_id, &self.shard)
                .await
            {
                Ok(()) => {}
                // The row is held by a live worker; classification below
                // decides whether to wait or resume.
                Err(ConsumerError::ConditionalCheckFailed) => {}
                Err(err) => {
                    warn!(shard = %self.shard, %err, "failed to create shard state row");
                    let pause_for = backoff.next_backoff().unwrap_or(CHECKPOINT_RETRY_INTERVAL);
                    if let Some(reason) = self.pause(pause_for).await {
                        return Err(reason);
                    }
                    continue;
                }
            }

            match self
                .ctx
                .store
                .read_shard_status(&self.ctx.table, &self.ctx.worker_id, &self.shard)
                .await
            {
                Ok(Some(ShardStatus::New { .. })) => return Ok(IteratorPosition::TrimHorizon),
                Ok(Some(ShardStatus::Processing { worker, checkpoint }))
                    if worker == self.ctx.worker_id =>
                {
                    self.last_checkpoint = checkpoint.clone();
                    return Ok(checkpoint
                        .map(IteratorPosition::AfterSequenceNumber)
                        .unwrap_or(IteratorPosition::TrimHorizon));
                }
                Ok(Some(ShardStatus::Processing { worker, .. })) => {
                    info!(
                        shard = %self.shard,
                        owner = %worker,
                        "shard is owned by another worker, re-checking after heartbeat timeout"
                    );
                    if let Some(reason) = self.pause(self.ctx.config.heartbeat_timeout).await {
                        return Err(reason);
                    }
                }
                Ok(Some(ShardStatus::NotProcessing { worker, .. })) => {
                    // Stale heartbeat; the next create_shard_row attempt
                    // takes the row over, checkpoint included.
                    info!(shard = %self.shard, previous = %worker, "taking over shard with stale heartbeat");
                }
                Ok(None) => {
                    // Row vanished between the create attempt and the read.
                    debug!(shard = %self.shard, "shard state row missing, re-creating");
                }
                Err(err) => {
                    warn!(shard = %self.shard, %err, "failed to read shard status");
                    let pause_for = backoff.next_backoff().unwrap_or(CHECKPOINT_RETRY_INTERVAL);
                    if let Some(reason) = self.pause(pause_for).await {
                        return Err(reason);
                    }
                }
            }
        }
    }

    /// The fetch → process → checkpoint loop.
    async fn pump(
        &mut self,
        start: IteratorPosition,
        fetch_tx: mpsc::Sender<FetchCommand>,
        event_rx: &mut mpsc::Receiver<WorkerEvent>,
    ) -> StopReason {
        if fetch_tx
            .send(FetchCommand::Position(start.clone()))
            .await
            .is_err()
        {
            return StopReason::ChannelClosed;
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = self.owned.cancelled() => return StopReason::OwnershipLost,
                _ = self.stop.cancelled() => return StopReason::Requested,
                event = event_rx.recv() => match event {
                    Some(event) => event,
                    None => return StopReason::ChannelClosed,
                },
            };

            match event {
                WorkerEvent::OwnershipLost => return StopReason::OwnershipLost,
                WorkerEvent::FetchFailed => {
                    if let Some(reason) = self.pause(self.ctx.config.empty_receive_delay).await {
                        return reason;
                    }
                    let resume = self.resume_position(&start);
                    if fetch_tx
                        .send(FetchCommand::Position(resume))
                        .await
                        .is_err()
                    {
                        return StopReason::ChannelClosed;
                    }
                }
                WorkerEvent::EmptyReceive { next_token } => {
                    let Some(token) = next_token else {
                        return StopReason::ShardClosed;
                    };
                    debug!(shard = %self.shard, "empty receive, delaying next fetch");
                    if let Some(reason) = self.pause(self.ctx.config.empty_receive_delay).await {
                        return reason;
                    }
                    if fetch_tx.send(FetchCommand::Token(token)).await.is_err() {
                        return StopReason::ChannelClosed;
                    }
                }
                WorkerEvent::BatchReceived {
                    records,
                    next_token,
                } => {
                    let outcome = self.process_batch(&records).await;
                    if outcome.ownership_lost {
                        return StopReason::OwnershipLost;
                    }
                    if let Some(sequence_number) = &outcome.checkpoint {
                        if let Err(reason) = self.persist_checkpoint(sequence_number).await {
                            return reason;
                        }
                    }
                    debug!(
                        shard = %self.shard,
                        count = outcome.processed,
                        "batch processed"
                    );

                    let command = match outcome.stopped_at {
                        // The failed record will recur; the retry cycle
                        // repeats until an operator intervenes or ownership
                        // is lost.
                        Some(0) => Some(FetchCommand::Position(
                            IteratorPosition::AtSequenceNumber(records[0].sequence_number.clone()),
                        )),
                        Some(stopped_at) => Some(FetchCommand::Position(
                            IteratorPosition::AtSequenceNumber(
                                records[stopped_at - 1].sequence_number.clone(),
                            ),
                        )),
                        None => next_token.map(FetchCommand::Token),
                    };
                    match command {
                        Some(command) => {
                            if fetch_tx.send(command).await.is_err() {
                                return StopReason::ChannelClosed;
                            }
                        }
                        None => return StopReason::ShardClosed,
                    }
                }
            }
        }
    }

    /// Process a batch in order. Skipped records count toward the checkpoint;
    /// a `RetryAndStop` halts the batch at the failing record.
    async fn process_batch(&self, records: &[Record]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            processed: 0,
            checkpoint: None,
            stopped_at: None,
            ownership_lost: false,
        };
        for (index, record) in records.iter().enumerate() {
            if self.owned.is_cancelled() {
                outcome.ownership_lost = true;
                return outcome;
            }
            match self.process_record(record).await {
                ProcessResult::Success(sequence_number) => {
                    outcome.checkpoint = Some(sequence_number);
                    outcome.processed += 1;
                }
                ProcessResult::Failure(sequence_number, detail) => {
                    warn!(
                        shard = %self.shard,
                        sequence = %sequence_number,
                        detail = %detail,
                        "record processing stopped the batch"
                    );
                    outcome.stopped_at = Some(index);
                    return outcome;
                }
            }
        }
        outcome
    }

    /// Run one record through the current processor, applying its error
    /// handling mode on failure.
    async fn process_record(&self, record: &Record) -> ProcessResult {
        let processor = self.ctx.processor.read().unwrap().clone();
        let sequence_number = record.sequence_number.clone();

        let mut error = match processor.process(record).await {
            Ok(()) => {
                self.ctx
                    .metrics
                    .records_processed
                    .with_label_values(&[self.shard.as_str()])
                    .inc();
                return ProcessResult::Success(sequence_number);
            }
            Err(error) => error,
        };
        let mode = processor.error_handling_mode(record, &error);

        for attempt in 1..=mode.max_retries() {
            debug!(
                shard = %self.shard,
                sequence = %sequence_number,
                attempt,
                "retrying record after processor error"
            );
            match processor.process(record).await {
                Ok(()) => {
                    self.ctx
                        .metrics
                        .records_processed
                        .with_label_values(&[self.shard.as_str()])
                        .inc();
                    return ProcessResult::Success(sequence_number);
                }
                Err(retry_error) => error = retry_error,
            }
        }

        warn!(
            shard = %self.shard,
            sequence = %sequence_number,
            retries = mode.max_retries(),
            %error,
            "processor failed after exhausting retries"
        );
        processor.on_max_retry_exceeded(record, &mode);

        match mode {
            ErrorHandlingMode::RetryAndSkip(_) => {
                self.ctx
                    .metrics
                    .records_skipped
                    .with_label_values(&[self.shard.as_str()])
                    .inc();
                ProcessResult::Success(sequence_number)
            }
            ErrorHandlingMode::RetryAndStop(_) => {
                ProcessResult::Failure(sequence_number, error.to_string())
            }
        }
    }

    /// Persist a checkpoint, retrying transient failures with fixed spacing
    /// until it succeeds, ownership is lost, or the worker is stopped.
    async fn persist_checkpoint(
        &mut self,
        sequence_number: &SequenceNumber,
    ) -> Result<(), StopReason> {
        loop {
            if self.owned.is_cancelled() {
                return Err(StopReason::OwnershipLost);
            }
            match self
                .ctx
                .store
                .update_checkpoint(
                    &self.ctx.table,
                    &self.ctx.worker_id,
                    &self.shard,
                    sequence_number,
                )
                .await
            {
                Ok(()) => {
                    self.last_checkpoint = Some(sequence_number.clone());
                    self.ctx
                        .metrics
                        .checkpoints_persisted
                        .with_label_values(&[self.shard.as_str()])
                        .inc();
                    debug!(shard = %self.shard, sequence = %sequence_number, "checkpoint persisted");
                    return Ok(());
                }
                Err(ConsumerError::ConditionalCheckFailed) => {
                    warn!(shard = %self.shard, "checkpoint rejected, shard ownership lost");
                    self.owned.cancel();
                    return Err(StopReason::OwnershipLost);
                }
                Err(err) => {
                    warn!(shard = %self.shard, %err, "checkpoint update failed, retrying");
                    if let Some(reason) = self.pause(CHECKPOINT_RETRY_INTERVAL).await {
                        return Err(reason);
                    }
                }
            }
        }
    }

    fn spawn_fetcher(
        &self,
        mut commands: mpsc::Receiver<FetchCommand>,
        events: mpsc::Sender<WorkerEvent>,
    ) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let shard = self.shard.clone();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let token = match command {
                    FetchCommand::Token(token) => token,
                    FetchCommand::Position(position) => {
                        match ctx
                            .stream
                            .get_iterator(&ctx.stream_name, &shard, &position)
                            .await
                        {
                            Ok(token) => token,
                            Err(err) => {
                                warn!(shard = %shard, %err, "failed to obtain shard iterator");
                                if events.send(WorkerEvent::FetchFailed).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        }
                    }
                };
                let event = match ctx
                    .stream
                    .get_records(&token, ctx.config.max_batch_records)
                    .await
                {
                    Ok(batch) if batch.records.is_empty() => WorkerEvent::EmptyReceive {
                        next_token: batch.next_token,
                    },
                    Ok(batch) => WorkerEvent::BatchReceived {
                        records: batch.records,
                        next_token: batch.next_token,
                    },
                    Err(err) => {
                        warn!(shard = %shard, %err, "failed to fetch records");
                        WorkerEvent::FetchFailed
                    }
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_heartbeat(&self, events: mpsc::Sender<WorkerEvent>) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let shard = self.shard.clone();
        let stop = self.stop.clone();
        let owned = self.owned.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(ctx.config.heartbeat);
            loop {
                tokio::select! {
                    biased;
                    _ = owned.cancelled() => break,
                    _ = stop.cancelled() => break,
                    // The worker closed its event channel and is tearing down.
                    _ = events.closed() => break,
                    _ = ticks.tick() => {
                        match ctx
                            .store
                            .update_heartbeat(&ctx.table, &ctx.worker_id, &shard)
                            .await
                        {
                            Ok(()) => {
                                ctx.metrics
                                    .heartbeats_emitted
                                    .with_label_values(&[shard.as_str()])
                                    .inc();
                            }
                            Err(ConsumerError::ConditionalCheckFailed) => {
                                warn!(shard = %shard, "heartbeat rejected, shard ownership lost");
                                owned.cancel();
                                let _ = events.send(WorkerEvent::OwnershipLost).await;
                                break;
                            }
                            // The next tick or the next checkpoint write
                            // refreshes the timestamp.
                            Err(err) => {
                                warn!(shard = %shard, %err, "heartbeat update failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Where to restart fetching after a failed fetch: just past the last
    /// persisted checkpoint, or the initial position if nothing has been
    /// checkpointed yet.
    fn resume_position(&self, start: &IteratorPosition) -> IteratorPosition {
        self.last_checkpoint
            .clone()
            .map(IteratorPosition::AfterSequenceNumber)
            .unwrap_or_else(|| start.clone())
    }

    /// Sleep for `duration` unless the worker is stopped or loses ownership
    /// first.
    async fn pause(&self, duration: Duration) -> Option<StopReason> {
        tokio::select! {
            biased;
            _ = self.owned.cancelled() => Some(StopReason::OwnershipLost),
            _ = self.stop.cancelled() => Some(StopReason::Requested),
            _ = sleep(duration) => None,
        }
    }
}
