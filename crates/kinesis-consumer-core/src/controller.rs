// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The application controller.
//!
//! One task owns the set of known shards and the map of running workers. All
//! mutation happens inside that task, which serially drains a command queue,
//! consumes worker stop notices, and periodically reconciles the shard
//! topology against the stream service — so no locking is required.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Processor,
    config::ConsumerConfig,
    errors::{ConsumerError, ConsumerResult},
    gateway::{StateStore, StreamGateway},
    metrics::ConsumerMetrics,
    types::{ShardId, StreamName, TableName, WorkerId},
    worker::{ShardWorker, SharedProcessor, WorkerContext, WorkerStopped},
};

const COMMAND_QUEUE_DEPTH: usize = 64;
/// Sized generously so workers never block reporting their termination.
const STATUS_QUEUE_DEPTH: usize = 1024;

enum ControllerCommand {
    StartWorker {
        shard: ShardId,
        ack: Option<oneshot::Sender<()>>,
    },
    StopWorker {
        shard: ShardId,
        ack: Option<oneshot::Sender<()>>,
    },
    AddKnownShard {
        shard: ShardId,
        ack: Option<oneshot::Sender<()>>,
    },
    RemoveKnownShard {
        shard: ShardId,
        ack: Option<oneshot::Sender<()>>,
    },
}

struct WorkerHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct Controller<S, T> {
    ctx: Arc<WorkerContext<S, T>>,
    known_shards: HashSet<ShardId>,
    workers: HashMap<ShardId, WorkerHandle>,
    status_tx: mpsc::Sender<WorkerStopped>,
    token: CancellationToken,
}

impl<S: StreamGateway, T: StateStore> Controller<S, T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ControllerCommand>,
        mut status: mpsc::Receiver<WorkerStopped>,
    ) {
        let mut reconcile =
            tokio::time::interval(self.ctx.config.check_stream_changes_frequency);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                // First tick fires immediately: shards are discovered at
                // startup.
                _ = reconcile.tick() => self.reconcile().await,
                command = commands.recv() => match command {
                    Some(command) => self.apply(command).await,
                    None => break,
                },
                // `self.status_tx` keeps a sender alive, so recv never
                // yields None here.
                Some(stopped) = status.recv() => self.note_worker_stopped(stopped),
            }
        }
        self.shutdown().await;
    }

    /// Apply one queued message, then acknowledge it.
    async fn apply(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::StartWorker { shard, ack } => {
                self.start_worker(shard);
                acknowledge(ack);
            }
            ControllerCommand::StopWorker { shard, ack } => {
                self.stop_worker(&shard).await;
                acknowledge(ack);
            }
            ControllerCommand::AddKnownShard { shard, ack } => {
                self.known_shards.insert(shard);
                acknowledge(ack);
            }
            ControllerCommand::RemoveKnownShard { shard, ack } => {
                self.known_shards.remove(&shard);
                acknowledge(ack);
            }
        }
    }

    /// Compare the stream's current shard set with the known set, and start
    /// or stop workers for the difference.
    async fn reconcile(&mut self) {
        let shards = match self.ctx.stream.list_shards(&self.ctx.stream_name).await {
            Ok(shards) => shards,
            Err(err) => {
                warn!(stream = %self.ctx.stream_name, %err, "shard discovery failed");
                return;
            }
        };
        let current: HashSet<ShardId> = shards.into_iter().collect();
        let added: Vec<ShardId> = current.difference(&self.known_shards).cloned().collect();
        let removed: Vec<ShardId> = self.known_shards.difference(&current).cloned().collect();
        if !added.is_empty() || !removed.is_empty() {
            info!(
                stream = %self.ctx.stream_name,
                added = added.len(),
                removed = removed.len(),
                "stream shard topology changed"
            );
        }
        for shard in added {
            self.apply(ControllerCommand::AddKnownShard {
                shard: shard.clone(),
                ack: None,
            })
            .await;
            self.apply(ControllerCommand::StartWorker { shard, ack: None })
                .await;
        }
        for shard in removed {
            self.apply(ControllerCommand::RemoveKnownShard {
                shard: shard.clone(),
                ack: None,
            })
            .await;
            self.apply(ControllerCommand::StopWorker { shard, ack: None })
                .await;
        }
    }

    /// Idempotent: a request for a shard that already has a live worker is a
    /// no-op.
    fn start_worker(&mut self, shard: ShardId) {
        if self.workers.contains_key(&shard) {
            debug!(shard = %shard, "worker already running");
            return;
        }
        let stop = self.token.child_token();
        let worker = ShardWorker::new(
            self.ctx.clone(),
            shard.clone(),
            stop.clone(),
            self.status_tx.clone(),
        );
        let task = tokio::spawn(worker.run());
        self.workers.insert(shard, WorkerHandle { stop, task });
        self.ctx.metrics.active_workers.inc();
    }

    /// Idempotent: a request for an unknown shard is a no-op. Stopping waits
    /// for the worker's in-flight batch and checkpoint to complete.
    async fn stop_worker(&mut self, shard: &ShardId) {
        let Some(handle) = self.workers.remove(shard) else {
            debug!(shard = %shard, "no worker running for shard");
            return;
        };
        handle.stop.cancel();
        if let Err(err) = handle.task.await {
            error!(shard = %shard, %err, "shard worker task failed");
        }
        self.ctx.metrics.active_workers.dec();
    }

    fn note_worker_stopped(&mut self, stopped: WorkerStopped) {
        debug!(shard = %stopped.shard, reason = %stopped.reason, "worker reported stop");
        if self.workers.remove(&stopped.shard).is_some() {
            self.ctx.metrics.active_workers.dec();
        }
    }

    async fn shutdown(&mut self) {
        info!("stopping {} shard workers", self.workers.len());
        for (shard, handle) in std::mem::take(&mut self.workers) {
            handle.stop.cancel();
            if let Err(err) = handle.task.await {
                error!(shard = %shard, %err, "shard worker task failed");
            }
            self.ctx.metrics.active_workers.dec();
        }
    }
}

fn acknowledge(ack: Option<oneshot::Sender<()>>) {
    if let Some(ack) = ack {
        // The requester may have gone away; that is fine.
        let _ = ack.send(());
    }
}

/// Handle to a running application controller.
///
/// Owns the controller task and the cancellation root of all of its workers.
/// [`shutdown`](Coordinator::shutdown) is the only clean way to stop it; a
/// `Coordinator` dropped without shutdown cancels background processing and
/// logs a warning.
pub struct Coordinator {
    commands: mpsc::Sender<ControllerCommand>,
    processor: SharedProcessor,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Spawn a controller over the given gateways and begin processing
    /// immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<S: StreamGateway, T: StateStore>(
        stream: Arc<S>,
        store: Arc<T>,
        processor: Arc<dyn Processor>,
        stream_name: StreamName,
        worker_id: WorkerId,
        table: TableName,
        config: ConsumerConfig,
        metrics: ConsumerMetrics,
    ) -> Self {
        let token = CancellationToken::new();
        let processor: SharedProcessor = Arc::new(RwLock::new(processor));
        let ctx = Arc::new(WorkerContext {
            stream,
            store,
            processor: processor.clone(),
            stream_name,
            worker_id,
            table,
            config,
            metrics,
        });
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (status_tx, status_rx) = mpsc::channel(STATUS_QUEUE_DEPTH);
        let controller = Controller {
            ctx,
            known_shards: HashSet::new(),
            workers: HashMap::new(),
            status_tx,
            token: token.clone(),
        };
        let task = tokio::spawn(controller.run(command_rx, status_rx));
        Self {
            commands: command_tx,
            processor,
            token,
            task: Some(task),
        }
    }

    /// Request a worker for `shard`; resolves once the request has been
    /// applied. Idempotent on an already-running shard.
    pub async fn start_processing(&self, shard: ShardId) -> ConsumerResult<()> {
        self.request(|ack| ControllerCommand::StartWorker {
            shard,
            ack: Some(ack),
        })
        .await
    }

    /// Request that the worker for `shard` stop; resolves once the worker
    /// has terminated. Idempotent on an unknown shard.
    pub async fn stop_processing(&self, shard: ShardId) -> ConsumerResult<()> {
        self.request(|ack| ControllerCommand::StopWorker {
            shard,
            ack: Some(ack),
        })
        .await
    }

    /// Replace the record processor. Takes effect on the next record of
    /// every shard.
    pub fn change_processor(&self, processor: Arc<dyn Processor>) {
        *self.processor.write().unwrap() = processor;
    }

    /// Stop all workers gracefully and wait for the controller to finish.
    pub async fn shutdown(mut self) -> ConsumerResult<()> {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|err| ConsumerError::Shutdown {
                component: "application controller".into(),
                msg: err.to_string(),
            })?;
        }
        Ok(())
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<()>) -> ControllerCommand,
    ) -> ConsumerResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(command(ack_tx))
            .await
            .map_err(|_| ConsumerError::Channel("controller command queue closed".into()))?;
        ack_rx
            .await
            .map_err(|_| ConsumerError::Channel("controller dropped the acknowledgement".into()))
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.task.is_some() && !self.token.is_cancelled() {
            warn!("coordinator dropped without shutdown, cancelling background processing");
            self.token.cancel();
        }
    }
}
