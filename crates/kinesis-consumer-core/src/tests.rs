// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use prometheus::Registry;

use crate::{
    AppName, ConsumerConfig, ConsumerError, ConsumerMetrics, ConsumerResult, Coordinator,
    ErrorHandlingMode, IteratorPosition, MemoryStateStore, Processor, ProcessorError, Record,
    RecordBatch, SequenceNumber, ShardId, ShardRow, ShardStatus, StateStore, StreamGateway,
    StreamName, TableName, WorkerId, register_app,
};

const APP_SUFFIX: &str = "KinesisState";

fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        heartbeat: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(500),
        empty_receive_delay: Duration::from_millis(40),
        check_stream_changes_frequency: Duration::from_millis(40),
        ..ConsumerConfig::default()
    }
}

fn record(sequence_number: u64) -> Record {
    Record {
        partition_key: "pk".to_owned(),
        sequence_number: SequenceNumber::from(sequence_number.to_string()),
        data: Bytes::from_static(b"payload"),
    }
}

fn seq(sequence_number: u64) -> SequenceNumber {
    SequenceNumber::from(sequence_number.to_string())
}

fn numeric(sequence_number: &SequenceNumber) -> u64 {
    sequence_number.as_str().parse().expect("numeric sequence")
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    GetIterator(ShardId, IteratorPosition),
    GetRecords(ShardId),
    CreateRow(ShardId),
    Checkpoint(ShardId, SequenceNumber),
}

type Journal = Arc<Mutex<Vec<(Call, Instant)>>>;

fn calls(journal: &Journal) -> Vec<Call> {
    journal
        .lock()
        .unwrap()
        .iter()
        .map(|(call, _)| call.clone())
        .collect()
}

struct FakeShard {
    records: Vec<Record>,
    closed: bool,
}

/// A scripted stream gateway. Iterator tokens encode `<shard>/<index>` into
/// the shard's record list; `list_shards` pops scripted topologies, with the
/// last one repeating forever.
struct FakeStream {
    shards: Mutex<HashMap<ShardId, FakeShard>>,
    topologies: Mutex<VecDeque<Vec<ShardId>>>,
    batch_limit: usize,
    journal: Journal,
}

impl FakeStream {
    fn new(batch_limit: usize, journal: Journal) -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
            topologies: Mutex::new(VecDeque::new()),
            batch_limit,
            journal,
        }
    }

    fn with_shard(self, shard: &ShardId, records: Vec<Record>, closed: bool) -> Self {
        self.shards
            .lock()
            .unwrap()
            .insert(shard.clone(), FakeShard { records, closed });
        self.topologies
            .lock()
            .unwrap()
            .push_back(self.shards.lock().unwrap().keys().cloned().collect());
        self
    }

    fn script_topologies(&self, topologies: Vec<Vec<ShardId>>) {
        *self.topologies.lock().unwrap() = topologies.into();
    }

    fn append_records(&self, shard: &ShardId, records: Vec<Record>) {
        self.shards
            .lock()
            .unwrap()
            .get_mut(shard)
            .expect("unknown shard")
            .records
            .extend(records);
    }

    fn log(&self, call: Call) {
        self.journal.lock().unwrap().push((call, Instant::now()));
    }
}

#[async_trait]
impl StreamGateway for FakeStream {
    async fn list_shards(&self, _stream: &StreamName) -> ConsumerResult<Vec<ShardId>> {
        let mut topologies = self.topologies.lock().unwrap();
        if topologies.len() > 1 {
            Ok(topologies.pop_front().unwrap())
        } else {
            Ok(topologies.front().cloned().unwrap_or_default())
        }
    }

    async fn get_iterator(
        &self,
        _stream: &StreamName,
        shard: &ShardId,
        position: &IteratorPosition,
    ) -> ConsumerResult<String> {
        self.log(Call::GetIterator(shard.clone(), position.clone()));
        let shards = self.shards.lock().unwrap();
        let fake = shards
            .get(shard)
            .ok_or_else(|| ConsumerError::Stream(format!("unknown shard `{shard}`")))?;
        let index = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::AtSequenceNumber(at) => fake
                .records
                .iter()
                .position(|r| numeric(&r.sequence_number) >= numeric(at))
                .unwrap_or(fake.records.len()),
            IteratorPosition::AfterSequenceNumber(after) => fake
                .records
                .iter()
                .position(|r| numeric(&r.sequence_number) > numeric(after))
                .unwrap_or(fake.records.len()),
            IteratorPosition::ContinuationToken(token) => {
                return Ok(token.clone());
            }
        };
        Ok(format!("{shard}/{index}"))
    }

    async fn get_records(&self, iterator: &str, limit: u32) -> ConsumerResult<RecordBatch> {
        let (shard, index) = iterator
            .split_once('/')
            .ok_or_else(|| ConsumerError::Stream(format!("malformed iterator `{iterator}`")))?;
        let shard = ShardId::from(shard);
        let index: usize = index
            .parse()
            .map_err(|_| ConsumerError::Stream(format!("malformed iterator `{iterator}`")))?;
        self.log(Call::GetRecords(shard.clone()));
        let shards = self.shards.lock().unwrap();
        let fake = shards
            .get(&shard)
            .ok_or_else(|| ConsumerError::Stream(format!("unknown shard `{shard}`")))?;
        let end = index
            .saturating_add(self.batch_limit.min(limit as usize))
            .min(fake.records.len());
        let records = fake.records.get(index..end).unwrap_or_default().to_vec();
        let next_token = if end >= fake.records.len() && fake.closed {
            None
        } else {
            Some(format!("{shard}/{end}"))
        };
        Ok(RecordBatch {
            records,
            next_token,
        })
    }
}

/// A state store that journals mutations and can be told to reject
/// heartbeats, backed by [`MemoryStateStore`] for the actual semantics.
struct RecordingStore {
    inner: MemoryStateStore,
    journal: Journal,
    checkpoints: Mutex<Vec<(ShardId, SequenceNumber)>>,
    reject_heartbeats: AtomicBool,
    writes: AtomicU64,
}

impl RecordingStore {
    fn new(heartbeat_timeout: Duration, journal: Journal) -> Self {
        Self {
            inner: MemoryStateStore::new(heartbeat_timeout),
            journal,
            checkpoints: Mutex::new(Vec::new()),
            reject_heartbeats: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    fn checkpoints_for(&self, shard: &ShardId) -> Vec<SequenceNumber> {
        self.checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == shard)
            .map(|(_, sequence_number)| sequence_number.clone())
            .collect()
    }

    fn assert_checkpoints_monotonic(&self) {
        let mut highest: HashMap<ShardId, u64> = HashMap::new();
        for (shard, sequence_number) in self.checkpoints.lock().unwrap().iter() {
            let value = numeric(sequence_number);
            let previous = highest.entry(shard.clone()).or_insert(value);
            assert!(
                value >= *previous,
                "checkpoint for {shard} went backwards: {value} < {previous}"
            );
            *previous = value;
        }
    }
}

#[async_trait]
impl StateStore for RecordingStore {
    async fn ensure_table(
        &self,
        app: &AppName,
        read_capacity: i64,
        write_capacity: i64,
        suffix: &str,
    ) -> ConsumerResult<TableName> {
        self.inner
            .ensure_table(app, read_capacity, write_capacity, suffix)
            .await
    }

    async fn create_shard_row(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.journal
            .lock()
            .unwrap()
            .push((Call::CreateRow(shard.clone()), Instant::now()));
        self.inner.create_shard_row(table, worker, shard).await
    }

    async fn read_shard_status(
        &self,
        table: &TableName,
        caller: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<Option<ShardStatus>> {
        self.inner.read_shard_status(table, caller, shard).await
    }

    async fn update_heartbeat(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.reject_heartbeats.load(Ordering::SeqCst) {
            return Err(ConsumerError::ConditionalCheckFailed);
        }
        self.inner.update_heartbeat(table, worker, shard).await
    }

    async fn update_checkpoint(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> ConsumerResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .update_checkpoint(table, worker, shard, sequence_number)
            .await?;
        self.journal
            .lock()
            .unwrap()
            .push((Call::Checkpoint(shard.clone(), sequence_number.clone()), Instant::now()));
        self.checkpoints
            .lock()
            .unwrap()
            .push((shard.clone(), sequence_number.clone()));
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct FailurePlan {
    mode: ErrorHandlingMode,
    /// How many `process` invocations fail before the record succeeds.
    failures: usize,
}

#[derive(Default)]
struct ScriptedProcessor {
    calls: Mutex<Vec<SequenceNumber>>,
    failures: Mutex<HashMap<SequenceNumber, FailurePlan>>,
    exhausted: Mutex<Vec<(SequenceNumber, ErrorHandlingMode)>>,
}

impl ScriptedProcessor {
    fn fail_on(self, sequence_number: SequenceNumber, plan: FailurePlan) -> Self {
        self.failures.lock().unwrap().insert(sequence_number, plan);
        self
    }

    fn processed(&self) -> Vec<SequenceNumber> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, record: &Record) -> Result<(), ProcessorError> {
        self.calls
            .lock()
            .unwrap()
            .push(record.sequence_number.clone());
        let mut failures = self.failures.lock().unwrap();
        if let Some(plan) = failures.get_mut(&record.sequence_number) {
            if plan.failures > 0 {
                plan.failures -= 1;
                return Err(format!("injected failure for {}", record.sequence_number).into());
            }
        }
        Ok(())
    }

    fn error_handling_mode(&self, record: &Record, _error: &ProcessorError) -> ErrorHandlingMode {
        self.failures
            .lock()
            .unwrap()
            .get(&record.sequence_number)
            .map(|plan| plan.mode)
            .unwrap_or(ErrorHandlingMode::RetryAndSkip(0))
    }

    fn on_max_retry_exceeded(&self, record: &Record, mode: &ErrorHandlingMode) {
        self.exhausted
            .lock()
            .unwrap()
            .push((record.sequence_number.clone(), *mode));
    }
}

struct Harness {
    coordinator: Coordinator,
    metrics: ConsumerMetrics,
    journal: Journal,
    table: TableName,
}

async fn spawn_app(
    app: &str,
    stream: Arc<FakeStream>,
    store: Arc<RecordingStore>,
    processor: Arc<dyn Processor>,
    config: ConsumerConfig,
) -> Harness {
    let journal = stream.journal.clone();
    let metrics = ConsumerMetrics::new(&Registry::new());
    let table = store
        .ensure_table(&AppName::from(app), 10, 10, APP_SUFFIX)
        .await
        .unwrap();
    let coordinator = Coordinator::spawn(
        stream,
        store,
        processor,
        StreamName::from(format!("{app}-stream")),
        WorkerId::from("worker-1"),
        table.clone(),
        config,
        metrics.clone(),
    );
    Harness {
        coordinator,
        metrics,
        journal,
        table,
    }
}

async fn wait_until(description: &str, predicate: impl Fn() -> bool) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout: {description}");
}

#[tokio::test]
async fn happy_path_checkpoints_once() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(
        FakeStream::new(100, journal.clone()).with_shard(
            &shard,
            vec![record(1), record(2)],
            false,
        ),
    );
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default());

    let harness = spawn_app(
        "happy-path",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    wait_until("checkpoint `2` persisted", || {
        store.checkpoints_for(&shard) == vec![seq(2)]
    })
    .await;
    assert_eq!(processor.processed(), vec![seq(1), seq(2)]);

    // The live shard keeps returning empty batches; the single checkpoint
    // must not be repeated.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.checkpoints_for(&shard), vec![seq(2)]);
    store.assert_checkpoints_monotonic();

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_and_skip_invokes_callback_and_continues() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(FakeStream::new(100, journal.clone()).with_shard(
        &shard,
        vec![record(1), record(2), record(3)],
        false,
    ));
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default().fail_on(
        seq(2),
        FailurePlan {
            mode: ErrorHandlingMode::RetryAndSkip(1),
            failures: usize::MAX,
        },
    ));

    let harness = spawn_app(
        "retry-skip",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    wait_until("checkpoint `3` persisted", || {
        store.checkpoints_for(&shard) == vec![seq(3)]
    })
    .await;

    // Initial attempt plus one retry for the failing record.
    assert_eq!(processor.processed(), vec![seq(1), seq(2), seq(2), seq(3)]);
    assert_eq!(
        *processor.exhausted.lock().unwrap(),
        vec![(seq(2), ErrorHandlingMode::RetryAndSkip(1))]
    );

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_and_stop_holds_checkpoint_and_refetches() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(FakeStream::new(100, journal.clone()).with_shard(
        &shard,
        vec![record(1), record(2), record(3)],
        false,
    ));
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default().fail_on(
        seq(2),
        FailurePlan {
            mode: ErrorHandlingMode::RetryAndStop(0),
            failures: usize::MAX,
        },
    ));

    let harness = spawn_app(
        "retry-stop",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    // The worker checkpoints the last success and re-fetches at it.
    wait_until("re-fetch at the stop anchor", || {
        calls(&harness.journal)
            .contains(&Call::GetIterator(shard.clone(), IteratorPosition::AtSequenceNumber(seq(1))))
    })
    .await;
    wait_until("retry cycle repeats", || {
        processor
            .exhausted
            .lock()
            .unwrap()
            .len()
            >= 2
    })
    .await;

    let checkpoints = store.checkpoints_for(&shard);
    assert!(!checkpoints.is_empty());
    assert!(checkpoints.iter().all(|c| *c == seq(1)));
    assert!(!processor.processed().contains(&seq(3)));

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_and_stop_on_first_record_leaves_checkpoint_unset() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(FakeStream::new(100, journal.clone()).with_shard(
        &shard,
        vec![record(1), record(2)],
        false,
    ));
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default().fail_on(
        seq(1),
        FailurePlan {
            mode: ErrorHandlingMode::RetryAndStop(0),
            failures: usize::MAX,
        },
    ));

    let harness = spawn_app(
        "retry-stop-first",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    // The same batch start is re-read on every cycle, without a checkpoint.
    wait_until("batch start re-fetched", || {
        calls(&harness.journal)
            .iter()
            .filter(|call| {
                **call
                    == Call::GetIterator(
                        shard.clone(),
                        IteratorPosition::AtSequenceNumber(seq(1)),
                    )
            })
            .count()
            >= 2
    })
    .await;
    assert!(store.checkpoints_for(&shard).is_empty());
    assert!(!processor.processed().contains(&seq(2)));

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn lost_ownership_stops_all_state_store_writes() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(
        FakeStream::new(100, journal.clone()).with_shard(&shard, vec![record(1)], false),
    );
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default());

    let harness = spawn_app(
        "ownership-lost",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    wait_until("first checkpoint persisted", || {
        !store.checkpoints_for(&shard).is_empty()
    })
    .await;

    store.reject_heartbeats.store(true, Ordering::SeqCst);
    wait_until("worker disposed", || {
        harness.metrics.active_workers.get() == 0
    })
    .await;

    // No further writes of any kind after the worker observed the rejection.
    let writes = store.writes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.writes.load(Ordering::SeqCst), writes);

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn topology_change_starts_worker_for_new_shard() {
    let journal: Journal = Default::default();
    let shard_a = ShardId::from("shard-a");
    let shard_b = ShardId::from("shard-b");
    let stream = Arc::new(
        FakeStream::new(100, journal.clone())
            .with_shard(&shard_a, vec![record(1)], false)
            .with_shard(&shard_b, vec![record(10)], false),
    );
    stream.script_topologies(vec![
        vec![shard_a.clone()],
        vec![shard_a.clone(), shard_b.clone()],
    ]);
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default());

    let harness = spawn_app(
        "topology",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    wait_until("both shards processed", || {
        let processed = processor.processed();
        processed.contains(&seq(1)) && processed.contains(&seq(10))
    })
    .await;

    let recorded = calls(&harness.journal);
    for shard in [&shard_a, &shard_b] {
        assert_eq!(
            recorded
                .iter()
                .filter(|call| **call == Call::CreateRow((*shard).clone()))
                .count(),
            1,
            "worker for {shard} claimed its row more than once"
        );
    }

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn resume_claims_stale_row_and_continues_after_checkpoint() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(FakeStream::new(100, journal.clone()).with_shard(
        &shard,
        vec![record(5), record(7), record(8), record(9)],
        false,
    ));
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let table = TableName::from(format!("resume{APP_SUFFIX}"));
    store.inner.put_row(
        &table,
        &shard,
        ShardRow {
            worker: WorkerId::from("departed-worker"),
            last_heartbeat: Utc::now() - chrono::Duration::seconds(60),
            checkpoint: Some(seq(7)),
        },
    );
    let processor = Arc::new(ScriptedProcessor::default());

    let harness = spawn_app(
        "resume",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    wait_until("records after the checkpoint processed", || {
        processor.processed() == vec![seq(8), seq(9)]
    })
    .await;
    assert!(calls(&harness.journal).contains(&Call::GetIterator(
        shard.clone(),
        IteratorPosition::AfterSequenceNumber(seq(7))
    )));
    let row = store.inner.row(&harness.table, &shard).unwrap();
    assert_eq!(row.worker, WorkerId::from("worker-1"));

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn round_trip_processes_every_record_exactly_once() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let records: Vec<Record> = (1..=25).map(record).collect();
    let stream =
        Arc::new(FakeStream::new(10, journal.clone()).with_shard(&shard, records, true));
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default());

    let harness = spawn_app(
        "round-trip",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    wait_until("worker exits after the closed shard drains", || {
        harness.metrics.active_workers.get() == 0
    })
    .await;

    let expected: Vec<SequenceNumber> = (1..=25).map(seq).collect();
    assert_eq!(processor.processed(), expected);
    assert_eq!(
        store.checkpoints_for(&shard),
        vec![seq(10), seq(20), seq(25)]
    );
    store.assert_checkpoints_monotonic();

    // No fetch is issued before the previous batch's checkpoint is
    // persisted: the journal interleaves strictly.
    let relevant: Vec<Call> = calls(&harness.journal)
        .into_iter()
        .filter(|call| {
            matches!(call, Call::GetRecords(_) | Call::Checkpoint(_, _))
        })
        .collect();
    assert_eq!(
        relevant,
        vec![
            Call::GetRecords(shard.clone()),
            Call::Checkpoint(shard.clone(), seq(10)),
            Call::GetRecords(shard.clone()),
            Call::Checkpoint(shard.clone(), seq(20)),
            Call::GetRecords(shard.clone()),
            Call::Checkpoint(shard.clone(), seq(25)),
        ]
    );

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_receive_delays_the_next_fetch() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream =
        Arc::new(FakeStream::new(100, journal.clone()).with_shard(&shard, vec![], false));
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default());
    let mut config = test_config();
    config.empty_receive_delay = Duration::from_millis(100);

    let harness = spawn_app(
        "empty-receive",
        stream.clone(),
        store.clone(),
        processor.clone(),
        config,
    )
    .await;

    wait_until("several empty receives", || {
        calls(&harness.journal)
            .iter()
            .filter(|call| matches!(call, Call::GetRecords(_)))
            .count()
            >= 3
    })
    .await;

    let fetches: Vec<Instant> = harness
        .journal
        .lock()
        .unwrap()
        .iter()
        .filter(|(call, _)| matches!(call, Call::GetRecords(_)))
        .map(|(_, at)| *at)
        .collect();
    for pair in fetches.windows(2) {
        assert!(
            pair[1].duration_since(pair[0]) >= Duration::from_millis(80),
            "fetch issued before the empty-receive delay elapsed"
        );
    }

    // The loop resumes once records appear.
    stream.append_records(&shard, vec![record(1), record(2)]);
    wait_until("appended records processed", || {
        store.checkpoints_for(&shard) == vec![seq(2)]
    })
    .await;

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(
        FakeStream::new(100, journal.clone()).with_shard(&shard, vec![record(1)], false),
    );
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let processor = Arc::new(ScriptedProcessor::default());

    let harness = spawn_app(
        "idempotent",
        stream,
        store.clone(),
        processor.clone(),
        test_config(),
    )
    .await;

    wait_until("worker running", || {
        harness.metrics.active_workers.get() == 1
    })
    .await;

    // Re-requesting a live shard succeeds without creating a second worker.
    harness
        .coordinator
        .start_processing(shard.clone())
        .await
        .unwrap();
    assert_eq!(harness.metrics.active_workers.get(), 1);

    // Stopping an unknown shard succeeds without side effects.
    harness
        .coordinator
        .stop_processing(ShardId::from("no-such-shard"))
        .await
        .unwrap();

    harness
        .coordinator
        .stop_processing(shard.clone())
        .await
        .unwrap();
    assert_eq!(harness.metrics.active_workers.get(), 0);

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn change_processor_takes_effect_on_next_record() {
    let journal: Journal = Default::default();
    let shard = ShardId::from("shard-0");
    let stream = Arc::new(FakeStream::new(100, journal.clone()).with_shard(
        &shard,
        vec![record(1), record(2)],
        false,
    ));
    let store = Arc::new(RecordingStore::new(
        Duration::from_millis(500),
        journal.clone(),
    ));
    let first = Arc::new(ScriptedProcessor::default());
    let second = Arc::new(ScriptedProcessor::default());

    let harness = spawn_app(
        "hot-swap",
        stream.clone(),
        store.clone(),
        first.clone(),
        test_config(),
    )
    .await;

    wait_until("first processor drained the shard", || {
        store.checkpoints_for(&shard) == vec![seq(2)]
    })
    .await;

    harness.coordinator.change_processor(second.clone());
    stream.append_records(&shard, vec![record(3), record(4)]);

    wait_until("second processor handled the new records", || {
        second.processed() == vec![seq(3), seq(4)]
    })
    .await;
    assert_eq!(first.processed(), vec![seq(1), seq(2)]);

    harness.coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn app_names_are_unique_per_process() {
    let app = AppName::from("unique-app");
    let stream = StreamName::from("unique-stream");
    let registration = register_app(&app, &stream).unwrap();
    assert!(matches!(
        register_app(&app, &stream),
        Err(ConsumerError::AppAlreadyRunning(name)) if name == app
    ));
    drop(registration);
    // Disposal releases the name.
    register_app(&app, &stream).unwrap();
}

#[tokio::test]
async fn memory_store_enforces_conditional_semantics() {
    let store = MemoryStateStore::new(Duration::from_millis(50));
    let table = TableName::from("appKinesisState");
    let shard = ShardId::from("shard-0");
    let owner = WorkerId::from("owner");
    let intruder = WorkerId::from("intruder");

    store.create_shard_row(&table, &owner, &shard).await.unwrap();

    // A live row cannot be re-claimed, heartbeated, or checkpointed by
    // another worker.
    assert!(matches!(
        store.create_shard_row(&table, &intruder, &shard).await,
        Err(ConsumerError::ConditionalCheckFailed)
    ));
    assert!(matches!(
        store.update_heartbeat(&table, &intruder, &shard).await,
        Err(ConsumerError::ConditionalCheckFailed)
    ));
    assert!(matches!(
        store
            .update_checkpoint(&table, &intruder, &shard, &seq(1))
            .await,
        Err(ConsumerError::ConditionalCheckFailed)
    ));

    store
        .update_checkpoint(&table, &owner, &shard, &seq(4))
        .await
        .unwrap();

    // Once the heartbeat goes stale the row can be taken over, and the
    // checkpoint survives.
    tokio::time::sleep(Duration::from_millis(80)).await;
    store
        .create_shard_row(&table, &intruder, &shard)
        .await
        .unwrap();
    let row = store.row(&table, &shard).unwrap();
    assert_eq!(row.worker, intruder);
    assert_eq!(row.checkpoint, Some(seq(4)));

    // The previous owner's writes are now rejected.
    assert!(matches!(
        store.update_heartbeat(&table, &owner, &shard).await,
        Err(ConsumerError::ConditionalCheckFailed)
    ));
}

#[test]
fn shard_row_classification() {
    let caller = WorkerId::from("caller");
    let other = WorkerId::from("other");
    let now = Utc::now();
    let timeout = Duration::from_secs(180);

    // Fresh row owned by the caller without a checkpoint.
    let row = ShardRow {
        worker: caller.clone(),
        last_heartbeat: now,
        checkpoint: None,
    };
    assert!(matches!(
        row.classify(&caller, now, timeout),
        ShardStatus::New { worker, .. } if worker == caller
    ));

    // Freshly heartbeating row with a checkpoint.
    let row = ShardRow {
        worker: other.clone(),
        last_heartbeat: now - chrono::Duration::seconds(30),
        checkpoint: Some(seq(7)),
    };
    assert_eq!(
        row.classify(&caller, now, timeout),
        ShardStatus::Processing {
            worker: other.clone(),
            checkpoint: Some(seq(7)),
        }
    );

    // Stale heartbeat.
    let heartbeat_at = now - chrono::Duration::seconds(600);
    let row = ShardRow {
        worker: other.clone(),
        last_heartbeat: heartbeat_at,
        checkpoint: Some(seq(7)),
    };
    assert_eq!(
        row.classify(&caller, now, timeout),
        ShardStatus::NotProcessing {
            worker: other,
            heartbeat_at,
            checkpoint: Some(seq(7)),
        }
    );
}
