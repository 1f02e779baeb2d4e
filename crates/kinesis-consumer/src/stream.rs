// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;

use async_trait::async_trait;
use aws_sdk_kinesis::{
    Client,
    error::{ProvideErrorMetadata, SdkError},
    types::ShardIteratorType,
};
use backoff::{ExponentialBackoff, backoff::Backoff};
use bytes::Bytes;
use kinesis_consumer_core::{
    ConsumerError, ConsumerResult, IteratorPosition, Record, RecordBatch, SequenceNumber, ShardId,
    StreamGateway, StreamName,
};
use tracing::warn;

/// GetRecords accepts at most this many records per call.
const MAX_RECORDS_PER_FETCH: u32 = 10_000;

/// [`StreamGateway`] backed by Amazon Kinesis Data Streams.
pub struct KinesisGateway {
    client: Client,
    max_retries: u32,
}

impl KinesisGateway {
    pub fn new(client: Client, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
        }
    }

    /// Retry `operation` on transient service errors up to the configured
    /// budget. An expired iterator also lands here; after the budget is
    /// spent the worker re-positions from its last checkpoint.
    async fn with_retries<T, F, Fut>(&self, name: &str, operation: F) -> ConsumerResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ConsumerResult<T>>,
    {
        let mut backoff = ExponentialBackoff::default();
        let mut attempts = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempts < self.max_retries => {
                    attempts += 1;
                    warn!(operation = name, attempt = attempts, %err, "transient stream error, backing off");
                    let pause = backoff
                        .next_backoff()
                        .unwrap_or(std::time::Duration::from_secs(1));
                    tokio::time::sleep(pause).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl StreamGateway for KinesisGateway {
    async fn list_shards(&self, stream: &StreamName) -> ConsumerResult<Vec<ShardId>> {
        self.with_retries("list_shards", || async {
            let mut shards = Vec::new();
            let mut next_token: Option<String> = None;
            loop {
                // Pages after the first are addressed by token alone.
                let request = match &next_token {
                    Some(token) => self.client.list_shards().next_token(token),
                    None => self.client.list_shards().stream_name(stream.as_str()),
                };
                let output = request.send().await.map_err(into_stream_error)?;
                shards.extend(
                    output
                        .shards()
                        .iter()
                        .map(|shard| ShardId::from(shard.shard_id())),
                );
                match output.next_token() {
                    Some(token) => next_token = Some(token.to_owned()),
                    None => return Ok(shards),
                }
            }
        })
        .await
    }

    async fn get_iterator(
        &self,
        stream: &StreamName,
        shard: &ShardId,
        position: &IteratorPosition,
    ) -> ConsumerResult<String> {
        // A continuation token is already a valid iterator.
        if let IteratorPosition::ContinuationToken(token) = position {
            return Ok(token.clone());
        }
        self.with_retries("get_iterator", || async {
            let request = self
                .client
                .get_shard_iterator()
                .stream_name(stream.as_str())
                .shard_id(shard.as_str());
            let request = match position {
                IteratorPosition::TrimHorizon => {
                    request.shard_iterator_type(ShardIteratorType::TrimHorizon)
                }
                IteratorPosition::AtSequenceNumber(sequence_number) => request
                    .shard_iterator_type(ShardIteratorType::AtSequenceNumber)
                    .starting_sequence_number(sequence_number.as_str()),
                IteratorPosition::AfterSequenceNumber(sequence_number) => request
                    .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                    .starting_sequence_number(sequence_number.as_str()),
                IteratorPosition::ContinuationToken(_) => unreachable!("handled above"),
            };
            let output = request.send().await.map_err(into_stream_error)?;
            output
                .shard_iterator()
                .map(ToOwned::to_owned)
                .ok_or_else(|| {
                    ConsumerError::Stream(format!("no iterator returned for shard `{shard}`"))
                })
        })
        .await
    }

    async fn get_records(&self, iterator: &str, limit: u32) -> ConsumerResult<RecordBatch> {
        self.with_retries("get_records", || async {
            let output = self
                .client
                .get_records()
                .shard_iterator(iterator)
                .limit(limit.min(MAX_RECORDS_PER_FETCH) as i32)
                .send()
                .await
                .map_err(into_stream_error)?;
            let records = output
                .records()
                .iter()
                .map(|record| Record {
                    partition_key: record.partition_key().to_owned(),
                    sequence_number: SequenceNumber::from(record.sequence_number()),
                    data: Bytes::copy_from_slice(record.data().as_ref()),
                })
                .collect();
            Ok(RecordBatch {
                records,
                // A missing continuation iterator means the shard is closed.
                next_token: output.next_shard_iterator().map(ToOwned::to_owned),
            })
        })
        .await
    }
}

fn into_stream_error<E>(err: SdkError<E>) -> ConsumerError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    ConsumerError::Stream(format!("{err:?}"))
}
