// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    Client,
    error::{ProvideErrorMetadata, SdkError},
    types::{
        AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
        ScalarAttributeType, TableStatus,
    },
};
use backoff::{ExponentialBackoff, backoff::Backoff};
use chrono::{DateTime, SecondsFormat, Utc};
use kinesis_consumer_core::{
    AppName, ConsumerError, ConsumerResult, SequenceNumber, ShardId, ShardRow, ShardStatus,
    StateStore, TableName, WorkerId,
};
use tracing::{debug, info, warn};

const HASH_KEY: &str = "ShardId";
const TABLE_WAIT_INTERVAL: Duration = Duration::from_secs(2);
const TABLE_WAIT_ATTEMPTS: u32 = 60;

/// [`StateStore`] backed by a DynamoDB table with one row per shard.
///
/// Row schema: `ShardId` (hash key), `WorkerId` (current owner),
/// `LastHeartbeat` (RFC 3339 timestamp) and the optional `LastCheckpoint`.
/// Ownership is asserted through conditional expressions keyed on
/// `WorkerId`; a rejected condition surfaces as
/// [`ConsumerError::ConditionalCheckFailed`].
pub struct DynamoStateStore {
    client: Client,
    heartbeat_timeout: Duration,
    max_retries: u32,
}

impl DynamoStateStore {
    pub fn new(client: Client, heartbeat_timeout: Duration, max_retries: u32) -> Self {
        Self {
            client,
            heartbeat_timeout,
            max_retries,
        }
    }

    /// Retry `operation` on transient errors up to the configured budget.
    /// Conditional-check failures are never retried.
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
                Err(ConsumerError::ConditionalCheckFailed) => {
                    return Err(ConsumerError::ConditionalCheckFailed);
                }
                Err(err) if attempts < self.max_retries => {
                    attempts += 1;
                    warn!(operation = name, attempt = attempts, %err, "transient state store error, backing off");
                    let pause = backoff.next_backoff().unwrap_or(TABLE_WAIT_INTERVAL);
                    tokio::time::sleep(pause).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn timestamp(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Heartbeats older than this RFC 3339 instant are considered stale.
    /// Fixed-width UTC timestamps compare correctly as strings.
    fn stale_cutoff(&self) -> String {
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        Self::timestamp(Utc::now() - timeout)
    }
}

#[async_trait]
impl StateStore for DynamoStateStore {
    async fn ensure_table(
        &self,
        app: &AppName,
        read_capacity: i64,
        write_capacity: i64,
        suffix: &str,
    ) -> ConsumerResult<TableName> {
        let table = TableName::from(format!("{app}{suffix}"));

        let created = self
            .client
            .create_table()
            .table_name(table.as_str())
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name(HASH_KEY)
                    .key_type(KeyType::Hash)
                    .build()
                    .map_err(|err| ConsumerError::StateStore(err.to_string()))?,
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name(HASH_KEY)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(|err| ConsumerError::StateStore(err.to_string()))?,
            )
            .provisioned_throughput(
                ProvisionedThroughput::builder()
                    .read_capacity_units(read_capacity)
                    .write_capacity_units(write_capacity)
                    .build()
                    .map_err(|err| ConsumerError::StateStore(err.to_string()))?,
            )
            .send()
            .await;
        match created {
            Ok(_) => info!(table = %table, "created state table"),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_resource_in_use_exception()) =>
            {
                debug!(table = %table, "state table already exists");
            }
            Err(err) => return Err(into_store_error(err)),
        }

        for _ in 0..TABLE_WAIT_ATTEMPTS {
            match self
                .client
                .describe_table()
                .table_name(table.as_str())
                .send()
                .await
            {
                Ok(output) => {
                    let status = output.table().and_then(|description| description.table_status());
                    if status == Some(&TableStatus::Active) {
                        return Ok(table);
                    }
                    debug!(table = %table, ?status, "waiting for state table to become active");
                }
                Err(err) => {
                    warn!(table = %table, err = %into_store_error(err), "failed to describe state table");
                }
            }
            tokio::time::sleep(TABLE_WAIT_INTERVAL).await;
        }
        Err(ConsumerError::StateStore(format!(
            "table `{table}` did not become active"
        )))
    }

    async fn create_shard_row(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()> {
        self.with_retries("create_shard_row", || async {
            // An update (rather than a put) so that taking over a stale row
            // preserves its checkpoint.
            self.client
                .update_item()
                .table_name(table.as_str())
                .key(HASH_KEY, AttributeValue::S(shard.to_string()))
                .update_expression("SET WorkerId = :worker, LastHeartbeat = :now")
                .condition_expression(
                    "attribute_not_exists(ShardId) OR LastHeartbeat < :stale",
                )
                .expression_attribute_values(":worker", AttributeValue::S(worker.to_string()))
                .expression_attribute_values(
                    ":now",
                    AttributeValue::S(Self::timestamp(Utc::now())),
                )
                .expression_attribute_values(":stale", AttributeValue::S(self.stale_cutoff()))
                .send()
                .await
                .map(|_| ())
                .map_err(into_store_error)
        })
        .await
    }

    async fn read_shard_status(
        &self,
        table: &TableName,
        caller: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<Option<ShardStatus>> {
        let output = self
            .with_retries("read_shard_status", || async {
                self.client
                    .get_item()
                    .table_name(table.as_str())
                    .key(HASH_KEY, AttributeValue::S(shard.to_string()))
                    .consistent_read(true)
                    .send()
                    .await
                    .map_err(into_store_error)
            })
            .await?;
        let Some(item) = output.item() else {
            return Ok(None);
        };
        let row = row_from_item(item)?;
        Ok(Some(row.classify(caller, Utc::now(), self.heartbeat_timeout)))
    }

    async fn update_heartbeat(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
    ) -> ConsumerResult<()> {
        self.with_retries("update_heartbeat", || async {
            self.client
                .update_item()
                .table_name(table.as_str())
                .key(HASH_KEY, AttributeValue::S(shard.to_string()))
                .update_expression("SET LastHeartbeat = :now")
                .condition_expression("WorkerId = :worker")
                .expression_attribute_values(":worker", AttributeValue::S(worker.to_string()))
                .expression_attribute_values(
                    ":now",
                    AttributeValue::S(Self::timestamp(Utc::now())),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(into_store_error)
        })
        .await
    }

    async fn update_checkpoint(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> ConsumerResult<()> {
        self.with_retries("update_checkpoint", || async {
            // A checkpoint write doubles as a heartbeat.
            self.client
                .update_item()
                .table_name(table.as_str())
                .key(HASH_KEY, AttributeValue::S(shard.to_string()))
                .update_expression("SET LastCheckpoint = :checkpoint, LastHeartbeat = :now")
                .condition_expression("WorkerId = :worker")
                .expression_attribute_values(":worker", AttributeValue::S(worker.to_string()))
                .expression_attribute_values(
                    ":checkpoint",
                    AttributeValue::S(sequence_number.to_string()),
                )
                .expression_attribute_values(
                    ":now",
                    AttributeValue::S(Self::timestamp(Utc::now())),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(into_store_error)
        })
        .await
    }
}

fn into_store_error<E>(err: SdkError<E>) -> ConsumerError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    if err
        .as_service_error()
        .and_then(|service| service.code())
        == Some("ConditionalCheckFailedException")
    {
        return ConsumerError::ConditionalCheckFailed;
    }
    ConsumerError::StateStore(format!("{err:?}"))
}

fn row_from_item(item: &HashMap<String, AttributeValue>) -> ConsumerResult<ShardRow> {
    let attribute = |name: &str| {
        item.get(name)
            .and_then(|value| value.as_s().ok())
            .ok_or_else(|| {
                ConsumerError::StateStore(format!("shard row is missing attribute `{name}`"))
            })
    };
    let worker = WorkerId::from(attribute("WorkerId")?.as_str());
    let last_heartbeat = DateTime::parse_from_rfc3339(attribute("LastHeartbeat")?)
        .map_err(|err| ConsumerError::StateStore(format!("malformed LastHeartbeat: {err}")))?
        .with_timezone(&Utc);
    let checkpoint = item
        .get("LastCheckpoint")
        .and_then(|value| value.as_s().ok())
        .map(|value| SequenceNumber::from(value.as_str()));
    Ok(ShardRow {
        worker,
        last_heartbeat,
        checkpoint,
    })
}
