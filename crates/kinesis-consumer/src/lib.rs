// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Amazon Kinesis binding of the consumer core: a Kinesis-backed stream
//! gateway, a DynamoDB-backed state store, and the application surface that
//! wires credentials, the state table, and the controller together.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use kinesis_consumer::create_app;
//! use kinesis_consumer_core::{
//!     ErrorHandlingMode, Processor, ProcessorError, Record,
//! };
//!
//! struct PrintingProcessor;
//!
//! #[async_trait]
//! impl Processor for PrintingProcessor {
//!     async fn process(&self, record: &Record) -> Result<(), ProcessorError> {
//!         println!("{}: {} bytes", record.sequence_number, record.data.len());
//!         Ok(())
//!     }
//!
//!     fn error_handling_mode(
//!         &self,
//!         _record: &Record,
//!         _error: &ProcessorError,
//!     ) -> ErrorHandlingMode {
//!         ErrorHandlingMode::RetryAndSkip(2)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = create_app(
//!         "AKIA...",
//!         "secret",
//!         "us-east-1",
//!         "orders".into(),
//!         "orders-stream".into(),
//!         "worker-1".into(),
//!         Arc::new(PrintingProcessor),
//!         None,
//!     )
//!     .await
//!     .unwrap();
//!     // ... later:
//!     app.dispose().await.unwrap();
//! }
//! ```

mod state_store;
mod stream;

use std::{sync::Arc, time::Duration};

use aws_config::{BehaviorVersion, timeout::TimeoutConfig};
use aws_sdk_dynamodb::config::{Credentials, Region};
use kinesis_consumer_core::{
    AppName, AppRegistration, ConsumerConfig, ConsumerError, ConsumerMetrics, ConsumerResult,
    Coordinator, Processor, ShardId, StateStore, StreamName, WorkerId, register_app,
};
pub use state_store::DynamoStateStore;
pub use stream::KinesisGateway;
use tracing::info;

/// A running consumer application.
///
/// Created by [`create_app`]; processing begins immediately.
/// [`dispose`](App::dispose) is the only clean shutdown: it stops every
/// shard worker gracefully and releases the application name.
pub struct App {
    coordinator: Coordinator,
    _registration: AppRegistration,
}

impl App {
    /// Request a worker for `shard`; resolves once the request has been
    /// applied. Idempotent on an already-running shard.
    pub async fn start_processing(&self, shard: ShardId) -> ConsumerResult<()> {
        self.coordinator.start_processing(shard).await
    }

    /// Request that the worker for `shard` stop; resolves once the worker
    /// has terminated. Idempotent on an unknown shard.
    pub async fn stop_processing(&self, shard: ShardId) -> ConsumerResult<()> {
        self.coordinator.stop_processing(shard).await
    }

    /// Replace the record processor. Takes effect on the next record of
    /// every shard.
    pub fn change_processor(&self, processor: Arc<dyn Processor>) {
        self.coordinator.change_processor(processor);
    }

    /// Stop all shard workers gracefully, letting in-flight batches finish
    /// and their checkpoints persist, then release the application name.
    pub async fn dispose(self) -> ConsumerResult<()> {
        self.coordinator.shutdown().await
    }
}

/// Create a consumer application and begin processing immediately.
///
/// Blocks only until the DynamoDB state table is ready; per-shard claim
/// loops run asynchronously and retry until they obtain ownership. Fails
/// with [`ConsumerError::AppAlreadyRunning`] when an application with the
/// same name already runs in this process, or with
/// [`ConsumerError::InitializationFailed`] when the state table cannot be
/// bootstrapped.
#[allow(clippy::too_many_arguments)]
pub async fn create_app(
    aws_access_key_id: &str,
    aws_secret_access_key: &str,
    region: &str,
    app_name: AppName,
    stream_name: StreamName,
    worker_id: WorkerId,
    processor: Arc<dyn Processor>,
    config: Option<ConsumerConfig>,
) -> ConsumerResult<App> {
    let config = config.unwrap_or_default();
    let registration = register_app(&app_name, &stream_name)?;

    let aws_config = load_aws_config(aws_access_key_id, aws_secret_access_key, region).await;
    let store = Arc::new(DynamoStateStore::new(
        aws_sdk_dynamodb::Client::new(&aws_config),
        config.heartbeat_timeout,
        config.max_state_store_retries,
    ));
    let stream = Arc::new(KinesisGateway::new(
        aws_sdk_kinesis::Client::new(&aws_config),
        config.max_stream_retries,
    ));

    let table = store
        .ensure_table(
            &app_name,
            config.state_store_read_capacity,
            config.state_store_write_capacity,
            &config.table_suffix,
        )
        .await
        .map_err(|err| ConsumerError::InitializationFailed(Box::new(err)))?;
    info!(app = %app_name, stream = %stream_name, table = %table, "application state table ready");

    let metrics = ConsumerMetrics::new(&prometheus::Registry::new());
    let coordinator = Coordinator::spawn(
        stream,
        store,
        processor,
        stream_name,
        worker_id,
        table,
        config,
        metrics,
    );
    Ok(App {
        coordinator,
        _registration: registration,
    })
}

async fn load_aws_config(
    aws_access_key_id: &str,
    aws_secret_access_key: &str,
    region: &str,
) -> aws_config::SdkConfig {
    let credentials = Credentials::new(
        aws_access_key_id,
        aws_secret_access_key,
        None,
        None,
        "kinesis-consumer",
    );
    let timeout_config = TimeoutConfig::builder()
        .operation_timeout(Duration::from_secs(10))
        .operation_attempt_timeout(Duration::from_secs(3))
        .connect_timeout(Duration::from_secs(3))
        .build();
    aws_config::defaults(BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(Region::new(region.to_owned()))
        .timeout_config(timeout_config)
        .load()
        .await
}
