// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::types::AppName;

pub type ConsumerResult<T, E = ConsumerError> = core::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConsumerError {
    #[error("stream service error: `{0}`")]
    Stream(String),

    #[error("state store error: `{0}`")]
    StateStore(String),

    /// A conditional state-store update was rejected because the row is no
    /// longer owned by this worker. Recoverable only by conceding ownership.
    #[error("conditional state-store update rejected, shard ownership lost")]
    ConditionalCheckFailed,

    #[error("an application named `{0}` is already running in this process")]
    AppAlreadyRunning(AppName),

    #[error("application initialization failed")]
    InitializationFailed(#[source] Box<ConsumerError>),

    #[error("{component} shutdown error: `{msg}`")]
    Shutdown { component: String, msg: String },

    #[error("channel error: `{0}`")]
    Channel(String),
}
