// Copyright ⓒ 2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! CLS Consumer
//!
//! Consumer group coordinator for a partitioned, leased log stream.
//!
//! A [`Coordinator`] keeps group membership alive through a [`Heartbeat`],
//! reconciles the partitions held by this member against a set of
//! [`PartitionWorker`]s running on a shared [`ExecutionPool`], and drains
//! every worker before it stops.

use std::{
    fmt, io, result,
    sync::{Arc, LazyLock, PoisonError},
};

use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use tokio::task::JoinError;

mod client;
mod config;
mod coordinator;
mod heartbeat;
mod partition;
mod pool;
mod worker;

pub use client::{ConsumerClient, Cursor, Fetched, Record};
pub use config::{Builder, Configuration, Credentials, Identity, Position};
pub use coordinator::{Coordinator, Handle};
pub use heartbeat::{ConsumerHeartbeat, Heartbeat};
pub use partition::{HeldPartitions, PartitionId, TopicPartition, TopicPartitions};
pub use pool::ExecutionPool;
pub use worker::{
    Assignment, ConsumerFactory, MakeProcessor, PartitionConsumer, PartitionWorker, Processor,
    WorkerFactory,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    Box(#[from] BoxError),
    Client(BoxError),
    Elapsed(#[from] tokio::time::error::Elapsed),
    Io(Arc<io::Error>),
    Join(Arc<JoinError>),
    Message(String),
    Poison,
    PoolClosed,
    Position(String),

    ProcessorInit {
        processor: &'static str,
        partition: TopicPartition,
        error: BoxError,
    },

    Processing {
        partition: TopicPartition,
        error: BoxError,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "{msg}"),
            error => write!(f, "{error:?}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Self::Join(Arc::new(value))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});
