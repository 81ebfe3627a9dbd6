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

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Position, Result, TopicPartition, TopicPartitions};

/// opaque position within a partition, issued by the log service
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Record {
    pub timestamp: SystemTime,
    pub content: Bytes,
}

/// records fetched from a partition and the cursor following them
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Fetched {
    pub records: Vec<Record>,
    pub next_cursor: Cursor,
}

/// Remote calls made by a consumer against the log service.
///
/// Implementations wrap the network client, a consumer only relies on this
/// contract.
#[async_trait]
pub trait ConsumerClient: Clone + fmt::Debug + Send + Sync + 'static {
    /// register the consumer group, succeeding when it already exists
    async fn create_consumer_group(&self, timeout: Duration) -> Result<()>;

    /// renew membership, reporting the partitions still being consumed,
    /// returning the partitions now assigned to this member
    async fn heartbeat(&self, held: &[TopicPartitions]) -> Result<Vec<TopicPartitions>>;

    /// the last cursor committed by the group for a partition
    async fn checkpoint(&self, partition: &TopicPartition) -> Result<Option<Cursor>>;

    async fn cursor(&self, partition: &TopicPartition, position: Position) -> Result<Cursor>;

    async fn fetch(
        &self,
        partition: &TopicPartition,
        cursor: &Cursor,
        max_batch_size: u32,
        end: Option<&Cursor>,
    ) -> Result<Fetched>;

    async fn commit(&self, partition: &TopicPartition, member: &str, cursor: &Cursor)
    -> Result<()>;
}
