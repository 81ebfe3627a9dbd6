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

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use cls_consumer::{
    BoxError, Configuration, ConsumerClient, Cursor, Fetched, Position, Processor, Record,
    TopicPartition, TopicPartitions,
};
use tokio::task::JoinError;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, filter::ParseError};
use url::Url;

pub(crate) const TOPIC: &str = "abc";

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    Consumer(#[from] cls_consumer::Error),
    Join(#[from] JoinError),
    Message(String),
    ParseFilter(#[from] ParseError),
    Url(#[from] url::ParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub(crate) fn init_tracing() -> Result<DefaultGuard, Error> {
    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(false)
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(format!("{}=debug", env!("CARGO_CRATE_NAME")).parse()?)
                    .add_directive("cls_consumer=debug".parse()?),
            )
            .with_test_writer()
            .finish(),
    ))
}

pub(crate) fn configuration(end: Option<Position>) -> Result<Configuration, Error> {
    Url::parse("http://localhost:8080")
        .map(|endpoint| {
            Configuration::builder()
                .endpoint(endpoint)
                .logset("ls")
                .topics([TOPIC])
                .group("g")
                .member("m")
                .group_timeout(Duration::from_secs(3))
                .heartbeat_interval(Duration::from_secs(1))
                .data_fetch_interval(Duration::from_secs(1))
                .max_batch_size(2)
                .end(end)
                .build()
        })
        .map_err(Into::into)
}

pub(crate) fn records(n: u64) -> Vec<Record> {
    (0..n)
        .map(|i| Record {
            timestamp: UNIX_EPOCH + Duration::from_secs(1_000 + i),
            content: Bytes::from(format!("record-{i}")),
        })
        .collect()
}

#[derive(Debug, Default)]
struct Log {
    partitions: BTreeMap<TopicPartition, Vec<Record>>,
    checkpoints: BTreeMap<TopicPartition, Cursor>,
    commits: Vec<(TopicPartition, String, Cursor)>,
    assignment: Vec<TopicPartitions>,
    hearts: Vec<Vec<TopicPartitions>>,
}

/// log service held in memory, cursors are record offsets
#[derive(Clone, Debug, Default)]
pub(crate) struct MemoryClient {
    log: Arc<Mutex<Log>>,
    groups_created: Arc<AtomicUsize>,
    refuse_group: Arc<AtomicBool>,
    refuse_heartbeat: Arc<AtomicBool>,
}

impl MemoryClient {
    pub(crate) fn with_partition(self, partition: i32, records: Vec<Record>) -> Self {
        _ = self
            .log
            .lock()
            .unwrap()
            .partitions
            .insert(TopicPartition::new(TOPIC, partition), records);
        self
    }

    pub(crate) fn assign(&self, partitions: impl IntoIterator<Item = i32>) {
        self.log.lock().unwrap().assignment = vec![TopicPartitions::new(TOPIC, partitions)];
    }

    pub(crate) fn checkpoint_at(&self, partition: i32, cursor: &str) {
        _ = self
            .log
            .lock()
            .unwrap()
            .checkpoints
            .insert(TopicPartition::new(TOPIC, partition), Cursor::from(cursor));
    }

    pub(crate) fn refuse_group(&self) {
        self.refuse_group.store(true, Ordering::SeqCst)
    }

    pub(crate) fn refuse_heartbeat(&self, refuse: bool) {
        self.refuse_heartbeat.store(refuse, Ordering::SeqCst)
    }

    pub(crate) fn groups_created(&self) -> usize {
        self.groups_created.load(Ordering::SeqCst)
    }

    pub(crate) fn committed(&self, partition: i32) -> Option<Cursor> {
        self.log
            .lock()
            .unwrap()
            .checkpoints
            .get(&TopicPartition::new(TOPIC, partition))
            .cloned()
    }

    pub(crate) fn commits(&self) -> usize {
        self.log.lock().unwrap().commits.len()
    }

    /// the partitions reported by the most recent heartbeat
    pub(crate) fn last_heart(&self) -> Option<Vec<TopicPartitions>> {
        self.log.lock().unwrap().hearts.last().cloned()
    }

    pub(crate) fn heartbeats(&self) -> usize {
        self.log.lock().unwrap().hearts.len()
    }

    fn offset(cursor: &Cursor) -> cls_consumer::Result<usize> {
        cursor
            .as_str()
            .parse()
            .map_err(|_| cls_consumer::Error::Message(format!("bad cursor: {cursor}")))
    }
}

#[async_trait]
impl ConsumerClient for MemoryClient {
    async fn create_consumer_group(&self, _timeout: Duration) -> cls_consumer::Result<()> {
        if self.refuse_group.load(Ordering::SeqCst) {
            return Err(cls_consumer::Error::Message("group refused".into()));
        }

        _ = self.groups_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn heartbeat(
        &self,
        held: &[TopicPartitions],
    ) -> cls_consumer::Result<Vec<TopicPartitions>> {
        let mut log = self.log.lock().unwrap();
        log.hearts.push(held.to_vec());

        if self.refuse_heartbeat.load(Ordering::SeqCst) {
            return Err(cls_consumer::Error::Message("heartbeat refused".into()));
        }

        Ok(log.assignment.clone())
    }

    async fn checkpoint(&self, partition: &TopicPartition) -> cls_consumer::Result<Option<Cursor>> {
        Ok(self.log.lock().unwrap().checkpoints.get(partition).cloned())
    }

    async fn cursor(
        &self,
        partition: &TopicPartition,
        position: Position,
    ) -> cls_consumer::Result<Cursor> {
        let log = self.log.lock().unwrap();
        let records = log
            .partitions
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let offset = match position {
            Position::Begin => 0,
            Position::End => records.len(),
            Position::At(time) => records
                .iter()
                .position(|record| record.timestamp >= time)
                .unwrap_or(records.len()),
        };

        Ok(Cursor::new(offset.to_string()))
    }

    async fn fetch(
        &self,
        partition: &TopicPartition,
        cursor: &Cursor,
        max_batch_size: u32,
        end: Option<&Cursor>,
    ) -> cls_consumer::Result<Fetched> {
        let from = Self::offset(cursor)?;
        let end = end.map(Self::offset).transpose()?;

        let log = self.log.lock().unwrap();
        let records = log
            .partitions
            .get(partition)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let upto = (from + max_batch_size as usize)
            .min(end.unwrap_or(records.len()))
            .min(records.len())
            .max(from);

        Ok(Fetched {
            records: records[from..upto].to_vec(),
            next_cursor: Cursor::new(upto.to_string()),
        })
    }

    async fn commit(
        &self,
        partition: &TopicPartition,
        member: &str,
        cursor: &Cursor,
    ) -> cls_consumer::Result<()> {
        let mut log = self.log.lock().unwrap();
        _ = log.checkpoints.insert(partition.clone(), cursor.clone());
        log.commits
            .push((partition.clone(), member.into(), cursor.clone()));
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct CollectingProcessor {
    processed: Arc<Mutex<Vec<(TopicPartition, Record)>>>,
    shutdowns: Arc<Mutex<Vec<TopicPartition>>>,
}

impl CollectingProcessor {
    pub(crate) fn processed(&self, partition: i32) -> Vec<Record> {
        self.processed
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| *key == TopicPartition::new(TOPIC, partition))
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub(crate) fn shutdowns(&self) -> Vec<TopicPartition> {
        self.shutdowns.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for CollectingProcessor {
    async fn process(
        &mut self,
        partition: &TopicPartition,
        records: &[Record],
    ) -> Result<(), BoxError> {
        self.processed.lock().unwrap().extend(
            records
                .iter()
                .cloned()
                .map(|record| (partition.clone(), record)),
        );
        Ok(())
    }

    async fn shutdown(&mut self, partition: &TopicPartition) -> Result<(), BoxError> {
        self.shutdowns.lock().unwrap().push(partition.clone());
        Ok(())
    }
}

pub(crate) fn timestamp(seconds: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds)
}
