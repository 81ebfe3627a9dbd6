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

use std::{any::type_name, fmt, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use futures::FutureExt as _;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{Instrument as _, Level, debug, error, span, warn};

use crate::{
    BoxError, ConsumerClient, Cursor, Error, ExecutionPool, Position, Record, Result,
    TopicPartition,
};

/// Fetch, process and commit cycle of a single partition.
///
/// Every method returns without waiting for partition work to complete, the
/// work itself runs on an [`ExecutionPool`].
pub trait PartitionWorker: Send + 'static {
    /// advance by one fetch, process and commit step
    fn consume(&mut self);

    /// request termination, calling more than once has no further effect
    fn shut_down(&mut self);

    /// true once terminated
    fn is_shutdown(&self) -> bool;

    /// when the last fetch succeeded, `None` when no fetch has succeeded
    fn last_success_fetch_time(&self) -> Option<SystemTime>;

    /// the number of records returned by the most recent fetch
    fn last_fetch_count(&self) -> usize;

    /// true once the end position has been reached with no more data before it
    fn next_task_reach_end(&self) -> bool;
}

/// Everything a worker needs to consume a partition held by this member.
#[derive(Clone, Debug)]
pub struct Assignment {
    pub partition: TopicPartition,
    pub member: String,
    pub start: Position,
    pub end: Option<Position>,
    pub max_batch_size: u32,
    pub pool: ExecutionPool,
}

pub trait WorkerFactory: Send + Sync + 'static {
    type Worker: PartitionWorker;

    /// create a worker for a newly held partition
    fn worker(&self, assignment: Assignment) -> Result<Self::Worker>;
}

/// Application processing of the records fetched from a partition.
#[async_trait]
pub trait Processor: Send + 'static {
    async fn process(
        &mut self,
        partition: &TopicPartition,
        records: &[Record],
    ) -> Result<(), BoxError>;

    /// called once when the partition is no longer consumed
    async fn shutdown(&mut self, _partition: &TopicPartition) -> Result<(), BoxError> {
        Ok(())
    }
}

/// creates a processor for each partition
pub type MakeProcessor<P> = Arc<dyn Fn() -> Result<P, BoxError> + Send + Sync>;

/// [`WorkerFactory`] of [`PartitionConsumer`]s
pub struct ConsumerFactory<C, P> {
    client: C,
    make_processor: MakeProcessor<P>,
}

impl<C, P> ConsumerFactory<C, P> {
    pub fn new(client: C, make_processor: MakeProcessor<P>) -> Self {
        Self {
            client,
            make_processor,
        }
    }
}

impl<C, P> fmt::Debug for ConsumerFactory<C, P>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(ConsumerFactory))
            .field("client", &self.client)
            .field("processor", &type_name::<P>())
            .finish()
    }
}

impl<C, P> WorkerFactory for ConsumerFactory<C, P>
where
    C: ConsumerClient,
    P: Processor,
{
    type Worker = PartitionConsumer<C, P>;

    fn worker(&self, assignment: Assignment) -> Result<Self::Worker> {
        match (self.make_processor)() {
            Ok(processor) => Ok(PartitionConsumer::new(
                self.client.clone(),
                assignment,
                processor,
            )),

            Err(error) => Err(Error::ProcessorInit {
                processor: type_name::<P>(),
                partition: assignment.partition,
                error,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Status {
    Initializing,
    Processing,
    ShuttingDown,
    Shutdown,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Outcome {
    Initialized {
        cursor: Cursor,
        end: Option<Cursor>,
    },

    Fetched {
        count: usize,
        next_cursor: Cursor,
    },

    ShutDown,
}

/// [`PartitionWorker`] fetching through a [`ConsumerClient`] into a [`Processor`].
///
/// Each step is a single task on the pool. A step is only submitted once the
/// previous one has completed, so a partition never has more than one task in
/// flight.
pub struct PartitionConsumer<C, P> {
    client: C,
    assignment: Assignment,
    processor: Arc<Mutex<P>>,
    status: Status,
    shutdown_requested: bool,
    cursor: Option<Cursor>,
    end_cursor: Option<Cursor>,
    in_flight: Option<JoinHandle<Result<Outcome>>>,
    last_success_fetch_time: Option<SystemTime>,
    last_fetch_count: usize,
    next_task_reach_end: bool,
}

impl<C, P> fmt::Debug for PartitionConsumer<C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(PartitionConsumer))
            .field("partition", &self.assignment.partition)
            .field("status", &self.status)
            .field("cursor", &self.cursor)
            .field("end_cursor", &self.end_cursor)
            .field("in_flight", &self.in_flight.is_some())
            .field("last_fetch_count", &self.last_fetch_count)
            .field("next_task_reach_end", &self.next_task_reach_end)
            .finish()
    }
}

impl<C, P> PartitionConsumer<C, P>
where
    C: ConsumerClient,
    P: Processor,
{
    pub fn new(client: C, assignment: Assignment, processor: P) -> Self {
        Self {
            client,
            assignment,
            processor: Arc::new(Mutex::new(processor)),
            status: Status::Initializing,
            shutdown_requested: false,
            cursor: None,
            end_cursor: None,
            in_flight: None,
            last_success_fetch_time: None,
            last_fetch_count: 0,
            next_task_reach_end: false,
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.assignment.partition
    }

    /// collect the outcome of a completed step, returning false while a step
    /// is still running
    fn collect(&mut self) -> bool {
        let Some(handle) = self.in_flight.as_mut() else {
            return true;
        };

        if !handle.is_finished() {
            return false;
        }

        let joined = handle.now_or_never();
        self.in_flight = None;

        match joined.map(|joined| joined.map_err(Error::from).and_then(|outcome| outcome)) {
            Some(Ok(outcome)) => self.completed(outcome),

            Some(Err(error)) => {
                warn!(partition = %self.assignment.partition, status = ?self.status, %error);

                if self.status == Status::ShuttingDown {
                    self.status = Status::Shutdown;
                }
            }

            None => {
                debug!(partition = %self.assignment.partition, status = ?self.status);
            }
        }

        true
    }

    fn completed(&mut self, outcome: Outcome) {
        debug!(partition = %self.assignment.partition, ?outcome);

        match outcome {
            Outcome::Initialized { cursor, end } => {
                self.cursor = Some(cursor);
                self.end_cursor = end;

                if self.status == Status::Initializing {
                    self.status = Status::Processing;
                }
            }

            Outcome::Fetched { count, next_cursor } => {
                self.last_success_fetch_time = Some(SystemTime::now());
                self.last_fetch_count = count;
                self.next_task_reach_end = self
                    .end_cursor
                    .as_ref()
                    .is_some_and(|end| *end == next_cursor);
                self.cursor = Some(next_cursor);
            }

            Outcome::ShutDown => self.status = Status::Shutdown,
        }
    }

    fn step(&mut self) {
        if !self.collect() || self.status == Status::Shutdown {
            return;
        }

        if self.shutdown_requested {
            self.status = Status::ShuttingDown;
            self.in_flight = Some(self.submit_shutdown());
            return;
        }

        match self.status {
            Status::Initializing => self.in_flight = Some(self.submit_initialize()),

            Status::Processing if !self.next_task_reach_end => {
                if let Some(cursor) = self.cursor.clone() {
                    self.in_flight = Some(self.submit_fetch(cursor))
                }
            }

            _ => (),
        }
    }

    fn span(&self) -> tracing::Span {
        span!(
            Level::DEBUG,
            "partition",
            partition = %self.assignment.partition,
            member = %self.assignment.member
        )
    }

    fn submit_initialize(&self) -> JoinHandle<Result<Outcome>> {
        let client = self.client.clone();
        let partition = self.assignment.partition.clone();
        let start = self.assignment.start;
        let end = self.assignment.end;

        self.assignment.pool.spawn(
            async move {
                let cursor = match client.checkpoint(&partition).await? {
                    Some(checkpoint) => checkpoint,
                    None => client.cursor(&partition, start).await?,
                };

                let end = match end {
                    Some(position) => Some(client.cursor(&partition, position).await?),
                    None => None,
                };

                debug!(%cursor, ?end);
                Ok(Outcome::Initialized { cursor, end })
            }
            .instrument(self.span()),
        )
    }

    fn submit_fetch(&self, cursor: Cursor) -> JoinHandle<Result<Outcome>> {
        let client = self.client.clone();
        let partition = self.assignment.partition.clone();
        let member = self.assignment.member.clone();
        let max_batch_size = self.assignment.max_batch_size;
        let end = self.end_cursor.clone();
        let processor = self.processor.clone();

        self.assignment.pool.spawn(
            async move {
                let fetched = client
                    .fetch(&partition, &cursor, max_batch_size, end.as_ref())
                    .await?;

                let count = fetched.records.len();
                debug!(%cursor, count, next_cursor = %fetched.next_cursor);

                if count > 0 {
                    processor
                        .lock()
                        .await
                        .process(&partition, &fetched.records)
                        .await
                        .map_err(|error| Error::Processing {
                            partition: partition.clone(),
                            error,
                        })?;
                }

                if fetched.next_cursor != cursor {
                    client
                        .commit(&partition, &member, &fetched.next_cursor)
                        .await?;
                }

                Ok(Outcome::Fetched {
                    count,
                    next_cursor: fetched.next_cursor,
                })
            }
            .instrument(self.span()),
        )
    }

    fn submit_shutdown(&self) -> JoinHandle<Result<Outcome>> {
        let client = self.client.clone();
        let partition = self.assignment.partition.clone();
        let member = self.assignment.member.clone();
        let cursor = self.cursor.clone();
        let processor = self.processor.clone();

        self.assignment.pool.spawn(
            async move {
                if let Err(error) = processor.lock().await.shutdown(&partition).await {
                    error!(%partition, %error, "processor shutdown");
                }

                if let Some(ref cursor) = cursor {
                    client.commit(&partition, &member, cursor).await?;
                }

                Ok(Outcome::ShutDown)
            }
            .instrument(self.span()),
        )
    }
}

impl<C, P> PartitionWorker for PartitionConsumer<C, P>
where
    C: ConsumerClient,
    P: Processor,
{
    fn consume(&mut self) {
        self.step()
    }

    fn shut_down(&mut self) {
        self.shutdown_requested = true;
        self.step()
    }

    fn is_shutdown(&self) -> bool {
        self.status == Status::Shutdown
    }

    fn last_success_fetch_time(&self) -> Option<SystemTime> {
        self.last_success_fetch_time
    }

    fn last_fetch_count(&self) -> usize {
        self.last_fetch_count
    }

    fn next_task_reach_end(&self) -> bool {
        self.next_task_reach_end
    }
}
