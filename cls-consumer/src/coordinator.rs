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
    collections::{BTreeMap, btree_map::Entry},
    fmt,
    sync::{Arc, LazyLock},
    time::Duration,
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, Level, debug, error, info, span, warn};

use crate::{
    Assignment, Configuration, ConsumerClient, ConsumerFactory, ConsumerHeartbeat, Error,
    ExecutionPool, Heartbeat, HeldPartitions, Identity, METER, MakeProcessor, PartitionWorker, Processor, Result,
    TopicPartition, WorkerFactory,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// monotonic shutdown shared by the control loop and its handle
struct Signal<H> {
    identity: Identity,
    cancellation: CancellationToken,
    heartbeat: Arc<H>,
}

impl<H> Clone for Signal<H> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            cancellation: self.cancellation.clone(),
            heartbeat: self.heartbeat.clone(),
        }
    }
}

impl<H> fmt::Debug for Signal<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Signal))
            .field("identity", &self.identity)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl<H> Signal<H>
where
    H: Heartbeat,
{
    fn shutdown(&self) {
        if !self.cancellation.is_cancelled() {
            info!(consumer = %self.identity, "stop requested");
        }

        self.cancellation.cancel();
        self.heartbeat.shutdown();
    }

    fn is_shutdown(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Consumer coordinator.
///
/// Each cycle reads the partitions held by this member from the heartbeat,
/// creates and advances a worker for every held partition, evicts workers of
/// partitions that are no longer held and checks whether a bounded stream has
/// been consumed. On shutdown every worker is drained before the pool is
/// released.
pub struct Coordinator<H, F>
where
    F: WorkerFactory,
{
    configuration: Configuration,
    signal: Signal<H>,
    heartbeat: Arc<H>,
    factory: F,
    pool: ExecutionPool,
    owns_pool: bool,
    workers: BTreeMap<TopicPartition, F::Worker>,
    all_finished_since: Option<Instant>,
}

impl<H, F> fmt::Debug for Coordinator<H, F>
where
    H: fmt::Debug,
    F: WorkerFactory + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Coordinator))
            .field("identity", &self.signal.identity)
            .field("heartbeat", &self.heartbeat)
            .field("factory", &self.factory)
            .field("pool", &self.pool)
            .field("owns_pool", &self.owns_pool)
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .field("all_finished_since", &self.all_finished_since)
            .finish()
    }
}

impl<C, P> Coordinator<ConsumerHeartbeat<C>, ConsumerFactory<C, P>>
where
    C: ConsumerClient,
    P: Processor,
{
    /// register the consumer group, failing when it cannot be registered
    pub async fn new(
        configuration: Configuration,
        client: C,
        make_processor: MakeProcessor<P>,
    ) -> Result<Self> {
        let identity = configuration.identity();

        client
            .create_consumer_group(configuration.group_timeout())
            .await
            .inspect(|_| debug!(consumer = %identity, "consumer group created"))
            .inspect_err(|error| error!(consumer = %identity, %error, "create consumer group"))?;

        let heartbeat = ConsumerHeartbeat::new(client.clone(), &configuration);
        let factory = ConsumerFactory::new(client, make_processor);

        Ok(Self::with(configuration, heartbeat, factory))
    }
}

impl<H, F> Coordinator<H, F>
where
    H: Heartbeat,
    F: WorkerFactory,
{
    /// Assemble a coordinator from an existing heartbeat and worker factory.
    ///
    /// No consumer group is registered here: the caller is responsible for
    /// the group already existing, as [`Coordinator::new`] ensures before
    /// building the default heartbeat and factory.
    pub fn with(configuration: Configuration, heartbeat: H, factory: F) -> Self {
        let (pool, owns_pool) = configuration.pool().cloned().map_or_else(
            || (ExecutionPool::new(configuration.worker_pool_size()), true),
            |pool| (pool, false),
        );

        let heartbeat = Arc::new(heartbeat);

        Self {
            signal: Signal {
                identity: configuration.identity(),
                cancellation: CancellationToken::new(),
                heartbeat: heartbeat.clone(),
            },
            configuration,
            heartbeat,
            factory,
            pool,
            owns_pool,
            workers: BTreeMap::new(),
            all_finished_since: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.signal.identity
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn shutdown(&self) {
        self.signal.shutdown()
    }

    fn attributes(&self) -> [KeyValue; 1] {
        [KeyValue::new("consumer", self.signal.identity.to_string())]
    }

    /// the worker of a held partition, created when not already present
    fn worker(&mut self, partition: &TopicPartition) -> Result<&mut F::Worker> {
        match self.workers.entry(partition.clone()) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),

            Entry::Vacant(vacant) => self
                .factory
                .worker(Assignment {
                    partition: partition.clone(),
                    member: self.configuration.member().into(),
                    start: self.configuration.start(),
                    end: self.configuration.end(),
                    max_batch_size: self.configuration.max_batch_size(),
                    pool: self.pool.clone(),
                })
                .inspect(|_| {
                    WORKERS_CREATED.add(
                        1,
                        &[KeyValue::new("consumer", self.signal.identity.to_string())],
                    );
                    info!(consumer = %self.signal.identity, %partition, "worker created");
                })
                .inspect_err(|error| {
                    error!(consumer = %self.signal.identity, %partition, %error, "worker creation failed")
                })
                .map(|worker| vacant.insert(worker)),
        }
    }

    /// advance the worker of every held partition in snapshot order
    fn consume(&mut self, held: &HeldPartitions) -> Result<()> {
        for partition in held.iter() {
            if self.signal.is_shutdown() {
                break;
            }

            self.worker(&partition)?.consume();
        }

        Ok(())
    }

    /// shut down workers of partitions no longer held, removing any that
    /// have completed their shutdown
    fn reconcile(&mut self, held: &HeldPartitions) {
        let mut removed = Vec::new();

        for (partition, worker) in self.workers.iter_mut() {
            if !held.contains(partition) {
                debug!(consumer = %self.signal.identity, %partition, "shut down unassigned");
                worker.shut_down();
            }

            if worker.is_shutdown() {
                info!(consumer = %self.signal.identity, %partition, "remove");

                if let Err(error) = self.heartbeat.remove_partition(partition) {
                    warn!(consumer = %self.signal.identity, %partition, %error);
                }

                removed.push(partition.clone());
            }
        }

        for partition in removed {
            if self.workers.remove(&partition).is_some() {
                WORKERS_REMOVED.add(1, &self.attributes());
            }
        }
    }

    /// Every held partition has consumed up to the end position, and has
    /// done so for longer than a heartbeat renewal could revoke it.
    fn need_stop(&mut self, held: &HeldPartitions, now: Instant) -> bool {
        if self.configuration.end().is_none() {
            return false;
        }

        let all_finished = self
            .workers
            .iter()
            .filter(|(partition, worker)| held.contains(partition) && !worker.is_shutdown())
            .all(|(_, worker)| {
                // never fetched or still receiving data
                let active =
                    worker.last_success_fetch_time().is_none() || worker.last_fetch_count() > 0;

                !active || worker.next_task_reach_end()
            });

        if !all_finished {
            self.all_finished_since = None;
            return false;
        }

        let since = *self.all_finished_since.get_or_insert(now);

        now.saturating_duration_since(since)
            >= self.configuration.group_timeout() + self.configuration.heartbeat_interval()
    }

    /// shut down workers one at a time until every one has shut down
    async fn drain(&mut self) {
        info!(consumer = %self.signal.identity, workers = self.workers.len(), "draining");

        loop {
            sleep(DRAIN_POLL_INTERVAL).await;

            let Some((partition, worker)) = self
                .workers
                .iter_mut()
                .find(|(_, worker)| !worker.is_shutdown())
            else {
                break;
            };

            debug!(consumer = %self.signal.identity, %partition, "shut down");
            worker.shut_down();
        }

        self.workers.clear();
    }

    async fn run(mut self) -> Result<()> {
        info!(consumer = %self.signal.identity, "started");
        self.heartbeat.start();

        let mut failure = None;

        while !self.signal.is_shutdown() {
            let held = self.heartbeat.held_partitions();
            let cycle_start = Instant::now();
            debug!(consumer = %self.signal.identity, ?held);

            if let Err(error) = self.consume(&held) {
                self.shutdown();
                failure = Some(error);
            }

            self.reconcile(&held);

            if self.need_stop(&held, Instant::now()) {
                info!(
                    consumer = %self.signal.identity,
                    workers = ?self.workers.keys().collect::<Vec<_>>(),
                    "all owned partitions complete"
                );

                self.shutdown();
            }

            CYCLES.add(1, &self.attributes());
            CYCLE_DURATION.record(
                cycle_start.elapsed().as_millis() as u64,
                &self.attributes(),
            );

            tokio::select! {
                _ = sleep_until(cycle_start + self.configuration.data_fetch_interval()) => (),
                cancelled = self.signal.cancellation.cancelled() => debug!(?cancelled),
            }
        }

        self.drain().await;

        if self.owns_pool {
            info!(consumer = %self.signal.identity, "closing pool");
            self.pool.close().await;
            info!(consumer = %self.signal.identity, "stopped");
        } else {
            info!(consumer = %self.signal.identity, "pool is shared, stopped");
        }

        failure.map_or(Ok(()), Err)
    }

    /// run the control loop as an independent task
    pub fn start(self) -> Handle<H> {
        let signal = self.signal.clone();
        let span = span!(Level::DEBUG, "coordinator", consumer = %signal.identity);

        Handle {
            task: tokio::spawn(self.run().instrument(span)),
            signal,
        }
    }

    /// run until stopped by an interrupt or terminate signal
    pub async fn main(self) -> Result<()> {
        let cancellation = CancellationToken::new();
        let signals = cancel_on_signal(cancellation.clone())?;

        self.start().join_signalled(cancellation, signals).await
    }
}

/// Control of a started [`Coordinator`].
#[derive(Debug)]
pub struct Handle<H> {
    signal: Signal<H>,
    task: JoinHandle<Result<()>>,
}

impl<H> Handle<H>
where
    H: Heartbeat,
{
    /// request shutdown without waiting for it to complete
    pub fn shutdown(&self) {
        self.signal.shutdown()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// wait for the control loop to exit
    pub async fn wait(self) -> Result<()> {
        self.task.await?
    }

    /// Wait for the control loop to exit, converting cancellation into a
    /// graceful shutdown.
    pub async fn join(mut self, cancellation: CancellationToken) -> Result<()> {
        tokio::select! {
            joined = &mut self.task => {
                info!(consumer = %self.signal.identity, "exited");
                self.shutdown();
                return joined?
            }

            cancelled = cancellation.cancelled() => {
                debug!(?cancelled);
                info!(consumer = %self.signal.identity, "cancelled, try to exit");
                self.shutdown();
            }
        }

        self.task.await?
    }

    /// join, shutting down on an interrupt or terminate signal
    pub async fn join_with_signals(self) -> Result<()> {
        let cancellation = CancellationToken::new();

        match cancel_on_signal(cancellation.clone()) {
            Ok(signals) => self.join_signalled(cancellation, signals).await,
            Err(error) => self.abandon(error).await,
        }
    }

    async fn join_signalled(
        self,
        cancellation: CancellationToken,
        signals: JoinHandle<()>,
    ) -> Result<()> {
        let joined = self.join(cancellation.clone()).await;

        cancellation.cancel();
        signals.await?;

        joined
    }

    /// shut down and wait for the control loop before reporting an error
    async fn abandon(self, error: Error) -> Result<()> {
        error!(consumer = %self.signal.identity, %error);
        self.shutdown();

        if let Err(exited) = self.wait().await {
            warn!(%exited);
        }

        Err(error)
    }
}

/// cancel once an interrupt or terminate signal is received
fn cancel_on_signal(cancellation: CancellationToken) -> Result<JoinHandle<()>> {
    let mut interrupt_signal = signal(SignalKind::interrupt())?;
    debug!(?interrupt_signal);

    let mut terminate_signal = signal(SignalKind::terminate())?;
    debug!(?terminate_signal);

    Ok(tokio::spawn(async move {
        tokio::select! {
            interrupt = interrupt_signal.recv() => debug!(?interrupt),
            terminate = terminate_signal.recv() => debug!(?terminate),
            cancelled = cancellation.cancelled() => debug!(?cancelled),
        }

        cancellation.cancel();
    }))
}

static WORKERS_CREATED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("partition_workers_created")
        .with_description("Partition workers created")
        .build()
});

static WORKERS_REMOVED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("partition_workers_removed")
        .with_description("Partition workers removed after shutdown")
        .build()
});

static CYCLES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("coordinator_cycles")
        .with_description("Reconciliation cycles")
        .build()
});

static CYCLE_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("coordinator_cycle_duration")
        .with_unit("ms")
        .with_description("The reconciliation cycle latencies in milliseconds")
        .build()
});
