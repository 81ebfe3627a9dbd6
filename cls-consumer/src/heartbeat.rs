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
    collections::BTreeSet,
    fmt::Debug,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use opentelemetry::{KeyValue, metrics::Counter};
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, Level, debug, info, span, warn};

use crate::{
    Configuration, ConsumerClient, Error, HeldPartitions, Identity, METER, Result, TopicPartition,
    TopicPartitions,
};

/// Group membership renewal.
///
/// Renews membership in the background and exposes the partitions most
/// recently assigned to this member.
pub trait Heartbeat: Debug + Send + Sync + 'static {
    /// begin renewing membership, calling more than once has no further effect
    fn start(&self);

    /// stop renewing membership, calling more than once has no further effect
    fn shutdown(&self);

    /// the partitions currently held, without waiting on the network
    fn held_partitions(&self) -> HeldPartitions;

    /// stop reporting a partition as consumed so that it is released on the
    /// next renewal
    fn remove_partition(&self, partition: &TopicPartition) -> Result<()>;
}

#[derive(Debug, Default)]
struct Membership {
    held: HeldPartitions,
    heart: BTreeSet<TopicPartition>,
    renewed_at: Option<Instant>,
}

#[derive(Debug)]
struct Renewal<C> {
    client: C,
    identity: Identity,
    topics: Vec<String>,
    timeout: Duration,
    membership: Arc<Mutex<Membership>>,
}

impl<C> Renewal<C>
where
    C: ConsumerClient,
{
    fn heart(&self) -> Result<Vec<TopicPartitions>> {
        let membership = self.membership.lock()?;

        Ok(self
            .topics
            .iter()
            .map(|topic| {
                TopicPartitions::new(
                    topic.as_str(),
                    membership
                        .heart
                        .iter()
                        .filter(|key| key.topic() == topic)
                        .map(TopicPartition::partition),
                )
            })
            .collect())
    }

    async fn renew(&self) -> Result<()> {
        let heart = self.heart()?;
        debug!(consumer = %self.identity, ?heart);

        match timeout(self.timeout, self.client.heartbeat(&heart))
            .await
            .map_err(Error::from)
            .and_then(|assigned| assigned)
        {
            Ok(assigned) => {
                let held = HeldPartitions::from(assigned);
                debug!(consumer = %self.identity, ?held);

                let mut membership = self.membership.lock()?;
                membership.heart.extend(held.iter());
                membership.held = held;
                membership.renewed_at = Some(Instant::now());

                Ok(())
            }

            Err(error) => {
                HEARTBEAT_FAILURES.add(1, &[KeyValue::new("consumer", self.identity.to_string())]);
                warn!(consumer = %self.identity, %error, "heartbeat failed");

                let mut membership = self.membership.lock()?;

                if membership
                    .renewed_at
                    .is_none_or(|renewed_at| renewed_at.elapsed() >= self.timeout)
                    && !membership.held.is_empty()
                {
                    info!(consumer = %self.identity, held = ?membership.held, "membership lost");
                    membership.held = HeldPartitions::default();
                }

                Err(error)
            }
        }
    }
}

/// [`Heartbeat`] renewing membership through a [`ConsumerClient`].
#[derive(Debug)]
pub struct ConsumerHeartbeat<C> {
    renewal: Arc<Renewal<C>>,
    interval: Duration,
    cancellation: CancellationToken,
    started: AtomicBool,
}

impl<C> ConsumerHeartbeat<C>
where
    C: ConsumerClient,
{
    pub fn new(client: C, configuration: &Configuration) -> Self {
        Self {
            renewal: Arc::new(Renewal {
                client,
                identity: configuration.identity(),
                topics: configuration.topics().to_vec(),
                timeout: configuration.group_timeout(),
                membership: Arc::new(Mutex::new(Membership::default())),
            }),
            interval: configuration.heartbeat_interval(),
            cancellation: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// the partitions reported as consumed on the next renewal
    pub fn heart_partitions(&self) -> HeldPartitions {
        self.renewal
            .membership
            .lock()
            .map(|membership| membership.heart.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl<C> Heartbeat for ConsumerHeartbeat<C>
where
    C: ConsumerClient,
{
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let renewal = self.renewal.clone();
        let cancellation = self.cancellation.clone();
        let period = self.interval;

        let span = span!(Level::DEBUG, "heartbeat", consumer = %renewal.identity);

        _ = tokio::spawn(
            async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        cancelled = cancellation.cancelled() => {
                            debug!(?cancelled);
                            break
                        }

                        _ = ticker.tick() => {
                            _ = renewal.renew().await;
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    fn shutdown(&self) {
        if !self.cancellation.is_cancelled() {
            info!(consumer = %self.renewal.identity, "heartbeat stopping");
            self.cancellation.cancel();
        }
    }

    fn held_partitions(&self) -> HeldPartitions {
        self.renewal
            .membership
            .lock()
            .map(|membership| membership.held.clone())
            .inspect_err(|error| warn!(consumer = %self.renewal.identity, %error))
            .unwrap_or_default()
    }

    fn remove_partition(&self, partition: &TopicPartition) -> Result<()> {
        let mut membership = self.renewal.membership.lock()?;

        if membership.heart.remove(partition) {
            debug!(consumer = %self.renewal.identity, %partition, "released");
        }

        Ok(())
    }
}

static HEARTBEAT_FAILURES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("heartbeat_failures")
        .with_description("Failed group membership renewals")
        .build()
});
