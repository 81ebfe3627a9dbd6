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
    collections::{BTreeMap, BTreeSet},
    fmt,
};

pub type PartitionId = i32;

/// a partition of a topic, the key of the worker set
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TopicPartition {
    topic: String,
    partition: PartitionId,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// the partitions of a single topic, as exchanged with the membership service
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TopicPartitions {
    pub topic: String,
    pub partitions: BTreeSet<PartitionId>,
}

impl TopicPartitions {
    pub fn new(
        topic: impl Into<String>,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partitions: partitions.into_iter().collect(),
        }
    }
}

/// Snapshot of the partitions currently held by this member.
///
/// Topic order is preserved as returned by the heartbeat, partitions within a
/// topic are in ascending order.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct HeldPartitions(Vec<TopicPartitions>);

impl HeldPartitions {
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|topic| topic.partitions.is_empty())
    }

    pub fn contains(&self, key: &TopicPartition) -> bool {
        self.0
            .iter()
            .find(|held| held.topic == key.topic())
            .is_some_and(|held| held.partitions.contains(&key.partition()))
    }

    /// every held partition in snapshot order
    pub fn iter(&self) -> impl Iterator<Item = TopicPartition> + '_ {
        self.0.iter().flat_map(|held| {
            held.partitions
                .iter()
                .map(|partition| TopicPartition::new(held.topic.as_str(), *partition))
        })
    }

    pub fn topics(&self) -> &[TopicPartitions] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<TopicPartitions> {
        self.0
    }
}

impl From<Vec<TopicPartitions>> for HeldPartitions {
    fn from(value: Vec<TopicPartitions>) -> Self {
        Self(value)
    }
}

impl FromIterator<TopicPartition> for HeldPartitions {
    fn from_iter<T: IntoIterator<Item = TopicPartition>>(iter: T) -> Self {
        let mut topics = Vec::<TopicPartitions>::new();
        let mut index = BTreeMap::new();

        for key in iter {
            let position = *index.entry(key.topic.clone()).or_insert_with(|| {
                topics.push(TopicPartitions::new(key.topic.as_str(), []));
                topics.len() - 1
            });

            _ = topics[position].partitions.insert(key.partition);
        }

        Self(topics)
    }
}
