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
    marker::PhantomData,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use url::Url;

use crate::{Error, ExecutionPool, Result};

const DEFAULT_GROUP_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_DATA_FETCH_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_BATCH_SIZE: u32 = 1_000;
const DEFAULT_WORKER_POOL_SIZE: usize = 2;

/// where to start (or stop) consuming a partition
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Position {
    #[default]
    Begin,
    End,
    At(SystemTime),
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "begin" => Ok(Self::Begin),
            "end" => Ok(Self::End),
            otherwise => otherwise
                .parse::<u64>()
                .map(|seconds| Self::At(UNIX_EPOCH + Duration::from_secs(seconds)))
                .map_err(|_| Error::Position(otherwise.into())),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => f.write_str("begin"),
            Self::End => f.write_str("end"),
            Self::At(time) => write!(
                f,
                "{}",
                time.duration_since(UNIX_EPOCH)
                    .map_or(0, |duration| duration.as_secs())
            ),
        }
    }
}

#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Credentials {
    access_key_id: String,
    access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key: access_key.into(),
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Consumer identity prefixed on every log line: `logset/[topics]/group/member`.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Identity(String);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct Configuration {
    endpoint: Url,
    credentials: Option<Credentials>,
    logset: String,
    topics: Vec<String>,
    group: String,
    member: String,
    group_timeout: Duration,
    heartbeat_interval: Duration,
    data_fetch_interval: Duration,
    start: Position,
    end: Option<Position>,
    max_batch_size: u32,
    worker_pool_size: usize,
    pool: Option<ExecutionPool>,
}

impl Configuration {
    pub fn builder() -> PhantomBuilder {
        Builder::default()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn logset(&self) -> &str {
        &self.logset
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn group_timeout(&self) -> Duration {
        self.group_timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn data_fetch_interval(&self) -> Duration {
        self.data_fetch_interval
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn end(&self) -> Option<Position> {
        self.end
    }

    pub fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size
    }

    /// an externally owned pool, shared with other consumers
    pub fn pool(&self) -> Option<&ExecutionPool> {
        self.pool.as_ref()
    }

    pub fn identity(&self) -> Identity {
        Identity(format!(
            "{}/{:?}/{}/{}",
            self.logset, self.topics, self.group, self.member
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Builder<E, L, T, G, M> {
    endpoint: E,
    logset: L,
    topics: T,
    group: G,
    member: M,
    credentials: Option<Credentials>,
    group_timeout: Duration,
    heartbeat_interval: Duration,
    data_fetch_interval: Duration,
    start: Position,
    end: Option<Position>,
    max_batch_size: u32,
    worker_pool_size: usize,
    pool: Option<ExecutionPool>,
}

pub type PhantomBuilder = Builder<
    PhantomData<Url>,
    PhantomData<String>,
    PhantomData<Vec<String>>,
    PhantomData<String>,
    PhantomData<String>,
>;

impl Default for PhantomBuilder {
    fn default() -> Self {
        Self {
            endpoint: Default::default(),
            logset: Default::default(),
            topics: Default::default(),
            group: Default::default(),
            member: Default::default(),
            credentials: None,
            group_timeout: DEFAULT_GROUP_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            data_fetch_interval: DEFAULT_DATA_FETCH_INTERVAL,
            start: Position::default(),
            end: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            pool: None,
        }
    }
}

impl<E, L, T, G, M> Builder<E, L, T, G, M> {
    pub fn endpoint(self, endpoint: impl Into<Url>) -> Builder<Url, L, T, G, M> {
        Builder {
            endpoint: endpoint.into(),
            logset: self.logset,
            topics: self.topics,
            group: self.group,
            member: self.member,
            credentials: self.credentials,
            group_timeout: self.group_timeout,
            heartbeat_interval: self.heartbeat_interval,
            data_fetch_interval: self.data_fetch_interval,
            start: self.start,
            end: self.end,
            max_batch_size: self.max_batch_size,
            worker_pool_size: self.worker_pool_size,
            pool: self.pool,
        }
    }

    pub fn logset(self, logset: impl Into<String>) -> Builder<E, String, T, G, M> {
        Builder {
            endpoint: self.endpoint,
            logset: logset.into(),
            topics: self.topics,
            group: self.group,
            member: self.member,
            credentials: self.credentials,
            group_timeout: self.group_timeout,
            heartbeat_interval: self.heartbeat_interval,
            data_fetch_interval: self.data_fetch_interval,
            start: self.start,
            end: self.end,
            max_batch_size: self.max_batch_size,
            worker_pool_size: self.worker_pool_size,
            pool: self.pool,
        }
    }

    pub fn topics<I>(self, topics: I) -> Builder<E, L, Vec<String>, G, M>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Builder {
            endpoint: self.endpoint,
            logset: self.logset,
            topics: topics.into_iter().map(Into::into).collect(),
            group: self.group,
            member: self.member,
            credentials: self.credentials,
            group_timeout: self.group_timeout,
            heartbeat_interval: self.heartbeat_interval,
            data_fetch_interval: self.data_fetch_interval,
            start: self.start,
            end: self.end,
            max_batch_size: self.max_batch_size,
            worker_pool_size: self.worker_pool_size,
            pool: self.pool,
        }
    }

    pub fn group(self, group: impl Into<String>) -> Builder<E, L, T, String, M> {
        Builder {
            endpoint: self.endpoint,
            logset: self.logset,
            topics: self.topics,
            group: group.into(),
            member: self.member,
            credentials: self.credentials,
            group_timeout: self.group_timeout,
            heartbeat_interval: self.heartbeat_interval,
            data_fetch_interval: self.data_fetch_interval,
            start: self.start,
            end: self.end,
            max_batch_size: self.max_batch_size,
            worker_pool_size: self.worker_pool_size,
            pool: self.pool,
        }
    }

    pub fn member(self, member: impl Into<String>) -> Builder<E, L, T, G, String> {
        Builder {
            endpoint: self.endpoint,
            logset: self.logset,
            topics: self.topics,
            group: self.group,
            member: member.into(),
            credentials: self.credentials,
            group_timeout: self.group_timeout,
            heartbeat_interval: self.heartbeat_interval,
            data_fetch_interval: self.data_fetch_interval,
            start: self.start,
            end: self.end,
            max_batch_size: self.max_batch_size,
            worker_pool_size: self.worker_pool_size,
            pool: self.pool,
        }
    }

    pub fn credentials(self, credentials: Option<Credentials>) -> Self {
        Self {
            credentials,
            ..self
        }
    }

    pub fn group_timeout(self, group_timeout: Duration) -> Self {
        Self {
            group_timeout,
            ..self
        }
    }

    pub fn heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            ..self
        }
    }

    pub fn data_fetch_interval(self, data_fetch_interval: Duration) -> Self {
        Self {
            data_fetch_interval,
            ..self
        }
    }

    pub fn start(self, start: Position) -> Self {
        Self { start, ..self }
    }

    pub fn end(self, end: Option<Position>) -> Self {
        Self { end, ..self }
    }

    pub fn max_batch_size(self, max_batch_size: u32) -> Self {
        Self {
            max_batch_size,
            ..self
        }
    }

    pub fn worker_pool_size(self, worker_pool_size: usize) -> Self {
        Self {
            worker_pool_size,
            ..self
        }
    }

    /// share an existing pool rather than creating one
    pub fn pool(self, pool: Option<ExecutionPool>) -> Self {
        Self { pool, ..self }
    }
}

impl Builder<Url, String, Vec<String>, String, String> {
    pub fn build(self) -> Configuration {
        Configuration::from(self)
    }
}

impl From<Builder<Url, String, Vec<String>, String, String>> for Configuration {
    fn from(builder: Builder<Url, String, Vec<String>, String, String>) -> Self {
        Self {
            endpoint: builder.endpoint,
            credentials: builder.credentials,
            logset: builder.logset,
            topics: builder.topics,
            group: builder.group,
            member: builder.member,
            group_timeout: builder.group_timeout,
            heartbeat_interval: builder.heartbeat_interval,
            data_fetch_interval: builder.data_fetch_interval,
            start: builder.start,
            end: builder.end,
            max_batch_size: builder.max_batch_size,
            worker_pool_size: builder.worker_pool_size.max(1),
            pool: builder.pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn configuration() -> Result<Configuration> {
        Url::parse("https://cls.example.com")
            .map(|endpoint| {
                Configuration::builder()
                    .endpoint(endpoint)
                    .logset("ls")
                    .topics(["abc", "pqr"])
                    .group("g")
                    .member("m")
                    .build()
            })
            .map_err(|error| Error::Message(error.to_string()))
    }

    #[test]
    fn defaults() -> Result<()> {
        let configuration = configuration()?;

        assert_eq!(DEFAULT_GROUP_TIMEOUT, configuration.group_timeout());
        assert_eq!(DEFAULT_HEARTBEAT_INTERVAL, configuration.heartbeat_interval());
        assert_eq!(DEFAULT_DATA_FETCH_INTERVAL, configuration.data_fetch_interval());
        assert_eq!(Position::Begin, configuration.start());
        assert_eq!(None, configuration.end());
        assert_eq!(DEFAULT_MAX_BATCH_SIZE, configuration.max_batch_size());
        assert_eq!(DEFAULT_WORKER_POOL_SIZE, configuration.worker_pool_size());
        assert!(configuration.pool().is_none());
        assert!(configuration.credentials().is_none());

        Ok(())
    }

    #[test]
    fn identity() -> Result<()> {
        assert_eq!(
            r#"ls/["abc", "pqr"]/g/m"#,
            configuration()?.identity().to_string()
        );
        Ok(())
    }

    #[test]
    fn position_from_str() -> Result<()> {
        assert_eq!(Position::Begin, "begin".parse()?);
        assert_eq!(Position::End, " end ".parse()?);
        assert_eq!(
            Position::At(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            "1700000000".parse()?
        );
        assert!(matches!(
            "yesterday".parse::<Position>(),
            Err(Error::Position(_))
        ));
        Ok(())
    }

    #[test]
    fn credentials_are_not_logged() {
        let credentials = Credentials::new("id", "secret");
        assert!(!format!("{credentials:?}").contains("secret"));
    }
}
