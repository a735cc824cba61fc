//! Remote (Redis) tier client
//!
//! Supports a single node through `ConnectionManager` and a statically
//! configured cluster through `ClusterConnection`. The connection is opened
//! lazily by the first [`RemoteClient::connect`] and its health is tracked as a
//! [`ConnectionState`]:
//!
//! ```text
//! Uninitialized -> Connecting -> Connected -> Degraded -> Connecting -> ...
//!                                    any state -> Closed (terminal)
//! ```
//!
//! While not `Connected`, requests fail immediately with
//! [`CacheError::RemoteUnavailable`] instead of queueing, and a background task
//! pings with exponential backoff until the server answers again.

use futures::future::try_join_all;
use redis::{
    Cmd, FromRedisValue, IntoConnectionInfo, Pipeline, RedisResult,
    aio::{ConnectionManager, ConnectionManagerConfig},
    cluster::ClusterClientBuilder,
    cluster_async::ClusterConnection,
};
use serde::Serialize;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::{
    CacheError,
    config::{MAX_TTL, RemoteConfig},
};

const SCAN_BATCH: usize = 500;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Health of the remote tier as observed by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Uninitialized = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Degraded,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either deployment mode behind one query surface
#[derive(Clone)]
enum RemoteConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl RemoteConnection {
    async fn open(config: &RemoteConfig) -> Result<Self, CacheError> {
        if config.cluster_enabled {
            let nodes: Vec<String> = config
                .cluster_seeds()
                .iter()
                .map(|node| format!("redis://{}", node))
                .collect();
            let mut builder = ClusterClientBuilder::new(nodes)
                .retries(config.max_attempts)
                .connection_timeout(config.timeout)
                .response_timeout(config.timeout);
            if let Some(password) = &config.password {
                builder = builder.password(password.clone());
            }
            let client = builder.build()?;
            let connection = client.get_async_connection().await?;
            Ok(Self::Cluster(connection))
        } else {
            let mut info = (config.host.as_str(), config.port).into_connection_info()?;
            info.redis.db = config.database;
            info.redis.password = config.password.clone();
            let client = redis::Client::open(info)?;
            let manager_config = ConnectionManagerConfig::new()
                .set_number_of_retries(config.max_attempts as usize)
                .set_connection_timeout(config.timeout)
                .set_response_timeout(config.timeout);
            let manager = ConnectionManager::new_with_config(client, manager_config).await?;
            Ok(Self::Single(manager))
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> RedisResult<T> {
        match self {
            Self::Single(manager) => {
                let mut conn = manager.clone();
                cmd.query_async(&mut conn).await
            }
            Self::Cluster(cluster) => {
                let mut conn = cluster.clone();
                cmd.query_async(&mut conn).await
            }
        }
    }

    async fn exec_pipeline(&self, pipe: &Pipeline) -> RedisResult<()> {
        match self {
            Self::Single(manager) => {
                let mut conn = manager.clone();
                pipe.query_async(&mut conn).await
            }
            Self::Cluster(cluster) => {
                let mut conn = cluster.clone();
                pipe.query_async(&mut conn).await
            }
        }
    }

    fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }
}

struct RemoteClientInner {
    config: RemoteConfig,
    connection: OnceCell<RemoteConnection>,
    state: AtomicU8,
    reconnecting: AtomicBool,
}

/// Client for the shared remote tier.
///
/// Cheap to clone; all clones share one connection and one state.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<RemoteClientInner>,
}

impl RemoteClient {
    /// Create a client. No connection is made until [`connect`](Self::connect).
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            inner: Arc::new(RemoteClientInner {
                config,
                connection: OnceCell::new(),
                state: AtomicU8::new(ConnectionState::Uninitialized as u8),
                reconnecting: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Move to `next` unless the client is closed. Returns false if closed.
    fn transition(&self, next: ConnectionState) -> bool {
        let result = self
            .inner
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ConnectionState::Closed as u8).then_some(next as u8)
            });
        match result {
            Ok(previous) => {
                let previous = ConnectionState::from_u8(previous);
                if previous != next {
                    info!(from = %previous, to = %next, "Remote cache state changed");
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Open the connection (if needed) and verify it with `PING`.
    ///
    /// Success moves the client to `Connected`; failure moves it to
    /// `Degraded` and starts the background reconnect loop.
    pub async fn connect(&self) -> Result<(), CacheError> {
        if !self.transition(ConnectionState::Connecting) {
            return Err(CacheError::RemoteUnavailable("client is closed".to_owned()));
        }
        match self.establish().await {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.degrade(&e);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(), CacheError> {
        let config = &self.inner.config;
        let connection = self
            .inner
            .connection
            .get_or_try_init(|| async {
                tokio::time::timeout(config.timeout, RemoteConnection::open(config))
                    .await
                    .map_err(|_| {
                        CacheError::RemoteUnavailable(format!(
                            "connect timed out after {:?}",
                            config.timeout
                        ))
                    })?
            })
            .await?;
        let reply: String = connection.query(&redis::cmd("PING")).await?;
        debug!(reply = %reply, "Remote cache answered PING");
        Ok(())
    }

    /// Record a connectivity failure and schedule reconnection.
    fn degrade(&self, error: &CacheError) {
        if self.state() == ConnectionState::Degraded {
            return;
        }
        if self.transition(ConnectionState::Degraded) {
            warn!(error = %error, "Remote cache degraded; serving from fallback tier");
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        let client = self.clone();
        handle.spawn(async move {
            client.reconnect_loop().await;
            client.finish_reconnect();
        });
    }

    /// Release the reconnect slot once a loop has exited.
    ///
    /// A request that degraded the client while the loop was finishing found
    /// the slot taken and did not start a loop of its own, so start one here.
    fn finish_reconnect(&self) {
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        if self.state() == ConnectionState::Degraded {
            self.spawn_reconnect();
        }
    }

    async fn reconnect_loop(&self) {
        let mut delay = self.inner.config.reconnect_interval.max(MIN_RECONNECT_DELAY);
        loop {
            tokio::time::sleep(delay).await;
            if self.state() != ConnectionState::Degraded {
                return;
            }
            if !self.transition(ConnectionState::Connecting) {
                return;
            }
            match self.establish().await {
                Ok(()) => {
                    if self.transition(ConnectionState::Connected) {
                        info!("Remote cache reconnected");
                    }
                    return;
                }
                Err(e) => {
                    if !self.transition(ConnectionState::Degraded) {
                        return;
                    }
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                    debug!(error = %e, retry_in = ?delay, "Remote cache reconnect attempt failed");
                }
            }
        }
    }

    /// Enter the terminal `Closed` state.
    pub fn close(&self) {
        let previous = self
            .inner
            .state
            .swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if previous != ConnectionState::Closed as u8 {
            info!("Remote cache client closed");
        }
    }

    fn live_connection(&self) -> Result<&RemoteConnection, CacheError> {
        match self.state() {
            ConnectionState::Connected => self.inner.connection.get().ok_or_else(|| {
                CacheError::RemoteUnavailable("connection not established".to_owned())
            }),
            other => Err(CacheError::RemoteUnavailable(format!(
                "remote cache is {}",
                other
            ))),
        }
    }

    /// Run one command; a connectivity failure degrades the client.
    async fn run<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, CacheError> {
        let connection = self.live_connection()?;
        self.execute(connection, cmd).await.inspect_err(|error| {
            if error.is_retryable() {
                self.degrade(error);
            }
        })
    }

    /// Run one command with bounded retries, leaving the state untouched.
    async fn execute<T: FromRedisValue>(
        &self,
        connection: &RemoteConnection,
        cmd: &Cmd,
    ) -> Result<T, CacheError> {
        let max_attempts = self.inner.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match connection.query::<T>(cmd).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let error = CacheError::from(e);
                    if error.is_retryable() && attempt < max_attempts {
                        debug!(attempt, error = %error, "Retrying remote cache request");
                        attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        let _: String = self.run(&redis::cmd("PING")).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(&cmd).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("PX").arg(ttl_millis(ttl));
        let _: () = self.run(&cmd).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run(&cmd).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: u64 = self.run(&cmd).await?;
        Ok(count > 0)
    }

    /// Remaining lifetime; `None` when the key is missing or has no expiry.
    pub async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        let millis: i64 = self.run(&cmd).await?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    /// Keys matching a glob pattern.
    ///
    /// Single-node mode walks the keyspace with `SCAN`; cluster mode issues
    /// `KEYS`, which the cluster client fans out to every primary.
    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        if self.live_connection()?.is_cluster() {
            let mut cmd = redis::cmd("KEYS");
            cmd.arg(pattern);
            return self.run(&cmd).await;
        }

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self.run(&cmd).await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        // SCAN may report a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    /// Delete every key matching `pattern`.
    ///
    /// Redis has no native glob delete, so this enumerates the matches and
    /// then removes them: one `DEL` on a single node, one `DEL` per key in
    /// cluster mode where keys may live in different slots.
    pub async fn pattern_delete(&self, pattern: &str) -> Result<u64, CacheError> {
        let keys = self.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        if self.live_connection()?.is_cluster() {
            let counts = try_join_all(keys.iter().map(|key| self.delete(key))).await?;
            return Ok(counts.into_iter().sum());
        }

        let mut cmd = redis::cmd("DEL");
        cmd.arg(&keys);
        self.run(&cmd).await
    }

    /// Raw `INFO <section>` output for diagnostics.
    ///
    /// Read-only with respect to the client: a failure is returned but does
    /// not degrade the connection state.
    pub async fn info(&self, section: &str) -> Result<String, CacheError> {
        let mut cmd = redis::cmd("INFO");
        cmd.arg(section);
        let value: redis::Value = self.execute(self.live_connection()?, &cmd).await?;
        Ok(String::from_redis_value(&value).unwrap_or_else(|_| format!("{:?}", value)))
    }

    /// A command batch bound to the live connection, or a disabled no-op
    /// batch when the remote tier is not connected.
    pub fn pipeline(&self) -> RemotePipeline {
        match self.live_connection() {
            Ok(connection) => RemotePipeline::enabled(connection.clone()),
            Err(_) => RemotePipeline::disabled(),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.min(MAX_TTL).as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}

/// Batched commands sent in one round trip.
///
/// A disabled pipeline accepts commands and discards them, so callers can
/// build one unconditionally and check [`is_enabled`](Self::is_enabled) only
/// when they care.
pub struct RemotePipeline {
    pipe: Pipeline,
    connection: Option<RemoteConnection>,
    commands: usize,
}

impl RemotePipeline {
    fn enabled(connection: RemoteConnection) -> Self {
        Self {
            pipe: redis::pipe(),
            connection: Some(connection),
            commands: 0,
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            pipe: redis::pipe(),
            connection: None,
            commands: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.connection.is_some()
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands == 0
    }

    pub fn set(&mut self, key: &str, value: &str, ttl: Duration) -> &mut Self {
        if self.is_enabled() {
            self.pipe
                .cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .ignore();
            self.commands += 1;
        }
        self
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        if self.is_enabled() {
            self.pipe.cmd("DEL").arg(key).ignore();
            self.commands += 1;
        }
        self
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        if self.is_enabled() {
            self.pipe
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .ignore();
            self.commands += 1;
        }
        self
    }

    /// Send the batch. Returns how many commands were sent (0 when disabled).
    pub async fn execute(self) -> Result<usize, CacheError> {
        match self.connection {
            Some(connection) if self.commands > 0 => {
                connection.exec_pipeline(&self.pipe).await?;
                Ok(self.commands)
            }
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> RemoteConfig {
        RemoteConfig {
            host: "127.0.0.1".to_owned(),
            port: 1,
            max_attempts: 1,
            timeout: Duration::from_millis(300),
            reconnect_interval: Duration::from_secs(60),
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Uninitialized,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Degraded,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_new_client_is_uninitialized() {
        let client = RemoteClient::new(unreachable_config());
        assert_eq!(client.state(), ConnectionState::Uninitialized);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_closed_is_terminal() {
        let client = RemoteClient::new(unreachable_config());
        client.close();
        assert!(!client.transition(ConnectionState::Connecting));
        assert!(!client.transition(ConnectionState::Connected));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_requests_fail_fast_when_not_connected() {
        let client = RemoteClient::new(unreachable_config());
        assert!(matches!(
            client.get("k").await,
            Err(CacheError::RemoteUnavailable(_))
        ));
        assert!(matches!(
            client.pattern_delete("job:*").await,
            Err(CacheError::RemoteUnavailable(_))
        ));
        // No connection attempt was made on the caller's behalf
        assert_eq!(client.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_failed_connect_degrades() {
        let client = RemoteClient::new(unreachable_config());
        let result = client.connect().await;
        assert!(matches!(result, Err(CacheError::RemoteUnavailable(_))));
        assert_eq!(client.state(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn test_connect_after_close_is_refused() {
        let client = RemoteClient::new(unreachable_config());
        client.close();
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_pipeline_is_a_noop() {
        let client = RemoteClient::new(unreachable_config());
        let mut pipeline = client.pipeline();
        assert!(!pipeline.is_enabled());
        pipeline
            .set("a", "1", Duration::from_secs(1))
            .delete("b")
            .expire("c", Duration::from_secs(1));
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.execute().await.unwrap(), 0);
    }

    #[test]
    fn test_ttl_millis_is_bounded() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(ttl_millis(Duration::MAX), MAX_TTL.as_millis() as u64);
    }

    #[tokio::test]
    async fn test_finished_loop_restarts_when_degraded_again() {
        let client = RemoteClient::new(unreachable_config());
        // A loop is finishing while a request degrades the client
        client.inner.reconnecting.store(true, Ordering::SeqCst);
        assert!(client.transition(ConnectionState::Degraded));
        client.spawn_reconnect();
        assert!(client.inner.reconnecting.load(Ordering::SeqCst));

        client.finish_reconnect();
        assert!(client.inner.reconnecting.load(Ordering::SeqCst));
        assert_eq!(client.state(), ConnectionState::Degraded);
        client.close();
    }

    #[tokio::test]
    async fn test_finished_loop_releases_slot_when_healthy() {
        let client = RemoteClient::new(unreachable_config());
        client.inner.reconnecting.store(true, Ordering::SeqCst);
        assert!(client.transition(ConnectionState::Connected));
        client.finish_reconnect();
        assert!(!client.inner.reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_info_failure_keeps_state() {
        let client = RemoteClient::new(unreachable_config());
        assert!(client.transition(ConnectionState::Connected));
        // Connected with no established connection: the command cannot be sent
        assert!(matches!(
            client.info("memory").await,
            Err(CacheError::RemoteUnavailable(_))
        ));
        assert_eq!(client.state(), ConnectionState::Connected);
    }
}
