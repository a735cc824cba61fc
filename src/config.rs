//! Cache configuration
//!
//! One [`CacheConfig`] is built at process start (normally through
//! [`CacheConfig::from_env`]) and handed to the orchestrator, which keeps it
//! behind an `Arc` for the rest of the process lifetime.
//!
//! Environment variables:
//! - `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`, `REDIS_DB`
//! - `REDIS_CLUSTER_ENABLED`: "true" enables cluster mode
//! - `REDIS_CLUSTER_NODES`: comma-separated `host:port` list
//! - `CACHE_TTL_DEFAULT`, `CACHE_TTL_QUERY`, `CACHE_TTL_SESSION`, `CACHE_TTL_ANALYSIS` (seconds)
//! - `CACHE_FALLBACK_SWEEP_SECS`, `CACHE_REMOTE_MAX_ATTEMPTS`,
//!   `CACHE_REMOTE_TIMEOUT_MS`, `CACHE_RECONNECT_INTERVAL_SECS`

use serde::Serialize;
use std::{fmt, str::FromStr, time::Duration};
use tracing::warn;

use crate::CacheError;

/// Longest lifetime an entry can be given; longer TTLs are clamped to it.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Named TTL classes for cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// General purpose entries
    Default,
    /// Relational query results
    Query,
    /// Per-user session data
    Session,
    /// Derived analysis results (scoring, recommendations)
    Analysis,
}

impl CacheStrategy {
    pub const ALL: [CacheStrategy; 4] = [
        CacheStrategy::Default,
        CacheStrategy::Query,
        CacheStrategy::Session,
        CacheStrategy::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Query => "query",
            Self::Session => "session",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CacheError::Config(format!("unknown cache strategy '{}'", s)))
    }
}

/// A cluster seed node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ClusterNode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| CacheError::Config(format!("cluster node '{}' is not host:port", s)))?;
        if host.is_empty() {
            return Err(CacheError::Config(format!("cluster node '{}' has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| CacheError::Config(format!("cluster node '{}': {}", s, e)))?;
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

/// Time-to-live per [`CacheStrategy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    pub default: Duration,
    pub query: Duration,
    pub session: Duration,
    pub analysis: Duration,
}

impl TtlPolicy {
    pub fn for_strategy(&self, strategy: CacheStrategy) -> Duration {
        match strategy {
            CacheStrategy::Default => self.default,
            CacheStrategy::Query => self.query,
            CacheStrategy::Session => self.session,
            CacheStrategy::Analysis => self.analysis,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(3600),   // 1 hour
            query: Duration::from_secs(1800),     // 30 minutes
            session: Duration::from_secs(86400),  // 24 hours
            analysis: Duration::from_secs(7200),  // 2 hours
        }
    }
}

/// Connection parameters for the remote (Redis) tier
#[derive(Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index (ignored in cluster mode)
    pub database: i64,
    pub cluster_enabled: bool,
    pub cluster_nodes: Vec<ClusterNode>,
    /// Attempts per request, including the first one
    pub max_attempts: u32,
    /// Connect and response timeout
    pub timeout: Duration,
    /// First delay of the background reconnect loop; doubles up to a minute
    pub reconnect_interval: Duration,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("cluster_enabled", &self.cluster_enabled)
            .field("cluster_nodes", &self.cluster_nodes)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .field("reconnect_interval", &self.reconnect_interval)
            .finish()
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 6379,
            password: None,
            database: 0,
            cluster_enabled: false,
            cluster_nodes: Vec::new(),
            max_attempts: 3,
            timeout: Duration::from_millis(2000),
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

impl RemoteConfig {
    /// Nodes used to bootstrap a cluster connection.
    ///
    /// Falls back to the single `host:port` when no node list was configured.
    pub fn cluster_seeds(&self) -> Vec<ClusterNode> {
        if self.cluster_nodes.is_empty() {
            vec![ClusterNode {
                host: self.host.clone(),
                port: self.port,
            }]
        } else {
            self.cluster_nodes.clone()
        }
    }
}

/// Configuration for the dual-tier cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub remote: RemoteConfig,
    pub ttl: TtlPolicy,
    /// How often the fallback store reclaims expired entries
    pub fallback_sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            ttl: TtlPolicy::default(),
            fallback_sweep_interval: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Missing variables take their defaults; unparsable ones are logged and
    /// take their defaults too.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RemoteConfig::default();
        let ttl_defaults = TtlPolicy::default();

        let password = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty());

        let cluster_nodes = lookup("REDIS_CLUSTER_NODES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .filter_map(|entry| match entry.parse::<ClusterNode>() {
                        Ok(node) => Some(node),
                        Err(e) => {
                            warn!(entry = %entry, error = %e, "Skipping invalid cluster node");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let cluster_enabled = lookup("REDIS_CLUSTER_ENABLED")
            .map(|s| s.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let remote = RemoteConfig {
            host: lookup("REDIS_HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.host),
            port: parse_or(&lookup, "REDIS_PORT", defaults.port),
            password,
            database: parse_or(&lookup, "REDIS_DB", defaults.database),
            cluster_enabled,
            cluster_nodes,
            max_attempts: parse_or(&lookup, "CACHE_REMOTE_MAX_ATTEMPTS", defaults.max_attempts),
            timeout: Duration::from_millis(parse_or(
                &lookup,
                "CACHE_REMOTE_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )),
            reconnect_interval: Duration::from_secs(parse_or(
                &lookup,
                "CACHE_RECONNECT_INTERVAL_SECS",
                defaults.reconnect_interval.as_secs(),
            )),
        };

        let ttl = TtlPolicy {
            default: secs_or(&lookup, "CACHE_TTL_DEFAULT", ttl_defaults.default),
            query: secs_or(&lookup, "CACHE_TTL_QUERY", ttl_defaults.query),
            session: secs_or(&lookup, "CACHE_TTL_SESSION", ttl_defaults.session),
            analysis: secs_or(&lookup, "CACHE_TTL_ANALYSIS", ttl_defaults.analysis),
        };

        Self {
            remote,
            ttl,
            fallback_sweep_interval: secs_or(
                &lookup,
                "CACHE_FALLBACK_SWEEP_SECS",
                default_sweep_interval(),
            ),
        }
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> Result<(), CacheError> {
        for strategy in CacheStrategy::ALL {
            let ttl = self.ttl.for_strategy(strategy);
            if ttl.is_zero() {
                return Err(CacheError::Config(format!(
                    "TTL for strategy '{}' must be positive",
                    strategy
                )));
            }
            if ttl > MAX_TTL {
                return Err(CacheError::Config(format!(
                    "TTL for strategy '{}' exceeds {}s",
                    strategy,
                    MAX_TTL.as_secs()
                )));
            }
        }
        if self.fallback_sweep_interval.is_zero() {
            return Err(CacheError::Config(
                "fallback sweep interval must be positive".to_owned(),
            ));
        }
        if self.remote.max_attempts == 0 {
            return Err(CacheError::Config(
                "remote max attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// TTL for a named strategy
    pub fn ttl_for(&self, strategy: CacheStrategy) -> Duration {
        self.ttl.for_strategy(strategy)
    }
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(600) // 10 minutes
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "Invalid cache setting, using default");
                default
            }
        },
    }
}

fn secs_or<F>(lookup: &F, name: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parse_or(lookup, name, default.as_secs()))
}
