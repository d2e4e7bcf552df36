//! Pool configuration.
//!
//! # Example
//!
//! ```
//! use hostpool::config::PoolConfig;
//! use std::time::Duration;
//!
//! let config = PoolConfig::builder()
//!     .max_connections(4)
//!     .min_connections(1)
//!     .keep_alive_timeout(Some(Duration::from_secs(30)))
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::time::Duration;

/// Configuration for a single-host connection pool.
///
/// Pipelining is fixed at one in-flight request per connection; there is no
/// knob for it.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on simultaneously open connections.
    pub max_connections: usize,
    /// Floor of warm connections kept open eagerly.
    pub min_connections: usize,
    /// Default retry budget per request when the caller supplies none.
    pub max_retries: u32,
    /// Initial delay after a failed connect attempt.
    pub base_connection_backoff: Duration,
    /// Cap on the exponential connect backoff.
    pub max_connection_backoff: Duration,
    /// Idle timeout after which a connection is closed. `None` keeps idle
    /// connections open indefinitely.
    pub keep_alive_timeout: Option<Duration>,
    /// Window within which a response entity must be subscribed. `None`
    /// disables the timeout.
    pub response_entity_subscription_timeout: Option<Duration>,
    /// Bound on the admission queue; a full queue rejects further offers.
    pub max_queue_size: usize,
    /// Bound on fulfilled-but-unclaimed responses before the dispatcher
    /// stops feeding slots. `None` derives `2 * max_connections`.
    pub max_unclaimed_responses: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            min_connections: 0,
            max_retries: 5,
            base_connection_backoff: Duration::from_millis(100),
            max_connection_backoff: Duration::from_secs(2),
            keep_alive_timeout: None,
            response_entity_subscription_timeout: Some(Duration::from_secs(1)),
            max_queue_size: 32,
            max_unclaimed_responses: None,
        }
    }
}

impl PoolConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Effective bound on unclaimed responses.
    #[must_use]
    pub fn unclaimed_response_bound(&self) -> usize {
        self.max_unclaimed_responses
            .unwrap_or_else(|| self.max_connections.saturating_mul(2).max(1))
    }

    /// Checks the configuration for invalid combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_connections,
                max: self.max_connections,
            });
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.base_connection_backoff.is_zero() {
            return Err(ConfigError::ZeroBackoffBase);
        }
        Ok(())
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    max_connections: Option<usize>,
    min_connections: Option<usize>,
    max_retries: Option<u32>,
    base_connection_backoff: Option<Duration>,
    max_connection_backoff: Option<Duration>,
    keep_alive_timeout: Option<Option<Duration>>,
    response_entity_subscription_timeout: Option<Option<Duration>>,
    max_queue_size: Option<usize>,
    max_unclaimed_responses: Option<usize>,
}

impl PoolConfigBuilder {
    /// Sets the hard cap on simultaneous connections.
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Sets the floor of warm connections.
    #[must_use]
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = Some(min);
        self
    }

    /// Sets the default retry budget per request.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the initial connect backoff delay.
    #[must_use]
    pub fn base_connection_backoff(mut self, base: Duration) -> Self {
        self.base_connection_backoff = Some(base);
        self
    }

    /// Sets the connect backoff cap.
    #[must_use]
    pub fn max_connection_backoff(mut self, max: Duration) -> Self {
        self.max_connection_backoff = Some(max);
        self
    }

    /// Sets the idle keep-alive timeout (`None` disables it).
    #[must_use]
    pub fn keep_alive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.keep_alive_timeout = Some(timeout);
        self
    }

    /// Sets the entity subscription timeout (`None` disables it).
    #[must_use]
    pub fn response_entity_subscription_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_entity_subscription_timeout = Some(timeout);
        self
    }

    /// Sets the admission queue bound.
    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Sets the unclaimed-response bound.
    #[must_use]
    pub fn max_unclaimed_responses(mut self, bound: usize) -> Self {
        self.max_unclaimed_responses = Some(bound);
        self
    }

    /// Builds the configuration, falling back to defaults for unset fields.
    #[must_use]
    pub fn build(self) -> PoolConfig {
        let defaults = PoolConfig::default();
        PoolConfig {
            max_connections: self.max_connections.unwrap_or(defaults.max_connections),
            min_connections: self.min_connections.unwrap_or(defaults.min_connections),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_connection_backoff: self
                .base_connection_backoff
                .unwrap_or(defaults.base_connection_backoff),
            max_connection_backoff: self
                .max_connection_backoff
                .unwrap_or(defaults.max_connection_backoff),
            keep_alive_timeout: self
                .keep_alive_timeout
                .unwrap_or(defaults.keep_alive_timeout),
            response_entity_subscription_timeout: self
                .response_entity_subscription_timeout
                .unwrap_or(defaults.response_entity_subscription_timeout),
            max_queue_size: self.max_queue_size.unwrap_or(defaults.max_queue_size),
            max_unclaimed_responses: self
                .max_unclaimed_responses
                .or(defaults.max_unclaimed_responses),
        }
    }
}

/// Rejected configuration combinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_connections` must be at least 1.
    ZeroMaxConnections,
    /// `min_connections` exceeds `max_connections`.
    MinExceedsMax {
        /// Configured floor.
        min: usize,
        /// Configured cap.
        max: usize,
    },
    /// The admission queue must hold at least one request.
    ZeroQueueSize,
    /// The backoff base must be non-zero or the retry loop would spin.
    ZeroBackoffBase,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroMaxConnections => write!(f, "max_connections must be >= 1"),
            Self::MinExceedsMax { min, max } => {
                write!(f, "min_connections ({min}) exceeds max_connections ({max})")
            }
            Self::ZeroQueueSize => write!(f, "max_queue_size must be >= 1"),
            Self::ZeroBackoffBase => write!(f, "base_connection_backoff must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
