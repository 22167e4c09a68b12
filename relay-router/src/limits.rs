//! Rate limiting for the router.
//!
//! Provides protection against connection flooding and request spam:
//! - connection attempts are limited per peer IP address
//! - requests are limited per session entity
//! - a global limiter caps aggregate throughput
//!
//! All use the governor crate; keyed limiters are backed by DashMap.

use crate::config::LimitsConfig;
use crate::table::EntityId;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the router.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits connection attempts per peer address.
    connection_limiter: Arc<KeyedLimiter<IpAddr>>,

    /// Limits requests per session.
    message_limiter: Arc<KeyedLimiter<EntityId>>,

    /// Global rate limiter across all sessions.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("connection_limiter", &"KeyedLimiter<IpAddr>")
            .field("message_limiter", &"KeyedLimiter<EntityId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are treated as one; [`Config::validated`] never produces
    /// them.
    ///
    /// [`Config::validated`]: crate::config::Config::validated
    pub fn new(config: &LimitsConfig) -> Self {
        let connection_quota = Quota::per_minute(non_zero(config.connections_per_minute));
        let message_quota = Quota::per_minute(non_zero(config.messages_per_minute));
        let global_quota = Quota::per_second(non_zero(config.global_requests_per_second));

        Self {
            connection_limiter: Arc::new(RateLimiter::keyed(connection_quota)),
            message_limiter: Arc::new(RateLimiter::keyed(message_quota)),
            global_limiter: Arc::new(RateLimiter::direct(global_quota)),
        }
    }

    /// Check if a connection attempt from `peer` is allowed.
    pub fn check_connection(&self, peer: &IpAddr) -> Result<(), RateLimitError> {
        self.connection_limiter
            .check_key(peer)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Check if a request from session `entity` is allowed.
    pub fn check_message(&self, entity: &EntityId) -> Result<(), RateLimitError> {
        self.message_limiter
            .check_key(entity)
            .map_err(|_| RateLimitError::MessageLimitExceeded)
    }

    /// Check if the global request rate is within limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Get the number of tracked connection keys (for metrics).
    pub fn connection_keys_count(&self) -> usize {
        self.connection_limiter.len()
    }

    /// Get the number of tracked message keys (for metrics).
    pub fn message_keys_count(&self) -> usize {
        self.message_limiter.len()
    }

    /// Evict entries whose cells have fully recharged.
    ///
    /// Closed sessions and departed peers otherwise stay in the DashMaps
    /// forever. Called from the sweep task.
    pub fn shrink(&self) {
        self.connection_limiter.retain_recent();
        self.message_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this address.
    ConnectionLimitExceeded,
    /// Too many requests from this session.
    MessageLimitExceeded,
    /// Global request rate exceeded across all sessions.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => {
                write!(f, "connection rate limit exceeded")
            }
            Self::MessageLimitExceeded => {
                write!(f, "message rate limit exceeded")
            }
            Self::GlobalLimitExceeded => {
                write!(f, "global rate limit exceeded")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}
