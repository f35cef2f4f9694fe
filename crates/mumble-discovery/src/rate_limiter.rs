//! Rate limiting and Sybil/DoS protection
//!
//! Implements per-category sliding windows for:
//! - Peer admission into the DHT (per announcing wallet)
//! - Outbound and inbound chat traffic (per peer wallet)
//! - DHT lookups served to peers
//! - Gossip relay requests (per origin sender)
//! - Inbound connection attempts (per remote IP)
//!
//! A global window caps aggregate traffic across every key, and a key that
//! overruns its category ceiling by the escalation factor is blocked outright
//! for the block duration, even after its window drains.
//!
//! Refusals are plain `false` returns: callers try another path instead of
//! failing.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Operation classes with independent ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitCategory {
    /// Admitting an announced peer into the DHT
    PeerAddition,
    /// Sending a message to a recipient
    MessageSend,
    /// Receiving a frame from a peer
    MessageReceive,
    /// Serving a DHT lookup
    DhtOperation,
    /// Forwarding gossip on behalf of an origin sender
    RelayRequest,
    /// Accepting a connection from a remote address
    ConnectionAttempt,
}

impl RateLimitCategory {
    /// Every category
    pub const ALL: [Self; 6] = [
        Self::PeerAddition,
        Self::MessageSend,
        Self::MessageReceive,
        Self::DhtOperation,
        Self::RelayRequest,
        Self::ConnectionAttempt,
    ];

    /// Stable lowercase name for logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PeerAddition => "peer_addition",
            Self::MessageSend => "message_send",
            Self::MessageReceive => "message_receive",
            Self::DhtOperation => "dht_operation",
            Self::RelayRequest => "relay_request",
            Self::ConnectionAttempt => "connection_attempt",
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Peer admissions per wallet per window
    pub peer_addition_per_window: u32,

    /// Messages sent per recipient per window
    pub message_send_per_window: u32,

    /// Frames received per peer per window
    pub message_receive_per_window: u32,

    /// DHT lookups served per peer per window
    pub dht_operation_per_window: u32,

    /// Gossip forwards per origin sender per window
    pub relay_request_per_window: u32,

    /// Inbound connections per remote IP per window
    pub connection_attempt_per_window: u32,

    /// Aggregate ceiling across all keys and categories
    pub global_per_window: u32,

    /// Sliding window length
    pub window: Duration,

    /// How long an abusive key stays blocked
    pub block_duration: Duration,

    /// Multiple of the category ceiling that triggers a block
    pub escalation_factor: u32,

    /// Interval of the background cleanup sweep
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            peer_addition_per_window: 10,
            message_send_per_window: 100,
            message_receive_per_window: 100,
            dht_operation_per_window: 60,
            relay_request_per_window: 50,
            connection_attempt_per_window: 20,
            global_per_window: 1000,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300), // 5 minutes
            escalation_factor: 3,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Ceiling for a category
    #[must_use]
    pub const fn limit_for(&self, category: RateLimitCategory) -> u32 {
        match category {
            RateLimitCategory::PeerAddition => self.peer_addition_per_window,
            RateLimitCategory::MessageSend => self.message_send_per_window,
            RateLimitCategory::MessageReceive => self.message_receive_per_window,
            RateLimitCategory::DhtOperation => self.dht_operation_per_window,
            RateLimitCategory::RelayRequest => self.relay_request_per_window,
            RateLimitCategory::ConnectionAttempt => self.connection_attempt_per_window,
        }
    }
}

/// Rate limiting metrics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RateLimitMetrics {
    /// Operations allowed
    pub allowed: u64,

    /// Operations refused by a per-key ceiling
    pub refused: u64,

    /// Operations refused by the global ceiling
    pub global_refused: u64,

    /// Operations refused because the key was blocked
    pub blocked_refused: u64,

    /// Blocks issued
    pub blocks_issued: u64,

    /// (category, key) windows currently tracked
    pub tracked_windows: usize,

    /// Keys currently blocked
    pub blocked_keys: usize,
}

#[derive(Default)]
struct Counters {
    allowed: AtomicU64,
    refused: AtomicU64,
    global_refused: AtomicU64,
    blocked_refused: AtomicU64,
    blocks_issued: AtomicU64,
}

/// Sliding-window rate limiter with escalation to temporary blocks
///
/// # Examples
///
/// ```
/// use mumble_discovery::{RateLimitCategory, RateLimitConfig, RateLimiter};
///
/// let limiter = RateLimiter::new(RateLimitConfig::default());
/// for _ in 0..10 {
///     assert!(limiter.check_and_increment(RateLimitCategory::PeerAddition, "0xabc"));
/// }
/// assert!(!limiter.check_and_increment(RateLimitCategory::PeerAddition, "0xabc"));
/// ```
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<(RateLimitCategory, String), VecDeque<Instant>>,
    blocked: DashMap<String, Instant>,
    global: Mutex<VecDeque<Instant>>,
    counters: Counters,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            blocked: DashMap::new(),
            global: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record an attempt and decide whether it may proceed
    ///
    /// Order of checks: key block, global ceiling, per-key ceiling. A key whose
    /// count passes `escalation_factor × ceiling` inside one window is blocked
    /// for `block_duration`.
    pub fn check_and_increment(&self, category: RateLimitCategory, key: &str) -> bool {
        let now = Instant::now();

        if self.is_blocked_at(key, now) {
            self.counters.blocked_refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        {
            let mut global = self.global.lock();
            prune(&mut global, now, self.config.window);
            global.push_back(now);
            if global.len() > self.config.global_per_window as usize {
                self.counters.global_refused.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%category, key, "Global rate ceiling reached");
                return false;
            }
        }

        let limit = self.config.limit_for(category) as usize;
        let count = {
            let mut window = self
                .windows
                .entry((category, key.to_string()))
                .or_default();
            prune(&mut window, now, self.config.window);
            window.push_back(now);
            window.len()
        };

        if count <= limit {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.counters.refused.fetch_add(1, Ordering::Relaxed);

        let escalation = limit.saturating_mul(self.config.escalation_factor as usize);
        if count > escalation {
            self.blocked
                .insert(key.to_string(), now + self.config.block_duration);
            self.counters.blocks_issued.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                %category,
                key,
                count,
                "Rate limit exceeded {}x, blocking key for {:?}",
                self.config.escalation_factor,
                self.config.block_duration
            );
        } else {
            tracing::debug!(%category, key, count, limit, "Rate limited");
        }

        false
    }

    /// Whether the next attempt would be refused, without recording it
    #[must_use]
    pub fn would_exceed_limit(&self, category: RateLimitCategory, key: &str) -> bool {
        if self.is_blocked(key) {
            return true;
        }
        self.current_count(category, key) + 1 > self.config.limit_for(category) as usize
    }

    /// Attempts recorded for (category, key) inside the current window
    #[must_use]
    pub fn current_count(&self, category: RateLimitCategory, key: &str) -> usize {
        let now = Instant::now();
        self.windows
            .get(&(category, key.to_string()))
            .map(|w| {
                w.iter()
                    .filter(|t| now.duration_since(**t) < self.config.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Whether `key` is currently blocked
    #[must_use]
    pub fn is_blocked(&self, key: &str) -> bool {
        self.is_blocked_at(key, Instant::now())
    }

    /// Drop empty windows and expired blocks
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.config.window;

        self.windows.retain(|_, hits| {
            prune(hits, now, window);
            !hits.is_empty()
        });
        self.blocked.retain(|_, until| *until > now);
        prune(&mut self.global.lock(), now, window);
    }

    /// Run `cleanup` every `cleanup_interval` until `cancel` fires
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(limiter.config.cleanup_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        limiter.cleanup();
                        tracing::trace!(
                            windows = limiter.windows.len(),
                            blocked = limiter.blocked.len(),
                            "Rate limiter cleanup"
                        );
                    }
                }
            }
        })
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> RateLimitMetrics {
        RateLimitMetrics {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
            global_refused: self.counters.global_refused.load(Ordering::Relaxed),
            blocked_refused: self.counters.blocked_refused.load(Ordering::Relaxed),
            blocks_issued: self.counters.blocks_issued.load(Ordering::Relaxed),
            tracked_windows: self.windows.len(),
            blocked_keys: self.blocked.len(),
        }
    }

    fn is_blocked_at(&self, key: &str, now: Instant) -> bool {
        let until = self.blocked.get(key).map(|entry| *entry);
        match until {
            Some(until) if until > now => true,
            Some(_) => {
                self.blocked.remove_if(key, |_, until| *until <= now);
                false
            }
            None => false,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while hits
        .front()
        .is_some_and(|t| now.duration_since(*t) >= window)
    {
        hits.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> RateLimitConfig {
        RateLimitConfig {
            peer_addition_per_window: 3,
            window: Duration::from_millis(200),
            block_duration: Duration::from_millis(600),
            ..Default::default()
        }
    }

    #[test]
    fn test_allows_up_to_ceiling() {
        let limiter = RateLimiter::new(small_config());

        for _ in 0..3 {
            assert!(limiter.check_and_increment(RateLimitCategory::PeerAddition, "a"));
        }
        assert!(!limiter.check_and_increment(RateLimitCategory::PeerAddition, "a"));

        // Other keys and categories are independent
        assert!(limiter.check_and_increment(RateLimitCategory::PeerAddition, "b"));
        assert!(limiter.check_and_increment(RateLimitCategory::MessageSend, "a"));

        let metrics = limiter.metrics();
        assert_eq!(metrics.allowed, 5);
        assert_eq!(metrics.refused, 1);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(small_config());

        for _ in 0..3 {
            assert!(limiter.check_and_increment(RateLimitCategory::PeerAddition, "a"));
        }
        assert!(!limiter.check_and_increment(RateLimitCategory::PeerAddition, "a"));

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(limiter.current_count(RateLimitCategory::PeerAddition, "a"), 0);
        assert!(limiter.check_and_increment(RateLimitCategory::PeerAddition, "a"));
    }

    #[tokio::test]
    async fn test_escalation_blocks_after_window_resets() {
        let limiter = RateLimiter::new(small_config());

        // 3x ceiling = 9; the 10th attempt in the window escalates
        for _ in 0..10 {
            limiter.check_and_increment(RateLimitCategory::PeerAddition, "abuser");
        }
        assert!(limiter.is_blocked("abuser"));
        assert_eq!(limiter.metrics().blocks_issued, 1);

        // Window drains, block persists
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(limiter.current_count(RateLimitCategory::PeerAddition, "abuser"), 0);
        assert!(!limiter.check_and_increment(RateLimitCategory::PeerAddition, "abuser"));
        // Block applies to every category for that key
        assert!(!limiter.check_and_increment(RateLimitCategory::MessageSend, "abuser"));

        // Block expires
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(!limiter.is_blocked("abuser"));
        assert!(limiter.check_and_increment(RateLimitCategory::PeerAddition, "abuser"));
    }

    #[test]
    fn test_no_block_below_escalation() {
        let limiter = RateLimiter::new(small_config());
        for _ in 0..9 {
            limiter.check_and_increment(RateLimitCategory::PeerAddition, "k");
        }
        assert!(!limiter.is_blocked("k"));
    }

    #[test]
    fn test_global_ceiling() {
        let config = RateLimitConfig {
            global_per_window: 5,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);

        for i in 0..5 {
            assert!(limiter.check_and_increment(RateLimitCategory::MessageSend, &format!("k{i}")));
        }
        // Fresh key, still refused by the aggregate ceiling
        assert!(!limiter.check_and_increment(RateLimitCategory::MessageSend, "fresh"));
        assert_eq!(limiter.metrics().global_refused, 1);
    }

    #[test]
    fn test_would_exceed_is_read_only() {
        let limiter = RateLimiter::new(small_config());
        assert!(!limiter.would_exceed_limit(RateLimitCategory::PeerAddition, "a"));
        assert_eq!(limiter.current_count(RateLimitCategory::PeerAddition, "a"), 0);

        for _ in 0..3 {
            limiter.check_and_increment(RateLimitCategory::PeerAddition, "a");
        }
        assert!(limiter.would_exceed_limit(RateLimitCategory::PeerAddition, "a"));
        assert_eq!(limiter.current_count(RateLimitCategory::PeerAddition, "a"), 3);
    }

    #[tokio::test]
    async fn test_cleanup_removes_idle_state() {
        let limiter = RateLimiter::new(small_config());
        for _ in 0..10 {
            limiter.check_and_increment(RateLimitCategory::PeerAddition, "x");
        }
        limiter.check_and_increment(RateLimitCategory::DhtOperation, "y");
        assert_eq!(limiter.metrics().tracked_windows, 2);
        assert_eq!(limiter.metrics().blocked_keys, 1);

        tokio::time::sleep(Duration::from_millis(700)).await;
        limiter.cleanup();

        let metrics = limiter.metrics();
        assert_eq!(metrics.tracked_windows, 0);
        assert_eq!(metrics.blocked_keys, 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_cancel() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            cleanup_interval: Duration::from_millis(10),
            ..small_config()
        }));
        let cancel = CancellationToken::new();
        let handle = limiter.spawn_cleanup_task(cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup task did not stop")
            .unwrap();
    }
}
