//! Runtime limits and timeouts.
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Slowloris-style stalled reads
//! - Header flooding
//! - Unbounded cache growth
//!
//! # Examples
//!
//! ```no_run
//! use hearth_web::{App, Server, limits::{CacheLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = App::builder()
//!         .cache_limits(CacheLimits {
//!             max_bytes: 64 * 1024 * 1024,
//!             latency_threshold: Duration::from_millis(5),
//!             ..CacheLimits::default()
//!         })
//!         .build();
//!
//!     Server::builder()
//!         .bind("127.0.0.1", 8080, 128).await.unwrap()
//!         .app(app)
//!         .server_limits(ServerLimits {
//!             max_connections: 500,
//!             ..ServerLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Server-level concurrency and admission behavior.
///
/// Accepted connections go into a pending queue; a fixed pool of worker
/// tasks drains it. When the queue is full, new connections receive an
/// immediate 503 from dedicated responders.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks, each processing one connection at a time
    /// (default: `100`).
    pub max_connections: usize,

    /// Maximum number of accepted connections waiting for a worker
    /// (default: `250`). Overflow is answered with a 503 and closed.
    pub max_pending_connections: usize,

    /// How idle workers wait for the pending queue to fill
    /// (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Dedicated responders for queue overflow (default: `1`).
    /// Set to 0 to close rejected connections silently.
    pub count_503_handlers: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,

            _priv: (),
        }
    }
}

/// Strategy for worker waiting when no connections are queued.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Spin on [`tokio::task::yield_now()`]. Lowest latency, near-full CPU.
    Yield,

    /// Sleep between polls via [`tokio::time::sleep()`].
    Sleep(Duration),
}

/// Connection-level limits and timeouts.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration of a single socket write (default: `3 seconds`).
    pub socket_write_timeout: Duration,

    /// Requests served on one connection before it is closed
    /// (default: `100`).
    pub max_requests_per_connection: usize,

    /// Hard ceiling on a connection's total lifetime (default: `2 minutes`).
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_write_timeout: Duration::from_secs(3),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),

            _priv: (),
        }
    }
}

/// Request reading limits.
///
/// A connection pre-allocates one working buffer of `buffer_size` bytes; it
/// persists across requests so pipelined bytes are retained between reads.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Working buffer per connection (default: `16 KiB`). A request whose
    /// head does not fit here is dropped.
    pub buffer_size: usize,

    /// Cap on the request line plus header block, terminator included
    /// (default: `8 KiB`). A block ending exactly at the cap is accepted.
    pub header_block_size: usize,

    /// Cap on the declared `content-length` (default: `10 MiB`). A body of
    /// exactly this size is accepted.
    pub body_size: usize,

    /// Deadline for each socket poll while reading headers or body
    /// (default: `5 seconds`).
    pub read_timeout: Duration,

    /// Maximum query parameters parsed from the target (default: `32`).
    pub query_params: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            header_block_size: 8 * 1024,
            body_size: 10 * 1024 * 1024,
            read_timeout: Duration::from_secs(5),
            query_params: 32,

            _priv: (),
        }
    }
}

/// Learning reply-cache limits.
///
/// The cache observes GET traffic and freezes responses that proved
/// byte-stable across two observations and slower than
/// `latency_threshold` to produce.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Byte budget for frozen blobs (default: `32 MiB`). A configured `0`
    /// is substituted with the default rather than disabling the cache.
    pub max_bytes: usize,

    /// Entry time-to-live from stabilization (default: `300 seconds`).
    pub max_entry_age: Duration,

    /// Hits after which a stable entry is discarded to force re-learning
    /// (default: `100_000`).
    pub revalidate_hits: u64,

    /// Handlers faster than this are never cached (default: `10 ms`).
    pub latency_threshold: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_bytes: 32 * 1024 * 1024,
            max_entry_age: Duration::from_secs(300),
            revalidate_hits: 100_000,
            latency_threshold: Duration::from_millis(10),

            _priv: (),
        }
    }
}

impl CacheLimits {
    // A zero byte budget falls back to the default budget.
    #[inline(always)]
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_bytes == 0 {
            self.max_bytes = CacheLimits::default().max_bytes;
        }
        self
    }
}

/// Static asset pool limits.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Byte budget for loaded file bodies (default: `0` = twice the scanned
    /// total; an empty tree counts as 1 MiB before doubling).
    pub capacity: usize,

    /// Delay between retiring a replaced body and freeing it
    /// (default: `5 seconds`). Covers the window between a pointer swap and
    /// a reference acquire on another thread.
    pub retire_grace: Duration,

    /// Interval between filesystem change scans (default: `2 seconds`).
    pub watch_interval: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            capacity: 0,
            retire_grace: Duration::from_secs(5),
            watch_interval: Duration::from_secs(2),

            _priv: (),
        }
    }
}
