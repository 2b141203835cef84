//! Logging setup — env filter, fmt output, and a global record rate limit.
//!
//! The limit is a fixed window: at most N records per second across all
//! levels. Records past the limit are dropped without notice. A window
//! resets when a record arrives at least one window length after the
//! window began.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

use mesh_core::config::LoggingConfig;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct LogRateLimiter {
    max_per_window: u32,
    window: Duration,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl LogRateLimiter {
    /// `max_per_window == 0` disables limiting.
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn per_second(max: u32) -> Self {
        Self::new(max, WINDOW)
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Returns true if a record arriving at `now` should be emitted.
    pub fn allow_at(&self, now: Instant) -> bool {
        if self.max_per_window == 0 {
            return true;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }
        if state.count < self.max_per_window {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

/// Drops events once the limiter's window is full.
pub struct RateLimitLayer {
    limiter: LogRateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: LogRateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S: Subscriber> Layer<S> for RateLimitLayer {
    fn event_enabled(&self, _event: &Event<'_>, _ctx: Context<'_, S>) -> bool {
        self.limiter.allow()
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(RateLimitLayer::new(LogRateLimiter::per_second(
            config.max_records_per_sec,
        )))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
