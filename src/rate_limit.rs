use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{self, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tracing::debug;

/// Default minimum gap between two calls to the remote sheet.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// A governor clock the limiter can also pause on.
pub trait Clock: clock::Clock + Send + Sync + 'static {
    fn sleep(&self, duration: Duration);
}

impl Clock for DefaultClock {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

type DirectLimiter<C> = governor::RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as clock::Clock>::Instant>>;

trait Gate: Send + Sync {
    fn wait(&self);
}

struct Governed<C: Clock> {
    limiter: DirectLimiter<C>,
    clock: C,
}

impl<C: Clock> Gate for Governed<C> {
    fn wait(&self) {
        while let Err(not_until) = self.limiter.check() {
            let pause = not_until.wait_time_from(self.clock.now());
            debug!(pause_ms = pause.as_millis() as u64, "rate limiting remote call");
            self.clock.sleep(pause);
        }
    }
}

/// Enforces a minimum wall-clock interval between consecutive remote calls.
///
/// One cell per interval with a burst of one: the first call passes, every
/// later call waits until the interval since the previous one has run out.
pub struct RateLimiter {
    gate: Option<Box<dyn Gate>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, DefaultClock::default())
    }

    /// A zero interval disables throttling.
    pub fn with_clock<C: Clock>(min_interval: Duration, clock: C) -> Self {
        let gate = Quota::with_period(min_interval).map(|quota| {
            let quota = quota.allow_burst(NonZeroU32::MIN);
            Box::new(Governed {
                limiter: governor::RateLimiter::direct_with_clock(quota, &clock),
                clock,
            }) as Box<dyn Gate>
        });
        Self { gate }
    }

    /// Block until `min_interval` has passed since the previous call.
    pub fn wait(&self) {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
    }
}
