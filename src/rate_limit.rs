//! Pacing for the two remote services a pass talks to.
//!
//! The upstream statistics API shares one rolling window across the whole
//! process. Webhook destinations each get their own window, a minimum spacing
//! between posts and an optional cooldown deadline set from 429 responses.
//! Both limiters run on the monotonic clock.

use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct UpstreamLimits {
    pub per_second: usize,
    pub per_minute: usize,
    pub per_hour: usize,
}

impl Default for UpstreamLimits {
    fn default() -> Self {
        Self {
            per_second: 20,
            per_minute: 250,
            per_hour: 2000,
        }
    }
}

impl UpstreamLimits {
    fn caps(&self) -> [(usize, Duration); 3] {
        [
            (self.per_second, SECOND),
            (self.per_minute, MINUTE),
            (self.per_hour, HOUR),
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WebhookLimits {
    pub per_second: usize,
    pub per_minute: usize,
    /// Minimum gap between two posts to the same destination.
    pub min_spacing: Duration,
    /// Upper bound of the uniform jitter added on top of `min_spacing`.
    pub jitter: Duration,
}

impl Default for WebhookLimits {
    fn default() -> Self {
        Self {
            per_second: 1,
            per_minute: 15,
            min_spacing: Duration::from_millis(2800),
            jitter: Duration::from_millis(800),
        }
    }
}

impl WebhookLimits {
    fn caps(&self) -> [(usize, Duration); 2] {
        [(self.per_second, SECOND), (self.per_minute, MINUTE)]
    }
}

/// Smallest sleep after which every `(cap, span)` pair admits one more call.
///
/// `window` must be sorted oldest first. An entry counts against a span while
/// `now - entry < span`.
pub(crate) fn required_wait(
    window: &VecDeque<Instant>,
    now: Instant,
    caps: &[(usize, Duration)],
) -> Duration {
    let mut wait = Duration::ZERO;
    for &(cap, span) in caps {
        let in_span: Vec<Instant> = window
            .iter()
            .copied()
            .filter(|t| now.saturating_duration_since(*t) < span)
            .collect();
        if in_span.len() < cap {
            continue;
        }
        if cap == 0 {
            // A zero cap can never be satisfied; wait a full span and re-check.
            wait = wait.max(span);
            continue;
        }
        // Once this entry leaves the span there is room for exactly one call.
        let pivot = in_span[in_span.len() - cap];
        let age = now.saturating_duration_since(pivot);
        wait = wait.max(span - age);
    }
    wait
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, keep: Duration) {
    while let Some(front) = window.front() {
        if now.saturating_duration_since(*front) >= keep {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Process-wide limiter for the statistics API.
#[derive(Debug)]
pub struct UpstreamLimiter {
    limits: UpstreamLimits,
    window: Mutex<VecDeque<Instant>>,
}

impl UpstreamLimiter {
    pub fn new(limits: UpstreamLimits) -> Self {
        Self {
            limits,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Blocks until a call fits under all three caps and reserves it.
    pub async fn acquire(&self) {
        let caps = self.limits.caps();
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                prune(&mut window, now, HOUR);
                let wait = required_wait(&window, now, &caps);
                if wait.is_zero() {
                    window.push_back(now);
                    return;
                }
                wait
            };
            debug!("Upstream limiter sleeping {:?}", wait);
            sleep(wait).await;
        }
    }

    #[cfg(test)]
    async fn calls_in_last(&self, span: Duration) -> usize {
        let now = Instant::now();
        self.window
            .lock()
            .await
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < span)
            .count()
    }
}

#[derive(Debug, Default)]
struct Destination {
    posts: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl Destination {
    fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

/// Per-destination limiter for webhook posts and edits.
#[derive(Debug)]
pub struct WebhookLimiter {
    limits: WebhookLimits,
    destinations: Mutex<HashMap<String, Destination>>,
}

impl WebhookLimiter {
    pub fn new(limits: WebhookLimits) -> Self {
        Self {
            limits,
            destinations: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until `base` may receive another request and reserves the slot.
    ///
    /// An active cooldown overrides every other rule.
    pub async fn acquire(&self, base: &str) {
        let caps = self.limits.caps();
        let spacing = self.limits.min_spacing + jitter(self.limits.jitter);
        loop {
            let wait = {
                let mut destinations = self.destinations.lock().await;
                let dest = destinations.entry(base.to_string()).or_default();
                let now = Instant::now();
                prune(&mut dest.posts, now, MINUTE);

                let cooldown = dest.cooldown_remaining(now);
                let spacing_wait = dest
                    .posts
                    .back()
                    .map(|last| spacing.saturating_sub(now.saturating_duration_since(*last)))
                    .unwrap_or(Duration::ZERO);
                let wait = cooldown
                    .max(spacing_wait)
                    .max(required_wait(&dest.posts, now, &caps));
                if wait.is_zero() {
                    dest.cooldown_until = None;
                    dest.posts.push_back(now);
                    return;
                }
                wait
            };
            debug!("Webhook limiter sleeping {:?}", wait);
            sleep(wait).await;
        }
    }

    /// Pushes the destination's cooldown deadline out to at least `now + duration`.
    pub async fn set_cooldown(&self, base: &str, duration: Duration) {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(base.to_string()).or_default();
        let until = Instant::now() + duration;
        dest.cooldown_until = Some(match dest.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub async fn cooldown_remaining(&self, base: &str) -> Duration {
        let now = Instant::now();
        self.destinations
            .lock()
            .await
            .get(base)
            .map(|d| d.cooldown_remaining(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Longest remaining cooldown across all destinations.
    pub async fn max_cooldown_remaining(&self) -> Duration {
        let now = Instant::now();
        self.destinations
            .lock()
            .await
            .values()
            .map(|d| d.cooldown_remaining(now))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Shared pacing service threaded through a pass.
#[derive(Debug)]
pub struct Limiters {
    pub upstream: UpstreamLimiter,
    pub webhook: WebhookLimiter,
    hard_blocked: AtomicBool,
}

impl Limiters {
    pub fn new(upstream: UpstreamLimits, webhook: WebhookLimits) -> Self {
        Self {
            upstream: UpstreamLimiter::new(upstream),
            webhook: WebhookLimiter::new(webhook),
            hard_blocked: AtomicBool::new(false),
        }
    }

    /// Latches for the lifetime of this value; there is no reset.
    pub fn latch_hard_block(&self) {
        self.hard_blocked.store(true, Ordering::SeqCst);
    }

    pub fn is_hard_blocked(&self) -> bool {
        self.hard_blocked.load(Ordering::SeqCst)
    }
}

impl Default for Limiters {
    fn default() -> Self {
        Self::new(UpstreamLimits::default(), WebhookLimits::default())
    }
}
