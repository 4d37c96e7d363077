//! The injected time and randomness collaborators (§4.7).
//!
//! These are the thin seams a test harness drives directly rather than
//! sleeping: election jitter, heartbeat cadence, and cluster-id generation
//! all go through these traits instead of `std`/`tokio` time and `rand`
//! directly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tokio::sync::oneshot;

/// A source of time, abstracted so tests can advance it deterministically
/// instead of sleeping on wall-clock time.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current instant, as milliseconds since some fixed but unspecified epoch.
    fn now_millis(&self) -> u64;

    /// Suspend the caller for `dur`.
    async fn sleep(&self, dur: Duration);
}

/// A source of randomness, abstracted for deterministic election-jitter and
/// cluster-id tests.
pub trait Rand: Send + Sync + 'static {
    /// Draw a `u64` in `[low, high]`, inclusive, used for election timeout jitter.
    fn gen_range(&self, low: u64, high: u64) -> u64;

    /// Mint a new cluster identifier for `initialize()`.
    fn gen_cluster_id(&self) -> u64;
}

/// The real, `tokio`-backed clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// The real, `rand`-backed random source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRand;

impl Rand for SystemRand {
    fn gen_range(&self, low: u64, high: u64) -> u64 {
        use rand::Rng;
        rand::thread_rng().gen_range(low..=high)
    }

    fn gen_cluster_id(&self) -> u64 {
        rand::random()
    }
}

struct MockClockInner {
    now_millis: u64,
    waiters: Vec<(u64, oneshot::Sender<()>)>,
}

/// A virtual clock for deterministic election-timeout and heartbeat tests
/// (§4.7, §9, §8): `sleep` suspends until a matching [`MockClock::advance`]
/// call (from the cloned handle retained by the test driving the node)
/// crosses the sleeper's deadline, never on wall-clock time.
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockInner>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockInner {
                now_millis: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// Move virtual time forward by `dur`, waking every sleeper whose
    /// deadline has now been reached (in no particular order among ties).
    pub fn advance(&self, dur: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.now_millis += dur.as_millis() as u64;
        let now = inner.now_millis;
        let mut still_waiting = Vec::new();
        for (deadline, tx) in inner.waiters.drain(..) {
            if deadline <= now {
                let _ = tx.send(());
            } else {
                still_waiting.push((deadline, tx));
            }
        }
        inner.waiters = still_waiting;
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        self.inner.lock().unwrap().now_millis
    }

    async fn sleep(&self, dur: Duration) {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            let deadline = inner.now_millis + dur.as_millis() as u64;
            let (tx, rx) = oneshot::channel();
            if deadline <= inner.now_millis {
                let _ = tx.send(());
            } else {
                inner.waiters.push((deadline, tx));
            }
            rx
        };
        let _ = rx.await;
    }
}

struct MockRandInner {
    rng: StdRng,
    next_cluster_id: Option<u64>,
}

/// A seeded, reproducible random source for tests (§4.7, §8): the same seed
/// always draws the same election-jitter sequence, and a single cluster id
/// can be pinned with [`MockRand::set_next_cluster_id`] when a test needs to
/// assert on it.
#[derive(Clone)]
pub struct MockRand {
    inner: Arc<Mutex<MockRandInner>>,
}

impl MockRand {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockRandInner {
                rng: StdRng::seed_from_u64(seed),
                next_cluster_id: None,
            })),
        }
    }

    pub fn set_next_cluster_id(&self, id: u64) {
        self.inner.lock().unwrap().next_cluster_id = Some(id);
    }
}

impl Rand for MockRand {
    fn gen_range(&self, low: u64, high: u64) -> u64 {
        self.inner.lock().unwrap().rng.gen_range(low..=high)
    }

    fn gen_cluster_id(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        match inner.next_cluster_id.take() {
            Some(id) => id,
            None => inner.rng.gen(),
        }
    }
}
