//! Transfer-rate throttling: a token bucket per direction, plus a global
//! fair-share allocator that splits the engine-wide limit between swarms.
//!
//! Readers and writers ask the bucket for a grant before touching the
//! socket. When the bucket is empty the caller suspends until a refill tick
//! wakes it; partial grants are allowed, so a caller asking for a full block
//! may be woken with fewer bytes and simply asks again for the rest. A limit
//! of `0` means unlimited and grants are immediate.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// How often buckets are refilled.
pub const REFILL_INTERVAL: Duration = Duration::from_millis(100);

const TICKS_PER_SECOND: u64 = 10;

/// A token bucket. Capacity equals the per-second limit; each refill tick
/// adds one tick's worth of tokens.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// Bytes per second. `0` means unlimited.
    limit_bps: u64,
    tokens: u64,
    waiters: VecDeque<Waiter>,
    shut_down: bool,
}

#[derive(Debug)]
struct Waiter {
    requested: u64,
    tx: oneshot::Sender<u64>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit_bps: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                limit_bps,
                tokens: limit_bps,
                waiters: VecDeque::new(),
                shut_down: false,
            }),
        })
    }

    /// Requests up to `wanted` bytes. Returns the granted amount, which is
    /// `wanted` when unlimited, possibly less under throttling, and `0` only
    /// when the limiter is shut down while waiting.
    pub async fn acquire(&self, wanted: u64) -> u64 {
        let rx = {
            let mut state = self.state.lock().await;

            if state.limit_bps == 0 || state.shut_down {
                return if state.shut_down { 0 } else { wanted };
            }

            if state.tokens > 0 {
                let granted = state.tokens.min(wanted);
                state.tokens -= granted;
                return granted;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { requested: wanted, tx });
            rx
        };

        // A dropped sender means the limiter went away entirely.
        rx.await.unwrap_or(0)
    }

    /// Changes the per-second limit. Setting `0` (unlimited) releases every
    /// waiter with a full grant.
    pub async fn set_limit(&self, limit_bps: u64) {
        let mut state = self.state.lock().await;

        state.limit_bps = limit_bps;
        state.tokens = state.tokens.min(limit_bps);

        if limit_bps == 0 {
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(waiter.requested);
            }
        }
    }

    pub async fn limit(&self) -> u64 {
        self.state.lock().await.limit_bps
    }

    /// Wakes every waiter with a grant of `0` and makes all future acquires
    /// return `0`. Used on engine shutdown and swarm suspension.
    pub async fn shut_down(&self) {
        let mut state = self.state.lock().await;
        state.shut_down = true;

        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(0);
        }
    }

    /// One refill tick: add a tick's worth of tokens (bounded by the bucket
    /// capacity) and hand them out to waiters in FIFO order.
    pub async fn refill_tick(&self) {
        let mut state = self.state.lock().await;

        if state.limit_bps == 0 || state.shut_down {
            return;
        }

        state.tokens = (state.tokens + state.limit_bps / TICKS_PER_SECOND).min(state.limit_bps);

        while state.tokens > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };

            let granted = state.tokens.min(waiter.requested);
            state.tokens -= granted;

            // The receiver may have been cancelled; return its tokens.
            if waiter.tx.send(granted).is_err() {
                state.tokens += granted;
            }
        }
    }

    /// Spawns the refill timer driving this bucket.
    #[must_use]
    pub fn spawn_refill(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFILL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                limiter.refill_tick().await;

                if limiter.state.lock().await.shut_down {
                    break;
                }
            }
        })
    }
}

/// Splits a global per-second limit between registered swarms in proportion
/// to their weights. Each swarm's effective limit is
/// `min(per-swarm cap, fair share)`, recomputed whenever a swarm registers
/// or deregisters or the global limit changes.
#[derive(Debug)]
pub struct FairShare {
    state: Mutex<FairShareState>,
}

#[derive(Debug)]
struct FairShareState {
    global_limit_bps: u64,
    members: Vec<Member>,
}

#[derive(Debug)]
struct Member {
    key: harbor_primitives::info_hash::InfoHash,
    weight: u64,
    cap_bps: u64,
    limiter: Arc<RateLimiter>,
}

impl FairShare {
    #[must_use]
    pub fn new(global_limit_bps: u64) -> Self {
        Self {
            state: Mutex::new(FairShareState {
                global_limit_bps,
                members: Vec::new(),
            }),
        }
    }

    /// Registers a swarm and returns its personal limiter.
    pub async fn register(
        &self,
        key: harbor_primitives::info_hash::InfoHash,
        weight: u64,
        cap_bps: u64,
    ) -> Arc<RateLimiter> {
        let limiter = RateLimiter::new(cap_bps);

        let mut state = self.state.lock().await;
        state.members.push(Member {
            key,
            weight: weight.max(1),
            cap_bps,
            limiter: limiter.clone(),
        });
        state.recompute().await;

        limiter
    }

    pub async fn deregister(&self, key: harbor_primitives::info_hash::InfoHash) {
        let mut state = self.state.lock().await;

        if let Some(index) = state.members.iter().position(|member| member.key == key) {
            let member = state.members.swap_remove(index);
            member.limiter.shut_down().await;
        }

        state.recompute().await;
    }

    pub async fn set_global_limit(&self, global_limit_bps: u64) {
        let mut state = self.state.lock().await;
        state.global_limit_bps = global_limit_bps;
        state.recompute().await;
    }

    pub async fn global_limit(&self) -> u64 {
        self.state.lock().await.global_limit_bps
    }
}

impl FairShareState {
    async fn recompute(&mut self) {
        let total_weight: u64 = self.members.iter().map(|member| member.weight).sum();

        for member in &self.members {
            let effective = if self.global_limit_bps == 0 {
                member.cap_bps
            } else {
                let share = self.global_limit_bps * member.weight / total_weight.max(1);
                if member.cap_bps == 0 {
                    share
                } else {
                    member.cap_bps.min(share)
                }
            };

            debug!(key = %member.key, effective, "throttle share recomputed");
            member.limiter.set_limit(effective).await;
        }
    }
}
