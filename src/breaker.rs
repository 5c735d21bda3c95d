//! Circuit breaker (component C6)
//!
//! A three-state admission gate — Closed, HalfOpen, Open — driven by a
//! combined load signal: the worst of worker utilisation, queue-depth
//! ratio, and memory-usage ratio. State transitions are a deterministic
//! pure function of the signal history and a monotonic clock, so the same
//! sequence of samples always produces the same sequence of states
//! regardless of wall-clock speed.

use crate::config::BreakerConfig;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl BreakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BreakerState::HalfOpen,
            2 => BreakerState::Open,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half_open",
            BreakerState::Open => "open",
        }
    }
}

/// The inputs the breaker needs to compute a combined load signal.
pub struct LoadSample {
    pub worker_utilisation: f64,
    pub queue_depth_ratio: f64,
    pub memory_ratio: f64,
}

impl LoadSample {
    fn combined(&self) -> f64 {
        self.worker_utilisation
            .max(self.queue_depth_ratio)
            .max(self.memory_ratio)
            .clamp(0.0, 1.0)
    }
}

/// The breaker's decision for one admission attempt.
pub struct Decision {
    pub allowed: bool,
    pub state: BreakerState,
    pub reason: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
    pub cost_multiplier: f64,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    closed_streak: AtomicU32,
    high_load_streak: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(BreakerState::Closed as u8),
            closed_streak: AtomicU32::new(0),
            high_load_streak: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Feed one load sample and return the admission decision for the
    /// request that triggered it. Transitions:
    ///
    /// - Closed -> HalfOpen when load >= `open_threshold` for two
    ///   consecutive samples.
    /// - HalfOpen -> Open when load >= `shed_threshold`.
    /// - HalfOpen -> Closed after 5 consecutive samples below
    ///   `closed_threshold`.
    /// - Open -> HalfOpen after `cooldown_secs` have elapsed since the
    ///   transition into Open, and load has dropped back below
    ///   `open_threshold`.
    pub fn admit(&self, sample: &LoadSample) -> Decision {
        let load = sample.combined();
        let current = self.state();

        match current {
            BreakerState::Closed => {
                if load >= self.config.open_threshold {
                    let streak = self.high_load_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    if streak >= 2 {
                        self.transition_to(BreakerState::HalfOpen);
                        self.high_load_streak.store(0, Ordering::SeqCst);
                        self.closed_streak.store(0, Ordering::SeqCst);
                    }
                } else {
                    self.high_load_streak.store(0, Ordering::SeqCst);
                }
                Decision {
                    allowed: true,
                    state: self.state(),
                    reason: None,
                    retry_after_seconds: None,
                    cost_multiplier: 1.0,
                }
            }
            BreakerState::HalfOpen => {
                if load >= self.config.shed_threshold {
                    self.transition_to(BreakerState::Open);
                    return Decision {
                        allowed: false,
                        state: BreakerState::Open,
                        reason: Some("load exceeded shed threshold"),
                        retry_after_seconds: Some(self.config.cooldown_secs),
                        cost_multiplier: 0.0,
                    };
                }
                if load < self.config.closed_threshold {
                    let streak = self.closed_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    if streak >= 5 {
                        self.transition_to(BreakerState::Closed);
                        self.closed_streak.store(0, Ordering::SeqCst);
                    }
                } else {
                    self.closed_streak.store(0, Ordering::SeqCst);
                }
                Decision {
                    allowed: true,
                    state: self.state(),
                    reason: Some("admitted at reduced cost while probing recovery"),
                    retry_after_seconds: None,
                    cost_multiplier: self.config.half_open_cost_multiplier,
                }
            }
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .expect("breaker mutex poisoned")
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= Duration::from_secs(self.config.cooldown_secs)
                    && load < self.config.open_threshold
                {
                    self.transition_to(BreakerState::HalfOpen);
                    self.closed_streak.store(0, Ordering::SeqCst);
                    self.high_load_streak.store(0, Ordering::SeqCst);
                    return Decision {
                        allowed: true,
                        state: BreakerState::HalfOpen,
                        reason: Some("cooldown elapsed, probing recovery"),
                        retry_after_seconds: None,
                        cost_multiplier: self.config.half_open_cost_multiplier,
                    };
                }
                let remaining = Duration::from_secs(self.config.cooldown_secs)
                    .saturating_sub(elapsed)
                    .as_secs()
                    .max(self.config.base_retry_after_secs);
                Decision {
                    allowed: false,
                    state: BreakerState::Open,
                    reason: Some("circuit open"),
                    retry_after_seconds: Some(remaining),
                    cost_multiplier: 0.0,
                }
            }
        }
    }

    /// Only a request whose `max_points`-bounded per-point budget fits
    /// within `half_open_cost_fraction` of a baseline single-point cost is
    /// admitted while HalfOpen; larger requests are asked to retry once the
    /// breaker has fully closed.
    pub fn half_open_admits_cost(&self, cost: u64, baseline_single_point_cost: u64) -> bool {
        let budget = (baseline_single_point_cost as f64) * self.config.half_open_cost_fraction;
        (cost as f64) <= budget.max(1.0)
    }

    fn transition_to(&self, next: BreakerState) {
        self.state.store(next as u8, Ordering::SeqCst);
        if next == BreakerState::Open {
            *self.opened_at.lock().expect("breaker mutex poisoned") = Some(Instant::now());
        }
    }
}
