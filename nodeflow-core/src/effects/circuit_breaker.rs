//! Per-target circuit breakers
//!
//! Breakers are the only state shared between concurrent effect executions.
//! Each key owns one [`CircuitBreakerState`] behind its own async mutex, so
//! every read-modify-write on a breaker is serialized.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::EngineConfiguration;
use crate::services::{default_sink, Observation, SharedSink};

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Threshold and cooldown of a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&EngineConfiguration> for CircuitBreakerConfig {
    fn from(config: &EngineConfiguration) -> Self {
        Self {
            threshold: config.circuit_breaker_threshold.max(1),
            cooldown: config.circuit_breaker_cooldown(),
        }
    }
}

/// Mutable breaker state for one target key
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub threshold: u32,
    pub cooldown: Duration,
    trial_in_flight: bool,
    /// Bumped on every position change; permits from older generations are stale
    generation: u64,
}

/// Proof of admission, handed back when the attempt's outcome is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    generation: u64,
    trial: bool,
}

impl Permit {
    /// Whether this permit holds the single half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Outcome of asking a breaker for permission to attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed breaker; attempt freely
    Allowed(Permit),
    /// Half-open breaker; this caller holds the single trial
    Trial(Permit),
    /// Open breaker (or trial already taken); retry after `remaining`
    Rejected { remaining: Duration },
}

impl Admission {
    pub fn permit(self) -> Option<Permit> {
        match self {
            Admission::Allowed(permit) | Admission::Trial(permit) => Some(permit),
            Admission::Rejected { .. } => None,
        }
    }

    pub fn is_trial(&self) -> bool {
        matches!(self, Admission::Trial(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected { .. })
    }
}

/// Position change caused by recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    None,
    Opened,
    Closed,
}

impl CircuitBreakerState {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            threshold: config.threshold.max(1),
            cooldown: config.cooldown,
            trial_in_flight: false,
            generation: 0,
        }
    }

    fn move_to(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
    }

    fn permit(&self, trial: bool) -> Permit {
        Permit {
            generation: self.generation,
            trial,
        }
    }

    /// Remaining cooldown while open
    fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self
            .last_failure_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(self.cooldown);
        Some(self.cooldown.saturating_sub(elapsed))
    }

    fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed(self.permit(false)),
            CircuitState::Open => match self.remaining(now) {
                Some(remaining) if !remaining.is_zero() => Admission::Rejected { remaining },
                _ => {
                    self.move_to(CircuitState::HalfOpen);
                    self.trial_in_flight = true;
                    Admission::Trial(self.permit(true))
                }
            },
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Rejected {
                        remaining: Duration::ZERO,
                    }
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial(self.permit(true))
                }
            }
        }
    }

    fn is_current(&self, permit: Permit) -> bool {
        permit.generation == self.generation
            && match self.state {
                CircuitState::Closed => !permit.trial,
                CircuitState::HalfOpen => permit.trial && self.trial_in_flight,
                CircuitState::Open => false,
            }
    }

    fn on_success(&mut self, permit: Permit) -> Change {
        // Outcomes of calls admitted before the last position change are ignored
        if !self.is_current(permit) {
            return Change::None;
        }
        self.failure_count = 0;
        if self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
            self.move_to(CircuitState::Closed);
            Change::Closed
        } else {
            Change::None
        }
    }

    fn on_failure(&mut self, permit: Permit, now: Instant) -> Change {
        if !self.is_current(permit) {
            return Change::None;
        }
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);

        match self.state {
            // A failed trial reopens immediately
            CircuitState::HalfOpen => {
                self.trial_in_flight = false;
                self.move_to(CircuitState::Open);
                Change::Opened
            }
            CircuitState::Closed if self.failure_count >= self.threshold => {
                self.move_to(CircuitState::Open);
                Change::Opened
            }
            _ => Change::None,
        }
    }

    fn abandon_trial(&mut self, permit: Permit) {
        if self.is_current(permit) && self.state == CircuitState::HalfOpen {
            self.trial_in_flight = false;
        }
    }
}

/// Registry of breakers keyed by effect target
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<Mutex<CircuitBreakerState>>>,
    overrides: DashMap<String, CircuitBreakerConfig>,
    defaults: CircuitBreakerConfig,
    sink: SharedSink,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            overrides: DashMap::new(),
            defaults,
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Use a specific threshold/cooldown for `key`; applies to breakers created afterwards
    pub fn configure(&self, key: impl Into<String>, config: CircuitBreakerConfig) {
        self.overrides.insert(key.into(), config);
    }

    fn breaker(&self, key: &str) -> Arc<Mutex<CircuitBreakerState>> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        let config = self
            .overrides
            .get(key)
            .map(|c| *c)
            .unwrap_or(self.defaults);
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreakerState::new(config))))
            .clone()
    }

    /// Ask permission to attempt an operation against `key`
    pub async fn acquire(&self, key: &str) -> Admission {
        let breaker = self.breaker(key);
        let mut state = breaker.lock().await;
        let admission = state.admit(Instant::now());
        if admission.is_trial() {
            self.sink.record(Observation::CircuitHalfOpened {
                key: key.to_string(),
            });
        }
        admission
    }

    pub async fn record_success(&self, key: &str, permit: Permit) {
        let breaker = self.breaker(key);
        let mut state = breaker.lock().await;
        if state.on_success(permit) == Change::Closed {
            self.sink.record(Observation::CircuitClosed {
                key: key.to_string(),
            });
        }
    }

    pub async fn record_failure(&self, key: &str, permit: Permit) {
        let breaker = self.breaker(key);
        let mut state = breaker.lock().await;
        if state.on_failure(permit, Instant::now()) == Change::Opened {
            self.sink.record(Observation::CircuitOpened {
                key: key.to_string(),
                failure_count: state.failure_count,
            });
        }
    }

    /// Release a half-open trial whose attempt ended without an outcome
    pub async fn abandon_trial(&self, key: &str, permit: Permit) {
        let breaker = self.breaker(key);
        breaker.lock().await.abandon_trial(permit);
    }

    /// Remaining cooldown if the breaker for `key` is open
    pub async fn open_for(&self, key: &str) -> Option<Duration> {
        let breaker = self.breakers.get(key).map(|b| b.clone())?;
        let state = breaker.lock().await;
        state.remaining(Instant::now())
    }

    pub async fn state(&self, key: &str) -> CircuitState {
        match self.breakers.get(key).map(|b| b.clone()) {
            Some(breaker) => breaker.lock().await.state,
            None => CircuitState::Closed,
        }
    }

    pub async fn snapshot(&self, key: &str) -> Option<CircuitBreakerState> {
        let breaker = self.breakers.get(key).map(|b| b.clone())?;
        let state = breaker.lock().await.clone();
        Some(state)
    }

    /// Force a breaker back to closed
    pub async fn reset(&self, key: &str) {
        let breaker = self.breaker(key);
        let mut state = breaker.lock().await;
        let config = CircuitBreakerConfig {
            threshold: state.threshold,
            cooldown: state.cooldown,
        };
        let generation = state.generation + 1;
        *state = CircuitBreakerState::new(config);
        state.generation = generation;
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
