//! # Circuit Breakers
//!
//! Per-provider circuit breakers for upstream failure isolation.
//!
//! ## States
//!
//! Each breaker operates in three states:
//!
//! - **Closed**: normal operation. Qualifying failures are timestamped
//!   into a rolling window; reaching the threshold within the window
//!   opens the circuit.
//! - **Open**: requests short-circuit without contacting the upstream.
//!   After the cooldown elapses, the next request is admitted as a
//!   probe.
//! - **HalfOpen**: a bounded number of probes are in flight. A success
//!   closes the circuit; any failure reopens it and restarts the
//!   cooldown.
//!
//! ## Sharding and lifetime
//!
//! One state cell per provider id, sharded in a concurrent map so
//! breakers on different providers never contend. Breaker state is
//! long-lived runtime state: it is keyed by the stable provider id and
//! survives registry snapshot swaps, provider edits and disable/enable
//! cycles. Administrative reset replaces the cell outright, so the next
//! request observes Closed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::common::duration_serde;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation; failures counted.
    Closed,
    /// Short-circuiting; no upstream contact until the cooldown elapses.
    Open,
    /// Cooldown elapsed; a limited number of probes are in flight.
    HalfOpen,
}

/// What the gate tells the dispatcher about one provider right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// Allowed as a half-open probe; the caller must report the outcome.
    AllowProbe,
    ShortCircuit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Qualifying failures within the window before the circuit opens.
    pub failure_threshold: u32,
    /// Rolling window failures are counted in.
    #[serde(with = "duration_serde")]
    pub window: Duration,
    /// How long an open circuit waits before permitting probes.
    #[serde(with = "duration_serde")]
    pub cooldown: Duration,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerCell {
    state: BreakerState,
    /// Timestamps of qualifying failures, oldest first.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    last_failure: Option<String>,
}

impl Default for BreakerCell {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probes_in_flight: 0,
            last_failure: None,
        }
    }
}

/// Point-in-time view of one breaker, for metrics and admin.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: BreakerState,
    pub recent_failures: u32,
    pub last_failure: Option<String>,
    /// Seconds until probes are permitted, when open.
    pub reopen_in_secs: Option<u64>,
}

/// The breaker table: one cell per provider, created lazily.
pub struct BreakerTable {
    config: BreakerConfig,
    cells: DashMap<String, BreakerCell>,
}

impl BreakerTable {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            cells: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Gate one attempt against a provider. A [`BreakerDecision::AllowProbe`]
    /// result reserves a half-open probe slot; the caller must follow up
    /// with [`on_success`](Self::on_success) or [`on_failure`](Self::on_failure).
    pub fn try_acquire(&self, provider_id: &str) -> BreakerDecision {
        let now = Instant::now();
        let mut cell = self.cells.entry(provider_id.to_string()).or_default();
        match cell.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                let elapsed = cell
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    cell.state = BreakerState::HalfOpen;
                    cell.probes_in_flight = 1;
                    tracing::info!(provider = provider_id, "breaker half-open, probing");
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::ShortCircuit
                }
            }
            BreakerState::HalfOpen => {
                if cell.probes_in_flight < self.config.half_open_max_probes {
                    cell.probes_in_flight += 1;
                    BreakerDecision::AllowProbe
                } else {
                    BreakerDecision::ShortCircuit
                }
            }
        }
    }

    /// Record a successful call. In half-open this closes the circuit.
    pub fn on_success(&self, provider_id: &str) {
        let mut cell = self.cells.entry(provider_id.to_string()).or_default();
        match cell.state {
            BreakerState::Closed => {
                cell.failures.clear();
            }
            BreakerState::HalfOpen => {
                tracing::info!(provider = provider_id, "breaker closed after probe");
                *cell = BreakerCell::default();
            }
            BreakerState::Open => {
                // A request admitted before the circuit opened finished
                // late; the open state stands until a probe succeeds.
            }
        }
    }

    /// Record a qualifying failure (upstream was contacted and the error
    /// class trips the breaker).
    ///
    /// `retryable` distinguishes transient failures, which count toward the
    /// rolling-window threshold, from permanent ones, which leave a closed
    /// circuit untouched but abort a half-open probe.
    pub fn on_failure(&self, provider_id: &str, retryable: bool, summary: &str) {
        let now = Instant::now();
        let mut cell = self.cells.entry(provider_id.to_string()).or_default();
        cell.last_failure = Some(summary.to_string());
        match cell.state {
            BreakerState::Closed => {
                if !retryable {
                    return;
                }
                cell.failures.push_back(now);
                if let Some(horizon) = now.checked_sub(self.config.window) {
                    while cell.failures.front().is_some_and(|t| *t < horizon) {
                        cell.failures.pop_front();
                    }
                }
                if cell.failures.len() as u32 >= self.config.failure_threshold {
                    cell.state = BreakerState::Open;
                    cell.opened_at = Some(now);
                    tracing::warn!(
                        provider = provider_id,
                        failures = cell.failures.len(),
                        "breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                cell.state = BreakerState::Open;
                cell.opened_at = Some(now);
                cell.probes_in_flight = 0;
                tracing::warn!(provider = provider_id, "breaker reopened after failed probe");
            }
            BreakerState::Open => {}
        }
    }

    /// Force a provider open, bypassing the threshold. Used when the
    /// provider's configuration itself is broken.
    pub fn force_open(&self, provider_id: &str, summary: &str) {
        let mut cell = self.cells.entry(provider_id.to_string()).or_default();
        cell.state = BreakerState::Open;
        cell.opened_at = Some(Instant::now());
        cell.probes_in_flight = 0;
        cell.last_failure = Some(summary.to_string());
        tracing::warn!(provider = provider_id, summary, "breaker forced open");
    }

    /// Administrative reset: the next request observes Closed.
    pub fn reset(&self, provider_id: &str) {
        self.cells
            .insert(provider_id.to_string(), BreakerCell::default());
        tracing::info!(provider = provider_id, "breaker reset");
    }

    pub fn state(&self, provider_id: &str) -> BreakerState {
        self.cells
            .get(provider_id)
            .map(|cell| cell.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        self.cells
            .iter()
            .map(|entry| {
                let cell = entry.value();
                let reopen_in_secs = match (cell.state, cell.opened_at) {
                    (BreakerState::Open, Some(at)) => Some(
                        self.config
                            .cooldown
                            .saturating_sub(now.duration_since(at))
                            .as_secs(),
                    ),
                    _ => None,
                };
                BreakerSnapshot {
                    provider_id: entry.key().clone(),
                    state: cell.state,
                    recent_failures: cell.failures.len() as u32,
                    last_failure: cell.last_failure.clone(),
                    reopen_in_secs,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(threshold: u32, cooldown: Duration) -> BreakerTable {
        BreakerTable::new(BreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(60),
            cooldown,
            half_open_max_probes: 1,
        })
    }

    #[test]
    fn opens_only_at_threshold() {
        let table = table(3, Duration::from_secs(30));
        for _ in 0..2 {
            assert_eq!(table.try_acquire("p"), BreakerDecision::Allow);
            table.on_failure("p", true, "503");
            assert_eq!(table.state("p"), BreakerState::Closed);
        }
        table.on_failure("p", true, "503");
        assert_eq!(table.state("p"), BreakerState::Open);
        assert_eq!(table.try_acquire("p"), BreakerDecision::ShortCircuit);
    }

    #[test]
    fn success_resets_the_failure_window() {
        let table = table(2, Duration::from_secs(30));
        table.on_failure("p", true, "503");
        table.on_success("p");
        table.on_failure("p", true, "503");
        assert_eq!(table.state("p"), BreakerState::Closed);
    }

    #[test]
    fn permanent_failures_do_not_open_a_closed_circuit() {
        let table = table(1, Duration::from_secs(30));
        table.on_failure("p", false, "garbled response");
        assert_eq!(table.state("p"), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let table = table(1, Duration::from_millis(10));
        table.on_failure("p", true, "503");
        assert_eq!(table.state("p"), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(table.try_acquire("p"), BreakerDecision::AllowProbe);
        // Only one probe slot while half-open.
        assert_eq!(table.try_acquire("p"), BreakerDecision::ShortCircuit);

        table.on_success("p");
        assert_eq!(table.state("p"), BreakerState::Closed);
        assert_eq!(table.try_acquire("p"), BreakerDecision::Allow);
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let table = table(1, Duration::from_millis(10));
        table.on_failure("p", true, "503");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(table.try_acquire("p"), BreakerDecision::AllowProbe);
        table.on_failure("p", true, "503 again");
        assert_eq!(table.state("p"), BreakerState::Open);
        assert_eq!(table.try_acquire("p"), BreakerDecision::ShortCircuit);
    }

    #[test]
    fn reset_returns_to_closed() {
        let table = table(1, Duration::from_secs(3600));
        table.on_failure("p", true, "503");
        assert_eq!(table.state("p"), BreakerState::Open);
        table.reset("p");
        assert_eq!(table.state("p"), BreakerState::Closed);
        assert_eq!(table.try_acquire("p"), BreakerDecision::Allow);
    }

    #[test]
    fn breakers_are_independent_per_provider() {
        let table = table(1, Duration::from_secs(3600));
        table.on_failure("a", true, "503");
        assert_eq!(table.state("a"), BreakerState::Open);
        assert_eq!(table.state("b"), BreakerState::Closed);
    }
}
