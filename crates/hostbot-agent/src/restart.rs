//! Crash restart policy: exponential backoff plus a restarts-per-window
//! circuit breaker.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartConfig {
    /// Restarts allowed inside `window` before the breaker opens.
    pub max_restarts: u32,
    pub window: Duration,
    /// A run that lasted this long resets the backoff and closes the breaker.
    pub min_uptime: Duration,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    pub restart_on_success: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(5 * 60),
            min_uptime: Duration::from_secs(30),
            backoff_ms: 2000,
            backoff_max_ms: 120_000,
            restart_on_success: true,
        }
    }
}

pub fn compute_backoff_ms(cfg: &RestartConfig, attempt: u32) -> u64 {
    // attempt is 1-based.
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
    cfg.backoff_ms.saturating_mul(mult).min(cfg.backoff_max_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    CleanExit,
    CircuitOpen { restarts: u32, window: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32, delay: Duration },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone)]
pub struct RestartTracker {
    config: RestartConfig,
    history: VecDeque<Instant>,
    backoff_attempt: u32,
}

impl RestartTracker {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            backoff_attempt: 0,
        }
    }

    /// Call with the uptime of the run that just ended, before `decide`.
    pub fn note_uptime(&mut self, uptime: Duration) {
        if uptime >= self.config.min_uptime {
            self.backoff_attempt = 0;
            self.history.clear();
        }
    }

    pub fn decide(&mut self, exit_code: Option<i32>, now: Instant) -> RestartDecision {
        self.prune(now);

        if exit_code == Some(0) && !self.config.restart_on_success {
            return RestartDecision::GiveUp(GiveUpReason::CleanExit);
        }

        let restarts = self.history.len() as u32;
        if restarts >= self.config.max_restarts {
            return RestartDecision::GiveUp(GiveUpReason::CircuitOpen {
                restarts,
                window: self.config.window,
            });
        }

        self.backoff_attempt = self.backoff_attempt.saturating_add(1);
        self.history.push_back(now);
        RestartDecision::Restart {
            attempt: restarts + 1,
            delay: Duration::from_millis(compute_backoff_ms(&self.config, self.backoff_attempt)),
        }
    }

    pub fn restarts_in_window(&self, now: Instant) -> u32 {
        self.history
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= self.config.window)
            .count() as u32
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.history.front() {
            if now.saturating_duration_since(*front) > self.config.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }
}
