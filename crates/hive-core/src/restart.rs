//! Restart policy: bounded backoff and sliding-window restart budgets.
//!
//! The supervisor consults a [`RestartManager`] every time a worker dies.
//! The manager answers with either a backoff delay for the next respawn or
//! a decision to disable the worker until an operator resets it.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Restart configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Total restart budget across the supervisor's lifetime.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Sliding window for counting restart bursts.
    #[serde(default = "default_restart_window")]
    #[serde(with = "humantime_serde")]
    pub restart_window: Duration,

    /// Restarts tolerated inside one window before the worker is disabled.
    #[serde(default = "default_window_limit")]
    pub window_limit: u32,

    /// Backoff between restart attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_max_restarts() -> u32 {
    1000
}

const fn default_restart_window() -> Duration {
    Duration::from_secs(300)
}

const fn default_window_limit() -> u32 {
    10
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            window_limit: default_window_limit(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between restarts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff with a hard cap.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each attempt (default 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi(attempt.saturating_sub(1) as i32);
                Duration::from_secs_f64(delay_secs).min(*max_delay)
            },
        }
    }
}

/// What the supervisor should do after a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after `delay`; this is restart number `restart_count`.
    Schedule {
        /// Backoff delay before the respawn.
        delay: Duration,
        /// Total restarts recorded so far, including this one.
        restart_count: u32,
    },

    /// Budget exhausted; do not respawn until a manual reset.
    Disable {
        /// Total restarts recorded.
        restart_count: u32,
        /// Restarts that fell inside the current window.
        window_count: u32,
    },
}

/// Tracks restart history for a single worker and applies the budget.
#[derive(Debug)]
pub struct RestartManager {
    config: RestartConfig,
    history: Vec<Instant>,
    restart_count: u32,
    disabled: bool,
}

impl RestartManager {
    /// Create a new restart manager.
    #[must_use]
    pub const fn new(config: RestartConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
            restart_count: 0,
            disabled: false,
        }
    }

    /// Record a worker failure and decide what to do about it.
    pub fn record_failure(&mut self) -> RestartDecision {
        self.record_failure_at(Instant::now())
    }

    /// Clock-injected variant of [`Self::record_failure`].
    pub fn record_failure_at(&mut self, now: Instant) -> RestartDecision {
        self.restart_count = self.restart_count.saturating_add(1);
        self.history
            .retain(|stamp| now.duration_since(*stamp) <= self.config.restart_window);
        self.history.push(now);
        let window_count = u32::try_from(self.history.len()).unwrap_or(u32::MAX);

        if self.disabled
            || window_count > self.config.window_limit
            || self.restart_count > self.config.max_restarts
        {
            self.disabled = true;
            return RestartDecision::Disable {
                restart_count: self.restart_count,
                window_count,
            };
        }

        RestartDecision::Schedule {
            delay: self.config.backoff.delay_for_attempt(self.restart_count),
            restart_count: self.restart_count,
        }
    }

    /// Total restarts recorded.
    #[must_use]
    pub const fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Whether the worker is disabled.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Manual reset: clears the disable latch and the window history. The
    /// total restart count is preserved for observability.
    pub fn reset(&mut self) {
        self.disabled = false;
        self.history.clear();
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
