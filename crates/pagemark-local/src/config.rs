//! Runtime knobs, read from `PAGEMARK_*` environment variables.
//!
//! Unset, empty or unparsable values fall back to the defaults; numeric values are
//! clamped.

use std::path::PathBuf;
use std::time::Duration;

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env(key)
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env(key)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_ms).min(max_ms))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Settling time after load before the first attempt.
    pub initial_delay: Duration,
    pub attempt_timeout: Duration,
    /// Wait before retry `n` is `n * backoff_unit`.
    pub backoff_unit: Duration,
    pub max_attempts: u32,
    pub load_timeout: Duration,
    /// Outer bound applied by the control surface.
    pub end_to_end_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_millis(3000),
            backoff_unit: Duration::from_millis(500),
            max_attempts: 3,
            load_timeout: Duration::from_millis(15_000),
            end_to_end_timeout: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightConfig {
    pub per_term_cap: usize,
    pub emphasis: Duration,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            per_term_cap: crate::highlight::DEFAULT_PER_TERM_CAP,
            emphasis: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffConfig {
    pub max_age: Duration,
    /// Directory for the file-backed store; `None` means in-memory only.
    pub dir: Option<PathBuf>,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(300),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagemarkConfig {
    pub delivery: DeliveryConfig,
    pub highlight: HighlightConfig,
    pub handoff: HandoffConfig,
}

impl PagemarkConfig {
    pub fn from_env() -> Self {
        let d = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            initial_delay: env_ms("PAGEMARK_INITIAL_DELAY_MS", 1000, 60_000),
            attempt_timeout: env_ms("PAGEMARK_ATTEMPT_TIMEOUT_MS", 3000, 120_000)
                .max(Duration::from_millis(1)),
            backoff_unit: env_ms("PAGEMARK_BACKOFF_UNIT_MS", 500, 60_000),
            max_attempts: env_usize("PAGEMARK_MAX_ATTEMPTS", d.max_attempts as usize).clamp(1, 10)
                as u32,
            load_timeout: env_ms("PAGEMARK_LOAD_TIMEOUT_MS", 15_000, 300_000),
            end_to_end_timeout: env_ms("PAGEMARK_END_TO_END_TIMEOUT_MS", 30_000, 600_000)
                .max(Duration::from_millis(1)),
        };
        let highlight = HighlightConfig {
            per_term_cap: env_usize(
                "PAGEMARK_PER_TERM_CAP",
                crate::highlight::DEFAULT_PER_TERM_CAP,
            )
            .clamp(1, 50),
            emphasis: env_ms("PAGEMARK_EMPHASIS_MS", 2000, 60_000),
        };
        let handoff = HandoffConfig {
            max_age: Duration::from_secs(env_u64("PAGEMARK_HANDOFF_MAX_AGE_S", 300).max(1)),
            dir: env("PAGEMARK_HANDOFF_DIR").map(PathBuf::from),
        };
        Self {
            delivery,
            highlight,
            handoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_documented_values() {
        let c = PagemarkConfig::default();
        assert_eq!(c.delivery.initial_delay, Duration::from_millis(1000));
        assert_eq!(c.delivery.attempt_timeout, Duration::from_millis(3000));
        assert_eq!(c.delivery.backoff_unit, Duration::from_millis(500));
        assert_eq!(c.delivery.max_attempts, 3);
        assert_eq!(c.highlight.per_term_cap, 3);
        assert_eq!(c.handoff.max_age, Duration::from_secs(300));
        assert!(c.handoff.dir.is_none());
    }

    #[test]
    fn env_overrides_are_parsed_and_clamped() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("PAGEMARK_MAX_ATTEMPTS", "99");
        std::env::set_var("PAGEMARK_BACKOFF_UNIT_MS", " 250 ");
        std::env::set_var("PAGEMARK_PER_TERM_CAP", "not-a-number");
        let c = PagemarkConfig::from_env();
        std::env::remove_var("PAGEMARK_MAX_ATTEMPTS");
        std::env::remove_var("PAGEMARK_BACKOFF_UNIT_MS");
        std::env::remove_var("PAGEMARK_PER_TERM_CAP");
        assert_eq!(c.delivery.max_attempts, 10);
        assert_eq!(c.delivery.backoff_unit, Duration::from_millis(250));
        assert_eq!(c.highlight.per_term_cap, 3);
    }
}
