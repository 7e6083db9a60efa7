//! Environment-style configuration.
//!
//! Recognized keys are read verbatim from the process environment:
//!
//! | Key | Meaning | Default |
//! |---|---|---|
//! | `xio_polling_timeout_us` | event-loop poll budget, accepted for compatibility | 0 |
//! | `xio_keepalive_time` | seconds a connection stays idle before probing | 600 |
//! | `xio_keepalive_intvl` | seconds between probes | 60 |
//! | `xio_keepalive_probes` | unanswered probes before the connection drops | 20 |
//! | `completion_pool_size` | completion dispatcher threads | 4 |
//! | `slab_manager_check_interval_mins` | pool reclamation period | 15 |

use std::str::FromStr;
use std::time::Duration;

pub const KEY_POLLING_TIMEOUT_US: &str = "xio_polling_timeout_us";
pub const KEY_KEEPALIVE_TIME: &str = "xio_keepalive_time";
pub const KEY_KEEPALIVE_INTVL: &str = "xio_keepalive_intvl";
pub const KEY_KEEPALIVE_PROBES: &str = "xio_keepalive_probes";
pub const KEY_COMPLETION_POOL_SIZE: &str = "completion_pool_size";
/// Reply workers of the legacy shared-memory transport; recognized for
/// compatibility, unused by the network transport.
pub const KEY_IO_THREADS_POOL_SIZE: &str = "io_threads_pool_size";

/// Reads `key` from the environment, falling back to `default` when the
/// variable is unset or does not parse.
pub fn env_or_default<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// TCP keepalive settings applied to every protocol connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub time: Duration,
    pub interval: Duration,
    pub probes: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            time: Duration::from_secs(600),
            interval: Duration::from_secs(60),
            probes: 20,
        }
    }
}

impl KeepaliveConfig {
    /// Defaults overridden by the `xio_keepalive_*` environment keys.
    pub fn from_env() -> KeepaliveConfig {
        let defaults = KeepaliveConfig::default();
        KeepaliveConfig {
            time: Duration::from_secs(env_or_default(
                KEY_KEEPALIVE_TIME,
                defaults.time.as_secs(),
            )),
            interval: Duration::from_secs(env_or_default(
                KEY_KEEPALIVE_INTVL,
                defaults.interval.as_secs(),
            )),
            probes: env_or_default(KEY_KEEPALIVE_PROBES, defaults.probes),
        }
    }
}

/// The legacy poll budget knob; parsed and reported only, the reactor needs
/// no poll budget.
pub fn polling_timeout() -> Duration {
    Duration::from_micros(env_or_default(KEY_POLLING_TIMEOUT_US, 0u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_default_falls_back() {
        assert_eq!(env_or_default("nvp_test_unset_key", 42u32), 42);
    }

    #[test]
    fn keepalive_defaults() {
        let ka = KeepaliveConfig::default();
        assert_eq!(ka.time, Duration::from_secs(600));
        assert_eq!(ka.interval, Duration::from_secs(60));
        assert_eq!(ka.probes, 20);
    }
}
