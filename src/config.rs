//! Session configuration.
//!
//! [`LinkConfig`] is a plain struct with public fields. Hosts typically load it
//! from their own settings file (it implements `serde::Deserialize`, and missing
//! fields fall back to their defaults) and hand it to [`Match::new`](crate::Match::new).
//!
//! # Example
//!
//! ```
//! use rollback_link::LinkConfig;
//!
//! let config = LinkConfig {
//!     input_delay: 3,
//!     ..LinkConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use web_time::Duration;

use crate::error::LinkError;
use crate::fastforward::DEFAULT_MAX_FRAMES_PER_TICK;
use crate::input_queue::DEFAULT_QUEUE_CAPACITY;

/// Everything tunable about a session.
///
/// New fields may be added; construct with `..LinkConfig::default()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Ticks of local input held back before pairing. Higher values hide more
    /// latency at the cost of responsiveness.
    ///
    /// Default: 2
    pub input_delay: usize,

    /// Per-player input buffer capacity. Must exceed `input_delay`.
    ///
    /// Default: 60
    pub queue_capacity: usize,

    /// How long the handshake may take in total.
    ///
    /// Default: 30s
    pub handshake_timeout: Duration,

    /// Nominal simulation rate, in ticks per second.
    ///
    /// Default: 60
    pub expected_fps: u32,

    /// How many round-trip samples the median latency is taken over.
    ///
    /// Default: 9
    pub rtt_window: usize,

    /// Time between latency pings.
    ///
    /// Default: 1s
    pub ping_interval: Duration,

    /// Ticks a locally committed turn waits before it is attached to an input.
    ///
    /// Default: 64
    pub turn_commit_delay: u32,

    /// Directory new replay files are created in.
    ///
    /// Default: `replays`
    pub replay_dir: PathBuf,

    /// Whether replay files are zstd-compressed.
    ///
    /// Default: true
    pub compress_replays: bool,

    /// Frames the offline simulation may run per tick without reaching the
    /// input intercept before a fastforward fails.
    ///
    /// Default: 8
    pub max_frames_per_tick: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            input_delay: 2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: Duration::from_secs(30),
            expected_fps: 60,
            rtt_window: 9,
            ping_interval: Duration::from_secs(1),
            turn_commit_delay: 64,
            replay_dir: PathBuf::from("replays"),
            compress_replays: true,
            max_frames_per_tick: DEFAULT_MAX_FRAMES_PER_TICK,
        }
    }
}

impl LinkConfig {
    /// Preset for local networks: minimal delay, short handshake timeout.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            input_delay: 1,
            handshake_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Preset for 100-200ms round trips: more delay and a deeper queue.
    #[must_use]
    pub fn high_latency() -> Self {
        Self {
            input_delay: 4,
            queue_capacity: 120,
            handshake_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Checks every field against its valid range.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidRequest`] naming the first field out of range.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.queue_capacity < 2 {
            return Err(out_of_range("queue_capacity", ">= 2", self.queue_capacity));
        }
        if self.input_delay >= self.queue_capacity {
            return Err(LinkError::invalid_request(format!(
                "input_delay {} must be below queue_capacity {}",
                self.input_delay, self.queue_capacity
            )));
        }
        if !(1..=240).contains(&self.expected_fps) {
            return Err(out_of_range("expected_fps", "1..=240", self.expected_fps));
        }
        if !(1..=256).contains(&self.rtt_window) {
            return Err(out_of_range("rtt_window", "1..=256", self.rtt_window));
        }
        if self.ping_interval < Duration::from_millis(1) || self.ping_interval > Duration::from_secs(60) {
            return Err(out_of_range(
                "ping_interval",
                "1ms..=60s",
                format_args!("{:?}", self.ping_interval),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(out_of_range("handshake_timeout", "> 0", "0s"));
        }
        if self.turn_commit_delay == 0 {
            return Err(out_of_range("turn_commit_delay", ">= 1", 0));
        }
        if self.max_frames_per_tick == 0 {
            return Err(out_of_range("max_frames_per_tick", ">= 1", 0));
        }
        Ok(())
    }
}

fn out_of_range(field: &str, range: &str, actual: impl std::fmt::Display) -> LinkError {
    LinkError::invalid_request(format!("{} must be {}, got {}", field, range, actual))
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for config in [LinkConfig::default(), LinkConfig::lan(), LinkConfig::high_latency()] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn delay_must_fit_in_queue() {
        let config = LinkConfig {
            input_delay: 60,
            queue_capacity: 60,
            ..LinkConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("input_delay"), "{err}");
    }

    #[test]
    fn zero_fields_are_rejected() {
        let cases = [
            LinkConfig {
                expected_fps: 0,
                ..LinkConfig::default()
            },
            LinkConfig {
                rtt_window: 0,
                ..LinkConfig::default()
            },
            LinkConfig {
                ping_interval: Duration::ZERO,
                ..LinkConfig::default()
            },
            LinkConfig {
                handshake_timeout: Duration::ZERO,
                ..LinkConfig::default()
            },
            LinkConfig {
                max_frames_per_tick: 0,
                ..LinkConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(LinkError::InvalidRequest { .. })),
                "{config:?}"
            );
        }
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: LinkConfig =
            serde_json::from_str(r#"{"input_delay": 5, "replay_dir": "out"}"#).unwrap();
        assert_eq!(config.input_delay, 5);
        assert_eq!(config.replay_dir, PathBuf::from("out"));
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.rtt_window, 9);
    }
}
