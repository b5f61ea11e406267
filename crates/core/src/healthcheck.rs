//! Healthcheck descriptors and normalization of docker image healthcheck config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// First element of a healthcheck `test` vector: remaining elements are the
/// argv, executed directly.
pub const TEST_CMD: &str = "CMD";
/// First element of a healthcheck `test` vector: the single remaining element
/// is a shell command line.
pub const TEST_CMD_SHELL: &str = "CMD-SHELL";
/// A `test` of exactly `["NONE"]` disables the healthcheck.
pub const TEST_NONE: &str = "NONE";

/// Docker defaults applied when an image config leaves a field unset or zero.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 3;

/// Normalized healthcheck descriptor: `{test, interval, timeout, retries}`.
/// Exit 0 of the test command means healthy; non-zero means unhealthy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Healthcheck {
    /// `["CMD", ...argv]` or `["CMD-SHELL", command]`.
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

impl Healthcheck {
    /// True when the test is a `CMD-SHELL` command line.
    pub fn is_shell(&self) -> bool {
        self.test.first().map(String::as_str) == Some(TEST_CMD_SHELL)
    }

    /// The argv to execute: `CMD-SHELL` is wrapped in `/bin/sh -c`, `CMD` is
    /// taken verbatim.
    pub fn command(&self) -> Vec<String> {
        if self.is_shell() {
            let mut cmd = vec!["/bin/sh".to_string(), "-c".to_string()];
            cmd.extend(self.test.iter().skip(1).cloned());
            cmd
        } else {
            self.test.iter().skip(1).cloned().collect()
        }
    }
}

/// Normalize the healthcheck block of a docker image config into a
/// [`Healthcheck`]. Returns `None` when the image declares no usable test
/// (absent, empty, or `["NONE"]`). Durations are nanoseconds in the image
/// config; zero or negative values fall back to the docker defaults.
pub fn from_image_config(
    test: &[String],
    interval_ns: i64,
    timeout_ns: i64,
    retries: i64,
) -> Option<Healthcheck> {
    match test.first().map(String::as_str) {
        None | Some(TEST_NONE) => return None,
        Some(TEST_CMD) | Some(TEST_CMD_SHELL) => {}
        // Docker treats an unrecognized discriminator as no healthcheck.
        Some(_) => return None,
    }
    if test.len() < 2 {
        return None;
    }
    let duration = |ns: i64, default: Duration| {
        if ns > 0 {
            Duration::from_nanos(ns as u64)
        } else {
            default
        }
    };
    Some(Healthcheck {
        test: test.to_vec(),
        interval: duration(interval_ns, DEFAULT_INTERVAL),
        timeout: duration(timeout_ns, DEFAULT_TIMEOUT),
        retries: if retries > 0 {
            retries as u32
        } else {
            DEFAULT_RETRIES
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn none_and_empty_tests_are_absent() {
        assert_eq!(from_image_config(&[], 0, 0, 0), None);
        assert_eq!(from_image_config(&strs(&["NONE"]), 0, 0, 0), None);
        assert_eq!(from_image_config(&strs(&["CMD"]), 0, 0, 0), None);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let hc = from_image_config(&strs(&["CMD-SHELL", "curl localhost"]), 0, 0, 0).unwrap();
        assert_eq!(hc.interval, DEFAULT_INTERVAL);
        assert_eq!(hc.timeout, DEFAULT_TIMEOUT);
        assert_eq!(hc.retries, DEFAULT_RETRIES);
    }

    #[test]
    fn explicit_fields_survive() {
        let hc = from_image_config(
            &strs(&["CMD", "pg_isready"]),
            5_000_000_000,
            2_000_000_000,
            7,
        )
        .unwrap();
        assert_eq!(hc.interval, Duration::from_secs(5));
        assert_eq!(hc.timeout, Duration::from_secs(2));
        assert_eq!(hc.retries, 7);
    }

    #[test]
    fn shell_tests_wrap_in_sh() {
        let hc = from_image_config(&strs(&["CMD-SHELL", "exit 0"]), 0, 0, 0).unwrap();
        assert_eq!(hc.command(), strs(&["/bin/sh", "-c", "exit 0"]));
        let hc = from_image_config(&strs(&["CMD", "true"]), 0, 0, 0).unwrap();
        assert_eq!(hc.command(), strs(&["true"]));
    }
}
