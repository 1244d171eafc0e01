//! Decides what happens after a failure: wait and try again, give up on the
//! library, or give up on the whole run.

use std::time::Duration;

use crate::config;
use crate::error::ErrorClass;

/// Retry knobs, all delays in seconds
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retry_count: u32,
    pub delay_intervals: Vec<u64>,
    pub conflict_delays: Vec<u64>,
    pub max_object_retries: u32,
    pub object_retry_delays: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_retry_count: 3,
            delay_intervals: vec![2, 10, 60],
            conflict_delays: vec![0, 10, 20, 30],
            max_object_retries: 5,
            object_retry_delays: vec![0, 60, 300, 900, 3600],
        }
    }
}

impl RetryPolicy {
    /// Read the policy from the `sync` config section, falling back to the
    /// defaults for anything missing.
    pub fn from_config() -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retry_count: config::get_opt(&["sync", "max_retry_count"]).unwrap_or(defaults.max_retry_count),
            delay_intervals: config::get_opt(&["sync", "delay_intervals"]).unwrap_or(defaults.delay_intervals),
            conflict_delays: config::get_opt(&["sync", "conflict_delays"]).unwrap_or(defaults.conflict_delays),
            max_object_retries: config::get_opt(&["sync", "max_object_retries"]).unwrap_or(defaults.max_object_retries),
            object_retry_delays: config::get_opt(&["sync", "object_retry_delays"]).unwrap_or(defaults.object_retry_delays),
        }
    }

    /// Object backoff delays as the store wants them (signed seconds)
    pub fn object_delays(&self) -> Vec<i64> {
        self.object_retry_delays.iter().map(|x| *x as i64).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    AbortLibrary,
    AbortSync,
}

/// Pick `delays[min(attempt, len - 1)]`, or nothing for an empty list
fn delay_for(delays: &[u64], attempt: u32) -> Duration {
    if delays.len() == 0 {
        return Duration::from_secs(0);
    }
    let idx = std::cmp::min(attempt as usize, delays.len() - 1);
    Duration::from_secs(delays[idx])
}

/// Given how many times we already retried (`attempt`, starting at 0) and
/// the kind of failure, decide what to do next.
pub fn decide(attempt: u32, class: ErrorClass, policy: &RetryPolicy) -> RetryDecision {
    match class {
        ErrorClass::Fatal => RetryDecision::AbortSync,
        ErrorClass::Precondition => {
            // a conflict always gets at least one more go
            if attempt == 0 || attempt < policy.max_retry_count {
                RetryDecision::RetryAfter(delay_for(&policy.conflict_delays, attempt))
            } else {
                RetryDecision::AbortLibrary
            }
        }
        ErrorClass::Library | ErrorClass::Transport | ErrorClass::Object => {
            if attempt < policy.max_retry_count {
                RetryDecision::RetryAfter(delay_for(&policy.delay_intervals, attempt))
            } else {
                RetryDecision::AbortLibrary
            }
        }
    }
}
