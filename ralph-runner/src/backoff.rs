//! Wait scheduling for rate limits and transient server errors.
//!
//! When the agent's usage window is exhausted its final result message
//! names the wall-clock hour at which the window reopens, e.g.
//! `You've hit your limit · resets 2am (America/Los_Angeles)`. This module
//! parses that marker, turns it into a concrete reset instant, and
//! computes how long to wait. It never sleeps itself; the loop controller
//! owns the (cancellable) wait.

use std::time::Duration;

use chrono::{DateTime, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::config::BackoffConfig;

/// Half of the 12-hour clock named in a reset marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meridiem {
    Am,
    Pm,
}

/// Parsed reset time from a rate-limit message: an hour on the 12-hour
/// clock in a named IANA timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetSpec {
    pub hour: u32,
    pub meridiem: Meridiem,
    pub zone: Tz,
}

impl ResetSpec {
    fn hour_24(&self) -> u32 {
        match self.meridiem {
            Meridiem::Am => {
                if self.hour == 12 {
                    0
                } else {
                    self.hour
                }
            }
            Meridiem::Pm => {
                if self.hour == 12 {
                    12
                } else {
                    self.hour + 12
                }
            }
        }
    }

    /// The reset hour on the given date, in the reset's own timezone.
    /// A DST gap (the hour does not exist that day) resolves to the
    /// following hour; an ambiguous hour resolves to its first occurrence.
    fn on_date(&self, date: NaiveDate) -> Option<DateTime<Tz>> {
        let naive = date.and_hms_opt(self.hour_24(), 0, 0)?;
        match self.zone.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(first, _) => Some(first),
            LocalResult::None => {
                let shifted = naive + chrono::Duration::hours(1);
                self.zone.from_local_datetime(&shifted).earliest()
            }
        }
    }

    /// Next instant at which this wall-clock hour occurs: today if still
    /// ahead, otherwise tomorrow.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.zone);
        let mut date = local_now.date_naive();
        for _ in 0..3 {
            if let Some(reset) = self.on_date(date) {
                if reset > local_now {
                    return reset.with_timezone(&Utc);
                }
            }
            date = date.succ_opt().unwrap_or(date);
        }
        now + chrono::Duration::days(1)
    }
}

/// A single computed wait: how long to sleep and why
#[derive(Debug, Clone)]
pub struct BackoffPlan {
    pub wait: Duration,
    pub reason: String,
}

/// Extract the reset spec from a rate-limit message, if present.
///
/// Expected shape: `resets 2am (America/Los_Angeles)`; matching is
/// case-insensitive and whitespace-tolerant.
pub fn parse_reset_marker(text: &str) -> Option<ResetSpec> {
    let re = Regex::new(r"(?i)resets\s+(\d{1,2})(am|pm)\s+\(([^)]+)\)")
        .expect("invalid reset marker regex");
    let caps = re.captures(text)?;
    let hour: u32 = caps[1].parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let meridiem = if caps[2].eq_ignore_ascii_case("am") {
        Meridiem::Am
    } else {
        Meridiem::Pm
    };
    let zone: Tz = caps[3].parse().ok()?;
    Some(ResetSpec {
        hour,
        meridiem,
        zone,
    })
}

/// Whether a result message indicates the usage window is exhausted
pub fn is_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("hit your limit")
        || lower.contains("rate limit")
        || lower.contains("usage limit")
        || parse_reset_marker(text).is_some()
}

/// Whether a result message indicates a transient API server error
/// (500/529/overloaded class), retryable with exponential backoff
pub fn is_server_error(text: &str) -> bool {
    let patterns = [
        r"status[_\s]?code[:\s]+5\d{2}",
        r"\b5\d{2}\b.*error",
        r"error.*\b5\d{2}\b",
        r"overloaded",
        r"internal[_\s]?server[_\s]?error",
        r"service[_\s]?unavailable",
        r"apistatuserror.*5\d{2}",
    ];
    let lower = text.to_lowercase();
    patterns.iter().any(|p| {
        Regex::new(p)
            .expect("invalid server error regex")
            .is_match(&lower)
    })
}

/// Compute the wait for a rate-limit event.
///
/// With a known reset instant the wait is `max(0, reset - now)` plus the
/// safety margin (published reset times are best-effort boundaries).
/// Without one, the configured fallback window is used.
pub fn plan(
    reset: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &BackoffConfig,
) -> BackoffPlan {
    match reset {
        Some(reset) => {
            let until = (reset - now).num_seconds().max(0) as u64;
            BackoffPlan {
                wait: Duration::from_secs(until + config.safety_margin_secs),
                reason: format!(
                    "usage window resets at {}",
                    reset.format("%Y-%m-%d %H:%M:%S UTC")
                ),
            }
        }
        None => BackoffPlan {
            wait: Duration::from_secs(config.rate_limit_fallback_secs),
            reason: "rate limited with no parseable reset time".to_string(),
        },
    }
}

/// Delay before the given server-error retry attempt (0-indexed):
/// doubling from the initial delay, capped at the configured maximum
pub fn server_error_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let secs = config
        .initial_backoff_secs
        .saturating_mul(factor)
        .min(config.max_backoff_secs);
    Duration::from_secs(secs)
}
