/*!
 * Elapsed-time helpers: a resettable stopwatch and the compact `1d2h3m4s`
 * duration notation used by the topology file and status output.
 */

use std::time::{Duration, Instant};

use crate::error::{MirrorError, Result};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Stopwatch with a "once every N" gate
///
/// The gate fires on its first call and then at most once per interval,
/// which is what the replica loop uses to schedule mid-transfer rescans.
#[derive(Debug, Clone)]
pub struct ElapsedTimer {
    start: Instant,
    last_fired: Option<Instant>,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_fired: None,
        }
    }

    /// Time since construction or the last `reset`
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
        self.last_fired = None;
    }

    /// Returns true if `interval` has passed since this last returned true
    pub fn once_every(&mut self, interval: Duration) -> bool {
        let now = Instant::now();
        match self.last_fired {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                self.last_fired = Some(now);
                true
            }
        }
    }
}

impl Default for ElapsedTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `"1d2h3m4s"`-style durations
///
/// Units may appear in any subset; a trailing bare number counts as seconds,
/// so `"90"` and `"1m30"` both mean ninety seconds. Whitespace is ignored.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(MirrorError::InvalidDuration(text.to_string()));
    }

    let mut total: u64 = 0;
    let mut number: Option<u64> = None;

    for ch in trimmed.chars() {
        if ch.is_whitespace() {
            continue;
        }
        if let Some(digit) = ch.to_digit(10) {
            let current = number.unwrap_or(0);
            number = Some(
                current
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(u64::from(digit)))
                    .ok_or_else(|| MirrorError::InvalidDuration(text.to_string()))?,
            );
            continue;
        }

        let scale = match ch {
            'd' => DAY,
            'h' => HOUR,
            'm' => MINUTE,
            's' => 1,
            _ => return Err(MirrorError::InvalidDuration(text.to_string())),
        };
        let value = number
            .take()
            .ok_or_else(|| MirrorError::InvalidDuration(text.to_string()))?;
        total = value
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| MirrorError::InvalidDuration(text.to_string()))?;
    }

    if let Some(seconds) = number {
        total = total
            .checked_add(seconds)
            .ok_or_else(|| MirrorError::InvalidDuration(text.to_string()))?;
    }

    Ok(Duration::from_secs(total))
}

/// Render whole seconds as `1d2h3m4s`, largest unit first, zero units omitted
pub fn format_duration(duration: Duration) -> String {
    format_seconds(duration.as_secs())
}

/// Same as [`format_duration`] for a raw (possibly fractional or negative)
/// number of seconds, as produced by timestamp arithmetic
pub fn format_seconds_f64(seconds: f64) -> String {
    if seconds < 0.0 {
        format!("-{}", format_seconds((-seconds) as u64))
    } else {
        format_seconds(seconds as u64)
    }
}

fn format_seconds(mut seconds: u64) -> String {
    if seconds == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, suffix) in [(DAY, 'd'), (HOUR, 'h'), (MINUTE, 'm')] {
        if seconds >= unit {
            out.push_str(&format!("{}{}", seconds / unit, suffix));
            seconds %= unit;
        }
    }
    if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    out
}
