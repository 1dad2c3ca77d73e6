// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry backoff schedules.
//!
//! Two schedules exist. When a function configures a fixed `retry_interval`
//! of at least one second, retries use a linear schedule (`attempt * interval`).
//! Otherwise retries use capped exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Base delay for the exponential schedule.
const EXP_BASE: Duration = Duration::from_secs(1);
/// Maximum delay for the exponential schedule.
const EXP_CAP: Duration = Duration::from_secs(60 * 60);
/// Jitter fraction applied to the exponential schedule.
const JITTER: f64 = 0.10;

/// Delay before retry number `attempt` (1-based: the first retry is attempt 1).
///
/// `retry_interval` of `Some(n)` with `n >= 1` selects the linear schedule;
/// `None` or sub-second intervals select capped exponential with jitter.
pub fn retry_delay(attempt: u32, retry_interval: Option<Duration>) -> Duration {
    match retry_interval {
        Some(interval) if interval >= Duration::from_secs(1) => {
            interval.saturating_mul(attempt.max(1))
        }
        _ => exponential(attempt),
    }
}

fn exponential(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let raw = EXP_BASE.saturating_mul(1u32 << exp.min(31));
    let capped = raw.min(EXP_CAP);

    let jitter_range = capped.as_secs_f64() * JITTER;
    let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
    let secs = (capped.as_secs_f64() + jitter).max(0.0);
    Duration::from_secs_f64(secs)
}
