// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Certificate rotation deadlines.

use super::CertInfo;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

const JITTER_FACTOR: f64 = 0.2;
const LEAD_FRACTION: f64 = 0.3;

/// `d` plus a random amount in `[0, factor * d)`.
pub fn jitter(d: Duration, factor: f64) -> Duration {
    let extra = rand::thread_rng().gen::<f64>() * factor;
    scale(d, 1.0 + extra)
}

fn scale(d: Duration, factor: f64) -> Duration {
    Duration::milliseconds((d.num_milliseconds() as f64 * factor) as i64)
}

/// When to rotate: between 70% and 90% of the certificate's lifetime.
pub fn rotation_deadline(cert: &CertInfo) -> DateTime<Utc> {
    let total = cert.lifetime();
    cert.not_before + jitter(total, JITTER_FACTOR) - scale(total, LEAD_FRACTION)
}
