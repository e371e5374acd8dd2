/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;

lazy_static! {
    static ref START: std::time::Instant = std::time::Instant::now();
}

/// Get the current time in milliseconds from a monotonically increasing clock.
#[inline(always)]
pub fn ms_monotonic() -> i64 {
    START.elapsed().as_millis() as i64
}

/// Get the current Unix epoch time in whole seconds.
#[inline(always)]
pub fn unix_time() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}
