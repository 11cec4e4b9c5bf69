// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Now utilities.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

/// A type representing the number of milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// A function that returns the current time.
///
/// This is a newtype around a shared closure so that production code can use
/// the system clock while tests inject a deterministic one.
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns the current time in seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        (self.0)() / 1_000
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

impl Deref for NowFn {
    type Target = dyn Fn() -> EpochMillis + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &(*self.0)
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

fn system_time() -> EpochMillis {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("failed to get millis since epoch");
    u64::try_from(dur.as_millis()).expect("current time did not fit into u64")
}

fn now_zero() -> EpochMillis {
    0
}

/// A [`NowFn`] that returns the actual system time.
pub static SYSTEM_TIME: Lazy<NowFn> = Lazy::new(|| NowFn::from(system_time));

/// A [`NowFn`] that always returns zero.
///
/// For use in tests.
pub static NOW_ZERO: Lazy<NowFn> = Lazy::new(|| NowFn::from(now_zero));

#[cfg(test)]
mod tests {
    use super::{NowFn, SYSTEM_TIME};

    #[test]
    fn test_now_fn() {
        let now: NowFn = NowFn::from(|| 1_700_000_000_123_u64);
        assert_eq!(now(), 1_700_000_000_123);
        assert_eq!(now.as_secs(), 1_700_000_000);
        assert!((*SYSTEM_TIME)() > 0);
    }
}
