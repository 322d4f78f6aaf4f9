// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./time_test.rs"]
mod time_test;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

// Determine the time until the next flush pegged against wall clock time, so that every process
// flushing with the same interval flushes at the same instants.
pub fn next_flush_interval(time_provider: &dyn TimeProvider, flush_interval: Duration) -> Duration {
  let interval_ms = i64::try_from(flush_interval.as_millis())
    .unwrap_or(i64::MAX)
    .max(1);
  let remainder = time_provider.unix_now_millis().rem_euclid(interval_ms);
  Duration::from_millis((interval_ms - remainder).unsigned_abs())
}

//
// TimeProvider
//

pub trait TimeProvider: Send + Sync + 'static {
  fn now_utc(&self) -> OffsetDateTime;
  fn unix_now_millis(&self) -> i64;
}

//
// RealTimeProvider
//

pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::now_utc()
  }

  fn unix_now_millis(&self) -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
  }
}

//
// TestTimeProvider
//

// A manually driven clock, in unix milliseconds.
#[derive(Default, Clone)]
pub struct TestTimeProvider {
  pub time: Arc<AtomicI64>,
}

impl TestTimeProvider {
  #[must_use]
  pub fn new(millis: i64) -> Self {
    Self {
      time: Arc::new(AtomicI64::new(millis)),
    }
  }

  pub fn set(&self, millis: i64) {
    self.time.store(millis, Ordering::SeqCst);
  }

  pub fn advance(&self, duration: Duration) {
    self.time.fetch_add(
      i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
      Ordering::SeqCst,
    );
  }
}

impl TimeProvider for TestTimeProvider {
  fn now_utc(&self) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.unix_now_millis()) * 1_000_000)
      .unwrap_or(OffsetDateTime::UNIX_EPOCH)
  }

  fn unix_now_millis(&self) -> i64 {
    self.time.load(Ordering::SeqCst)
  }
}
