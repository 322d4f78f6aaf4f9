// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn make_quantile() -> Quantile {
  Quantile::new(0.01, vec![0.5, 0.9, 0.99].into())
}

fn assert_within(expected: f64, tolerance: f64, actual: f64) {
  assert!(
    (expected - tolerance ..= expected + tolerance).contains(&actual),
    "expected {expected} +/- {tolerance}, got {actual}"
  );
}

#[test]
fn query_empty() {
  let cm = make_quantile();
  assert!(cm.is_empty());
  assert_eq!(0.0, cm.query(0.5));
  assert_eq!(0.0, cm.min());
  assert_eq!(0.0, cm.max());
}

#[test]
fn add_query() {
  let mut cm = make_quantile();
  cm.add_sample(100.0);
  assert_eq!(1, cm.count());
  assert_eq!(100.0, cm.query(0.5));
}

#[test]
fn add_negative_query() {
  let mut cm = make_quantile();
  cm.add_sample(-100.0);
  assert_eq!(-100.0, cm.query(0.5));
}

#[test]
fn small_set() {
  let mut cm = make_quantile();
  for value in [1.0, 5.0, 5.0, 9.0] {
    cm.add_sample(value);
  }
  cm.flush();
  assert_eq!(4, cm.count());
  assert_eq!(5.0, cm.query(0.5));
  assert_eq!(9.0, cm.query(0.99));
  assert_eq!(1.0, cm.min());
  assert_eq!(9.0, cm.max());
}

#[test]
fn add_loop_query() {
  let mut cm = make_quantile();
  for i in 0 .. 100_000u64 {
    cm.add_sample(i as f64);
  }
  cm.flush();

  assert_eq!(100_000, cm.count());
  assert_within(50000.0, 1000.0, cm.query(0.5));
  assert_within(90000.0, 1000.0, cm.query(0.9));
  assert_within(99000.0, 1000.0, cm.query(0.99));
  assert_eq!(0.0, cm.min());
  assert_eq!(99999.0, cm.max());
}

#[test]
fn add_loop_rev_query() {
  let mut cm = make_quantile();
  for i in (0 .. 100_000u64).rev() {
    cm.add_sample(i as f64);
  }
  cm.flush();

  assert_within(50000.0, 1000.0, cm.query(0.5));
  assert_within(90000.0, 1000.0, cm.query(0.9));
  assert_within(99000.0, 1000.0, cm.query(0.99));
  assert_eq!(0.0, cm.min());
  assert_eq!(99999.0, cm.max());
}

#[test]
fn add_loop_random_query() {
  let mut rng = SmallRng::seed_from_u64(7);
  let mut cm = make_quantile();
  for _ in 0 .. 100_000 {
    cm.add_sample(rng.random_range(0.0 .. 1_000_000.0));
  }
  cm.flush();

  assert_within(500_000.0, 20_000.0, cm.query(0.5));
  assert_within(900_000.0, 20_000.0, cm.query(0.9));
  assert_within(990_000.0, 20_000.0, cm.query(0.99));
}

#[test]
fn reset_and_reuse() {
  let mut cm = make_quantile();
  for i in 0 .. 1000u64 {
    cm.add_sample(i as f64);
  }
  cm.reset();
  assert!(cm.is_empty());
  assert_eq!(0.0, cm.query(0.5));

  for i in 0 .. 100u64 {
    cm.add_sample(1000.0 + i as f64);
  }
  cm.flush();
  assert_eq!(100, cm.count());
  assert_eq!(1000.0, cm.min());
  assert_eq!(1099.0, cm.max());
  assert_within(1050.0, 5.0, cm.query(0.5));
}

// Values larger than everything already in the list are appended at the tail once the insert pass
// runs off the end.
#[test]
fn append_past_tail() {
  let mut cm = make_quantile();
  for i in 0 .. 10u64 {
    cm.add_sample(i as f64);
  }
  cm.flush();

  for i in (100 .. 200u64).rev() {
    cm.add_sample(i as f64);
  }
  cm.add_sample(5.5);
  cm.flush();

  assert_eq!(111, cm.count());
  assert_eq!(0.0, cm.min());
  assert_eq!(199.0, cm.max());
  assert_within(150.0, 5.0, cm.query(0.5));
  assert!(cm.query(0.5) <= cm.query(0.9));
  assert!(cm.query(0.9) <= cm.query(0.99));
}
