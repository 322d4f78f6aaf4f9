// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{AggregationFunction, FlushContext};
use crate::key::OutputKey;

// Fold a sample into the running extreme, ignoring NaN.
fn fold_extreme(value: &mut Option<f64>, sample: f64, pick: fn(f64, f64) -> f64) {
  if sample.is_nan() {
    return;
  }
  *value = Some(value.map_or(sample, |current| pick(current, sample)));
}

//
// Min
//

pub(crate) struct Min;

impl Min {
  pub(crate) const SUFFIX: &'static str = "min";
}

impl AggregationFunction for Min {
  type Value = Option<f64>;

  fn new_value(&self) -> Option<f64> {
    None
  }

  fn update(&self, value: &mut Option<f64>, sample: f64) {
    fold_extreme(value, sample, f64::min);
  }

  fn has_data(&self, value: &Option<f64>) -> bool {
    value.is_some()
  }

  fn flush(&self, value: &mut Option<f64>, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    if let Some(min) = value.take() {
      ctx.append_series(output_key, Self::SUFFIX, min);
    }
  }
}

//
// Max
//

pub(crate) struct Max;

impl Max {
  pub(crate) const SUFFIX: &'static str = "max";
}

impl AggregationFunction for Max {
  type Value = Option<f64>;

  fn new_value(&self) -> Option<f64> {
    None
  }

  fn update(&self, value: &mut Option<f64>, sample: f64) {
    fold_extreme(value, sample, f64::max);
  }

  fn has_data(&self, value: &Option<f64>) -> bool {
    value.is_some()
  }

  fn flush(&self, value: &mut Option<f64>, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    if let Some(max) = value.take() {
      ctx.append_series(output_key, Self::SUFFIX, max);
    }
  }
}
