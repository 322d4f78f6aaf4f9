// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{AggregationFunction, FlushContext};
use crate::key::OutputKey;

//
// Last
//

// The most recently pushed value. Pushes for one key are linearized by the accumulator lock, so
// "most recent" is the order in which they acquired it.
pub(crate) struct Last;

impl Last {
  pub(crate) const SUFFIX: &'static str = "last";
}

impl AggregationFunction for Last {
  type Value = Option<f64>;

  fn new_value(&self) -> Option<f64> {
    None
  }

  fn update(&self, value: &mut Option<f64>, sample: f64) {
    *value = Some(sample);
  }

  fn has_data(&self, value: &Option<f64>) -> bool {
    value.is_some()
  }

  fn flush(&self, value: &mut Option<f64>, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    if let Some(last) = value.take() {
      ctx.append_series(output_key, Self::SUFFIX, last);
    }
  }
}
