// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{AggregationFunction, FlushContext};
use crate::LossyIntToFloat;
use crate::key::OutputKey;

#[derive(Default)]
pub(crate) struct AvgState {
  sum: f64,
  count: u64,
}

//
// Avg
//

// The arithmetic mean of the window's values.
pub(crate) struct Avg;

impl Avg {
  pub(crate) const SUFFIX: &'static str = "avg";
}

impl AggregationFunction for Avg {
  type Value = AvgState;

  fn new_value(&self) -> AvgState {
    AvgState::default()
  }

  fn update(&self, value: &mut AvgState, sample: f64) {
    value.sum += sample;
    value.count += 1;
  }

  fn has_data(&self, value: &AvgState) -> bool {
    value.count > 0
  }

  fn flush(&self, value: &mut AvgState, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    ctx.append_series(
      output_key,
      Self::SUFFIX,
      value.sum / value.count.lossy_to_f64(),
    );
    *value = AvgState::default();
  }
}
