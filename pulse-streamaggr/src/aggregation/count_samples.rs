// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./count_samples_test.rs"]
mod count_samples_test;

use super::{AggregationFunction, FlushContext};
use crate::LossyIntToFloat;
use crate::key::OutputKey;

//
// CountSamples
//

// Counts the number of observations seen for a key in each window, regardless of their values.
pub(crate) struct CountSamples;

impl CountSamples {
  pub(crate) const SUFFIX: &'static str = "count_samples";
}

impl AggregationFunction for CountSamples {
  type Value = u64;

  fn new_value(&self) -> u64 {
    0
  }

  fn update(&self, value: &mut u64, _sample: f64) {
    *value += 1;
  }

  fn has_data(&self, value: &u64) -> bool {
    *value > 0
  }

  fn flush(&self, value: &mut u64, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    ctx.append_series(output_key, Self::SUFFIX, value.lossy_to_f64());
    *value = 0;
  }
}
