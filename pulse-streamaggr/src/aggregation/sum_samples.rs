// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{AggregationFunction, FlushContext};
use crate::key::OutputKey;

//
// SumState
//

#[derive(Default)]
pub(crate) struct SumState {
  sum: f64,
  // Tracked separately so that a window whose values sum to zero is still emitted.
  samples: u64,
}

//
// SumSamples
//

pub(crate) struct SumSamples;

impl SumSamples {
  pub(crate) const SUFFIX: &'static str = "sum_samples";
}

impl AggregationFunction for SumSamples {
  type Value = SumState;

  fn new_value(&self) -> SumState {
    SumState::default()
  }

  fn update(&self, value: &mut SumState, sample: f64) {
    value.sum += sample;
    value.samples += 1;
  }

  fn has_data(&self, value: &SumState) -> bool {
    value.samples > 0
  }

  fn flush(&self, value: &mut SumState, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    ctx.append_series(output_key, Self::SUFFIX, value.sum);
    *value = SumState::default();
  }
}
