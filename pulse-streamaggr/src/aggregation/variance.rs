// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{AggregationFunction, FlushContext};
use crate::LossyIntToFloat;
use crate::key::OutputKey;

//
// WelfordState
//

// Running mean and sum of squared deviations, updated with Welford's online algorithm which stays
// numerically stable for large counts.
#[derive(Default)]
pub(crate) struct WelfordState {
  count: u64,
  mean: f64,
  m2: f64,
}

impl WelfordState {
  fn update(&mut self, sample: f64) {
    self.count += 1;
    let delta = sample - self.mean;
    self.mean += delta / self.count.lossy_to_f64();
    self.m2 += delta * (sample - self.mean);
  }

  // Population variance.
  fn variance(&self) -> f64 {
    if self.count == 0 {
      0.0
    } else {
      self.m2 / self.count.lossy_to_f64()
    }
  }
}

//
// Stdvar
//

pub(crate) struct Stdvar;

impl Stdvar {
  pub(crate) const SUFFIX: &'static str = "stdvar";
}

impl AggregationFunction for Stdvar {
  type Value = WelfordState;

  fn new_value(&self) -> WelfordState {
    WelfordState::default()
  }

  fn update(&self, value: &mut WelfordState, sample: f64) {
    value.update(sample);
  }

  fn has_data(&self, value: &WelfordState) -> bool {
    value.count > 0
  }

  fn flush(&self, value: &mut WelfordState, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    ctx.append_series(output_key, Self::SUFFIX, value.variance());
    *value = WelfordState::default();
  }
}

//
// Stddev
//

pub(crate) struct Stddev;

impl Stddev {
  pub(crate) const SUFFIX: &'static str = "stddev";
}

impl AggregationFunction for Stddev {
  type Value = WelfordState;

  fn new_value(&self) -> WelfordState {
    WelfordState::default()
  }

  fn update(&self, value: &mut WelfordState, sample: f64) {
    value.update(sample);
  }

  fn has_data(&self, value: &WelfordState) -> bool {
    value.count > 0
  }

  fn flush(&self, value: &mut WelfordState, output_key: &OutputKey, ctx: &mut FlushContext<'_>) {
    ctx.append_series(output_key, Self::SUFFIX, value.variance().sqrt());
    *value = WelfordState::default();
  }
}
