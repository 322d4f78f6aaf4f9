// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./quantiles_test.rs"]
mod quantiles_test;

use super::cm_quantile::Quantile;
use super::{AggregationFunction, FlushContext};
use crate::config::WrappedConfig;
use crate::key::OutputKey;
use crate::pool::{ObjectPool, Pooled, Reusable};
use std::sync::Arc;

const QUANTILE_LABEL: &str = "quantile";

//
// Quantiles
//

// Estimates a fixed list of quantile levels per key. The levels are shared read-only by every key
// of the aggregator, and digests are checked out of a pool owned by the aggregator so that churny
// keys reuse their allocations.
pub(crate) struct Quantiles {
  phis: Vec<f64>,
  labels: Vec<Arc<str>>,
  // Indexes into phis in ascending level order.
  sorted: Vec<usize>,
  pool: Arc<ObjectPool<Quantile>>,
}

impl Quantiles {
  pub(crate) const SUFFIX: &'static str = "quantiles";

  pub(crate) fn new(phis: &[f64], epsilon: f64) -> Self {
    // The digest only targets interior levels. 0 and 1 are answered from the exact min and max.
    let mut targets: Vec<f64> = phis
      .iter()
      .copied()
      .filter(|phi| *phi > 0.0 && *phi < 1.0)
      .collect();
    if targets.is_empty() {
      targets.push(0.5);
    }
    let targets: Arc<[f64]> = targets.into();

    let mut sorted: Vec<usize> = (0 .. phis.len()).collect();
    sorted.sort_by(|a, b| phis[*a].total_cmp(&phis[*b]));

    Self {
      phis: phis.to_vec(),
      labels: phis
        .iter()
        .map(|phi| WrappedConfig::quantile_label(*phi))
        .collect(),
      sorted,
      pool: ObjectPool::new(move || Quantile::new(epsilon, targets.clone())),
    }
  }

  #[cfg(test)]
  pub(crate) fn pool(&self) -> &Arc<ObjectPool<Quantile>> {
    &self.pool
  }

  // Compute the estimate for every level, returned in configured order. Estimates are clamped so
  // that a higher level never reports a lower value than a lower level.
  fn estimates(&self, digest: &Quantile) -> Vec<f64> {
    let mut estimates = vec![0.0; self.phis.len()];
    let mut floor = f64::MIN;
    for &index in &self.sorted {
      let phi = self.phis[index];
      let estimate = if phi <= 0.0 {
        digest.min()
      } else if phi >= 1.0 {
        digest.max()
      } else {
        digest.query(phi)
      };
      floor = floor.max(estimate);
      estimates[index] = floor;
    }
    estimates
  }
}

impl AggregationFunction for Quantiles {
  type Value = Pooled<Quantile>;

  fn new_value(&self) -> Pooled<Quantile> {
    self.pool.checkout()
  }

  fn update(&self, digest: &mut Pooled<Quantile>, sample: f64) {
    if sample.is_nan() {
      log::trace!("dropping NaN sample from quantile digest");
      return;
    }
    digest.add_sample(sample);
  }

  fn has_data(&self, digest: &Pooled<Quantile>) -> bool {
    !digest.is_empty()
  }

  fn flush(
    &self,
    digest: &mut Pooled<Quantile>,
    output_key: &OutputKey,
    ctx: &mut FlushContext<'_>,
  ) {
    digest.flush();
    for (estimate, label) in self.estimates(digest).into_iter().zip(&self.labels) {
      ctx.append_series_with_extra_label(output_key, Self::SUFFIX, estimate, QUANTILE_LABEL, label);
    }
    digest.reset();
  }
}
