// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::aggregation::{OutputSeries, SeriesDeleter};
use crate::aggregator::{AggregatorContext, OutputDispatch};
use crate::key::{KeyInterner, Label, OutputKey, PushSample, SampleKey, encode_labels};
use crate::time::TestTimeProvider;
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::Registry;
use std::sync::Arc;

#[must_use]
pub fn make_labels(labels: &[(&str, &str)]) -> Vec<Label> {
  labels
    .iter()
    .map(|(name, value)| Label::new(name.to_string(), value.to_string()))
    .collect()
}

// A sample key whose input key is the full label set and whose output labels are the given
// subset.
#[must_use]
pub fn make_sample_key(input: &[(&str, &str)], output: &[(&str, &str)]) -> SampleKey {
  SampleKey::from_labels(&make_labels(input), &make_labels(output)).unwrap()
}

#[must_use]
pub fn make_push_sample(output: &[(&str, &str)], value: f64) -> PushSample {
  PushSample {
    key: make_sample_key(output, output),
    value,
  }
}

#[must_use]
pub fn make_output_key(output: &[(&str, &str)]) -> OutputKey {
  encode_labels(&make_labels(output)).unwrap().as_ref().into()
}

//
// CollectingDispatch
//

// Records every flush as a separate batch.
#[derive(Default)]
pub struct CollectingDispatch {
  batches: Mutex<Vec<Vec<OutputSeries>>>,
}

impl CollectingDispatch {
  pub fn take_batches(&self) -> Vec<Vec<OutputSeries>> {
    std::mem::take(&mut *self.batches.lock())
  }

  pub fn take_series(&self) -> Vec<OutputSeries> {
    self.take_batches().into_iter().flatten().collect()
  }
}

#[async_trait]
impl OutputDispatch for CollectingDispatch {
  async fn send(&self, series: Vec<OutputSeries>) {
    self.batches.lock().push(series);
  }
}

//
// CollectingDeleter
//

#[derive(Default)]
pub struct CollectingDeleter {
  deleted: Mutex<Vec<(OutputKey, i64)>>,
}

impl CollectingDeleter {
  pub fn take(&self) -> Vec<(OutputKey, i64)> {
    std::mem::take(&mut *self.deleted.lock())
  }
}

impl SeriesDeleter for CollectingDeleter {
  fn delete_series(&self, output_key: &OutputKey, timestamp: i64) {
    self.deleted.lock().push((output_key.clone(), timestamp));
  }
}

//
// TestContext
//

// Collaborators for an aggregator under test, with handles kept for inspection.
pub struct TestContext {
  pub registry: Registry,
  pub dispatcher: Arc<CollectingDispatch>,
  pub deleter: Arc<CollectingDeleter>,
  pub time_provider: TestTimeProvider,
  pub interner: Arc<KeyInterner>,
}

impl Default for TestContext {
  fn default() -> Self {
    Self {
      registry: Registry::new(),
      dispatcher: Arc::default(),
      deleter: Arc::default(),
      time_provider: TestTimeProvider::default(),
      interner: Arc::default(),
    }
  }
}

impl TestContext {
  #[must_use]
  pub fn aggregator_context(&self) -> AggregatorContext {
    AggregatorContext {
      registry: self.registry.clone(),
      dispatcher: self.dispatcher.clone(),
      deleter: self.deleter.clone(),
      time_provider: Arc::new(self.time_provider.clone()),
      interner: self.interner.clone(),
    }
  }
}
