// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


mod avg;
pub mod cm_quantile;
mod count_samples;
mod extremes;
mod last;
mod quantiles;
mod sum_samples;
mod variance;

use self::avg::Avg;
use self::count_samples::CountSamples;
use self::extremes::{Max, Min};
use self::last::Last;
use self::quantiles::Quantiles;
use self::sum_samples::SumSamples;
use self::variance::{Stddev, Stdvar};
use crate::config::{OutputConfig, WrappedConfig};
use crate::key::{KeyInterner, OutputKey, PushSample, get_output_key};
use crate::table::ShardedMap;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::sync::Arc;

//
// OutputSeries
//

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraLabel {
  pub name: &'static str,
  pub value: Arc<str>,
}

// A single finished rollup point handed to the downstream collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputSeries {
  pub output_key: OutputKey,
  // Identifies the aggregation function, e.g. count_samples or quantiles.
  pub suffix: &'static str,
  pub value: f64,
  pub extra_label: Option<ExtraLabel>,
  pub timestamp: i64,
}

//
// SeriesDeleter
//

// Notified when a key has gone idle and its state was evicted, so that downstream bookkeeping for
// the series can be reclaimed.
pub trait SeriesDeleter: Send + Sync {
  fn delete_series(&self, output_key: &OutputKey, timestamp: i64);
}

//
// FlushContext
//

// Collects the output of a single flush of one or more aggregation states.
pub struct FlushContext<'a> {
  flush_timestamp: i64,
  emit: bool,
  series: Vec<OutputSeries>,
  deleter: &'a dyn SeriesDeleter,
  deleted: u64,
}

impl<'a> FlushContext<'a> {
  // When emit is false state is still read and reset, but no rows are produced.
  pub fn new(flush_timestamp: i64, emit: bool, deleter: &'a dyn SeriesDeleter) -> Self {
    Self {
      flush_timestamp,
      emit,
      series: Vec::new(),
      deleter,
      deleted: 0,
    }
  }

  #[must_use]
  pub const fn flush_timestamp(&self) -> i64 {
    self.flush_timestamp
  }

  pub fn append_series(&mut self, output_key: &OutputKey, suffix: &'static str, value: f64) {
    self.push_series(output_key, suffix, value, None);
  }

  pub fn append_series_with_extra_label(
    &mut self,
    output_key: &OutputKey,
    suffix: &'static str,
    value: f64,
    extra_label_name: &'static str,
    extra_label_value: &Arc<str>,
  ) {
    self.push_series(
      output_key,
      suffix,
      value,
      Some(ExtraLabel {
        name: extra_label_name,
        value: extra_label_value.clone(),
      }),
    );
  }

  fn push_series(
    &mut self,
    output_key: &OutputKey,
    suffix: &'static str,
    value: f64,
    extra_label: Option<ExtraLabel>,
  ) {
    if !self.emit {
      return;
    }
    self.series.push(OutputSeries {
      output_key: output_key.clone(),
      suffix,
      value,
      extra_label,
      timestamp: self.flush_timestamp,
    });
  }

  fn delete_series(&mut self, output_key: &OutputKey) {
    self.deleted += 1;
    self.deleter.delete_series(output_key, self.flush_timestamp);
  }

  #[must_use]
  pub const fn deleted(&self) -> u64 {
    self.deleted
  }

  #[must_use]
  pub fn into_series(self) -> Vec<OutputSeries> {
    self.series
  }
}

//
// AggregationFunction
//

// The behavior specific part of an aggregation: how an observation is merged into per-key state
// and how that state is rendered at flush time. The function object itself is shared read-only by
// every key of an aggregator.
pub(crate) trait AggregationFunction: Send + Sync + 'static {
  type Value: Send + 'static;

  fn new_value(&self) -> Self::Value;

  fn update(&self, value: &mut Self::Value, sample: f64);

  // Whether the value received any samples since it was last flushed.
  fn has_data(&self, value: &Self::Value) -> bool;

  // Emit the value into the context and reset it for the next window.
  fn flush(&self, value: &mut Self::Value, output_key: &OutputKey, ctx: &mut FlushContext<'_>);
}

//
// Accumulator
//

struct LockedAccumulator<V> {
  value: V,
  // Set once, when the flush drains the key. A deleted accumulator is never updated again.
  deleted: bool,
  // Unix milliseconds after which the key is considered idle.
  delete_deadline: i64,
}

// Per-key aggregation state. All fields are only accessed under the lock.
pub(crate) struct Accumulator<V> {
  locked: Mutex<LockedAccumulator<V>>,
}

impl<V> Accumulator<V> {
  // The accumulator is born with the deadline of the push creating it, so a flush racing its first
  // update sees it as live rather than expired.
  const fn new(value: V, delete_deadline: i64) -> Self {
    Self {
      locked: Mutex::new(LockedAccumulator {
        value,
        deleted: false,
        delete_deadline,
      }),
    }
  }

  // Apply a mutation unless the accumulator has been deleted. Returns false if deleted, in which
  // case the caller must look up the key again.
  fn try_update(&self, delete_deadline: i64, mutate: &mut impl FnMut(&mut V)) -> bool {
    let mut locked = self.locked.lock();
    if locked.deleted {
      return false;
    }
    mutate(&mut locked.value);
    locked.delete_deadline = locked.delete_deadline.max(delete_deadline);
    true
  }
}

//
// StateEngine
//

// The concurrent state shared by every aggregation function: a sharded table of individually
// locked accumulators keyed by output key. Ingesting threads update it through push_samples()
// while a single flusher drains it through flush_state().
pub(crate) struct StateEngine<F: AggregationFunction> {
  function: F,
  table: ShardedMap<Arc<Accumulator<F::Value>>>,
  interner: Arc<KeyInterner>,
  tombstone_retries: IntCounter,
}

impl<F: AggregationFunction> StateEngine<F> {
  pub(crate) fn new(function: F, interner: Arc<KeyInterner>, tombstone_retries: IntCounter) -> Self {
    Self {
      function,
      table: ShardedMap::default(),
      interner,
      tombstone_retries,
    }
  }

  pub(crate) fn push_samples(
    &self,
    samples: &[PushSample],
    delete_deadline: i64,
    include_input_key: bool,
  ) {
    for sample in samples {
      let output_key = get_output_key(&sample.key, include_input_key);
      self.push(output_key, delete_deadline, |value| {
        self.function.update(value, sample.value);
      });
    }
  }

  // Apply a mutation to the live accumulator for the key, creating it if needed.
  pub(crate) fn push(
    &self,
    output_key: &[u8],
    delete_deadline: i64,
    mut mutate: impl FnMut(&mut F::Value),
  ) {
    loop {
      let accumulator = if let Some(accumulator) = self.table.get(output_key) {
        accumulator
      } else {
        // The candidate is built outside of the table lock. If a concurrent push inserts first
        // the candidate is dropped, returning any pooled state it holds.
        let candidate = Arc::new(Accumulator::new(
          self.function.new_value(),
          delete_deadline,
        ));
        self
          .table
          .load_or_store(output_key, || self.interner.intern(output_key), candidate)
          .into_inner()
      };

      if accumulator.try_update(delete_deadline, &mut mutate) {
        return;
      }

      // A concurrent flush drained the accumulator after we looked it up. The flush removes the
      // table entry before tombstoning it, so the next lookup makes a new one.
      log::trace!("retrying push to drained accumulator");
      self.tombstone_retries.inc();
    }
  }

  // Drain the table. Every removed accumulator is tombstoned under its lock so that a racing push
  // moves on to a new entry, which lands in the next window. Keys idle past their deadline are
  // reported to the deleter, every other key with activity is emitted. A key that is pushed again
  // starts over with a fresh accumulator and deadline.
  pub(crate) fn flush_state(&self, ctx: &mut FlushContext<'_>) {
    let flush_timestamp = ctx.flush_timestamp();
    self.table.for_each_and_clear(|output_key, accumulator| {
      let mut locked = accumulator.locked.lock();
      locked.deleted = true;
      if flush_timestamp > locked.delete_deadline {
        drop(locked);
        ctx.delete_series(&output_key);
        return;
      }

      if self.function.has_data(&locked.value) {
        self.function.flush(&mut locked.value, &output_key, ctx);
      }
    });
  }

  pub(crate) fn len(&self) -> usize {
    self.table.len()
  }
}

//
// AggrState
//

// The closed set of aggregation functions, selected per configured output.
pub(crate) enum AggrState {
  CountSamples(StateEngine<CountSamples>),
  SumSamples(StateEngine<SumSamples>),
  Min(StateEngine<Min>),
  Max(StateEngine<Max>),
  Avg(StateEngine<Avg>),
  Last(StateEngine<Last>),
  Stddev(StateEngine<Stddev>),
  Stdvar(StateEngine<Stdvar>),
  Quantiles(StateEngine<Quantiles>),
}

macro_rules! with_engine {
  ($state:expr, $engine:ident => $body:expr) => {
    match $state {
      AggrState::CountSamples($engine) => $body,
      AggrState::SumSamples($engine) => $body,
      AggrState::Min($engine) => $body,
      AggrState::Max($engine) => $body,
      AggrState::Avg($engine) => $body,
      AggrState::Last($engine) => $body,
      AggrState::Stddev($engine) => $body,
      AggrState::Stdvar($engine) => $body,
      AggrState::Quantiles($engine) => $body,
    }
  };
}

impl AggrState {
  pub(crate) fn new(
    output: &OutputConfig,
    config: &WrappedConfig,
    interner: Arc<KeyInterner>,
    tombstone_retries: IntCounter,
  ) -> Self {
    match output {
      OutputConfig::CountSamples => Self::CountSamples(StateEngine::new(
        CountSamples,
        interner,
        tombstone_retries,
      )),
      OutputConfig::SumSamples => {
        Self::SumSamples(StateEngine::new(SumSamples, interner, tombstone_retries))
      },
      OutputConfig::Min => Self::Min(StateEngine::new(Min, interner, tombstone_retries)),
      OutputConfig::Max => Self::Max(StateEngine::new(Max, interner, tombstone_retries)),
      OutputConfig::Avg => Self::Avg(StateEngine::new(Avg, interner, tombstone_retries)),
      OutputConfig::Last => Self::Last(StateEngine::new(Last, interner, tombstone_retries)),
      OutputConfig::Stddev => Self::Stddev(StateEngine::new(Stddev, interner, tombstone_retries)),
      OutputConfig::Stdvar => Self::Stdvar(StateEngine::new(Stdvar, interner, tombstone_retries)),
      OutputConfig::Quantiles { phis } => Self::Quantiles(StateEngine::new(
        Quantiles::new(phis, config.quantile_epsilon),
        interner,
        tombstone_retries,
      )),
    }
  }

  pub(crate) fn push_samples(
    &self,
    samples: &[PushSample],
    delete_deadline: i64,
    include_input_key: bool,
  ) {
    with_engine!(self, engine => engine.push_samples(samples, delete_deadline, include_input_key));
  }

  pub(crate) fn flush_state(&self, ctx: &mut FlushContext<'_>) {
    with_engine!(self, engine => engine.flush_state(ctx));
  }

  pub(crate) fn len(&self) -> usize {
    with_engine!(self, engine => engine.len())
  }
}
