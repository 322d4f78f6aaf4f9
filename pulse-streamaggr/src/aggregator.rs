// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./aggregator_test.rs"]
mod aggregator_test;

use crate::aggregation::{AggrState, FlushContext, OutputSeries, SeriesDeleter};
use crate::config::{AggregatorConfig, WrappedConfig};
use crate::key::{KeyInterner, PushSample};
use crate::time::{TimeProvider, next_flush_interval};
use async_trait::async_trait;
use futures::FutureExt;
use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

//
// OutputDispatch
//

// Receives the rows produced by each flush.
#[async_trait]
pub trait OutputDispatch: Send + Sync {
  async fn send(&self, series: Vec<OutputSeries>);
}

//
// Stats
//

struct Stats {
  samples_pushed: IntCounter,
  series_emitted: IntCounter,
  series_deleted: IntCounter,
  tombstone_retries: IntCounter,
  flushes: IntCounter,
  flush_time: Histogram,
}

impl Stats {
  fn new(registry: &Registry, name: &str) -> anyhow::Result<Self> {
    let counter = |metric: &str, help: &str| -> anyhow::Result<IntCounter> {
      let counter = IntCounter::with_opts(
        Opts::new(metric, help)
          .namespace("streamaggr")
          .const_label("aggregator", name),
      )?;
      registry.register(Box::new(counter.clone()))?;
      Ok(counter)
    };

    let flush_time = Histogram::with_opts(
      HistogramOpts::new("flush_time", "time spent collecting a flush, in seconds")
        .namespace("streamaggr")
        .const_label("aggregator", name),
    )?;
    registry.register(Box::new(flush_time.clone()))?;

    Ok(Self {
      samples_pushed: counter("samples_pushed", "samples pushed")?,
      series_emitted: counter("series_emitted", "series handed to the dispatcher")?,
      series_deleted: counter("series_deleted", "idle series evicted")?,
      tombstone_retries: counter(
        "tombstone_retries",
        "pushes retried after racing a flush",
      )?,
      flushes: counter("flushes", "completed flushes")?,
      flush_time,
    })
  }
}

//
// AggregatorContext
//

// The collaborators of an aggregator. The interner may be shared by many aggregators.
#[derive(Clone)]
pub struct AggregatorContext {
  pub registry: Registry,
  pub dispatcher: Arc<dyn OutputDispatch>,
  pub deleter: Arc<dyn SeriesDeleter>,
  pub time_provider: Arc<dyn TimeProvider>,
  pub interner: Arc<KeyInterner>,
}

//
// Aggregator
//

// Runs every configured output function over a stream of samples and periodically flushes the
// aggregated rows. Pushes may happen from any number of threads concurrently. Flushes are
// serialized with each other but never block pushes for longer than a single key's update.
pub struct Aggregator {
  config: WrappedConfig,
  staleness_ms: i64,
  states: Vec<AggrState>,
  stats: Stats,
  // The number of periodic flushes performed. Held for the duration of a flush.
  flush_count: tokio::sync::Mutex<u64>,
  dispatcher: Arc<dyn OutputDispatch>,
  deleter: Arc<dyn SeriesDeleter>,
  time_provider: Arc<dyn TimeProvider>,
  interner: Arc<KeyInterner>,
}

impl Aggregator {
  pub fn new(config: AggregatorConfig, context: AggregatorContext) -> anyhow::Result<Arc<Self>> {
    let config = WrappedConfig::new(config)?;
    let stats = Stats::new(&context.registry, &config.config.name)?;
    let states = config
      .config
      .outputs
      .iter()
      .map(|output| {
        AggrState::new(
          output,
          &config,
          context.interner.clone(),
          stats.tombstone_retries.clone(),
        )
      })
      .collect();
    let staleness_ms = i64::try_from(config.staleness_interval.as_millis()).unwrap_or(i64::MAX);

    log::info!(
      "creating aggregator '{}' with {} output(s), interval={:?} staleness={:?}",
      config.config.name,
      config.config.outputs.len(),
      config.config.interval,
      config.staleness_interval
    );

    Ok(Arc::new(Self {
      config,
      staleness_ms,
      states,
      stats,
      flush_count: tokio::sync::Mutex::new(0),
      dispatcher: context.dispatcher,
      deleter: context.deleter,
      time_provider: context.time_provider,
      interner: context.interner,
    }))
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.config.config.name
  }

  // Feed a batch of samples to every output function.
  pub fn push(&self, samples: &[PushSample]) {
    if samples.is_empty() {
      return;
    }

    let delete_deadline = self
      .time_provider
      .unix_now_millis()
      .saturating_add(self.staleness_ms);
    for state in &self.states {
      state.push_samples(samples, delete_deadline, self.config.config.include_input_key);
    }
    self.stats.samples_pushed.inc_by(samples.len() as u64);
  }

  // The number of keys currently held by each output, in configured order.
  #[must_use]
  pub fn state_sizes(&self) -> Vec<usize> {
    self.states.iter().map(AggrState::len).collect()
  }

  // Drain every output, emitting the state of active keys and evicting idle keys.
  pub async fn flush(&self) {
    let mut flush_count = self.flush_count.lock().await;
    *flush_count += 1;
    let emit = *flush_count > u64::from(self.config.config.ignore_first_intervals);
    if !emit {
      log::debug!(
        "{}: discarding output of flush {} of {} ignored",
        self.name(),
        *flush_count,
        self.config.config.ignore_first_intervals
      );
    }

    let series = self.collect(emit);
    self.dispatch(series).await;
  }

  // The final flush, emitting the remaining state only if configured to.
  pub async fn shutdown_flush(&self) {
    let _flush_count = self.flush_count.lock().await;
    let series = self.collect(self.config.config.flush_on_shutdown);
    self.dispatch(series).await;
  }

  fn collect(&self, emit: bool) -> Vec<OutputSeries> {
    let _flush_time = self.stats.flush_time.start_timer();
    let mut ctx = FlushContext::new(
      self.time_provider.unix_now_millis(),
      emit,
      self.deleter.as_ref(),
    );
    for state in &self.states {
      state.flush_state(&mut ctx);
    }

    self.stats.flushes.inc();
    self.stats.series_deleted.inc_by(ctx.deleted());
    if ctx.deleted() > 0 {
      log::debug!("{}: evicted {} idle series", self.name(), ctx.deleted());
    }
    let series = ctx.into_series();
    self.interner.cleanup();
    series
  }

  async fn dispatch(&self, series: Vec<OutputSeries>) {
    if series.is_empty() {
      return;
    }
    log::debug!("{}: dispatching {} series", self.name(), series.len());
    self.stats.series_emitted.inc_by(series.len() as u64);
    self.dispatcher.send(series).await;
  }

  // Flush every interval until the shutdown token is cancelled, then perform the shutdown flush.
  pub fn spawn_flush_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
    let aggregator = self.clone();
    tokio::spawn(async move { aggregator.flush_loop(shutdown).await })
  }

  async fn flush_loop(&self, shutdown: CancellationToken) {
    let flush_interval = self.config.config.interval;
    let mut local_interval = if self.config.config.no_align_flush_to_interval {
      log::debug!("{}: using local process interval", self.name());
      let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      Some(interval)
    } else {
      None
    };

    loop {
      let sleep_future = local_interval.as_mut().map_or_else(
        || {
          tokio::time::sleep(next_flush_interval(
            self.time_provider.as_ref(),
            flush_interval,
          ))
          .boxed()
        },
        |local_interval| local_interval.tick().map(|_| ()).boxed(),
      );

      tokio::select! {
        () = sleep_future => {
          self.flush().await;
        }
        () = shutdown.cancelled() => {
          log::debug!("{}: shutting down flush loop", self.name());
          break;
        }
      }
    }

    log::debug!("{}: performing shutdown flush", self.name());
    self.shutdown_flush().await;
    log::info!("{}: shutdown flush complete", self.name());
  }
}
