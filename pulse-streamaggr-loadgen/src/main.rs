// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use async_trait::async_trait;
use clap::Parser;
use prometheus::{Registry, TextEncoder};
use pulse_streamaggr::aggregation::{OutputSeries, SeriesDeleter};
use pulse_streamaggr::aggregator::{Aggregator, AggregatorContext, OutputDispatch};
use pulse_streamaggr::config::load_from_file;
use pulse_streamaggr::key::{
  KeyInterner,
  Label,
  OutputKey,
  PushSample,
  SampleKey,
  decode_labels,
};
use pulse_streamaggr::time::RealTimeProvider;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const BATCH_SIZE: usize = 100;
const JOBS: usize = 64;

#[derive(Parser)]
struct Options {
  #[arg(short = 'c', long = "config")]
  pub config: String,

  /// Number of concurrent pushing tasks.
  #[arg(long = "workers", default_value_t = 4)]
  pub workers: usize,

  /// Number of distinct input series.
  #[arg(long = "keys", default_value_t = 10_000)]
  pub keys: usize,

  /// How long to generate load for, in seconds.
  #[arg(long = "duration", default_value_t = 300)]
  pub duration: u64,
}

//
// LogDispatch
//

struct LogDispatch {
  name: String,
}

#[async_trait]
impl OutputDispatch for LogDispatch {
  async fn send(&self, series: Vec<OutputSeries>) {
    log::info!("{}: flushed {} series", self.name, series.len());
    if let Some(first) = series.first() {
      log::debug!(
        "{}: e.g. {:?} {} {:?} = {}",
        self.name,
        decode_labels(&first.output_key),
        first.suffix,
        first.extra_label,
        first.value
      );
    }
  }
}

//
// LogDeleter
//

#[derive(Default)]
struct LogDeleter {
  deleted: AtomicU64,
}

impl SeriesDeleter for LogDeleter {
  fn delete_series(&self, output_key: &OutputKey, timestamp: i64) {
    self.deleted.fetch_add(1, Ordering::Relaxed);
    log::trace!("deleted {:?} at {timestamp}", decode_labels(output_key));
  }
}

// Every input series carries a job and an instance label. Outputs are grouped by job.
fn make_keys(count: usize) -> anyhow::Result<Vec<SampleKey>> {
  (0 .. count)
    .map(|i| {
      let job = Label::new("job", format!("job-{}", i % JOBS));
      let instance = Label::new("instance", format!("instance-{i}"));
      Ok(SampleKey::from_labels(
        &[job.clone(), instance],
        &[job],
      )?)
    })
    .collect()
}

async fn run_worker(
  worker: usize,
  aggregators: Arc<[Arc<Aggregator>]>,
  keys: Arc<[SampleKey]>,
  shutdown: CancellationToken,
) -> u64 {
  let mut rng = SmallRng::seed_from_u64(worker as u64);
  let mut pushed = 0;
  while !shutdown.is_cancelled() {
    let batch: Vec<_> = (0 .. BATCH_SIZE)
      .map(|_| PushSample {
        key: keys[rng.random_range(0 .. keys.len())].clone(),
        value: rng.random_range(0.0 .. 1000.0),
      })
      .collect();
    for aggregator in aggregators.iter() {
      aggregator.push(&batch);
    }
    pushed += batch.len() as u64;
    tokio::task::yield_now().await;
  }
  pushed
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let options = Options::parse();
  log::info!("loading config from: {}", options.config);
  let config = load_from_file(&options.config)?;

  let registry = Registry::new();
  let interner = Arc::new(KeyInterner::new());
  let deleter = Arc::new(LogDeleter::default());
  let aggregators = config
    .aggregators
    .into_iter()
    .map(|config| {
      let name = config.name.clone();
      Aggregator::new(
        config,
        AggregatorContext {
          registry: registry.clone(),
          dispatcher: Arc::new(LogDispatch { name }),
          deleter: deleter.clone(),
          time_provider: Arc::new(RealTimeProvider {}),
          interner: interner.clone(),
        },
      )
    })
    .collect::<anyhow::Result<Vec<_>>>()?;
  let aggregators: Arc<[Arc<Aggregator>]> = aggregators.into();

  let shutdown = CancellationToken::new();
  let flush_loops: Vec<_> = aggregators
    .iter()
    .map(|aggregator| aggregator.spawn_flush_loop(shutdown.clone()))
    .collect();

  let keys: Arc<[SampleKey]> = make_keys(options.keys.max(1))?.into();
  log::info!(
    "pushing {} series from {} worker(s) to {} aggregator(s) for {}s",
    keys.len(),
    options.workers,
    aggregators.len(),
    options.duration
  );
  let workers: Vec<_> = (0 .. options.workers)
    .map(|worker| {
      tokio::spawn(run_worker(
        worker,
        aggregators.clone(),
        keys.clone(),
        shutdown.clone(),
      ))
    })
    .collect();

  tokio::select! {
    () = tokio::time::sleep(Duration::from_secs(options.duration)) => {
      log::info!("load generation complete");
    }
    result = tokio::signal::ctrl_c() => {
      result?;
      log::info!("interrupted, shutting down");
    }
  }
  shutdown.cancel();

  let mut pushed = 0;
  for worker in workers {
    pushed += worker.await?;
  }
  for flush_loop in flush_loops {
    flush_loop.await?;
  }

  log::info!(
    "pushed {pushed} samples, {} series deleted",
    deleter.deleted.load(Ordering::Relaxed)
  );
  log::info!(
    "stats:\n{}",
    TextEncoder::new().encode_to_string(&registry.gather())?
  );
  Ok(())
}
