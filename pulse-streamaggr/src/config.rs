// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::bail;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const fn default_quantile_epsilon() -> f64 {
  0.01
}

const MIN_INTERVAL: Duration = Duration::from_secs(1);

//
// OutputConfig
//

// The aggregation functions that can be run over an input stream.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
  CountSamples,
  SumSamples,
  Min,
  Max,
  Avg,
  Last,
  Stddev,
  Stdvar,
  Quantiles { phis: Vec<f64> },
}

impl OutputConfig {
  // The suffix identifying this function on emitted series.
  #[must_use]
  pub const fn suffix(&self) -> &'static str {
    match self {
      Self::CountSamples => "count_samples",
      Self::SumSamples => "sum_samples",
      Self::Min => "min",
      Self::Max => "max",
      Self::Avg => "avg",
      Self::Last => "last",
      Self::Stddev => "stddev",
      Self::Stdvar => "stdvar",
      Self::Quantiles { .. } => "quantiles",
    }
  }
}

//
// AggregatorConfig
//

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
  pub name: String,
  // How often aggregated state is flushed.
  #[serde(with = "humantime_serde")]
  pub interval: Duration,
  // How long a key may go without samples before its state is evicted. Defaults to twice the
  // flush interval.
  #[serde(default, with = "humantime_serde")]
  pub staleness_interval: Option<Duration>,
  // Aggregate every input series separately instead of collapsing by output labels.
  #[serde(default)]
  pub include_input_key: bool,
  // Emit whatever is aggregated when the aggregator is shut down.
  #[serde(default)]
  pub flush_on_shutdown: bool,
  // Flush on a local timer started at creation instead of at wall clock multiples of interval.
  #[serde(default)]
  pub no_align_flush_to_interval: bool,
  // The number of initial flushes whose output is discarded, for inputs that need to warm up.
  #[serde(default)]
  pub ignore_first_intervals: u32,
  // Error bound for the quantile digest.
  #[serde(default)]
  pub quantile_epsilon: Option<f64>,
  pub outputs: Vec<OutputConfig>,
}

//
// Config
//

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
  pub aggregators: Vec<AggregatorConfig>,
}

impl Config {
  pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
    let config: Self = serde_yaml::from_str(yaml)?;
    let mut names = HashSet::new();
    for aggregator in &config.aggregators {
      if !names.insert(aggregator.name.as_str()) {
        bail!("duplicate aggregator name '{}'", aggregator.name);
      }
      // Validate up front so that a bad file is rejected as a whole.
      WrappedConfig::new(aggregator.clone())?;
    }
    Ok(config)
  }
}

pub fn load_from_file(path: &str) -> anyhow::Result<Config> {
  let file_contents = std::fs::read_to_string(path)?;
  Config::from_yaml(&file_contents)
    .inspect_err(|e| log::warn!("rejecting config file {path}: {e}"))
}

//
// WrappedConfig
//

// A validated aggregator config with defaults filled in and derived values precomputed.
#[derive(Debug)]
pub struct WrappedConfig {
  pub config: AggregatorConfig,
  pub staleness_interval: Duration,
  pub quantile_epsilon: f64,
}

impl WrappedConfig {
  // Render a quantile level as a label value, using the shortest representation that round trips
  // (0.5, 0.99, 1). Levels with a decimal exponent below -4 or of at least 6 switch to exponent
  // form with a signed, two digit minimum exponent (1e-05, 2.5e-07).
  #[must_use]
  pub fn quantile_label(phi: f64) -> Arc<str> {
    let scientific = format!("{phi:e}");
    if let Some((mantissa, exponent)) = scientific.split_once('e')
      && let Ok(exponent) = exponent.parse::<i32>()
      && phi != 0.0
      && !(-4 .. 6).contains(&exponent)
    {
      let sign = if exponent < 0 { '-' } else { '+' };
      return format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs()).into();
    }
    phi.to_string().into()
  }

  pub fn new(config: AggregatorConfig) -> anyhow::Result<Self> {
    if config.name.is_empty() {
      bail!("aggregator name must not be empty");
    }
    if config.interval < MIN_INTERVAL {
      bail!(
        "{}: interval must be at least {:?}, got {:?}",
        config.name,
        MIN_INTERVAL,
        config.interval
      );
    }

    let staleness_interval = config.staleness_interval.unwrap_or(2 * config.interval);
    if staleness_interval < config.interval {
      bail!(
        "{}: staleness_interval {:?} must not be shorter than interval {:?}",
        config.name,
        staleness_interval,
        config.interval
      );
    }

    let quantile_epsilon = config
      .quantile_epsilon
      .unwrap_or(default_quantile_epsilon());
    if quantile_epsilon <= 0.0 || quantile_epsilon > 0.1 {
      bail!("{}: quantile_epsilon must be > 0.0 and <= 0.1", config.name);
    }

    if config.outputs.is_empty() {
      bail!("{}: at least one output must be configured", config.name);
    }
    let mut suffixes = HashSet::new();
    for output in &config.outputs {
      if !suffixes.insert(output.suffix()) {
        bail!("{}: duplicate output '{}'", config.name, output.suffix());
      }
      if let OutputConfig::Quantiles { phis } = output {
        if phis.is_empty() {
          bail!("{}: quantiles requires at least one phi", config.name);
        }
        let mut seen = HashSet::new();
        for phi in phis {
          if !(0.0 ..= 1.0).contains(phi) {
            bail!("{}: phi {phi} must be between 0.0 and 1.0", config.name);
          }
          if !seen.insert(phi.to_bits()) {
            bail!("{}: duplicate phi {phi}", config.name);
          }
        }
      }
    }

    Ok(Self {
      config,
      staleness_interval,
      quantile_epsilon,
    })
  }
}
