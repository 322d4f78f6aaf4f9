// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;
use std::io::Write;

const FULL_CONFIG: &str = r"
aggregators:
  - name: api_requests
    interval: 1m
    staleness_interval: 5m
    include_input_key: true
    flush_on_shutdown: true
    no_align_flush_to_interval: true
    ignore_first_intervals: 2
    quantile_epsilon: 0.005
    outputs:
      - type: count_samples
      - type: stddev
      - type: quantiles
        phis: [0.5, 0.9, 0.99]
  - name: minimal
    interval: 10s
    outputs:
      - type: last
";

fn make_aggregator_config(yaml: &str) -> AggregatorConfig {
  serde_yaml::from_str(yaml).unwrap()
}

fn expect_error(yaml: &str, expected: &str) {
  let error = WrappedConfig::new(make_aggregator_config(yaml))
    .unwrap_err()
    .to_string();
  assert!(
    error.contains(expected),
    "expected '{expected}' in '{error}'"
  );
}

#[test]
fn full_config() {
  let config = Config::from_yaml(FULL_CONFIG).unwrap();
  assert_eq!(2, config.aggregators.len());

  let wrapped = WrappedConfig::new(config.aggregators[0].clone()).unwrap();
  assert_eq!(Duration::from_secs(60), wrapped.config.interval);
  assert_eq!(Duration::from_secs(300), wrapped.staleness_interval);
  assert_eq!(0.005, wrapped.quantile_epsilon);
  assert!(wrapped.config.include_input_key);
  assert!(wrapped.config.flush_on_shutdown);
  assert!(wrapped.config.no_align_flush_to_interval);
  assert_eq!(2, wrapped.config.ignore_first_intervals);
  assert_eq!(
    vec![
      OutputConfig::CountSamples,
      OutputConfig::Stddev,
      OutputConfig::Quantiles {
        phis: vec![0.5, 0.9, 0.99]
      },
    ],
    wrapped.config.outputs
  );

  let wrapped = WrappedConfig::new(config.aggregators[1].clone()).unwrap();
  assert_eq!(Duration::from_secs(20), wrapped.staleness_interval);
  assert_eq!(0.01, wrapped.quantile_epsilon);
  assert!(!wrapped.config.include_input_key);
  assert!(!wrapped.config.flush_on_shutdown);
  assert_eq!(0, wrapped.config.ignore_first_intervals);
}

#[test]
fn load_from_file_works() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  file.write_all(FULL_CONFIG.as_bytes()).unwrap();
  let config = load_from_file(file.path().to_str().unwrap()).unwrap();
  assert_eq!("api_requests", config.aggregators[0].name);

  assert!(load_from_file("/does/not/exist.yaml").is_err());
}

#[test]
fn duplicate_aggregator_names() {
  let yaml = r"
aggregators:
  - name: a
    interval: 1m
    outputs: [{type: count_samples}]
  - name: a
    interval: 1m
    outputs: [{type: count_samples}]
";
  let error = Config::from_yaml(yaml).unwrap_err().to_string();
  assert!(error.contains("duplicate aggregator name 'a'"), "{error}");
}

#[test]
fn unknown_fields_rejected() {
  assert!(
    serde_yaml::from_str::<AggregatorConfig>(
      "{name: a, interval: 1m, outputs: [{type: min}], bogus: 1}"
    )
    .is_err()
  );
  assert!(
    serde_yaml::from_str::<AggregatorConfig>("{name: a, interval: 1m, outputs: [{type: median}]}")
      .is_err()
  );
}

#[test]
fn validation() {
  expect_error(
    "{name: '', interval: 1m, outputs: [{type: min}]}",
    "name must not be empty",
  );
  expect_error(
    "{name: a, interval: 500ms, outputs: [{type: min}]}",
    "interval must be at least",
  );
  expect_error(
    "{name: a, interval: 1m, staleness_interval: 30s, outputs: [{type: min}]}",
    "must not be shorter than interval",
  );
  expect_error(
    "{name: a, interval: 1m, quantile_epsilon: 0.5, outputs: [{type: min}]}",
    "quantile_epsilon",
  );
  expect_error(
    "{name: a, interval: 1m, outputs: []}",
    "at least one output",
  );
  expect_error(
    "{name: a, interval: 1m, outputs: [{type: min}, {type: min}]}",
    "duplicate output 'min'",
  );
  expect_error(
    "{name: a, interval: 1m, outputs: [{type: quantiles, phis: []}]}",
    "at least one phi",
  );
  expect_error(
    "{name: a, interval: 1m, outputs: [{type: quantiles, phis: [1.5]}]}",
    "between 0.0 and 1.0",
  );
  expect_error(
    "{name: a, interval: 1m, outputs: [{type: quantiles, phis: [0.5, 0.5]}]}",
    "duplicate phi",
  );
}

#[test]
fn quantile_labels() {
  assert_eq!("0.5", &*WrappedConfig::quantile_label(0.5));
  assert_eq!("0.99", &*WrappedConfig::quantile_label(0.99));
  assert_eq!("0", &*WrappedConfig::quantile_label(0.0));
  assert_eq!("1", &*WrappedConfig::quantile_label(1.0));
  assert_eq!("0.0001", &*WrappedConfig::quantile_label(0.0001));
  assert_eq!("1e-05", &*WrappedConfig::quantile_label(0.00001));
  assert_eq!("2.5e-07", &*WrappedConfig::quantile_label(0.000_000_25));
  assert_eq!("1e+06", &*WrappedConfig::quantile_label(1_000_000.0));
}
