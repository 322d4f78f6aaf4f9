// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./key_test.rs"]
mod key_test;

use crate::table::ShardedMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

// An interned output key. All aggregation state for a series is stored under one of these.
pub type OutputKey = Arc<[u8]>;

//
// KeyError
//

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum KeyError {
  #[error("label name or value exceeds {} bytes", u16::MAX)]
  LabelTooLong,
  #[error("too many labels")]
  TooManyLabels,
  #[error("input key exceeds {} bytes", u32::MAX)]
  InputKeyTooLong,
  #[error("encoded key is truncated")]
  Truncated,
}

//
// Label
//

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label {
  pub name: Bytes,
  pub value: Bytes,
}

impl Label {
  pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
    }
  }
}

// Pack a label set into its canonical byte form. Labels are sorted by name so that two samples
// with the same label set always map to the same key regardless of the order labels arrived in.
// Layout: 2 bytes for the number of labels, followed by a 2 byte length + bytes for each name and
// value.
pub fn encode_labels(labels: &[Label]) -> Result<Bytes, KeyError> {
  let count = u16::try_from(labels.len()).map_err(|_| KeyError::TooManyLabels)?;

  let mut sorted: Vec<&Label> = labels.iter().collect();
  sorted.sort_unstable_by(|a, b| a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value)));

  let len = 2
    + sorted
      .iter()
      .map(|l| l.name.len() + l.value.len() + 4)
      .sum::<usize>();
  let mut data = BytesMut::with_capacity(len);
  data.put_u16(count);
  for label in sorted {
    put_len_prefixed(&mut data, &label.name)?;
    put_len_prefixed(&mut data, &label.value)?;
  }
  Ok(data.freeze())
}

fn put_len_prefixed(data: &mut BytesMut, bytes: &[u8]) -> Result<(), KeyError> {
  let len = u16::try_from(bytes.len()).map_err(|_| KeyError::LabelTooLong)?;
  data.put_u16(len);
  data.put(bytes);
  Ok(())
}

fn get_len_prefixed(buf: &mut &[u8]) -> Result<Bytes, KeyError> {
  if buf.remaining() < 2 {
    return Err(KeyError::Truncated);
  }
  let len = buf.get_u16() as usize;
  if buf.remaining() < len {
    return Err(KeyError::Truncated);
  }
  let bytes = Bytes::copy_from_slice(&buf[.. len]);
  buf.advance(len);
  Ok(bytes)
}

// Unpack a label set previously packed with encode_labels(). Sinks use this to turn an output key
// back into labels when rendering rows.
pub fn decode_labels(mut data: &[u8]) -> Result<Vec<Label>, KeyError> {
  if data.remaining() < 2 {
    return Err(KeyError::Truncated);
  }
  let count = data.get_u16() as usize;
  let mut labels = Vec::with_capacity(count);
  for _ in 0 .. count {
    let name = get_len_prefixed(&mut data)?;
    let value = get_len_prefixed(&mut data)?;
    labels.push(Label { name, value });
  }
  if data.has_remaining() {
    return Err(KeyError::Truncated);
  }
  Ok(labels)
}

//
// SampleKey
//

// The materialized identity of an input sample as produced by the ingestion front end. It carries
// both the raw input key (the full input series identity) and the packed output label set, so that
// output key derivation is a slice operation with no allocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SampleKey {
  data: Bytes,
}

impl SampleKey {
  pub fn new(input_key: &[u8], output_labels: &[u8]) -> Result<Self, KeyError> {
    let input_len = u32::try_from(input_key.len()).map_err(|_| KeyError::InputKeyTooLong)?;
    let mut data = BytesMut::with_capacity(4 + input_key.len() + output_labels.len());
    data.put_u32(input_len);
    data.put(input_key);
    data.put(output_labels);
    Ok(Self {
      data: data.freeze(),
    })
  }

  // Build a key from label sets. The input labels identify the input series, the output labels
  // are the subset of labels the aggregation groups by.
  pub fn from_labels(input_labels: &[Label], output_labels: &[Label]) -> Result<Self, KeyError> {
    Self::new(
      &encode_labels(input_labels)?,
      &encode_labels(output_labels)?,
    )
  }

  fn input_len(&self) -> usize {
    let mut buf = &self.data[..];
    buf.get_u32() as usize
  }

  #[must_use]
  pub fn input_key(&self) -> &[u8] {
    &self.data[4 .. 4 + self.input_len()]
  }

  #[must_use]
  pub fn output_labels(&self) -> &[u8] {
    &self.data[4 + self.input_len() ..]
  }
}

// Derive the key under which aggregated state is stored. When the input key is included every
// input series aggregates separately; otherwise all inputs sharing an output label set collapse
// into one output series.
#[must_use]
pub fn get_output_key(key: &SampleKey, include_input_key: bool) -> &[u8] {
  if include_input_key {
    &key.data[4 ..]
  } else {
    key.output_labels()
  }
}

//
// PushSample
//

#[derive(Clone, Debug)]
pub struct PushSample {
  pub key: SampleKey,
  pub value: f64,
}

//
// KeyInterner
//

// Deduplicates output key storage. The same output key recurs across every sample for a series
// and across every aggregation function run over it, so each distinct key is allocated once and
// shared. Keys that are no longer referenced by any aggregation state are released by cleanup().
#[derive(Default)]
pub struct KeyInterner {
  keys: ShardedMap<OutputKey>,
}

impl KeyInterner {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn intern(&self, key: &[u8]) -> OutputKey {
    if let Some(interned) = self.keys.get(key) {
      return interned;
    }

    let candidate: OutputKey = Arc::from(key);
    self
      .keys
      .load_or_store(key, || candidate.clone(), candidate.clone())
      .into_inner()
  }

  // Release every key that is only referenced by the interner itself. The map holds two references
  // to each key (the map key and the value).
  pub fn cleanup(&self) -> usize {
    let removed = self.keys.retain(|_, value| Arc::strong_count(value) > 2);
    if removed > 0 {
      log::debug!("released {removed} interned key(s)");
    }
    removed
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.keys.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
