// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./cm_quantile_test.rs"]
mod cm_quantile_test;

// Streaming biased quantile estimation following statsite's cm_quantile. The list/cursor layout is
// kept close to that implementation so the incremental insert and compress passes behave the same.

use crate::pool::Reusable;
use crate::{LossyFloatToInt, LossyIntToFloat};
use adapter::SampleAdapter;
use intrusive_collections::linked_list::Cursor;
use intrusive_collections::{LinkedList, LinkedListLink};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::binary_heap::PeekMut;
use std::ptr;
use std::sync::Arc;

//
// Sample
//

// A tuple in the summary. Ordered by value using a total order so that a stray NaN cannot corrupt
// the heaps, although callers are expected to filter NaN before adding.
struct Sample {
  value: f64,
  width: u64,
  delta: u64,
  link: LinkedListLink,
}

impl Sample {
  const fn new(value: f64) -> Self {
    Self {
      value,
      width: 0,
      delta: 0,
      link: LinkedListLink::new(),
    }
  }
}

impl PartialEq for Sample {
  fn eq(&self, other: &Self) -> bool {
    self.value.total_cmp(&other.value).is_eq()
  }
}

impl Eq for Sample {}

impl PartialOrd for Sample {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Sample {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self.value.total_cmp(&other.value)
  }
}

#[allow(clippy::expl_impl_clone_on_copy)]
mod adapter {
  use super::Sample;
  use intrusive_collections::{LinkedListLink, intrusive_adapter};

  intrusive_adapter!(pub(super) SampleAdapter = Box<Sample>: Sample { link: LinkedListLink });
}

//
// Quantile
//

// The Cormode-Muthukrishnan algorithm for biased quantiles over data streams, from "Effective
// Computation of Biased Quantiles over Data Streams". Error is targeted at the configured
// quantiles, which must lie strictly between 0 and 1.
pub struct Quantile {
  epsilon: f64,
  quantiles: Arc<[f64]>,

  num_samples: u64,
  num_values: u64,

  samples: LinkedList<SampleAdapter>,
  buf_less: BinaryHeap<Reverse<Box<Sample>>>,
  buf_more: BinaryHeap<Reverse<Box<Sample>>>,

  // Cursor and CursorMut borrow the list, so positions are kept as raw pointers into it. Both are
  // either null or point at a live element of samples.
  insert_cursor: *mut Sample,
  compress_cursor: *mut Sample,
  compress_min_rank: u64,
}

// Safety: the raw cursors only ever point into the owned samples list.
unsafe impl Send for Quantile {}
unsafe impl Sync for Quantile {}

impl Quantile {
  #[must_use]
  pub fn new(epsilon: f64, quantiles: Arc<[f64]>) -> Self {
    Self {
      epsilon,
      quantiles,
      num_samples: 0,
      num_values: 0,
      samples: LinkedList::new(SampleAdapter::new()),
      buf_less: BinaryHeap::new(),
      buf_more: BinaryHeap::new(),
      insert_cursor: ptr::null_mut(),
      compress_cursor: ptr::null_mut(),
      compress_min_rank: 0,
    }
  }

  pub fn add_sample(&mut self, sample: f64) {
    self.add_to_buffer(sample);
    self.insert();
    self.compress();
  }

  // The number of values added, including values still sitting in the buffers.
  #[must_use]
  pub fn count(&self) -> u64 {
    self.num_values + (self.buf_less.len() + self.buf_more.len()) as u64
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.count() == 0
  }

  fn add_to_buffer(&mut self, sample: f64) {
    let sample = Box::new(Sample::new(sample));

    // Values below the insert cursor have to wait for the next pass over the list.
    if self.num_values > 0
      && sample.value < Self::ptr_to_ref(&mut self.insert_cursor).map_or(0.0, |s| s.value)
    {
      self.buf_less.push(Reverse(sample));
    } else {
      self.buf_more.push(Reverse(sample));
    }
  }

  // A mutable reference to the pointer is required to guarantee exclusive access.
  fn ptr_to_ref(cursor: &mut *mut Sample) -> Option<&mut Sample> {
    if cursor.is_null() {
      None
    } else {
      unsafe { Some(&mut **cursor) }
    }
  }

  fn cursor_to_ptr(cursor: &Cursor<'_, SampleAdapter>) -> *mut Sample {
    cursor.get().map_or(ptr::null_mut(), |c| {
      std::ptr::from_ref::<Sample>(c).cast_mut()
    })
  }

  #[allow(clippy::needless_pass_by_ref_mut)]
  fn ptr_next(list: &mut LinkedList<SampleAdapter>, cursor: &mut *mut Sample) -> *mut Sample {
    let mut cursor = unsafe { list.cursor_from_ptr(*cursor) };
    cursor.move_next();
    Self::cursor_to_ptr(&cursor)
  }

  #[allow(clippy::needless_pass_by_ref_mut)]
  fn ptr_prev(list: &mut LinkedList<SampleAdapter>, cursor: &mut *mut Sample) -> *mut Sample {
    let mut cursor = unsafe { list.cursor_from_ptr(*cursor) };
    cursor.move_prev();
    Self::cursor_to_ptr(&cursor)
  }

  fn push_tuple_back(&mut self, mut sample: Box<Sample>) {
    sample.width = 1;
    sample.delta = 0;
    self.samples.push_back(sample);
    self.num_values += 1;
    self.num_samples += 1;
  }

  // Move a bounded number of buffered values into the list, walking the insert cursor forward.
  fn insert(&mut self) {
    if self.samples.is_empty() {
      if let Some(Reverse(sample)) = self.buf_more.pop() {
        self.push_tuple_back(sample);
        self.insert_cursor = Self::cursor_to_ptr(&self.samples.front());
      }
      return;
    }

    if self.insert_cursor.is_null() {
      self.insert_cursor = Self::cursor_to_ptr(&self.samples.front());
    }

    for _ in 0 .. self.cursor_increment() {
      let Some(insert_sample) = Self::ptr_to_ref(&mut self.insert_cursor) else {
        break;
      };
      let (insert_value, insert_rank_error) =
        (insert_sample.value, insert_sample.width + insert_sample.delta - 1);

      while let Some(sample) = self.buf_more.peek_mut() {
        if sample.0.value > insert_value {
          break;
        }
        let Reverse(mut sample) = PeekMut::pop(sample);
        sample.width = 1;
        sample.delta = insert_rank_error;

        if Self::ptr_to_ref(&mut self.compress_cursor)
          .is_some_and(|compress_sample| compress_sample.value >= sample.value)
        {
          self.compress_min_rank += 1;
        }

        unsafe { self.samples.cursor_mut_from_ptr(self.insert_cursor) }.insert_before(sample);
        self.num_values += 1;
        self.num_samples += 1;
      }

      self.insert_cursor = Self::ptr_next(&mut self.samples, &mut self.insert_cursor);
    }

    // Once the cursor runs off the end, everything larger than the tail is appended and the pass
    // starts over with the values that were parked in buf_less.
    if self.insert_cursor.is_null() {
      loop {
        let tail_value = self.samples.back().get().map_or(f64::MIN, |s| s.value);
        if !self
          .buf_more
          .peek()
          .is_some_and(|Reverse(sample)| sample.value > tail_value)
        {
          break;
        }
        let Some(Reverse(sample)) = self.buf_more.pop() else {
          break;
        };
        self.push_tuple_back(sample);
      }

      self.reset_insert_cursor();
    }
  }

  fn reset_insert_cursor(&mut self) {
    std::mem::swap(&mut self.buf_less, &mut self.buf_more);
    self.insert_cursor = ptr::null_mut();
  }

  fn cursor_increment(&self) -> u64 {
    (self.num_samples.lossy_to_f64() * self.epsilon)
      .ceil()
      .lossy_to_u64()
  }

  // Merge a bounded number of adjacent tuples, walking the compress cursor from the tail towards
  // the head. The head and tail are never merged away, so min() and max() stay exact.
  fn compress(&mut self) {
    if self.num_samples < 3 {
      return;
    }

    if self.compress_cursor.is_null() {
      let mut cursor = self.samples.back();
      cursor.move_prev();
      let Some(width) = cursor.get().map(|s| s.width) else {
        return;
      };
      self.compress_min_rank = self.num_values - 1 - width;
      cursor.move_prev();
      self.compress_cursor = Self::cursor_to_ptr(&cursor);
    }

    for _ in 0 .. self.cursor_increment() {
      if Self::cursor_to_ptr(&self.samples.front()) == self.compress_cursor {
        break;
      }

      let mut next = Self::ptr_next(&mut self.samples, &mut self.compress_cursor);
      let (Some(next_ref), Some(compressor_ref)) = (
        Self::ptr_to_ref(&mut next),
        Self::ptr_to_ref(&mut self.compress_cursor),
      ) else {
        break;
      };

      let max_rank = self.compress_min_rank + compressor_ref.width + compressor_ref.delta;
      self.compress_min_rank -= compressor_ref.width;
      let threshold = Self::threshold(
        &self.quantiles,
        self.epsilon,
        self.num_values,
        max_rank.lossy_to_f64(),
      );
      if compressor_ref.width + next_ref.width + next_ref.delta <= threshold {
        next_ref.width += compressor_ref.width;

        if self.insert_cursor == self.compress_cursor {
          self.insert_cursor = next;
        }

        let mut cursor = unsafe { self.samples.cursor_mut_from_ptr(self.compress_cursor) };
        cursor.remove();
        cursor.move_prev();
        self.compress_cursor = Self::cursor_to_ptr(&cursor.as_cursor());

        self.num_samples -= 1;
      } else {
        self.compress_cursor = Self::ptr_prev(&mut self.samples, &mut self.compress_cursor);
      }
    }

    if Self::cursor_to_ptr(&self.samples.front()) == self.compress_cursor {
      self.compress_cursor = ptr::null_mut();
    }
  }

  // The allowed rank error at a given rank, the tightest across all targeted quantiles.
  fn threshold(quantiles: &[f64], epsilon: f64, num_values: u64, rank: f64) -> u64 {
    let num_values = num_values.lossy_to_f64();
    quantiles
      .iter()
      .map(|quantile| {
        if rank >= quantile * num_values {
          2.0 * epsilon * rank / quantile
        } else {
          2.0 * epsilon * (num_values - rank) / (1.0 - quantile)
        }
      })
      .fold(f64::MAX, f64::min)
      .lossy_to_u64()
  }

  // Estimate the value at a quantile. flush() must be called first for buffered values to be
  // taken into account.
  #[must_use]
  pub fn query(&self, quantile: f64) -> f64 {
    let rank = (quantile * self.num_values.lossy_to_f64())
      .ceil()
      .lossy_to_u64();
    let threshold = (Self::threshold(
      &self.quantiles,
      self.epsilon,
      self.num_values,
      rank.lossy_to_f64(),
    )
    .lossy_to_f64()
      / 2.0)
      .ceil()
      .lossy_to_u64();

    let mut min_rank = 0;
    let mut prev_cursor = self.samples.front();
    let mut current_cursor = self.samples.front();
    while let Some(current) = current_cursor.get() {
      if min_rank + current.width + current.delta > rank + threshold {
        break;
      }
      min_rank += current.width;
      prev_cursor = current_cursor.clone();
      current_cursor.move_next();
    }
    prev_cursor.get().map_or(0.0, |p| p.value)
  }

  // Drain the buffers into the list so queries see every value.
  pub fn flush(&mut self) {
    while !self.buf_less.is_empty() || !self.buf_more.is_empty() {
      if self.buf_more.is_empty() {
        self.reset_insert_cursor();
      }
      self.insert();
      self.compress();
    }
  }

  #[must_use]
  pub fn min(&self) -> f64 {
    self.samples.front().get().map_or(0.0, |s| s.value)
  }

  #[must_use]
  pub fn max(&self) -> f64 {
    self.samples.back().get().map_or(0.0, |s| s.value)
  }
}

impl Reusable for Quantile {
  // Keeps epsilon and the targeted quantiles, which are fixed for the owning pool.
  fn reset(&mut self) {
    self.insert_cursor = ptr::null_mut();
    self.compress_cursor = ptr::null_mut();
    self.compress_min_rank = 0;
    self.samples.clear();
    self.buf_less.clear();
    self.buf_more.clear();
    self.num_samples = 0;
    self.num_values = 0;
  }
}
