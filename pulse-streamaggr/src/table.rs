// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./table_test.rs"]
mod table_test;

use crate::key::OutputKey;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::OnceLock;

//
// GetOrInsertResult
//

// Return type from load_or_store() below.
#[derive(Debug)]
pub enum GetOrInsertResult<V> {
  Inserted(V),
  Existed(V),
}

impl<V> GetOrInsertResult<V> {
  pub fn into_inner(self) -> V {
    match self {
      Self::Inserted(v) | Self::Existed(v) => v,
    }
  }
}

//
// Shard
//

struct Shard<V> {
  map: RwLock<HashMap<OutputKey, V, ahash::RandomState>>,
}

//
// ShardedMap
//

// A sharded concurrent map from output key to a cheaply cloneable value (typically an Arc). Each
// shard is an independent hash map behind its own reader/writer lock, so lookups from many
// ingesting threads only contend when they land in the same shard, and even then only on a read
// lock. Values are cloned out of the map and no lock is ever held while calling back into user
// code, which means callers can freely lock their own values and call back into the map.
pub struct ShardedMap<V> {
  shift: usize,
  hash_builder: ahash::RandomState,
  shards: Vec<Shard<V>>,
}

impl<V: Clone> Default for ShardedMap<V> {
  fn default() -> Self {
    Self::with_shards(Self::default_shard_amount())
  }
}

impl<V: Clone> ShardedMap<V> {
  fn default_shard_amount() -> usize {
    static DEFAULT_SHARD_AMOUNT: OnceLock<usize> = OnceLock::new();
    *DEFAULT_SHARD_AMOUNT.get_or_init(|| {
      (std::thread::available_parallelism().map_or(1, usize::from) * 4).next_power_of_two()
    })
  }

  const fn ptr_size_bits() -> usize {
    std::mem::size_of::<usize>() * 8
  }

  // Create a map with a specific number of shards, which must be a power of two.
  #[must_use]
  pub fn with_shards(shards: usize) -> Self {
    assert!(shards.is_power_of_two());
    let hash_builder = ahash::RandomState::new();
    let shards: Vec<_> = (0 .. shards)
      .map(|_| Shard {
        map: RwLock::new(HashMap::with_hasher(hash_builder.clone())),
      })
      .collect();

    Self {
      shift: Self::ptr_size_bits() - shards.len().trailing_zeros() as usize,
      hash_builder,
      shards,
    }
  }

  // The checked shift is required for the single shard case.
  fn determine_shard(&self, key: &[u8]) -> &Shard<V> {
    let hash = self.hash_builder.hash_one(key);
    let index = hash.checked_shr(self.shift as u32).unwrap_or(0) as usize;
    &self.shards[index]
  }

  // Fetch a clone of the value stored for a key.
  pub fn get(&self, key: &[u8]) -> Option<V> {
    self.determine_shard(key).map.read().get(key).cloned()
  }

  // Store the candidate value under the key unless a value is already present, in which case the
  // existing value is returned and the candidate is dropped. The candidate is dropped after the
  // shard lock is released so that any cleanup it performs does not extend the critical section.
  // The key is only materialized via make_key if the value is actually inserted.
  pub fn load_or_store(
    &self,
    key: &[u8],
    make_key: impl FnOnce() -> OutputKey,
    candidate: V,
  ) -> GetOrInsertResult<V> {
    let shard = self.determine_shard(key);
    let mut map = shard.map.write();
    if let Some(existing) = map.get(key) {
      let existing = existing.clone();
      drop(map);
      drop(candidate);
      return GetOrInsertResult::Existed(existing);
    }

    map.insert(make_key(), candidate.clone());
    GetOrInsertResult::Inserted(candidate)
  }

  // Remove every entry while visiting it. Each shard is emptied in one step under its write lock
  // and its former entries are visited after the lock is released, so new entries can be created
  // concurrently without waiting for the visitor.
  pub fn for_each_and_clear(&self, mut visit: impl FnMut(OutputKey, V)) {
    let mut drained = Vec::new();
    for shard in &self.shards {
      drained.extend(shard.map.write().drain());
      for (key, value) in drained.drain(..) {
        visit(key, value);
      }
    }
  }

  // Keep only the entries the predicate accepts. Returns the number of removed entries.
  pub fn retain(&self, mut predicate: impl FnMut(&OutputKey, &V) -> bool) -> usize {
    let mut removed = 0;
    for shard in &self.shards {
      let mut map = shard.map.write();
      let before = map.len();
      map.retain(|key, value| predicate(key, value));
      removed += before - map.len();
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.shards.iter().map(|shard| shard.map.read().len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.shards.iter().all(|shard| shard.map.read().is_empty())
  }
}
