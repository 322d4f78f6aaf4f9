// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./pool_test.rs"]
mod pool_test;

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

const DEFAULT_MAX_IDLE: usize = 1024;

//
// Reusable
//

// An object that can be returned to a pool. reset() must leave the object indistinguishable from
// a freshly built one.
pub trait Reusable: Send + 'static {
  fn reset(&mut self);
}

//
// ObjectPool
//

// A pool of heavyweight objects. Objects are checked out as a Pooled guard which is exclusively
// owned by its holder; dropping the guard resets the object and returns it to the pool. The pool
// grows on demand and retains at most max_idle idle objects.
pub struct ObjectPool<T> {
  idle: Mutex<Vec<T>>,
  max_idle: usize,
  make: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Reusable> ObjectPool<T> {
  pub fn new(make: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
    Self::with_max_idle(make, DEFAULT_MAX_IDLE)
  }

  pub fn with_max_idle(make: impl Fn() -> T + Send + Sync + 'static, max_idle: usize) -> Arc<Self> {
    Arc::new(Self {
      idle: Mutex::default(),
      max_idle,
      make: Box::new(make),
    })
  }

  pub fn checkout(self: &Arc<Self>) -> Pooled<T> {
    let object = self.idle.lock().pop().unwrap_or_else(|| (self.make)());
    Pooled {
      object: Some(object),
      pool: self.clone(),
    }
  }

  fn put(&self, mut object: T) {
    object.reset();
    let mut idle = self.idle.lock();
    if idle.len() < self.max_idle {
      idle.push(object);
    }
  }

  #[must_use]
  pub fn idle_len(&self) -> usize {
    self.idle.lock().len()
  }
}

//
// Pooled
//

pub struct Pooled<T: Reusable> {
  // Only None once drop() has taken it.
  object: Option<T>,
  pool: Arc<ObjectPool<T>>,
}

impl<T: Reusable> Drop for Pooled<T> {
  fn drop(&mut self) {
    if let Some(object) = self.object.take() {
      self.pool.put(object);
    }
  }
}

impl<T: Reusable> Deref for Pooled<T> {
  type Target = T;

  fn deref(&self) -> &T {
    self.object.as_ref().unwrap()
  }
}

impl<T: Reusable> DerefMut for Pooled<T> {
  fn deref_mut(&mut self) -> &mut T {
    self.object.as_mut().unwrap()
  }
}
