//! Bounded key/value cache with single-flight loading
//!
//! The cache only saves backend round trips. A miss always falls through to the
//! loader, so nothing may rely on an entry being present.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Cache capability injected into stores
#[async_trait]
pub trait Cache<V: Clone + Send + Sync + 'static>: Send + Sync {
    /// Cached value, if any
    fn get(&self, key: &str) -> Option<V>;

    /// Cached value, or the result of `loader`; the flag tells whether it was cached
    ///
    /// Concurrent calls for the same missing key share one `loader` run.
    async fn get_or_load(&self, key: &str, loader: BoxFuture<'_, Result<V>>) -> Result<(V, bool)>;

    /// Insert or replace
    fn add(&self, key: &str, value: V);

    /// Evict
    fn delete(&self, key: &str);
}

struct Entries<V> {
    values: HashMap<String, V>,
    order: VecDeque<String>,
}

/// FIFO-bounded cache that collapses concurrent loads of the same key
pub struct DedupCache<V> {
    capacity: usize,
    entries: Mutex<Entries<V>>,
    in_flight: DashMap<String, Arc<OnceCell<V>>>,
}

impl<V: Clone + Send + Sync + 'static> DedupCache<V> {
    /// Cache holding at most `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries {
                values: HashMap::new(),
                order: VecDeque::new(),
            }),
            in_flight: DashMap::new(),
        }
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.lock().values.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Cache<V> for DedupCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().values.get(key).cloned()
    }

    async fn get_or_load(&self, key: &str, loader: BoxFuture<'_, Result<V>>) -> Result<(V, bool)> {
        if let Some(v) = self.get(key) {
            return Ok((v, true));
        }

        let cell = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        // a finished load adds to the cache before it leaves `in_flight`
        if let Some(v) = self.get(key) {
            return Ok((v, true));
        }

        let mut loaded_here = false;
        let result = cell
            .get_or_try_init(|| {
                loaded_here = true;
                loader
            })
            .await
            .cloned();

        match result {
            Ok(v) => {
                if loaded_here {
                    self.add(key, v.clone());
                    self.in_flight.remove(key);
                }
                Ok((v, !loaded_here))
            }
            Err(e) => {
                if loaded_here {
                    self.in_flight.remove_if(key, |_, c| Arc::ptr_eq(c, &cell));
                }
                Err(e)
            }
        }
    }

    fn add(&self, key: &str, value: V) {
        let mut entries = self.entries.lock();
        if entries.values.insert(key.to_string(), value).is_none() {
            entries.order.push_back(key.to_string());
        }
        while entries.values.len() > self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.values.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn delete(&self, key: &str) {
        let mut entries = self.entries.lock();
        if entries.values.remove(key).is_some() {
            entries.order.retain(|k| k != key);
        }
    }
}
