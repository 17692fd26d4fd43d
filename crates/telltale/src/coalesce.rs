// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{Error, Result};

/// Canonical identity of a parameterized request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already canonical key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Types that can be reduced to a [`CacheKey`].
///
/// Parameter sets that would produce the same response must produce the same key.
pub trait CanonicalKey {
    /// Builds the key, rounding floating-point fields to `precision` decimal places.
    fn canonical_key(&self, precision: u8) -> CacheKey;
}

/// Incrementally builds a [`CacheKey`] of the form `namespace?a=1&b=2.500000`.
///
/// Fields are written in call order, so callers must add them in a fixed order. Floats are
/// rounded to the builder's precision and negative zero is written as zero.
///
/// # Examples
///
/// ```
/// use telltale::KeyBuilder;
///
/// let mut key = KeyBuilder::new("mandelbrot", 3);
/// key.int("width", 800_u32).float("zoom", 1.0004);
///
/// assert_eq!(key.finish().as_str(), "mandelbrot?width=800&zoom=1.000");
/// ```
#[derive(Debug)]
pub struct KeyBuilder {
    buffer: String,
    precision: u8,
    fields: usize,
}

impl KeyBuilder {
    /// Starts a key in `namespace` that rounds floats to `precision` decimal places.
    #[must_use]
    pub fn new(namespace: &str, precision: u8) -> Self {
        Self {
            buffer: namespace.to_string(),
            precision,
            fields: 0,
        }
    }

    /// Appends an integer field.
    pub fn int(&mut self, name: &str, value: impl Into<u64>) -> &mut Self {
        let value = value.into().to_string();
        self.field(name, &value)
    }

    /// Appends a float field, rounded to the builder's precision.
    pub fn float(&mut self, name: &str, value: f64) -> &mut Self {
        let value = quantize(value, self.precision);
        self.field(name, &value)
    }

    /// Appends a text field verbatim.
    pub fn text(&mut self, name: &str, value: &str) -> &mut Self {
        self.field(name, value)
    }

    /// Completes the key.
    #[must_use]
    pub fn finish(self) -> CacheKey {
        CacheKey(self.buffer)
    }

    fn field(&mut self, name: &str, value: &str) -> &mut Self {
        self.buffer.push(if self.fields == 0 { '?' } else { '&' });
        self.buffer.push_str(name);
        self.buffer.push('=');
        self.buffer.push_str(value);
        self.fields += 1;
        self
    }
}

fn quantize(value: f64, precision: u8) -> String {
    if !value.is_finite() {
        return value.to_string();
    }

    let text = format!("{value:.prec$}", prec = usize::from(precision));
    match text.strip_prefix('-') {
        Some(magnitude) if magnitude.chars().all(|c| c == '0' || c == '.') => magnitude.to_string(),
        _ => text,
    }
}

/// Counters describing how the coalescer served its callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Calls answered from a fresh cached value.
    pub hits: u64,
    /// Calls that started a new request.
    pub misses: u64,
    /// Calls that joined a request already in flight.
    pub coalesced: u64,
    /// Values currently cached, including expired ones not yet swept.
    pub entries: usize,
    /// Requests currently in flight.
    pub in_flight: usize,
}

impl CacheStats {
    /// Share of calls that did not start a request of their own.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "a ratio does not need exact counts")]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            return 0.0;
        }

        (self.hits + self.coalesced) as f64 / total as f64
    }
}

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

enum Found<V> {
    Ready(V),
    InFlight(SharedResult<V>),
}

enum Slot<V> {
    Ready { value: V, stored_at: Instant },
    Pending { token: u64, result: SharedResult<V> },
}

struct Table<V> {
    slots: HashMap<CacheKey, Slot<V>>,
    next_token: u64,
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next_token: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

/// Deduplicates concurrent identical requests and caches their results for a TTL.
///
/// For a given key at most one request is in flight at any time: the first caller starts it,
/// later callers attach to it and receive a clone of the same result. A successful result is
/// cached until the TTL runs out; failures are handed to everyone waiting and then forgotten.
///
/// The request runs on its own tokio task, so a caller that gives up does not cancel it for the
/// other callers waiting on the same key.
pub struct Coalescer<V> {
    table: Arc<Mutex<Table<V>>>,
    ttl: Duration,
    counters: Arc<Counters>,
}

impl<V> std::fmt::Debug for Coalescer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl<V> Coalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// An empty coalescer caching successful results for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            table: Arc::default(),
            ttl,
            counters: Arc::default(),
        }
    }

    /// How long a successful result is served from the cache.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the value for `key`, from the cache, from the request in flight, or by running
    /// `producer` on a new task.
    ///
    /// `producer` is only called when no fresh value and no request in flight exist, and it is
    /// called without holding any lock, so it may use this coalescer. If another caller starts
    /// a request for the same key meanwhile, the future `producer` built is dropped unpolled and
    /// this call joins the other request.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the error produced by the shared request, or [`Error::Abandoned`] if that request
    /// panicked or was cancelled before it settled.
    pub async fn execute<F, Fut>(&self, key: CacheKey, producer: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let now = Instant::now();

        let found = self.find(&self.table.lock(), &key, now);
        let shared = match found {
            Some(Found::Ready(value)) => return Ok(value),
            Some(Found::InFlight(result)) => result,
            None => {
                let request = producer();
                let mut table = self.table.lock();

                match self.find(&table, &key, now) {
                    Some(Found::Ready(value)) => return Ok(value),
                    Some(Found::InFlight(result)) => result,
                    None => self.start(&mut table, key, request),
                }
            }
        };

        shared.await
    }

    fn find(&self, table: &Table<V>, key: &CacheKey, now: Instant) -> Option<Found<V>> {
        match table.slots.get(key) {
            Some(Slot::Ready { value, stored_at }) if now.saturating_duration_since(*stored_at) < self.ttl => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::event!(name: "telltale.cache.hit", tracing::Level::DEBUG, cache.key = %key);
                Some(Found::Ready(value.clone()))
            }
            Some(Slot::Pending { result, .. }) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::event!(name: "telltale.cache.coalesced", tracing::Level::DEBUG, cache.key = %key);
                Some(Found::InFlight(result.clone()))
            }
            _ => None,
        }
    }

    fn start<Fut>(&self, table: &mut Table<V>, key: CacheKey, request: Fut) -> SharedResult<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::event!(name: "telltale.cache.miss", tracing::Level::DEBUG, cache.key = %key);

        let token = table.next_token;
        table.next_token = table.next_token.wrapping_add(1);

        let result = self.spawn(key.clone(), token, request);
        table.slots.insert(
            key,
            Slot::Pending {
                token,
                result: result.clone(),
            },
        );
        result
    }

    fn spawn<Fut>(&self, key: CacheKey, token: u64, request: Fut) -> SharedResult<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let mut settle = Settle {
            table: Arc::clone(&self.table),
            key: key.clone(),
            token,
            done: false,
        };

        let task = tokio::spawn(async move {
            let result = request.await;
            settle.complete(&result);
            result
        });

        async move {
            task.await.unwrap_or_else(|error| {
                tracing::event!(
                    name: "telltale.cache.abandoned",
                    tracing::Level::ERROR,
                    cache.key = %key,
                    error.message = %error,
                );
                Err(Error::Abandoned { key: key.to_string() })
            })
        }
        .boxed()
        .shared()
    }

    /// Drops cached values older than the TTL and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut table = self.table.lock();
        let before = table.slots.len();

        table.slots.retain(|_, slot| match slot {
            Slot::Ready { stored_at, .. } => now.saturating_duration_since(*stored_at) < ttl,
            Slot::Pending { .. } => true,
        });

        before - table.slots.len()
    }

    /// Drops the cached value for `key`; a request in flight is left alone.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut table = self.table.lock();
        if matches!(table.slots.get(key), Some(Slot::Ready { .. })) {
            table.slots.remove(key);
            true
        } else {
            false
        }
    }

    /// Drops every cached value; requests in flight are left alone.
    pub fn clear(&self) {
        self.table.lock().slots.retain(|_, slot| matches!(slot, Slot::Pending { .. }));
    }

    /// A snapshot of the counters and the table occupancy.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (entries, in_flight) = {
            let table = self.table.lock();
            let in_flight = table.slots.values().filter(|slot| matches!(slot, Slot::Pending { .. })).count();
            (table.slots.len() - in_flight, in_flight)
        };

        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            entries,
            in_flight,
        }
    }
}

/// Settles the slot of one request. If the task dies before completing, the slot is released
/// so that the next caller starts afresh.
struct Settle<V> {
    table: Arc<Mutex<Table<V>>>,
    key: CacheKey,
    token: u64,
    done: bool,
}

impl<V: Clone> Settle<V> {
    fn complete(&mut self, result: &Result<V>) {
        self.done = true;
        let mut table = self.table.lock();
        if !self.owns_slot(&table) {
            return;
        }

        match result {
            Ok(value) => {
                table.slots.insert(
                    self.key.clone(),
                    Slot::Ready {
                        value: value.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
            Err(_) => {
                table.slots.remove(&self.key);
            }
        }
    }

    fn owns_slot(&self, table: &Table<V>) -> bool {
        matches!(table.slots.get(&self.key), Some(Slot::Pending { token, .. }) if *token == self.token)
    }
}

impl<V> Drop for Settle<V> {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let mut table = self.table.lock();
        if matches!(table.slots.get(&self.key), Some(Slot::Pending { token, .. }) if *token == self.token) {
            table.slots.remove(&self.key);
        }
    }
}
