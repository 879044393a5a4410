// Copyright 2026 offheap Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, OnceLock,
    },
};

use offheap_common::{
    error::{Error, Result},
    event::{Event, EventListener, EvictionListener},
    strict_assert_pow2,
};

use crate::{
    config::{MapConfig, MAX_CONCURRENCY, MIN_SEGMENT_CAPACITY},
    evictor::Evictor,
    lru::Lru,
    memory::Memory,
    segment::{Segment, MAXIMUM_CAPACITY},
};

/// State shared by all segments of a map.
pub(crate) struct Shared {
    pub partition: u32,
    pub load_factor: f32,
    pub memory: Arc<Memory>,
    pub evictor: Option<Arc<Evictor>>,
    pub total_count: Arc<AtomicI64>,
    pub event_listener: OnceLock<Arc<dyn EventListener>>,
    pub evict_listener: OnceLock<Arc<dyn EvictionListener>>,
}

impl Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("partition", &self.partition)
            .field("load_factor", &self.load_factor)
            .field("memory", &self.memory)
            .field("total_count", &self.total_count)
            .finish()
    }
}

impl Shared {
    pub fn lru(&self) -> Option<&Lru> {
        self.evictor.as_deref().map(Evictor::lru)
    }

    pub fn notify(&self, event: Event) {
        if let Some(listener) = self.event_listener.get() {
            listener.on_event(event);
        }
    }

    /// Evict entries until `size` bytes were released. Must not be called with a segment lock held.
    pub fn poll(&self, size: usize) {
        if let Some(evictor) = self.evictor.as_ref() {
            evictor.poll(size);
        }
    }
}

/// Initial table capacity of each of `segments` segments for the capacity hint.
fn segment_capacity(initial_capacity: usize, segments: usize) -> usize {
    // Clamp before rounding up, the hint may be close to `usize::MAX`.
    initial_capacity
        .div_ceil(segments)
        .clamp(MIN_SEGMENT_CAPACITY, MAXIMUM_CAPACITY)
        .next_power_of_two()
}

#[derive(Debug)]
pub(crate) struct MapInner {
    shared: Shared,
    segments: Vec<Segment>,
    segment_shift: u32,
    segment_mask: usize,
    concurrency: usize,
    owner: bool,
}

impl MapInner {
    fn new(config: &MapConfig, shared: Shared, owner: bool) -> Result<Self> {
        let concurrency = config.concurrency.min(MAX_CONCURRENCY);
        let size = concurrency.next_power_of_two();
        strict_assert_pow2!(size);

        let segment_shift = 32 - size.trailing_zeros();
        let segment_mask = size - 1;

        let capacity = segment_capacity(config.initial_capacity, size);

        let mut segments = Vec::with_capacity(size);
        for index in 0..size {
            match Segment::new(index, capacity, &shared) {
                Ok(segment) => segments.push(segment),
                Err(e) => {
                    segments.iter().for_each(|segment| segment.destruct(&shared));
                    return Err(e);
                }
            }
        }

        Ok(Self {
            shared,
            segments,
            segment_shift,
            segment_mask,
            concurrency,
            owner,
        })
    }

    fn segment(&self, hash: u32) -> &Segment {
        &self.segments[((hash as u64) >> self.segment_shift) as usize & self.segment_mask]
    }

    /// Evict the candidate from the segment owning `hash`.
    pub fn free_space(&self, hash: u32, order: u16, qaddr: u64) -> usize {
        self.segment(hash).free_space(&self.shared, hash, order, qaddr)
    }

    fn destruct(&self) {
        if let Some(evictor) = self.shared.evictor.as_ref() {
            evictor.unregister(self.shared.partition, self);
        }

        self.segments.iter().for_each(|segment| segment.destruct(&self.shared));

        if let Some(evictor) = self.shared.evictor.as_ref() {
            if self.owner && evictor.maps() == 0 {
                evictor.lru().destruct();
            }
        }
    }
}

impl Drop for MapInner {
    fn drop(&mut self) {
        self.destruct();
    }
}

/// Builder for [`Map`].
pub struct MapBuilder {
    config: MapConfig,
    event_listener: Option<Arc<dyn EventListener>>,
    evict_listener: Option<Arc<dyn EvictionListener>>,
}

impl Debug for MapBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapBuilder")
            .field("config", &self.config)
            .field("event_listener", &self.event_listener.is_some())
            .field("evict_listener", &self.evict_listener.is_some())
            .finish()
    }
}

impl Default for MapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MapBuilder {
    /// Create a map builder with the default config.
    pub fn new() -> Self {
        Self {
            config: MapConfig::default(),
            event_listener: None,
            evict_listener: None,
        }
    }

    /// Replace the whole config.
    pub fn with_config(mut self, config: MapConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the partition id of the map.
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.config.partition = partition;
        self
    }

    /// Set the segment count hint.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Set the segment load factor.
    ///
    /// A segment doubles its table once its entry count exceeds `capacity * load_factor`, at most once per insert.
    /// Any positive finite value is accepted. Values far below `1.0` grow tables eagerly: while the threshold rounds
    /// down to a count already reached, every new key doubles the table, up to [`MAXIMUM_CAPACITY`] bins of 8 bytes
    /// each per segment.
    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.config.load_factor = load_factor;
        self
    }

    /// Set the initial capacity hint.
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.config.initial_capacity = initial_capacity;
        self
    }

    /// Set the arena budget for entry memory. `0` disables eviction.
    ///
    /// Ignored by [`MapBuilder::build_view`].
    pub fn with_total_memory(mut self, total_memory: u64) -> Self {
        self.config.total_memory = total_memory;
        self
    }

    /// Set the stripe count of the eviction queue.
    ///
    /// Ignored by [`MapBuilder::build_view`].
    pub fn with_eviction_stripes(mut self, eviction_stripes: u16) -> Self {
        self.config.eviction_stripes = eviction_stripes;
        self
    }

    /// Set the structural event listener.
    pub fn with_event_listener(mut self, listener: impl EventListener) -> Self {
        self.event_listener = Some(Arc::new(listener));
        self
    }

    /// Set the eviction listener. It is never invoked if eviction is disabled.
    pub fn with_evict_listener(mut self, listener: impl EvictionListener) -> Self {
        self.evict_listener = Some(Arc::new(listener));
        self
    }

    fn validate(&self, view: bool) -> Result<()> {
        let config = &self.config;
        if config.concurrency == 0 {
            return Err(Error::config("concurrency must be greater than zero"));
        }
        if !config.load_factor.is_finite() || config.load_factor <= 0.0 {
            return Err(
                Error::config("load factor must be a positive finite number").with_context("load_factor", config.load_factor)
            );
        }
        if !view && config.total_memory > 0 && config.eviction_stripes == 0 {
            return Err(Error::config("eviction stripes must be greater than zero if eviction is enabled"));
        }
        Ok(())
    }

    /// Build a map that owns its arena and, if a total memory budget is set, its eviction queue.
    pub fn build(self) -> Result<Map> {
        self.validate(false)?;

        let evictor = (self.config.total_memory > 0)
            .then(|| Arc::new(Evictor::new(Lru::new(self.config.eviction_stripes))));
        let shared = Shared {
            partition: self.config.partition,
            load_factor: self.config.load_factor,
            memory: Arc::new(Memory::new(self.config.total_memory)),
            evictor,
            total_count: Arc::new(AtomicI64::new(0)),
            event_listener: OnceLock::new(),
            evict_listener: OnceLock::new(),
        };

        self.build_inner(shared, true)
    }

    /// Build a view sharing the arena, eviction queue, entry counter and eviction poller of `map`.
    ///
    /// The view must use a partition not used by any other live map sharing the same eviction queue.
    pub fn build_view(self, map: &Map) -> Result<Map> {
        self.validate(true)?;

        let base = &map.inner.shared;
        let shared = Shared {
            partition: self.config.partition,
            load_factor: self.config.load_factor,
            memory: base.memory.clone(),
            evictor: base.evictor.clone(),
            total_count: base.total_count.clone(),
            event_listener: OnceLock::new(),
            evict_listener: OnceLock::new(),
        };

        self.build_inner(shared, false)
    }

    fn build_inner(self, shared: Shared, owner: bool) -> Result<Map> {
        let inner = Arc::new(MapInner::new(&self.config, shared, owner)?);
        if let Some(evictor) = inner.shared.evictor.as_ref() {
            evictor.register(inner.shared.partition, Arc::downgrade(&inner))?;
        }

        let map = Map { inner };
        if let Some(listener) = self.event_listener {
            map.set_event_listener(listener);
        }
        if let Some(listener) = self.evict_listener {
            map.set_evict_listener(listener);
        }

        tracing::debug!(
            "[offheap]: map built, partition: {}, owner: {}, segments: {}, total memory: {}",
            map.partition(),
            owner,
            map.inner.segments.len(),
            map.memory_size()
        );

        Ok(map)
    }
}

/// Segmented concurrent map storing byte keys and values in off-heap memory.
///
/// Keys are routed by a caller supplied 32-bit hash. The high bits of the hash select the segment and the low bits
/// select the bin within the segment table, so the hash should be well mixed.
///
/// Cloning a [`Map`] is cheap and yields a handle to the same map. The map is destructed when the last handle is
/// dropped, or explicitly with [`Map::destruct`]. After destruction, reads return nothing and mutations fail with
/// [`ErrorKind::Closed`](offheap_common::error::ErrorKind::Closed).
#[derive(Debug, Clone)]
pub struct Map {
    inner: Arc<MapInner>,
}

impl Map {
    /// Get a copy of the value of the key.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "offheap::memory::map::get"))]
    pub fn get(&self, hash: u32, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.segment(hash).get(&self.inner.shared, hash, key)
    }

    /// Check if the map contains the key.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "offheap::memory::map::contains"))]
    pub fn contains(&self, hash: u32, key: &[u8]) -> bool {
        self.inner.segment(hash).contains(&self.inner.shared, hash, key)
    }

    /// Put the key, value pair. Returns `true` if the key was not present before.
    ///
    /// If the arena budget is exceeded, least recently used entries are evicted after the put completes.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "offheap::memory::map::put"))]
    pub fn put(&self, hash: u32, key: &[u8], value: &[u8]) -> Result<bool> {
        self.inner.segment(hash).put(&self.inner.shared, hash, key, value)
    }

    /// Insert the key, value pair without checking for an existing entry of the same key.
    ///
    /// The caller must guarantee the key is not present, otherwise the map holds duplicates.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "offheap::memory::map::insert"))]
    pub fn insert(&self, hash: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.segment(hash).insert(&self.inner.shared, hash, key, value)
    }

    /// Remove the key and return its value.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "offheap::memory::map::remove"))]
    pub fn remove(&self, hash: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.segment(hash).remove(&self.inner.shared, hash, key, true)
    }

    /// Remove the key without copying its value. Returns `true` if the key was present.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "offheap::memory::map::removex"))]
    pub fn removex(&self, hash: u32, key: &[u8]) -> Result<bool> {
        self.inner
            .segment(hash)
            .remove(&self.inner.shared, hash, key, false)
            .map(|v| v.is_some())
    }

    /// Entry count.
    ///
    /// The counter is shared with all views of the map, so it counts the entries of every partition.
    pub fn size(&self) -> usize {
        self.inner.shared.total_count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Total arena budget, `0` if unbounded.
    pub fn memory_size(&self) -> u64 {
        self.inner.shared.memory.total_size()
    }

    /// Arena memory allocated for entries.
    pub fn allocated_size(&self) -> u64 {
        self.inner.shared.memory.allocated_size()
    }

    /// Arena memory allocated for segment tables.
    pub fn system_allocated_size(&self) -> u64 {
        self.inner.shared.memory.system_allocated_size()
    }

    /// Remaining arena budget.
    pub fn free_size(&self) -> u64 {
        self.inner.shared.memory.free_size()
    }

    /// Iterate over copies of all key, value pairs.
    ///
    /// Each segment is copied under its read lock when the iterator reaches it, so the iterator is not a consistent
    /// snapshot of the whole map.
    pub fn iter(&self) -> MapIter {
        MapIter {
            inner: self.inner.clone(),
            index: 0,
            current: Vec::new().into_iter(),
        }
    }

    /// Release every entry and segment table.
    ///
    /// If this map owns the eviction queue and no view is alive, the queue is released too.
    #[cfg_attr(feature = "tracing", fastrace::trace(name = "offheap::memory::map::destruct"))]
    pub fn destruct(&self) {
        self.inner.destruct()
    }

    /// Set the structural event listener. Returns `false` if a listener has already been set.
    ///
    /// The listener is also registered with the arena, unless the arena already has one.
    pub fn event_listener(&self, listener: impl EventListener) -> bool {
        self.set_event_listener(Arc::new(listener))
    }

    /// Set the eviction listener.
    ///
    /// Returns `false` if a listener has already been set, or if eviction is disabled.
    pub fn evict_listener(&self, listener: impl EvictionListener) -> bool {
        self.set_evict_listener(Arc::new(listener))
    }

    fn set_event_listener(&self, listener: Arc<dyn EventListener>) -> bool {
        let shared = &self.inner.shared;
        if shared.event_listener.set(listener.clone()).is_err() {
            return false;
        }
        shared.memory.listen(listener);
        true
    }

    fn set_evict_listener(&self, listener: Arc<dyn EvictionListener>) -> bool {
        let shared = &self.inner.shared;
        shared.evictor.is_some() && shared.evict_listener.set(listener).is_ok()
    }

    /// Partition id.
    pub fn partition(&self) -> u32 {
        self.inner.shared.partition
    }

    /// Segment load factor.
    pub fn load_factor(&self) -> f32 {
        self.inner.shared.load_factor
    }

    /// Configured concurrency, capped at the maximum segment count.
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// Stripe count of the eviction queue, `0` if eviction is disabled.
    pub fn lru_stripes(&self) -> u16 {
        self.inner.shared.lru().map(Lru::concurrency).unwrap_or(0)
    }

    /// Memory occupied by the eviction queue.
    pub fn lru_memory_size(&self) -> usize {
        self.inner.shared.lru().map(Lru::memory_size).unwrap_or(0)
    }

    /// Count of nodes in the eviction queue.
    pub fn lru_size(&self) -> usize {
        self.inner.shared.lru().map(Lru::size).unwrap_or(0)
    }
}

impl IntoIterator for &Map {
    type Item = (Vec<u8>, Vec<u8>);
    type IntoIter = MapIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over copies of the key, value pairs of a [`Map`].
///
/// Segments are copied lazily, one at a time.
#[derive(Debug)]
pub struct MapIter {
    inner: Arc<MapInner>,
    index: usize,
    current: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for MapIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(item);
            }
            let segment = self.inner.segments.get(self.index)?;
            self.index += 1;
            self.current = segment.snapshot(&self.inner.shared).into_iter();
        }
    }
}
