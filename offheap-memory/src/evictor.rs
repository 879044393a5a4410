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

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use offheap_common::error::{Error, Result};
use parking_lot::RwLock;

use crate::{lru::Lru, map::MapInner};

/// Eviction poller shared by an owner map and its views.
///
/// Candidates are peeked from the queue without any segment lock held, then dispatched to the map registered
/// under the candidate's partition, which revalidates the candidate under its segment lock.
#[derive(Debug)]
pub(crate) struct Evictor {
    lru: Lru,
    maps: RwLock<HashMap<u32, Weak<MapInner>>>,
}

impl Evictor {
    pub fn new(lru: Lru) -> Self {
        Self {
            lru,
            maps: RwLock::new(HashMap::new()),
        }
    }

    pub fn lru(&self) -> &Lru {
        &self.lru
    }

    /// Register the map of a partition. A partition whose map has already been dropped can be taken over.
    pub fn register(&self, partition: u32, map: Weak<MapInner>) -> Result<()> {
        let mut maps = self.maps.write();
        if maps.get(&partition).is_some_and(|m| m.strong_count() > 0) {
            return Err(Error::config("partition has already been registered").with_context("partition", partition));
        }
        maps.insert(partition, map);
        Ok(())
    }

    /// Unregister the map of a partition if it is still the registered one.
    pub fn unregister(&self, partition: u32, map: *const MapInner) {
        let mut maps = self.maps.write();
        if maps.get(&partition).is_some_and(|m| std::ptr::eq(m.as_ptr(), map)) {
            maps.remove(&partition);
        }
    }

    /// Count of maps alive in the registry.
    pub fn maps(&self) -> usize {
        self.maps.read().values().filter(|m| m.strong_count() > 0).count()
    }

    /// Evict least recently used entries until `size` bytes were released.
    ///
    /// Stops early when the queue is empty or a candidate releases nothing. Returns the released size.
    pub fn poll(&self, size: usize) -> usize {
        let mut released = 0;

        while released < size {
            let qaddr = self.lru.pre_poll();
            if qaddr == 0 {
                break;
            }
            let order = self.lru.order(qaddr);

            let (Some(partition), Some(hash)) = (self.lru.partition(order, qaddr), self.lru.hash(order, qaddr))
            else {
                // Removed since the peek.
                break;
            };

            let map = self.maps.read().get(&partition).and_then(Weak::upgrade);
            let Some(map) = map else {
                self.lru.poll(qaddr);
                continue;
            };

            match map.free_space(hash, order, qaddr) {
                0 => break,
                bytes => released += bytes,
            }
        }

        released
    }
}
