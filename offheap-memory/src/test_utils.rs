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

//! Utilities for testing.

use std::sync::Arc;

use offheap_common::event::{Event, EventListener, EvictionListener};
use parking_lot::{Mutex, MutexGuard};

/// An event listener that records all received events.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventListener for EventRecorder {
    fn on_event(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl EventRecorder {
    /// Get all received events.
    pub fn events(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock()
    }

    /// Count of received events of the given kind.
    pub fn count(&self, event: Event) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

/// A recorded eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// Partition of the map the entry was evicted from.
    pub partition: u32,
    /// Hash of the evicted entry.
    pub hash: u32,
    /// Key of the evicted entry.
    pub key: Vec<u8>,
    /// Value of the evicted entry.
    pub value: Vec<u8>,
}

/// An eviction listener that records all evictions.
#[derive(Debug, Clone, Default)]
pub struct EvictionRecorder {
    evictions: Arc<Mutex<Vec<Eviction>>>,
}

impl EvictionListener for EvictionRecorder {
    fn on_evict(&self, partition: u32, hash: u32, key: &[u8], value: &[u8]) {
        self.evictions.lock().push(Eviction {
            partition,
            hash,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }
}

impl EvictionRecorder {
    /// Get all recorded evictions.
    pub fn evictions(&self) -> MutexGuard<'_, Vec<Eviction>> {
        self.evictions.lock()
    }
}
