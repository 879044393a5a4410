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

//! Events emitted by the off-heap map and its arena, and the listener traits that receive them.

/// Structural event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// A segment doubled its table and relinked its entries.
    Rehash,
    /// Tracked entry memory has been allocated from the arena.
    Allocate,
    /// Tracked entry memory has been released back to the arena.
    Release,
}

/// Trait for the customized structural event listener.
///
/// Listeners are invoked synchronously on the thread that caused the event, so they must be cheap.
pub trait EventListener: Send + Sync + 'static {
    /// Called when a structural event happens.
    fn on_event(&self, event: Event);
}

impl<F> EventListener for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

/// Trait for the customized eviction listener.
pub trait EvictionListener: Send + Sync + 'static {
    /// Called after an entry has been evicted to free arena space.
    ///
    /// The key and value bytes are copies taken before the entry memory was released.
    fn on_evict(&self, partition: u32, hash: u32, key: &[u8], value: &[u8]);
}

impl<F> EvictionListener for F
where
    F: Fn(u32, u32, &[u8], &[u8]) + Send + Sync + 'static,
{
    fn on_evict(&self, partition: u32, hash: u32, key: &[u8], value: &[u8]) {
        self(partition, hash, key, value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn test_closure_listeners() {
        let rehashes = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn EventListener> = {
            let rehashes = rehashes.clone();
            Arc::new(move |event: Event| {
                if event == Event::Rehash {
                    rehashes.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        listener.on_event(Event::Allocate);
        listener.on_event(Event::Rehash);
        assert_eq!(rehashes.load(Ordering::Relaxed), 1);

        let evicted = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn EvictionListener> = {
            let evicted = evicted.clone();
            Arc::new(move |_: u32, _: u32, key: &[u8], value: &[u8]| {
                evicted.fetch_add(key.len() + value.len(), Ordering::Relaxed);
            })
        };
        listener.on_evict(0, 42, b"k1", b"value");
        assert_eq!(evicted.load(Ordering::Relaxed), 7);
    }
}
