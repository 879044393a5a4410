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

use std::sync::atomic::Ordering;

use offheap_common::{
    error::{Error, Result},
    event::Event,
    strict_assert, strict_assert_eq, strict_assert_pow2,
};
use parking_lot::RwLock;

use crate::{
    entry::{Bin, Entry, BIN_SIZE},
    map::Shared,
    memory::Memory,
};

/// Maximum table capacity of a segment.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

#[derive(Debug)]
struct Table {
    addr: u64,
    capacity: usize,
    threshold: usize,
    count: usize,
}

impl Table {
    fn new(addr: u64, capacity: usize, load_factor: f32) -> Self {
        strict_assert_pow2!(capacity);
        Self {
            addr,
            capacity,
            threshold: (capacity as f64 * load_factor as f64) as usize,
            count: 0,
        }
    }

    fn is_destructed(&self) -> bool {
        self.addr == 0
    }

    fn bin<'a>(&self, hash: u32, memory: &'a Memory) -> Bin<'a> {
        Bin::new(self.addr, hash as usize & (self.capacity - 1), memory)
    }

    fn needs_rehash(&self) -> bool {
        self.count > self.threshold && self.capacity < MAXIMUM_CAPACITY
    }

    /// Visit every entry of the table. The next address is read before `f` is called.
    fn for_each_entry<F>(&self, memory: &Memory, mut f: F)
    where
        F: FnMut(Entry<'_>),
    {
        for index in 0..self.capacity {
            let mut cur = Bin::new(self.addr, index, memory).first();
            while cur != 0 {
                let entry = Entry::new(cur, memory);
                cur = entry.next();
                f(entry);
            }
        }
    }
}

/// An independently locked shard of the map's hash table.
///
/// Entry memory is only read or written under the table lock. Released entry and table memory is returned to the
/// arena after the lock is dropped.
#[derive(Debug)]
pub(crate) struct Segment {
    index: usize,
    table: RwLock<Table>,
}

impl Segment {
    pub fn new(index: usize, capacity: usize, shared: &Shared) -> Result<Self> {
        let addr = shared.memory.allocate_system(capacity * BIN_SIZE, true)?;
        Ok(Self {
            index,
            table: RwLock::new(Table::new(addr, capacity, shared.load_factor)),
        })
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.table.read().count
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.table.read().capacity
    }

    pub fn get(&self, shared: &Shared, hash: u32, key: &[u8]) -> Option<Vec<u8>> {
        let table = self.table.read();
        if table.is_destructed() {
            return None;
        }
        match table.bin(hash, &shared.memory).find(hash, key) {
            (_, 0) => None,
            (_, addr) => Some(Entry::new(addr, &shared.memory).value()),
        }
    }

    pub fn contains(&self, shared: &Shared, hash: u32, key: &[u8]) -> bool {
        let table = self.table.read();
        !table.is_destructed() && table.bin(hash, &shared.memory).find(hash, key).1 != 0
    }

    /// Put the key, value pair, allocating under the lock.
    ///
    /// Returns `true` if the key was not present before.
    pub fn put(&self, shared: &Shared, hash: u32, key: &[u8], value: &[u8]) -> Result<bool> {
        let memory = &*shared.memory;
        let size = Entry::checked_size_of(key.len(), value.len())?;

        let mut garbage = None;
        let mut evict = false;

        let (is_new, rehash) = {
            let mut table = self.table.write();
            if table.is_destructed() {
                return Err(Error::closed());
            }

            let bin = table.bin(hash, memory);
            let is_new = match bin.find(hash, key) {
                (prev, cur) if cur != 0 => {
                    let old = Entry::new(cur, memory);
                    let qaddr = old.queue_address();
                    if old.value_len() == value.len() {
                        old.set_value(value);
                        if let Some(lru) = shared.lru() {
                            lru.touch(qaddr, cur);
                        }
                    } else {
                        evict = !memory.reserve(size);
                        let addr = memory.allocate(size, false, true)?;
                        Entry::write(addr, memory, hash, key, value, qaddr, old.next());
                        bin.relink(prev, addr);
                        if let Some(lru) = shared.lru() {
                            lru.touch(qaddr, addr);
                        }
                        garbage = Some((cur, old.size()));
                    }
                    false
                }
                _ => {
                    evict = !memory.reserve(size);
                    let addr = memory.allocate(size, false, true)?;
                    let qaddr = match shared.lru() {
                        Some(lru) => match lru.offer(shared.partition, addr, hash) {
                            Ok(qaddr) => qaddr,
                            Err(e) => {
                                memory.release(addr, size);
                                return Err(e);
                            }
                        },
                        None => 0,
                    };
                    let entry = Entry::write(addr, memory, hash, key, value, qaddr, 0);
                    bin.push(&entry);
                    table.count += 1;
                    shared.total_count.fetch_add(1, Ordering::Relaxed);
                    true
                }
            };

            (is_new, is_new && table.needs_rehash())
        };

        if let Some((addr, size)) = garbage {
            memory.release(addr, size);
        }
        if evict {
            shared.poll(size);
        }
        if rehash {
            self.rehash_or_warn(shared);
        }

        Ok(is_new)
    }

    /// Insert the key, value pair without looking for an existing key.
    ///
    /// The entry is allocated and written before the lock is taken.
    pub fn insert(&self, shared: &Shared, hash: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let memory = &*shared.memory;
        let size = Entry::checked_size_of(key.len(), value.len())?;

        let rehash = self.table.read().needs_rehash();
        if rehash {
            self.rehash(shared)?;
        }

        let evict = !memory.reserve(size);
        let addr = memory.allocate(size, false, true)?;
        let entry = Entry::write(addr, memory, hash, key, value, 0, 0);

        let rehash = {
            let mut table = self.table.write();
            if table.is_destructed() {
                drop(table);
                memory.release(addr, size);
                return Err(Error::closed());
            }

            if let Some(lru) = shared.lru() {
                match lru.offer(shared.partition, addr, hash) {
                    Ok(qaddr) => entry.set_queue_address(qaddr),
                    Err(e) => {
                        drop(table);
                        memory.release(addr, size);
                        return Err(e);
                    }
                }
            }

            table.bin(hash, memory).push(&entry);
            table.count += 1;
            shared.total_count.fetch_add(1, Ordering::Relaxed);

            table.needs_rehash()
        };

        if evict {
            shared.poll(size);
        }
        if rehash {
            self.rehash_or_warn(shared);
        }

        Ok(())
    }

    /// Remove the key.
    ///
    /// Returns `None` if the key is absent. Otherwise returns the value if `want_value` is set, or an empty vector.
    pub fn remove(&self, shared: &Shared, hash: u32, key: &[u8], want_value: bool) -> Result<Option<Vec<u8>>> {
        let memory = &*shared.memory;

        let (addr, size, value) = {
            let mut table = self.table.write();
            if table.is_destructed() {
                return Err(Error::closed());
            }

            let bin = table.bin(hash, memory);
            let (prev, cur) = bin.find(hash, key);
            if cur == 0 {
                return Ok(None);
            }

            let entry = Entry::new(cur, memory);
            bin.relink(prev, entry.next());
            if let Some(lru) = shared.lru() {
                lru.remove(entry.queue_address());
            }
            let value = if want_value { entry.value() } else { vec![] };

            table.count -= 1;
            shared.total_count.fetch_sub(1, Ordering::Relaxed);

            (cur, entry.size(), value)
        };

        memory.release(addr, size);

        Ok(Some(value))
    }

    /// Evict the entry behind the queue address, if it is still alive.
    ///
    /// Returns the released size, `0` if the candidate was already gone. The queue node is polled either way.
    pub fn free_space(&self, shared: &Shared, hash: u32, order: u16, qaddr: u64) -> usize {
        let Some(lru) = shared.lru() else {
            return 0;
        };
        let memory = &*shared.memory;
        let listener = shared.evict_listener.get();

        let mut released = None;
        let mut evicted = None;

        {
            let mut table = self.table.write();

            // Resolve the candidate under the lock, it may have been touched or removed since it was peeked.
            let addr = lru.entry(order, qaddr);
            if addr != 0 && !table.is_destructed() {
                let bin = table.bin(hash, memory);
                let (prev, cur) = bin.find_addr(addr);
                if cur != 0 {
                    let entry = Entry::new(cur, memory);
                    bin.relink(prev, entry.next());
                    if listener.is_some() {
                        evicted = Some((entry.key(), entry.value()));
                    }
                    strict_assert_eq!(entry.queue_address(), qaddr, "queue node address mismatch");

                    table.count -= 1;
                    shared.total_count.fetch_sub(1, Ordering::Relaxed);

                    released = Some((cur, entry.size()));
                }
            }

            lru.poll(qaddr);
        }

        let Some((addr, size)) = released else {
            return 0;
        };
        memory.release(addr, size);

        tracing::trace!(
            "[offheap]: evicted entry, partition: {}, segment: {}, hash: {}, size: {}",
            shared.partition,
            self.index,
            hash,
            size
        );

        if let (Some(listener), Some((key, value))) = (listener, evicted) {
            listener.on_evict(shared.partition, hash, &key, &value);
        }

        size
    }

    /// Double the table capacity if the segment is over its threshold.
    ///
    /// Entries are relinked into the new table by their stored hash. The new table is allocated before anything is
    /// relinked, so an allocation failure leaves the segment untouched.
    pub fn rehash(&self, shared: &Shared) -> Result<()> {
        let memory = &*shared.memory;

        let (old_addr, old_capacity, capacity, count) = {
            let mut table = self.table.write();
            if !table.needs_rehash() {
                return Ok(());
            }

            let capacity = table.capacity << 1;
            let addr = memory
                .allocate_system(capacity * BIN_SIZE, true)
                .map_err(|e| e.with_context("segment", self.index).with_context("capacity", capacity))?;

            let mut new = Table::new(addr, capacity, shared.load_factor);
            table.for_each_entry(memory, |entry| {
                new.bin(entry.hash(), memory).push(&entry);
                new.count += 1;
            });
            strict_assert_eq!(new.count, table.count);

            let old = std::mem::replace(&mut *table, new);
            (old.addr, old.capacity, capacity, old.count)
        };

        memory.release_system(old_addr, old_capacity * BIN_SIZE);

        tracing::debug!(
            "[offheap]: segment rehashed, partition: {}, segment: {}, count: {}, capacity: {} => {}",
            shared.partition,
            self.index,
            count,
            old_capacity,
            capacity
        );
        shared.notify(Event::Rehash);

        Ok(())
    }

    fn rehash_or_warn(&self, shared: &Shared) {
        if let Err(e) = self.rehash(shared) {
            tracing::warn!(
                "[offheap]: failed to rehash segment, partition: {}, segment: {}, err: {}",
                shared.partition,
                self.index,
                e
            );
        }
    }

    /// Copy every key, value pair of the segment.
    pub fn snapshot(&self, shared: &Shared) -> Vec<(Vec<u8>, Vec<u8>)> {
        let table = self.table.read();
        let mut items = Vec::with_capacity(table.count);
        if !table.is_destructed() {
            table.for_each_entry(&shared.memory, |entry| items.push((entry.key(), entry.value())));
        }
        strict_assert_eq!(items.len(), table.count);
        items
    }

    /// Release every entry and the table. Idempotent.
    pub fn destruct(&self, shared: &Shared) {
        let memory = &*shared.memory;

        let (table, garbages) = {
            let mut table = self.table.write();
            if table.is_destructed() {
                return;
            }

            let mut garbages = Vec::with_capacity(table.count);
            table.for_each_entry(memory, |entry| {
                if let Some(lru) = shared.lru() {
                    lru.remove(entry.queue_address());
                }
                garbages.push((entry.addr(), entry.size()));
            });
            shared.total_count.fetch_sub(table.count as i64, Ordering::Relaxed);

            let destructed = Table {
                addr: 0,
                capacity: 0,
                threshold: 0,
                count: 0,
            };
            (std::mem::replace(&mut *table, destructed), garbages)
        };

        strict_assert!(table.count == garbages.len());
        for (addr, size) in garbages {
            memory.release(addr, size);
        }
        memory.release_system(table.addr, table.capacity * BIN_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicI64, Arc, OnceLock};

    use offheap_common::error::ErrorKind;

    use super::*;
    use crate::{evictor::Evictor, lru::Lru};

    fn shared(total: u64) -> Shared {
        Shared {
            partition: 0,
            load_factor: 0.75,
            memory: Arc::new(Memory::new(total)),
            evictor: (total > 0).then(|| Arc::new(Evictor::new(Lru::new(1)))),
            total_count: Arc::new(AtomicI64::new(0)),
            event_listener: OnceLock::new(),
            evict_listener: OnceLock::new(),
        }
    }

    /// Counters, queue and arena must all agree with the entries reachable from the table.
    fn assert_consistent(shared: &Shared, segment: &Segment) {
        let items = segment.snapshot(shared);
        assert_eq!(segment.count(), items.len());
        assert_eq!(shared.total_count.load(Ordering::Relaxed), items.len() as i64);
        assert_eq!(shared.lru().unwrap().size(), items.len());
        assert_eq!(
            shared.memory.allocated_size() as usize,
            items.iter().map(|(k, v)| Entry::size_of(k.len(), v.len())).sum::<usize>()
        );
    }

    #[test_log::test]
    fn test_allocation_failure() {
        let shared = shared(1 << 20);
        let segment = Segment::new(0, 16, &shared).unwrap();
        segment.put(&shared, 1, b"k1", b"v1").unwrap();

        shared.memory.faults.allocate.store(true, Ordering::Relaxed);
        assert_eq!(segment.put(&shared, 2, b"k2", b"v2").unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(segment.insert(&shared, 3, b"k3", b"v3").unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(segment.put(&shared, 1, b"k1", b"longer").unwrap_err().kind(), ErrorKind::OutOfMemory);
        // A same length update is done in place.
        assert!(!segment.put(&shared, 1, b"k1", b"v9").unwrap());
        shared.memory.faults.allocate.store(false, Ordering::Relaxed);

        assert_eq!(segment.get(&shared, 1, b"k1"), Some(b"v9".to_vec()));
        assert!(!segment.contains(&shared, 2, b"k2"));
        assert!(!segment.contains(&shared, 3, b"k3"));
        assert_consistent(&shared, &segment);

        assert!(segment.put(&shared, 2, b"k2", b"v2").unwrap());
        segment.insert(&shared, 3, b"k3", b"v3").unwrap();
        assert_consistent(&shared, &segment);

        segment.destruct(&shared);
        assert_eq!(shared.memory.allocated_size(), 0);
    }

    #[test_log::test]
    fn test_offer_failure() {
        let shared = shared(1 << 20);
        let segment = Segment::new(0, 16, &shared).unwrap();
        let lru = shared.lru().unwrap();
        segment.put(&shared, 1, b"k1", b"v1").unwrap();

        lru.fail_offer.store(true, Ordering::Relaxed);
        assert_eq!(segment.put(&shared, 2, b"k2", b"v2").unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(segment.insert(&shared, 3, b"k3", b"v3").unwrap_err().kind(), ErrorKind::OutOfMemory);
        // Replacements reuse the queue node of the old entry.
        assert!(!segment.put(&shared, 1, b"k1", b"longer").unwrap());
        lru.fail_offer.store(false, Ordering::Relaxed);

        assert_eq!(shared.memory.allocated_size() as usize, Entry::size_of(2, 6));
        assert!(!segment.contains(&shared, 2, b"k2"));
        assert!(!segment.contains(&shared, 3, b"k3"));
        assert_consistent(&shared, &segment);

        segment.destruct(&shared);
    }

    #[test_log::test]
    fn test_rehash_failure() {
        let shared = shared(1 << 20);
        let segment = Segment::new(0, 16, &shared).unwrap();
        let key = |i: u32| i.to_le_bytes();

        // The threshold of 16 bins is 12. The 13th put fails to grow the table and succeeds anyway.
        shared.memory.faults.allocate_system.store(true, Ordering::Relaxed);
        for i in 0..13u32 {
            assert!(segment.put(&shared, i, &key(i), b"v").unwrap());
        }
        assert_eq!(segment.capacity(), 16);
        assert_consistent(&shared, &segment);

        // An insert grows the table first and fails as a whole.
        assert_eq!(segment.insert(&shared, 13, &key(13), b"v").unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert!(!segment.contains(&shared, 13, &key(13)));
        assert_eq!(segment.capacity(), 16);
        assert_consistent(&shared, &segment);

        shared.memory.faults.allocate_system.store(false, Ordering::Relaxed);
        segment.insert(&shared, 13, &key(13), b"v").unwrap();
        assert_eq!(segment.capacity(), 32);
        assert!((0..14u32).all(|i| segment.get(&shared, i, &key(i)) == Some(b"v".to_vec())));
        assert_consistent(&shared, &segment);

        segment.destruct(&shared);
        assert_eq!(shared.memory.system_allocated_size(), 0);
    }

    #[test]
    fn test_free_space() {
        let shared = shared(1 << 20);
        let segment = Segment::new(0, 16, &shared).unwrap();
        let lru = shared.lru().unwrap();

        segment.put(&shared, 1, b"k1", b"v1").unwrap();
        segment.insert(&shared, 2, b"k2", b"v2").unwrap();
        assert_eq!(segment.count(), 2);
        assert_eq!(lru.size(), 2);

        let qaddr = lru.pre_poll();
        let order = lru.order(qaddr);
        assert_eq!(lru.hash(order, qaddr), Some(1));

        // The candidate is removed between the peek and the eviction.
        assert!(segment.remove(&shared, 1, b"k1", false).unwrap().is_some());
        assert_eq!(segment.free_space(&shared, 1, order, qaddr), 0);
        assert_eq!(segment.count(), 1);

        let qaddr = lru.pre_poll();
        let order = lru.order(qaddr);
        assert_eq!(segment.free_space(&shared, 2, order, qaddr), Entry::size_of(2, 2));
        assert_eq!(segment.count(), 0);
        assert_eq!(lru.size(), 0);
        assert_eq!(shared.memory.allocated_size(), 0);
        assert_eq!(shared.total_count.load(Ordering::Relaxed), 0);

        segment.destruct(&shared);
        assert_eq!(shared.memory.system_allocated_size(), 0);
    }

    #[test]
    fn test_replace_keeps_queue_node() {
        let shared = shared(1 << 20);
        let segment = Segment::new(0, 16, &shared).unwrap();
        let lru = shared.lru().unwrap();

        segment.put(&shared, 1, b"k1", b"v1").unwrap();
        let qaddr = lru.pre_poll();

        assert!(!segment.put(&shared, 1, b"k1", b"longer").unwrap());
        assert_eq!(lru.size(), 1);
        assert_eq!(lru.pre_poll(), qaddr);
        assert_eq!(segment.free_space(&shared, 1, lru.order(qaddr), qaddr), Entry::size_of(2, 6));
        assert_eq!(segment.get(&shared, 1, b"k1"), None);
    }

    #[test]
    fn test_destruct_removes_queue_nodes() {
        let shared = shared(1 << 20);
        let segment = Segment::new(0, 16, &shared).unwrap();

        for i in 0..100u32 {
            segment.put(&shared, i, &i.to_le_bytes(), b"v").unwrap();
        }
        assert_eq!(segment.capacity(), 256);
        assert_eq!(segment.snapshot(&shared).len(), 100);

        segment.destruct(&shared);
        segment.destruct(&shared);
        assert_eq!(shared.lru().unwrap().size(), 0);
        assert_eq!(shared.memory.allocated_size(), 0);
        assert_eq!(shared.memory.system_allocated_size(), 0);
        assert_eq!(shared.total_count.load(Ordering::Relaxed), 0);
        assert!(segment.snapshot(&shared).is_empty());
        assert_eq!(segment.put(&shared, 1, b"k", b"v").unwrap_err().kind(), ErrorKind::Closed);
    }

    #[test]
    fn test_without_eviction() {
        let shared = shared(0);
        let segment = Segment::new(0, 16, &shared).unwrap();
        segment.put(&shared, 1, b"k1", b"v1").unwrap();
        assert!(segment.contains(&shared, 1, b"k1"));
        assert_eq!(segment.free_space(&shared, 1, 0, 1), 0);
        assert!(segment.contains(&shared, 1, b"k1"));
        segment.destruct(&shared);
    }
}
