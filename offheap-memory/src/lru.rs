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

//! Striped recency queue over entry addresses.
//!
//! Each stripe is an independently locked doubly linked list kept in a slab. Entries are offered to stripes
//! round-robin, so the order across stripes is only an approximation of a global LRU order. The queue never takes a
//! segment lock, and segments only take a stripe lock while holding their own lock, never the other way around.
//!
//! A queue address packs `(generation, stripe, slot)` into a non-zero `u64`. Slots are reused after removal with a
//! bumped generation, so an address that was peeked without a lock and went stale in the meantime resolves to
//! nothing instead of to an unrelated entry.

use std::sync::atomic::{AtomicUsize, Ordering};

use offheap_common::{
    error::{Error, Result},
    strict_assert, strict_assert_eq,
};
use parking_lot::Mutex;

const NIL: u32 = u32::MAX;

const STRIPE_SHIFT: u32 = 32;
const GENERATION_SHIFT: u32 = 48;

#[derive(Debug)]
struct Node {
    prev: u32,
    next: u32,
    entry: u64,
    hash: u32,
    partition: u32,
    generation: u16,
    linked: bool,
}

#[derive(Debug)]
struct Stripe {
    nodes: Vec<Node>,
    free: Vec<u32>,
    /// Least recently used.
    head: u32,
    /// Most recently used.
    tail: u32,
    len: usize,
}

impl Stripe {
    fn new() -> Self {
        Self {
            nodes: vec![],
            free: vec![],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    fn get(&self, slot: u32, generation: u16) -> Option<&Node> {
        self.nodes
            .get(slot as usize)
            .filter(|node| node.linked && node.generation == generation)
    }

    fn get_mut(&mut self, slot: u32, generation: u16) -> Option<&mut Node> {
        self.nodes
            .get_mut(slot as usize)
            .filter(|node| node.linked && node.generation == generation)
    }

    fn push(&mut self, partition: u32, entry: u64, hash: u32) -> Result<(u32, u16)> {
        let slot = match self.free.pop() {
            Some(slot) => {
                let node = &mut self.nodes[slot as usize];
                strict_assert!(!node.linked);
                node.generation = match node.generation.wrapping_add(1) {
                    0 => 1,
                    g => g,
                };
                node.entry = entry;
                node.hash = hash;
                node.partition = partition;
                slot
            }
            None => {
                if self.nodes.len() >= NIL as usize {
                    return Err(Error::out_of_memory(0, self.nodes.len() as u64, 1));
                }
                self.nodes.try_reserve(1).map_err(|e| {
                    Error::out_of_memory(0, self.nodes.len() as u64, std::mem::size_of::<Node>()).with_source(e)
                })?;
                self.nodes.push(Node {
                    prev: NIL,
                    next: NIL,
                    entry,
                    hash,
                    partition,
                    generation: 1,
                    linked: false,
                });
                (self.nodes.len() - 1) as u32
            }
        };
        self.link_tail(slot);
        self.len += 1;
        Ok((slot, self.nodes[slot as usize].generation))
    }

    fn link_tail(&mut self, slot: u32) {
        let tail = self.tail;
        {
            let node = &mut self.nodes[slot as usize];
            node.prev = tail;
            node.next = NIL;
            node.linked = true;
        }
        match tail {
            NIL => self.head = slot,
            tail => self.nodes[tail as usize].next = slot,
        }
        self.tail = slot;
    }

    fn detach(&mut self, slot: u32) {
        let (prev, next) = {
            let node = &mut self.nodes[slot as usize];
            node.linked = false;
            (node.prev, node.next)
        };
        match prev {
            NIL => self.head = next,
            prev => self.nodes[prev as usize].next = next,
        }
        match next {
            NIL => self.tail = prev,
            next => self.nodes[next as usize].prev = prev,
        }
    }

    fn remove(&mut self, slot: u32, generation: u16) -> bool {
        if self.get(slot, generation).is_none() {
            return false;
        }
        self.detach(slot);
        self.free.push(slot);
        self.len -= 1;
        true
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }
}

/// Striped LRU queue ordering tracked entries for eviction.
#[derive(Debug)]
pub(crate) struct Lru {
    stripes: Vec<Mutex<Stripe>>,
    offer_cursor: AtomicUsize,
    poll_cursor: AtomicUsize,
    /// Fail every offer, injected by tests.
    #[cfg(test)]
    pub(crate) fail_offer: std::sync::atomic::AtomicBool,
}

impl Lru {
    /// Create a queue with the given stripe count.
    ///
    /// # Panics
    ///
    /// Panics if `stripes` is `0`.
    pub fn new(stripes: u16) -> Self {
        assert!(stripes > 0, "lru stripes must be greater than zero");
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(Stripe::new())).collect(),
            offer_cursor: AtomicUsize::new(0),
            poll_cursor: AtomicUsize::new(0),
            #[cfg(test)]
            fail_offer: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Stripe count.
    pub fn concurrency(&self) -> u16 {
        self.stripes.len() as u16
    }

    /// Count of queued nodes.
    pub fn size(&self) -> usize {
        self.stripes.iter().map(|stripe| stripe.lock().len).sum()
    }

    /// Memory occupied by queue nodes.
    pub fn memory_size(&self) -> usize {
        self.stripes
            .iter()
            .map(|stripe| {
                let stripe = stripe.lock();
                stripe.nodes.capacity() * std::mem::size_of::<Node>() + stripe.free.capacity() * 4
            })
            .sum()
    }

    /// Queue the entry as the most recently used one of a stripe and return its queue address.
    pub fn offer(&self, partition: u32, entry: u64, hash: u32) -> Result<u64> {
        strict_assert!(entry != 0);
        #[cfg(test)]
        if self.fail_offer.load(Ordering::Relaxed) {
            return Err(Error::out_of_memory(0, 0, std::mem::size_of::<Node>()));
        }
        let order = self.offer_cursor.fetch_add(1, Ordering::Relaxed) % self.stripes.len();
        let (slot, generation) = self.stripes[order].lock().push(partition, entry, hash)?;
        Ok(encode(order as u16, slot, generation))
    }

    /// Mark the node as most recently used and point it at `entry`.
    pub fn touch(&self, qaddr: u64, entry: u64) {
        let (order, slot, generation) = decode(qaddr);
        let Some(stripe) = self.stripes.get(order as usize) else {
            return;
        };
        let mut stripe = stripe.lock();
        let Some(node) = stripe.get_mut(slot, generation) else {
            return;
        };
        node.entry = entry;
        stripe.detach(slot);
        stripe.link_tail(slot);
    }

    /// Remove a polled node from the queue. Stale addresses are ignored.
    pub fn poll(&self, qaddr: u64) {
        let (order, slot, generation) = decode(qaddr);
        if let Some(stripe) = self.stripes.get(order as usize) {
            stripe.lock().remove(slot, generation);
        }
    }

    /// Remove the node of an explicitly deleted entry. Stale addresses are ignored.
    pub fn remove(&self, qaddr: u64) {
        self.poll(qaddr)
    }

    /// Peek the least recently used node without removing it.
    ///
    /// Returns `0` if every stripe is empty. The returned address may go stale as soon as the stripe lock is
    /// released.
    pub fn pre_poll(&self) -> u64 {
        let n = self.stripes.len();
        let start = self.poll_cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let order = (start + i) % n;
            let stripe = self.stripes[order].lock();
            if stripe.head != NIL {
                let generation = stripe.nodes[stripe.head as usize].generation;
                return encode(order as u16, stripe.head, generation);
            }
        }
        0
    }

    /// Stripe of the queue address.
    pub fn order(&self, qaddr: u64) -> u16 {
        decode(qaddr).0
    }

    /// Resolve the queue address to its current entry address, `0` if the node is gone.
    pub fn entry(&self, order: u16, qaddr: u64) -> u64 {
        self.with_node(order, qaddr, |node| node.entry).unwrap_or(0)
    }

    /// Routing hash of the entry behind the queue address.
    pub fn hash(&self, order: u16, qaddr: u64) -> Option<u32> {
        self.with_node(order, qaddr, |node| node.hash)
    }

    /// Partition of the map owning the entry behind the queue address.
    pub fn partition(&self, order: u16, qaddr: u64) -> Option<u32> {
        self.with_node(order, qaddr, |node| node.partition)
    }

    /// Drop every queued node.
    pub fn destruct(&self) {
        for stripe in self.stripes.iter() {
            stripe.lock().clear();
        }
    }

    fn with_node<F, R>(&self, order: u16, qaddr: u64, f: F) -> Option<R>
    where
        F: FnOnce(&Node) -> R,
    {
        let (o, slot, generation) = decode(qaddr);
        strict_assert_eq!(o, order);
        self.stripes.get(order as usize)?.lock().get(slot, generation).map(f)
    }
}

fn encode(order: u16, slot: u32, generation: u16) -> u64 {
    ((generation as u64) << GENERATION_SHIFT) | ((order as u64) << STRIPE_SHIFT) | slot as u64
}

fn decode(qaddr: u64) -> (u16, u32, u16) {
    (
        (qaddr >> STRIPE_SHIFT) as u16,
        qaddr as u32,
        (qaddr >> GENERATION_SHIFT) as u16,
    )
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Lru>();
    }

    fn drain(lru: &Lru) -> Vec<u64> {
        let mut entries = vec![];
        loop {
            let q = lru.pre_poll();
            if q == 0 {
                break;
            }
            entries.push(lru.entry(lru.order(q), q));
            lru.poll(q);
        }
        entries
    }

    #[test]
    fn test_lru_order() {
        let lru = Lru::new(1);

        let qs = (1..=4).map(|i| lru.offer(0, i * 8, i as u32).unwrap()).collect_vec();
        assert!(qs.iter().all(|q| *q != 0));
        assert_eq!(lru.size(), 4);

        // 2, 3, 4, 1
        lru.touch(qs[0], 8);
        // 2, 4, 1
        lru.remove(qs[2]);
        // 2, 4, 1(100)
        lru.touch(qs[0], 100);

        let q = lru.pre_poll();
        assert_eq!(q, qs[1]);
        assert_eq!(lru.hash(lru.order(q), q), Some(2));
        assert_eq!(lru.partition(lru.order(q), q), Some(0));

        assert_eq!(drain(&lru), vec![16, 32, 100]);
        assert_eq!(lru.size(), 0);
        assert_eq!(lru.pre_poll(), 0);
    }

    #[test]
    fn test_lru_stale_address() {
        let lru = Lru::new(1);

        let q1 = lru.offer(3, 8, 1).unwrap();
        lru.poll(q1);
        assert_eq!(lru.entry(lru.order(q1), q1), 0);
        assert_eq!(lru.hash(lru.order(q1), q1), None);

        // The slot is reused with a new generation.
        let q2 = lru.offer(3, 16, 2).unwrap();
        assert_ne!(q1, q2);
        assert_eq!(q1 as u32, q2 as u32);
        assert_eq!(lru.entry(lru.order(q1), q1), 0);
        assert_eq!(lru.entry(lru.order(q2), q2), 16);

        // Stale operations must not affect the live node.
        lru.poll(q1);
        lru.touch(q1, 24);
        assert_eq!(lru.size(), 1);
        assert_eq!(lru.entry(lru.order(q2), q2), 16);

        // Addresses of a stripe that does not exist resolve to nothing.
        let bogus = encode(7, 0, 1);
        lru.touch(bogus, 24);
        lru.poll(bogus);
        lru.remove(u64::MAX);
        assert_eq!(lru.entry(lru.order(bogus), bogus), 0);
        assert_eq!(lru.size(), 1);
    }

    #[test]
    fn test_lru_stripes() {
        let lru = Lru::new(4);
        assert_eq!(lru.concurrency(), 4);

        let qs = (1..=8).map(|i| lru.offer(1, i * 8, i as u32).unwrap()).collect_vec();
        let orders = qs.iter().map(|q| lru.order(*q)).collect_vec();
        assert_eq!(orders, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        assert!(lru.memory_size() > 0);

        let mut entries = drain(&lru);
        entries.sort();
        assert_eq!(entries, (1..=8).map(|i| i * 8).collect_vec());

        for q in qs {
            lru.offer(1, q, 0).unwrap();
        }
        lru.destruct();
        assert_eq!(lru.size(), 0);
        assert_eq!(lru.pre_poll(), 0);
    }
}
