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

//! Entry and bin codecs over arena memory.
//!
//! Entry layout:
//!
//! ```plain
//! | hash (4B) | key len (4B) | value len (4B) | queue address (8B) | next address (8B) | key | value |
//! ```

use offheap_common::error::{Error, Result};

use crate::memory::Memory;

const HASH_OFFSET: u64 = 0;
const KEY_LEN_OFFSET: u64 = 4;
const VALUE_LEN_OFFSET: u64 = 8;
const QUEUE_ADDRESS_OFFSET: u64 = 12;
const NEXT_ADDRESS_OFFSET: u64 = 20;

/// Size of the fixed entry header.
pub const HEADER_SIZE: usize = 28;

/// Size of a bin slot in a segment table.
pub const BIN_SIZE: usize = 8;

/// View over an entry record in the arena.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry<'a> {
    addr: u64,
    memory: &'a Memory,
}

impl<'a> Entry<'a> {
    /// Encoded size of an entry with the given key and value lengths.
    pub fn size_of(key_len: usize, value_len: usize) -> usize {
        HEADER_SIZE + key_len + value_len
    }

    /// Like [`Entry::size_of`], but fails if a length does not fit the 4-byte length fields of the header.
    pub fn checked_size_of(key_len: usize, value_len: usize) -> Result<usize> {
        if key_len > u32::MAX as usize || value_len > u32::MAX as usize {
            return Err(Error::too_large(key_len, value_len));
        }
        HEADER_SIZE
            .checked_add(key_len)
            .and_then(|size| size.checked_add(value_len))
            .ok_or_else(|| Error::too_large(key_len, value_len))
    }

    pub fn new(addr: u64, memory: &'a Memory) -> Self {
        debug_assert_ne!(addr, 0);
        Self { addr, memory }
    }

    /// Write a complete entry at `addr`, header first.
    pub fn write(
        addr: u64,
        memory: &'a Memory,
        hash: u32,
        key: &[u8],
        value: &[u8],
        queue_address: u64,
        next: u64,
    ) -> Self {
        memory.write_u32(addr + HASH_OFFSET, hash);
        memory.write_u32(addr + KEY_LEN_OFFSET, key.len() as u32);
        memory.write_u32(addr + VALUE_LEN_OFFSET, value.len() as u32);
        memory.write_u64(addr + QUEUE_ADDRESS_OFFSET, queue_address);
        memory.write_u64(addr + NEXT_ADDRESS_OFFSET, next);
        memory.write_bytes(addr + HEADER_SIZE as u64, key);
        memory.write_bytes(addr + HEADER_SIZE as u64 + key.len() as u64, value);
        Self { addr, memory }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn hash(&self) -> u32 {
        self.memory.read_u32(self.addr + HASH_OFFSET)
    }

    pub fn key_len(&self) -> usize {
        self.memory.read_u32(self.addr + KEY_LEN_OFFSET) as usize
    }

    pub fn value_len(&self) -> usize {
        self.memory.read_u32(self.addr + VALUE_LEN_OFFSET) as usize
    }

    /// Encoded size of the entry.
    pub fn size(&self) -> usize {
        Self::size_of(self.key_len(), self.value_len())
    }

    pub fn queue_address(&self) -> u64 {
        self.memory.read_u64(self.addr + QUEUE_ADDRESS_OFFSET)
    }

    pub fn set_queue_address(&self, queue_address: u64) {
        self.memory.write_u64(self.addr + QUEUE_ADDRESS_OFFSET, queue_address)
    }

    /// Address of the next entry in the bin, `0` at the tail.
    pub fn next(&self) -> u64 {
        self.memory.read_u64(self.addr + NEXT_ADDRESS_OFFSET)
    }

    pub fn set_next(&self, next: u64) {
        self.memory.write_u64(self.addr + NEXT_ADDRESS_OFFSET, next)
    }

    pub fn key(&self) -> Vec<u8> {
        self.memory.read_bytes(self.key_addr(), self.key_len())
    }

    pub fn value(&self) -> Vec<u8> {
        self.memory.read_bytes(self.value_addr(), self.value_len())
    }

    /// Overwrite the value in place. The new value must have the current value length.
    pub fn set_value(&self, value: &[u8]) {
        debug_assert_eq!(value.len(), self.value_len());
        self.memory.write_bytes(self.value_addr(), value)
    }

    /// Compare the stored key with `key` without copying it out of the arena.
    pub fn key_equals(&self, key: &[u8]) -> bool {
        self.key_len() == key.len() && self.memory.compare(self.key_addr(), key)
    }

    fn key_addr(&self) -> u64 {
        self.addr + HEADER_SIZE as u64
    }

    fn value_addr(&self) -> u64 {
        self.key_addr() + self.key_len() as u64
    }
}

/// A table slot holding the address of the head entry of its chain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bin<'a> {
    addr: u64,
    memory: &'a Memory,
}

impl<'a> Bin<'a> {
    /// Bin `index` of the table at `table`.
    pub fn new(table: u64, index: usize, memory: &'a Memory) -> Self {
        Self {
            addr: table + (index * BIN_SIZE) as u64,
            memory,
        }
    }

    /// Address of the head entry, `0` if the bin is empty.
    pub fn first(&self) -> u64 {
        self.memory.read_u64(self.addr)
    }

    pub fn set_first(&self, first: u64) {
        self.memory.write_u64(self.addr, first)
    }

    /// Walk the chain looking for `key`.
    ///
    /// Returns `(previous, matched)` addresses; `matched` is `0` if there is no such key and `previous` is `0` if
    /// the match is the head.
    pub fn find(&self, hash: u32, key: &[u8]) -> (u64, u64) {
        let mut prev = 0;
        let mut cur = self.first();
        while cur != 0 {
            let entry = Entry::new(cur, self.memory);
            if entry.hash() == hash && entry.key_equals(key) {
                return (prev, cur);
            }
            prev = cur;
            cur = entry.next();
        }
        (0, 0)
    }

    /// Walk the chain looking for the entry at `addr`.
    ///
    /// Returns `(previous, matched)` with the same conventions as [`Bin::find`].
    pub fn find_addr(&self, addr: u64) -> (u64, u64) {
        let mut prev = 0;
        let mut cur = self.first();
        while cur != 0 {
            if cur == addr {
                return (prev, cur);
            }
            prev = cur;
            cur = Entry::new(cur, self.memory).next();
        }
        (0, 0)
    }

    /// Link `entry` as the head of the chain.
    pub fn push(&self, entry: &Entry<'_>) {
        entry.set_next(self.first());
        self.set_first(entry.addr());
    }

    /// Replace the link to `cur` (preceded by `prev`) with `next`.
    pub fn relink(&self, prev: u64, next: u64) {
        match prev {
            0 => self.set_first(next),
            prev => Entry::new(prev, self.memory).set_next(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use offheap_common::error::ErrorKind;

    use super::*;

    #[test]
    fn test_entry_codec() {
        let memory = Memory::new(0);
        let size = Entry::size_of(3, 5);
        assert_eq!(size, 36);

        let addr = memory.allocate(size, false, false).unwrap();
        let entry = Entry::write(addr, &memory, 0xdead_beef, b"key", b"value", 42, 0);

        assert_eq!(entry.hash(), 0xdead_beef);
        assert_eq!(entry.key_len(), 3);
        assert_eq!(entry.value_len(), 5);
        assert_eq!(entry.size(), size);
        assert_eq!(entry.queue_address(), 42);
        assert_eq!(entry.next(), 0);
        assert_eq!(entry.key(), b"key");
        assert_eq!(entry.value(), b"value");

        assert!(entry.key_equals(b"key"));
        assert!(!entry.key_equals(b"kez"));
        assert!(!entry.key_equals(b"keys"));
        assert!(!entry.key_equals(b""));

        entry.set_value(b"VALUE");
        assert_eq!(entry.value(), b"VALUE");
        assert_eq!(entry.key(), b"key");

        entry.set_queue_address(7);
        entry.set_next(1024);
        assert_eq!(entry.queue_address(), 7);
        assert_eq!(entry.next(), 1024);

        memory.release(addr, size);
        assert_eq!(memory.allocated_size(), 0);
    }

    #[test]
    fn test_checked_size() {
        let max = u32::MAX as usize;
        assert_eq!(Entry::checked_size_of(3, 5).unwrap(), 36);
        assert_eq!(Entry::checked_size_of(0, 0).unwrap(), HEADER_SIZE);
        assert_eq!(Entry::checked_size_of(max, 0).unwrap(), Entry::size_of(max, 0));
        assert_eq!(Entry::checked_size_of(max + 1, 0).unwrap_err().kind(), ErrorKind::TooLarge);
        assert_eq!(Entry::checked_size_of(0, max + 1).unwrap_err().kind(), ErrorKind::TooLarge);
    }

    #[test]
    fn test_empty_key_value() {
        let memory = Memory::new(0);
        let addr = memory.allocate(Entry::size_of(0, 0), false, false).unwrap();
        let entry = Entry::write(addr, &memory, 1, b"", b"", 0, 0);
        assert!(entry.key_equals(b""));
        assert!(entry.value().is_empty());
        memory.release(addr, entry.size());
    }

    #[test]
    fn test_bin_chain() {
        let memory = Memory::new(0);
        let table = memory.allocate_system(4 * BIN_SIZE, true).unwrap();
        let bin = Bin::new(table, 2, &memory);
        assert_eq!(bin.first(), 0);
        assert_eq!(bin.find(1, b"a"), (0, 0));

        let entries = [b"a", b"b", b"c"]
            .into_iter()
            .map(|key| {
                let addr = memory.allocate(Entry::size_of(1, 1), false, false).unwrap();
                let entry = Entry::write(addr, &memory, 1, key, b"v", 0, 0);
                bin.push(&entry);
                entry
            })
            .collect::<Vec<_>>();

        // c -> b -> a
        assert_eq!(bin.first(), entries[2].addr());
        assert_eq!(bin.find(1, b"a"), (entries[1].addr(), entries[0].addr()));
        assert_eq!(bin.find(1, b"c"), (0, entries[2].addr()));
        assert_eq!(bin.find(2, b"c"), (0, 0));
        assert_eq!(bin.find_addr(entries[1].addr()), (entries[2].addr(), entries[1].addr()));

        // c -> a
        bin.relink(entries[2].addr(), entries[1].next());
        assert_eq!(bin.find(1, b"b"), (0, 0));
        // a
        bin.relink(0, entries[2].next());
        assert_eq!(bin.first(), entries[0].addr());

        // Neighbour bins are untouched.
        assert_eq!(Bin::new(table, 1, &memory).first(), 0);
        assert_eq!(Bin::new(table, 3, &memory).first(), 0);

        for entry in entries {
            memory.release(entry.addr(), entry.size());
        }
        memory.release_system(table, 4 * BIN_SIZE);
    }
}
