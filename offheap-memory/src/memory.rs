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

//! Raw byte-addressable memory arena.
//!
//! All other modules address arena memory through opaque `u64` addresses handed out by [`Memory::allocate`] and
//! [`Memory::allocate_system`]. This module is the only place that turns such an address back into a pointer.
//!
//! Allocation, release and the typed accessors are crate-private. Every caller must only pass addresses (plus in-bounds offsets) that were
//! returned by this arena and have not been released yet, and must serialize writes against reads of the same
//! bytes. Within the map that is guaranteed by the segment locks: entry and table memory is only touched under the
//! owning segment's lock, and released only after it has been unlinked.

use std::{
    alloc::{alloc, alloc_zeroed, dealloc, Layout},
    fmt::Debug,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use offheap_common::{
    error::{Error, Result},
    event::{Event, EventListener},
};

const ALIGN: usize = 8;

/// Off-heap memory arena with reservation accounting.
///
/// Entry memory is tracked against the configured total budget, table memory is tracked separately as "system"
/// memory and never counts against the budget. A total of `0` means the arena is unbounded.
pub(crate) struct Memory {
    total: u64,
    allocated: AtomicU64,
    system_allocated: AtomicU64,
    listener: OnceLock<Arc<dyn EventListener>>,
    #[cfg(test)]
    pub(crate) faults: Faults,
}

/// Allocation failures injected by tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub allocate: std::sync::atomic::AtomicBool,
    pub allocate_system: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl Faults {
    fn fails(&self, system: bool) -> bool {
        match system {
            true => self.allocate_system.load(Ordering::Relaxed),
            false => self.allocate.load(Ordering::Relaxed),
        }
    }
}

impl Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("total", &self.total)
            .field("allocated", &self.allocated_size())
            .field("system_allocated", &self.system_allocated_size())
            .finish()
    }
}

impl Memory {
    /// Create an arena with the given total budget for tracked memory.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            allocated: AtomicU64::new(0),
            system_allocated: AtomicU64::new(0),
            listener: OnceLock::new(),
            #[cfg(test)]
            faults: Faults::default(),
        }
    }

    /// Register the event listener of the arena.
    ///
    /// Returns `false` if a listener has already been registered.
    pub(crate) fn listen(&self, listener: Arc<dyn EventListener>) -> bool {
        self.listener.set(listener).is_ok()
    }

    /// Account `size` bytes of tracked memory ahead of the allocation.
    ///
    /// Returns `false` if the budget is exceeded after the reservation. The reservation is kept either way, the
    /// caller is expected to allocate with `reserved = true` and then free space by eviction.
    pub(crate) fn reserve(&self, size: usize) -> bool {
        let allocated = self.allocated.fetch_add(size as u64, Ordering::AcqRel) + size as u64;
        self.total == 0 || allocated <= self.total
    }

    /// Allocate tracked memory.
    ///
    /// If `reserved` is `true`, the size has already been accounted by [`Memory::reserve`].
    /// On failure the accounted size, reserved or not, is rolled back.
    pub(crate) fn allocate(&self, size: usize, zero: bool, reserved: bool) -> Result<u64> {
        if !reserved {
            self.allocated.fetch_add(size as u64, Ordering::AcqRel);
        }
        match self.try_allocate(size, zero, false) {
            Some(addr) => {
                self.notify(Event::Allocate);
                Ok(addr)
            }
            None => {
                self.allocated.fetch_sub(size as u64, Ordering::AcqRel);
                Err(Error::out_of_memory(self.total, self.allocated_size(), size))
            }
        }
    }

    /// Allocate untracked structural memory (hash tables).
    pub(crate) fn allocate_system(&self, size: usize, zero: bool) -> Result<u64> {
        let addr = self
            .try_allocate(size, zero, true)
            .ok_or_else(|| Error::out_of_memory(self.total, self.system_allocated_size(), size))?;
        self.system_allocated.fetch_add(size as u64, Ordering::AcqRel);
        Ok(addr)
    }

    /// Release tracked memory. Releasing address `0` is a no-op.
    ///
    /// `addr` must have been returned by [`Memory::allocate`] with the same `size` and not released since.
    pub(crate) fn release(&self, addr: u64, size: usize) {
        if addr == 0 {
            return;
        }
        raw_release(addr, size);
        self.allocated.fetch_sub(size as u64, Ordering::AcqRel);
        self.notify(Event::Release);
    }

    /// Release untracked structural memory. Releasing address `0` is a no-op.
    pub(crate) fn release_system(&self, addr: u64, size: usize) {
        if addr == 0 {
            return;
        }
        raw_release(addr, size);
        self.system_allocated.fetch_sub(size as u64, Ordering::AcqRel);
    }

    /// Total budget of tracked memory, `0` if unbounded.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Tracked memory in use, including reservations.
    pub fn allocated_size(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Untracked structural memory in use.
    pub fn system_allocated_size(&self) -> u64 {
        self.system_allocated.load(Ordering::Acquire)
    }

    /// Tracked memory left before the budget is exceeded.
    pub fn free_size(&self) -> u64 {
        self.total.saturating_sub(self.allocated_size())
    }

    fn try_allocate(&self, size: usize, zero: bool, system: bool) -> Option<u64> {
        if self.injected_failure(system) {
            return None;
        }
        raw_allocate(size, zero)
    }

    #[cfg(test)]
    fn injected_failure(&self, system: bool) -> bool {
        self.faults.fails(system)
    }

    #[cfg(not(test))]
    fn injected_failure(&self, _: bool) -> bool {
        false
    }

    fn notify(&self, event: Event) {
        if let Some(listener) = self.listener.get() {
            listener.on_event(event);
        }
    }

    pub(crate) fn read_u32(&self, addr: u64) -> u32 {
        unsafe { std::ptr::read_unaligned(addr as *const u32) }
    }

    pub(crate) fn write_u32(&self, addr: u64, v: u32) {
        unsafe { std::ptr::write_unaligned(addr as *mut u32, v) }
    }

    pub(crate) fn read_u64(&self, addr: u64) -> u64 {
        unsafe { std::ptr::read_unaligned(addr as *const u64) }
    }

    pub(crate) fn write_u64(&self, addr: u64, v: u64) {
        unsafe { std::ptr::write_unaligned(addr as *mut u64, v) }
    }

    pub(crate) fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        self.slice(addr, len).to_vec()
    }

    pub(crate) fn write_bytes(&self, addr: u64, bytes: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) }
    }

    /// Byte-exact comparison of arena data against `bytes`.
    pub(crate) fn compare(&self, addr: u64, bytes: &[u8]) -> bool {
        self.slice(addr, bytes.len()) == bytes
    }

    fn slice(&self, addr: u64, len: usize) -> &[u8] {
        if len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }
    }
}

fn layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size.max(1), ALIGN).ok()
}

fn raw_allocate(size: usize, zero: bool) -> Option<u64> {
    let layout = layout(size)?;
    let ptr = unsafe {
        match zero {
            true => alloc_zeroed(layout),
            false => alloc(layout),
        }
    };
    NonNull::new(ptr).map(|ptr| ptr.as_ptr() as u64)
}

fn raw_release(addr: u64, size: usize) {
    // The layout was valid when the memory was allocated with the same size.
    if let Some(layout) = layout(size) {
        unsafe { dealloc(addr as *mut u8, layout) }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use offheap_common::error::ErrorKind;

    use super::*;

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<Memory>();
    }

    #[test]
    fn test_primitives() {
        let mem = Memory::new(0);
        let addr = mem.allocate(64, true, false).unwrap();
        assert_ne!(addr, 0);
        assert_eq!(mem.read_u64(addr), 0);

        mem.write_u32(addr, 0xdead_beef);
        mem.write_u64(addr + 4, u64::MAX - 1);
        mem.write_bytes(addr + 12, b"hello");
        assert_eq!(mem.read_u32(addr), 0xdead_beef);
        assert_eq!(mem.read_u64(addr + 4), u64::MAX - 1);
        assert_eq!(mem.read_bytes(addr + 12, 5), b"hello".to_vec());
        assert!(mem.compare(addr + 12, b"hello"));
        assert!(!mem.compare(addr + 12, b"hellp"));
        assert!(mem.compare(addr + 12, b""));
        assert!(mem.read_bytes(addr + 12, 0).is_empty());

        mem.release(addr, 64);
        assert_eq!(mem.allocated_size(), 0);
    }

    #[test]
    fn test_accounting() {
        let mem = Memory::new(100);
        assert_eq!(mem.total_size(), 100);
        assert_eq!(mem.free_size(), 100);

        assert!(mem.reserve(60));
        let a = mem.allocate(60, false, true).unwrap();
        assert_eq!(mem.allocated_size(), 60);
        assert_eq!(mem.free_size(), 40);

        // Budget is soft: the reservation is kept and reported as exceeded.
        assert!(!mem.reserve(60));
        let b = mem.allocate(60, false, true).unwrap();
        assert_eq!(mem.allocated_size(), 120);
        assert_eq!(mem.free_size(), 0);

        let t = mem.allocate_system(128, true).unwrap();
        assert_eq!(mem.system_allocated_size(), 128);
        assert_eq!(mem.allocated_size(), 120);

        mem.release(a, 60);
        mem.release(b, 60);
        mem.release_system(t, 128);
        mem.release(0, 1024);
        assert_eq!(mem.allocated_size(), 0);
        assert_eq!(mem.system_allocated_size(), 0);
    }

    #[test]
    fn test_allocation_failure_rolls_back() {
        let mem = Memory::new(1024);
        let a = mem.allocate(64, false, false).unwrap();

        // No valid layout exists for this size, the allocator is never reached.
        let size = isize::MAX as usize;
        let err = mem.allocate(size, false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(mem.allocated_size(), 64);

        assert!(!mem.reserve(size));
        assert_eq!(mem.allocate(size, false, true).unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(mem.allocated_size(), 64);

        assert_eq!(mem.allocate_system(size, true).unwrap_err().kind(), ErrorKind::OutOfMemory);
        assert_eq!(mem.system_allocated_size(), 0);

        mem.faults.allocate.store(true, Ordering::Relaxed);
        assert!(mem.allocate(16, false, false).is_err());
        let t = mem.allocate_system(16, false).unwrap();
        mem.release_system(t, 16);
        mem.faults.allocate.store(false, Ordering::Relaxed);
        assert_eq!(mem.allocated_size(), 64);
        assert_eq!(mem.system_allocated_size(), 0);

        mem.release(a, 64);
        assert_eq!(mem.allocated_size(), 0);
    }

    #[test]
    fn test_unbounded_reserve() {
        let mem = Memory::new(0);
        assert!(mem.reserve(1 << 40));
        assert_eq!(mem.free_size(), 0);
    }

    #[test]
    fn test_listener() {
        let mem = Memory::new(0);
        let events = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn EventListener> = {
            let events = events.clone();
            Arc::new(move |_: Event| {
                events.fetch_add(1, Ordering::Relaxed);
            })
        };
        assert!(mem.listen(listener.clone()));
        assert!(!mem.listen(listener));

        let addr = mem.allocate(16, false, false).unwrap();
        mem.release(addr, 16);
        let t = mem.allocate_system(16, false).unwrap();
        mem.release_system(t, 16);
        assert_eq!(events.load(Ordering::Relaxed), 2);
    }
}
