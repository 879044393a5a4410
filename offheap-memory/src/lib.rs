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

//! A segmented concurrent hash map that stores byte keys and values in arena memory outside of the Rust heap
//! objects it manages, with optional capacity-bounded LRU eviction.
//!
//! # Overview
//!
//! ```plain
//!                 Map (partition 0)            Map view (partition 1)
//!                 /   |   \                      /   |   \
//!          Segment Segment Segment        Segment Segment Segment
//!              \      |      /                \      |      /
//!               +-----+-----+------ Memory ----+-----+-----+
//!               +-----+-----+------   Lru  ----+-----+-----+
//! ```
//!
//! A [`Map`] routes every operation to one of its segments by the high bits of the caller supplied hash. Each
//! segment owns a power-of-two table of bins, each bin heading a chain of entries living in the memory arena.
//!
//! With a total memory budget configured, every entry is tracked by the striped LRU queue. An insert that
//! exceeds the budget evicts least recently used entries afterwards, possibly from another segment or another
//! partition sharing the same arena.
//!
//! The arena and the queue are internal. Addresses never cross the public API, callers only see byte keys, byte
//! values and the accounting of [`Map`].

mod config;
mod entry;
mod evictor;
mod lru;
mod map;
mod memory;
mod segment;

/// Re-exports of the commonly used types.
pub mod prelude;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use prelude::*;
