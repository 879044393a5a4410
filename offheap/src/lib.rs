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

//! offheap - A segmented concurrent key/value map that keeps byte keys and values in a dedicated memory arena,
//! with optional capacity-bounded LRU eviction shared across partitions.
//!
//! ```
//! use offheap::MapBuilder;
//!
//! let map = MapBuilder::new().with_total_memory(1 << 20).build().unwrap();
//!
//! assert!(map.put(42, b"key", b"value").unwrap());
//! assert_eq!(map.get(42, b"key").unwrap(), b"value");
//! assert_eq!(map.remove(42, b"key").unwrap().unwrap(), b"value");
//! ```

pub use offheap_common as common;
pub use offheap_memory as memory;

mod prelude;
pub use prelude::*;
