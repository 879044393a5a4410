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

//! Listen to evictions and structural events of a memory bounded map.

use offheap::{Event, MapBuilder, HEADER_SIZE};

/// Output:
///
/// ```plain
/// Entry [key = 1] [value = First] is evicted from partition 0.
/// Entry [key = 2] [value = Second] is evicted from partition 0.
/// ```
fn main() {
    let entry = (HEADER_SIZE + 1 + 6) as u64;

    let map = MapBuilder::new()
        .with_total_memory(2 * entry)
        .with_eviction_stripes(1)
        .with_event_listener(|event: Event| {
            if event == Event::Rehash {
                println!("A segment has been rehashed.");
            }
        })
        .with_evict_listener(|partition: u32, _hash: u32, key: &[u8], value: &[u8]| {
            println!(
                "Entry [key = {}] [value = {}] is evicted from partition {partition}.",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value).trim_end()
            )
        })
        .build()
        .unwrap();

    map.put(1, b"1", b"First ").unwrap();
    map.put(2, b"2", b"Second").unwrap();
    map.put(3, b"3", b"Third ").unwrap();
    map.put(4, b"4", b"Forth ").unwrap();

    assert_eq!(map.size(), 2);
}
