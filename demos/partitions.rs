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

//! Share one memory budget and one eviction order between partitions.

use offheap::MapBuilder;

fn main() {
    let hot = MapBuilder::new()
        .with_partition(0)
        .with_total_memory(64 * 1024)
        .with_evict_listener(|partition: u32, _: u32, key: &[u8], _: &[u8]| {
            println!("partition {partition} evicted {}", String::from_utf8_lossy(key))
        })
        .build()
        .unwrap();
    let cold = MapBuilder::new()
        .with_partition(1)
        .with_evict_listener(|partition: u32, _: u32, key: &[u8], _: &[u8]| {
            println!("partition {partition} evicted {}", String::from_utf8_lossy(key))
        })
        .build_view(&hot)
        .unwrap();

    for i in 0..100u32 {
        cold.put(i, format!("cold-{i}").as_bytes(), &[0; 512]).unwrap();
    }
    // The cold partition gives way to the hot one.
    for i in 0..100u32 {
        hot.put(i, format!("hot-{i}").as_bytes(), &[1; 512]).unwrap();
    }

    let cold_size = cold.iter().count();
    let hot_size = hot.iter().count();
    println!("cold: {cold_size}, hot: {hot_size}, allocated: {} / {}", hot.allocated_size(), hot.memory_size());
    assert_eq!(hot.size(), cold_size + hot_size);
}
