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

use serde::{Deserialize, Serialize};

/// Maximum segment count of a map.
pub const MAX_CONCURRENCY: usize = 512;

/// Minimum table capacity of a segment.
pub const MIN_SEGMENT_CAPACITY: usize = 16;

/// Off-heap map config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Partition id of the map.
    ///
    /// Maps sharing one arena and eviction queue must use distinct partitions.
    pub partition: u32,

    /// Segment count hint.
    ///
    /// Rounded up to a power of two, capped at [`MAX_CONCURRENCY`].
    pub concurrency: usize,

    /// Segment load factor. A segment doubles its table once its entry count exceeds `capacity * load_factor`.
    pub load_factor: f32,

    /// Initial capacity hint, distributed evenly across segments.
    pub initial_capacity: usize,

    /// Total arena budget for entry memory in bytes.
    ///
    /// `0` disables eviction tracking entirely.
    pub total_memory: u64,

    /// Stripe count of the eviction queue.
    pub eviction_stripes: u16,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            partition: 0,
            concurrency: 16,
            load_factor: 0.75,
            initial_capacity: 1024,
            total_memory: 0,
            eviction_stripes: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config: MapConfig = serde_json::from_str(r#"{ "total_memory": 1048576, "eviction_stripes": 4 }"#).unwrap();
        assert_eq!(
            config,
            MapConfig {
                total_memory: 1 << 20,
                eviction_stripes: 4,
                ..Default::default()
            }
        );

        let json = serde_json::to_string(&config).unwrap();
        let decoded: MapConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }
}
