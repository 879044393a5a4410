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

//! Throughput and latency bench for the offheap map.

use std::{
    hash::{BuildHasher, BuildHasherDefault, DefaultHasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use bytesize::{ByteSize, MIB};
use clap::Parser;
use hdrhistogram::Histogram;
use itertools::Itertools;
use offheap::{Map, MapBuilder};
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Writer count.
    #[arg(long, default_value_t = 8)]
    writers: usize,

    /// Reader count.
    #[arg(long, default_value_t = 8)]
    readers: usize,

    /// (s)
    #[arg(short, long, default_value_t = 10)]
    time: u64,

    /// Segment count hint.
    #[arg(long, default_value_t = 64)]
    concurrency: usize,

    /// Segment load factor.
    #[arg(long, default_value_t = 0.75)]
    load_factor: f32,

    /// Initial capacity hint.
    #[arg(long, default_value_t = 1024)]
    initial_capacity: usize,

    /// Arena budget, 0 disables eviction. (MiB)
    #[arg(long, default_value_t = 256)]
    memory: u64,

    /// Eviction queue stripes.
    #[arg(long, default_value_t = 16)]
    stripes: u16,

    /// Key range of writers and readers.
    #[arg(long, default_value_t = 1_000_000)]
    key_range: u64,

    /// Min value size. (B)
    #[arg(long, default_value_t = 64)]
    value_size_min: usize,

    /// Max value size. (B)
    #[arg(long, default_value_t = 1024)]
    value_size_max: usize,
}

#[derive(Debug)]
struct Stats {
    latency: Histogram<u64>,
    hits: u64,
    misses: u64,
    bytes: u64,
}

impl Stats {
    fn new() -> Result<Self> {
        Ok(Self {
            // 1ns ~ 60s
            latency: Histogram::new_with_bounds(1, 60_000_000_000, 3)?,
            hits: 0,
            misses: 0,
            bytes: 0,
        })
    }

    fn merge(mut self, other: &Stats) -> Result<Self> {
        self.latency.add(&other.latency)?;
        self.hits += other.hits;
        self.misses += other.misses;
        self.bytes += other.bytes;
        Ok(self)
    }
}

fn hash(key: &[u8]) -> u32 {
    BuildHasherDefault::<DefaultHasher>::default().hash_one(key) as u32
}

fn write(map: Map, args: Args, seed: u64, stop: Arc<AtomicBool>) -> Result<Stats> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut stats = Stats::new()?;

    while !stop.load(Ordering::Relaxed) {
        let idx = rng.random_range(0..args.key_range);
        let key = idx.to_le_bytes();
        let size = rng.random_range(args.value_size_min..=args.value_size_max);
        let value = vec![idx as u8; size];

        let now = Instant::now();
        map.put(hash(&key), &key, &value)?;
        stats.latency.record(now.elapsed().as_nanos() as u64)?;
        stats.bytes += size as u64;
    }

    Ok(stats)
}

fn read(map: Map, args: Args, seed: u64, stop: Arc<AtomicBool>) -> Result<Stats> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut stats = Stats::new()?;

    while !stop.load(Ordering::Relaxed) {
        let idx = rng.random_range(0..args.key_range);
        let key = idx.to_le_bytes();

        let now = Instant::now();
        let value = map.get(hash(&key), &key);
        stats.latency.record(now.elapsed().as_nanos() as u64)?;

        match value {
            Some(value) => {
                assert!(value.iter().all(|b| *b == idx as u8), "corrupted value of key {idx}");
                stats.hits += 1;
                stats.bytes += value.len() as u64;
            }
            None => stats.misses += 1,
        }
    }

    Ok(stats)
}

fn report(name: &str, stats: &Stats, elapsed: Duration) {
    let ops = stats.latency.len();
    let secs = elapsed.as_secs_f64();
    let us = |q: f64| stats.latency.value_at_quantile(q) as f64 / 1000.0;

    println!("{name}:");
    println!("  ops:        {ops} ({:.0} op/s)", ops as f64 / secs);
    println!(
        "  throughput: {}/s",
        ByteSize::b((stats.bytes as f64 / secs) as u64)
    );
    if stats.hits + stats.misses > 0 {
        println!(
            "  hit ratio:  {:.2}%",
            stats.hits as f64 * 100.0 / (stats.hits + stats.misses) as f64
        );
    }
    println!(
        "  latency:    p50 {:.3}us, p90 {:.3}us, p99 {:.3}us, p999 {:.3}us, max {:.3}us",
        us(0.5),
        us(0.9),
        us(0.99),
        us(0.999),
        stats.latency.max() as f64 / 1000.0
    );
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(1));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{}", i);
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            panic!()
        });
    }

    let args = Args::parse();
    println!("{:#?}", args);
    anyhow::ensure!(args.key_range > 0, "\"--key-range\" value must be greater than 0");
    anyhow::ensure!(
        args.value_size_min <= args.value_size_max,
        "\"--value-size-min\" must not be greater than \"--value-size-max\""
    );

    let map = MapBuilder::new()
        .with_concurrency(args.concurrency)
        .with_load_factor(args.load_factor)
        .with_initial_capacity(args.initial_capacity)
        .with_total_memory(args.memory * MIB)
        .with_eviction_stripes(args.stripes)
        .build()?;

    let stop = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let spawn = |f: fn(Map, Args, u64, Arc<AtomicBool>) -> Result<Stats>, seed: u64| {
        let (map, args, stop) = (map.clone(), args.clone(), stop.clone());
        std::thread::spawn(move || f(map, args, seed, stop))
    };
    let writers = (0..args.writers).map(|i| spawn(write, i as u64)).collect_vec();
    let readers = (0..args.readers)
        .map(|i| spawn(read, (args.writers + i) as u64))
        .collect_vec();

    std::thread::sleep(Duration::from_secs(args.time));
    stop.store(true, Ordering::Relaxed);

    let join = |handles: Vec<std::thread::JoinHandle<Result<Stats>>>| -> Result<Stats> {
        handles.into_iter().try_fold(Stats::new()?, |acc, handle| {
            let stats = handle
                .join()
                .map_err(|_| anyhow::anyhow!("bench thread panicked"))??;
            acc.merge(&stats)
        })
    };
    let write_stats = join(writers)?;
    let read_stats = join(readers)?;
    let elapsed = start.elapsed();

    report("put", &write_stats, elapsed);
    report("get", &read_stats, elapsed);

    println!("map:");
    println!("  size:             {}", map.size());
    println!("  allocated:        {}", ByteSize::b(map.allocated_size()));
    println!("  system allocated: {}", ByteSize::b(map.system_allocated_size()));
    println!("  lru size:         {}", map.lru_size());
    println!("  lru memory:       {}", ByteSize::b(map.lru_memory_size() as u64));

    map.destruct();

    Ok(())
}
