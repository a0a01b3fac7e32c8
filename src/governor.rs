//! Resource Governor: samples CPU and process memory, drives an adaptive
//! concurrency limit, and owns a bounded TTL cache.
//!
//! The governor never raises an error under pressure; it throttles, evicts
//! and, at worst, pauses work until utilization recovers.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Pressure state derived each tick from CPU and memory samples. The more
/// severe of the two derived states wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureState {
    Normal,
    Warning,
    Critical,
}

/// One resource measurement. Recomputed every tick, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    /// CPU utilization across all cores, 0-100.
    pub cpu_percent: f32,
    /// Process resident memory in bytes.
    pub memory_bytes: u64,
    pub taken_at: Instant,
}

/// Governor configuration. Defaults follow the engine's standard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Sampling tick interval.
    pub tick_interval_ms: u64,
    /// CPU below this scales concurrency up (percent).
    pub cpu_scale_up: f32,
    /// CPU above this scales concurrency down / enters warning (percent).
    pub cpu_warning: f32,
    /// CPU at or above this pauses work entirely / enters critical (percent).
    pub cpu_critical: f32,
    /// Memory ceiling in bytes.
    pub memory_limit_bytes: u64,
    /// Heap sub-limit in bytes.
    pub heap_limit_bytes: u64,
    /// Fraction of the ceiling that enters warning.
    pub memory_warning_fraction: f32,
    /// Fraction of the ceiling that enters critical.
    pub memory_critical_fraction: f32,
    /// Concurrency bounds.
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Cache bounds.
    pub cache_max_entries: usize,
    pub cache_max_bytes: usize,
    pub cache_ttl_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            cpu_scale_up: 30.0,
            cpu_warning: 50.0,
            cpu_critical: 80.0,
            memory_limit_bytes: 500 * 1024 * 1024,
            heap_limit_bytes: 256 * 1024 * 1024,
            memory_warning_fraction: 0.80,
            memory_critical_fraction: 0.95,
            min_concurrency: 1,
            max_concurrency: 4,
            cache_max_entries: 100,
            cache_max_bytes: 50 * 1024 * 1024,
            cache_ttl_ms: 5 * 60 * 1_000,
        }
    }
}

/// A cached value with its insertion time and size estimate.
#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    value: serde_json::Value,
    inserted_at: Instant,
    size_estimate: usize,
}

/// Capacity- and TTL-bounded cache owned by the governor.
///
/// Inserts evict the oldest entry on overflow; a periodic sweep removes
/// TTL-expired entries; an emergency sweep removes roughly half of all
/// entries when resources turn critical.
#[derive(Debug)]
pub struct BoundedCache {
    entries: VecDeque<CacheEntry>,
    total_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    ttl: Duration,
}

impl BoundedCache {
    fn new(max_entries: usize, max_bytes: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            total_bytes: 0,
            max_entries,
            max_bytes,
            ttl,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.remove(&key);
        let size_estimate = value.to_string().len() + key.len();
        self.entries.push_back(CacheEntry {
            key,
            value,
            inserted_at: Instant::now(),
            size_estimate,
        });
        self.total_bytes += size_estimate;
        while self.entries.len() > self.max_entries || self.total_bytes > self.max_bytes {
            if let Some(oldest) = self.entries.pop_front() {
                self.total_bytes -= oldest.size_estimate;
                debug!(key = %oldest.key, "evicted oldest cache entry");
            } else {
                break;
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries
            .iter()
            .find(|e| e.key == key && e.inserted_at.elapsed() < self.ttl)
            .map(|e| &e.value)
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            let removed = self.entries.remove(pos);
            if let Some(entry) = removed {
                self.total_bytes -= entry.size_estimate;
            }
        }
    }

    /// Remove TTL-expired entries.
    pub fn sweep_expired(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|e| e.inserted_at.elapsed() < ttl);
        self.total_bytes = self.entries.iter().map(|e| e.size_estimate).sum();
        before - self.entries.len()
    }

    /// Drop roughly the oldest half of all entries and release spare
    /// capacity. Last-resort valve for critical pressure.
    pub fn emergency_sweep(&mut self) -> usize {
        let drop_count = self.entries.len().div_ceil(2);
        for _ in 0..drop_count {
            if let Some(oldest) = self.entries.pop_front() {
                self.total_bytes -= oldest.size_estimate;
            }
        }
        self.entries.shrink_to_fit();
        drop_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

/// Translates live CPU/memory pressure into a concurrency limit and a
/// cache eviction policy.
pub struct ResourceGovernor {
    cfg: GovernorConfig,
    system: System,
    state: PressureState,
    /// Current concurrency limit; 0 means paused.
    concurrency: usize,
    last_sample: Option<ResourceSample>,
    cache: BoundedCache,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("state", &self.state)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl ResourceGovernor {
    pub fn new(cfg: GovernorConfig) -> Self {
        let cache = BoundedCache::new(
            cfg.cache_max_entries,
            cfg.cache_max_bytes,
            Duration::from_millis(cfg.cache_ttl_ms),
        );
        let concurrency = cfg.min_concurrency;
        Self {
            cfg,
            system: System::new(),
            state: PressureState::Normal,
            concurrency,
            last_sample: None,
            cache,
        }
    }

    /// Take a live CPU/memory sample for this process.
    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        let cpu_percent = self.system.global_cpu_usage();
        let memory_bytes = match sysinfo::get_current_pid() {
            Ok(pid) => {
                self.system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
                self.system.process(pid).map_or(0, sysinfo::Process::memory)
            }
            Err(_) => 0,
        };
        ResourceSample {
            cpu_percent,
            memory_bytes,
            taken_at: Instant::now(),
        }
    }

    /// One governor tick with a live sample.
    pub fn tick(&mut self) {
        let sample = self.sample();
        self.apply_sample(sample);
    }

    /// One governor tick with an injected sample (deterministic for tests
    /// and for hosts that meter resources themselves).
    pub fn apply_sample(&mut self, sample: ResourceSample) {
        let cpu_state = if sample.cpu_percent >= self.cfg.cpu_critical {
            PressureState::Critical
        } else if sample.cpu_percent >= self.cfg.cpu_warning {
            PressureState::Warning
        } else {
            PressureState::Normal
        };

        let memory_fraction = sample.memory_bytes as f32 / self.cfg.memory_limit_bytes as f32;
        let memory_state = if memory_fraction >= self.cfg.memory_critical_fraction {
            PressureState::Critical
        } else if memory_fraction >= self.cfg.memory_warning_fraction {
            PressureState::Warning
        } else {
            PressureState::Normal
        };

        let new_state = cpu_state.max(memory_state);
        if new_state != self.state {
            info!(?new_state, cpu = sample.cpu_percent, "resource state changed");
        }

        // Adaptive concurrency: scale up under light load, down under heavy,
        // clamp to zero above the hard pause threshold.
        if sample.cpu_percent >= self.cfg.cpu_critical {
            if self.concurrency > 0 {
                warn!(cpu = sample.cpu_percent, "pausing work, CPU above pause threshold");
            }
            self.concurrency = 0;
        } else if sample.cpu_percent >= self.cfg.cpu_warning {
            self.concurrency = self
                .concurrency
                .saturating_sub(1)
                .max(self.cfg.min_concurrency);
        } else if sample.cpu_percent < self.cfg.cpu_scale_up {
            self.concurrency = (self.concurrency + 1).min(self.cfg.max_concurrency);
        } else if self.concurrency == 0 {
            // Recovered from pause but not yet light enough to grow
            self.concurrency = self.cfg.min_concurrency;
        }

        if new_state == PressureState::Critical && self.state != PressureState::Critical {
            let dropped = self.cache.emergency_sweep();
            warn!(dropped, "critical pressure: emergency cache sweep");
        } else {
            self.cache.sweep_expired();
        }

        self.state = new_state;
        self.last_sample = Some(sample);
    }

    /// Non-blocking capacity check.
    pub fn can_proceed(&self) -> bool {
        self.concurrency > 0
    }

    /// Current concurrency limit (0 = paused).
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn state(&self) -> PressureState {
        self.state
    }

    pub fn last_sample(&self) -> Option<&ResourceSample> {
        self.last_sample.as_ref()
    }

    /// Wait until capacity is available, re-sampling each tick interval.
    ///
    /// Bounded: gives up after `max_waits` ticks and returns `false`.
    pub async fn wait_for_capacity(&mut self, max_waits: u32) -> bool {
        for _ in 0..max_waits {
            if self.can_proceed() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.tick_interval_ms)).await;
            self.tick();
        }
        self.can_proceed()
    }

    pub fn cache(&mut self) -> &mut BoundedCache {
        &mut self.cache
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.cfg
    }
}
