//! # bpfrt-runtime
//!
//! Platform-backed half of the bpfrt substrate.
//!
//! This crate provides:
//! - CPU topology, affinity pinning, and the deferred dispatch level
//! - Page-granular mappings and the double-mapped ring trick
//! - Epoch-based memory reclamation with per-CPU free lists
//! - The epoch-protected concurrent hash table
//! - SPSC ring buffers and the per-CPU perf event array
//! - Per-CPU timed work queues

#![allow(dead_code)]

pub mod context;
pub mod epoch;
pub mod hash_table;
pub mod memory;
pub mod perf_event_array;
pub mod platform;
pub mod ring_buffer;
pub mod work_queue;

// Re-exports
pub use context::read_context_data;
pub use epoch::{EpochScope, EpochState};
pub use hash_table::{HashTable, HashTableOptions, UpdateMode};
pub use memory::{DoubleMapping, PageBuffer};
pub use perf_event_array::{PerfEventArray, CURRENT_CPU};
pub use platform::{CachePadded, DispatchGuard};
pub use ring_buffer::{RingBuffer, RingRecord, RingReservation};
pub use work_queue::{TimedWorkQueue, WakeupMode};
