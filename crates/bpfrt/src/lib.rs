//! # bpfrt
//!
//! Facade crate for the bpfrt eBPF runtime substrate. Re-exports the
//! platform-agnostic primitives from `bpfrt-core` and the
//! platform-backed services from `bpfrt-runtime` under one roof.
//!
//! ```no_run
//! use bpfrt::{epoch, HashTable, HashTableOptions, UpdateMode};
//!
//! let _state = epoch::initiate().unwrap();
//! let table = HashTable::new(HashTableOptions {
//!     key_size: 4,
//!     value_size: 8,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! table.update(b"key1", b"value_01", UpdateMode::Insert).unwrap();
//! let scope = epoch::enter().unwrap();
//! assert_eq!(table.find(&scope, b"key1").unwrap(), b"value_01");
//! ```

pub use bpfrt_core::{
    async_tracker::{self, AsyncTracker},
    bitmap::Bitmap,
    constants,
    error::{self, BpfError, BpfResult},
    kprint,
    object::{ObjectRef, ObjectType},
    pinning::PinningTable,
    random,
    serialize,
    spinlock::SpinLock,
    state,
};

pub use bpfrt_core::{kdebug, kerror, kinfo, klog, kwarn};

pub use bpfrt_runtime::{
    context, epoch, memory, platform, work_queue, EpochScope, EpochState, HashTable,
    HashTableOptions, PerfEventArray, RingBuffer, RingRecord, RingReservation, TimedWorkQueue,
    UpdateMode, WakeupMode, CURRENT_CPU,
};
