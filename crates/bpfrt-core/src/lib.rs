//! # bpfrt-core
//!
//! Core primitives for the bpfrt eBPF runtime substrate.
//!
//! This crate is platform-agnostic: everything that needs an OS service
//! (CPU topology, page mappings, epoch reclamation) lives in
//! `bpfrt-runtime`.
//!
//! ## Modules
//!
//! - `error` - result codes and the host errno mapping
//! - `spinlock` - internal spinlock primitive
//! - `bitmap` - dense bit set with cursor search
//! - `random` - uniform 32-bit PRNG
//! - `async_tracker` - pending/complete/cancel request lifetime
//! - `object` - reference-counted core objects and id tracking
//! - `pinning` - name to object pinning table
//! - `state` - per-execution-context slot table
//! - `serialize` - map-info and program-info descriptor marshalling
//! - `kprint` - kernel-style debug printing macros

#![allow(dead_code)]

pub mod async_tracker;
pub mod bitmap;
pub mod error;
pub mod kprint;
pub mod object;
pub mod pinning;
pub mod random;
pub mod serialize;
pub mod spinlock;
pub mod state;

// Re-exports for convenience
pub use bitmap::Bitmap;
pub use error::{BpfError, BpfResult};
pub use object::{ObjectRef, ObjectType};
pub use pinning::PinningTable;
pub use serialize::{ContextDescriptor, Guid, HelperPrototype, MapInfo, ProgramInfo};
pub use spinlock::SpinLock;
pub use state::ExecutionContextState;

/// Constants shared across the substrate.
pub mod constants {
    /// Cache line size for alignment.
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Maximum length of a pinning name in bytes.
    pub const MAX_PIN_NAME_LENGTH: usize = 255;

    /// Maximum length of a pin path carried by a serialized map-info
    /// entry, including the terminator of the deserialized form.
    pub const MAX_PIN_PATH_LENGTH: usize = 256;

    /// Maximum length of a program or helper function name.
    pub const MAX_NAME_LENGTH: usize = 64;

    /// Number of pointer-sized slots in an execution-context state.
    pub const MAX_STATE_SLOTS: usize = 64;
}
