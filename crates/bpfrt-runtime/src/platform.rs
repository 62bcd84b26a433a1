//! CPU topology and scheduling primitives
//!
//! The substrate assumes a fixed CPU count for the life of the
//! process; per-CPU structures are sized once from it. Affinity
//! pinning and the deferred dispatch level are real on Linux and
//! degrade to safe approximations elsewhere.

use core::cell::Cell;
use core::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use bpfrt_core::error::{BpfError, BpfResult};

/// Number of CPUs, sampled once per process.
pub fn cpu_count() -> usize {
    static CPU_COUNT: OnceLock<usize> = OnceLock::new();
    *CPU_COUNT.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// CPU the calling thread is executing on.
        pub fn current_cpu() -> usize {
            // sched_getcpu only fails on ancient kernels.
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu < 0 {
                0
            } else {
                (cpu as usize).min(cpu_count() - 1)
            }
        }
    } else {
        /// CPU the calling thread is executing on.
        ///
        /// Without a usable getcpu this reports 0; per-CPU structures
        /// still work, they just collapse onto one slot.
        pub fn current_cpu() -> usize {
            0
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Restores the thread's previous affinity mask when dropped.
        #[derive(Debug)]
        pub struct AffinityGuard {
            previous: nix::sched::CpuSet,
        }

        impl Drop for AffinityGuard {
            fn drop(&mut self) {
                let _ = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &self.previous);
            }
        }

        /// Pin the calling thread to `cpu`.
        pub fn pin_to_cpu(cpu: usize) -> BpfResult<AffinityGuard> {
            if cpu >= cpu_count() {
                return Err(BpfError::InvalidArgument);
            }
            let pid = nix::unistd::Pid::from_raw(0);
            let previous =
                nix::sched::sched_getaffinity(pid).map_err(|_| BpfError::InvalidArgument)?;
            let mut target = nix::sched::CpuSet::new();
            target.set(cpu).map_err(|_| BpfError::InvalidArgument)?;
            nix::sched::sched_setaffinity(pid, &target)
                .map_err(|_| BpfError::InvalidArgument)?;
            Ok(AffinityGuard { previous })
        }
    } else {
        /// Affinity is advisory off Linux; the guard is a placeholder.
        #[derive(Debug)]
        pub struct AffinityGuard {
            _private: (),
        }

        /// Validate `cpu` and succeed without changing affinity.
        pub fn pin_to_cpu(cpu: usize) -> BpfResult<AffinityGuard> {
            if cpu >= cpu_count() {
                return Err(BpfError::InvalidArgument);
            }
            Ok(AffinityGuard { _private: () })
        }
    }
}

thread_local! {
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the calling thread as running at the deferred dispatch
/// level until dropped. Nests.
pub struct DispatchGuard {
    _private: (),
}

/// Raise the calling thread to the deferred dispatch level.
///
/// Code at this level must not block or take page faults on user
/// memory; the marker is advisory and lets assertions catch misuse.
pub fn raise_to_dispatch() -> DispatchGuard {
    DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
    DispatchGuard { _private: () }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// True while the calling thread holds a [`DispatchGuard`].
pub fn at_dispatch_level() -> bool {
    DISPATCH_DEPTH.with(|depth| depth.get() > 0)
}

/// Pads and aligns a value to a cache line to stop false sharing
/// between per-CPU slots.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        CachePadded { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_count_stable() {
        let first = cpu_count();
        assert!(first >= 1);
        assert_eq!(cpu_count(), first);
    }

    #[test]
    fn test_current_cpu_in_range() {
        assert!(current_cpu() < cpu_count());
    }

    #[test]
    fn test_pin_out_of_range() {
        assert_eq!(
            pin_to_cpu(cpu_count() + 64).unwrap_err(),
            BpfError::InvalidArgument
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_and_restore() {
        let guard = pin_to_cpu(0).unwrap();
        assert_eq!(current_cpu(), 0);
        drop(guard);
    }

    #[test]
    fn test_dispatch_level_nests() {
        assert!(!at_dispatch_level());
        let outer = raise_to_dispatch();
        assert!(at_dispatch_level());
        {
            let _inner = raise_to_dispatch();
            assert!(at_dispatch_level());
        }
        assert!(at_dispatch_level());
        drop(outer);
        assert!(!at_dispatch_level());
    }

    #[test]
    fn test_cache_padded_alignment() {
        assert_eq!(core::mem::align_of::<CachePadded<u8>>(), 64);
        let padded = CachePadded::new(7u32);
        assert_eq!(*padded, 7);
    }
}
