//! Epoch-based memory reclamation
//!
//! Readers bracket their accesses in an [`EpochScope`]; frees are
//! deferred onto the freeing CPU's list stamped with the global epoch.
//! A block is released only once every active scope entered at a
//! later epoch, so no reader can still hold a reference to it. A
//! per-CPU stale-item timer advances the epoch and drains lists in the
//! background; [`synchronize`] does the same on demand and waits for
//! the grace period.
//!
//! The runtime is process-wide and reference counted: every user
//! brackets its lifetime with [`initiate`], and the returned handle
//! terminates on drop. `terminate` must not run while scopes are open.

use core::alloc::Layout;
use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bpfrt_core::error::{BpfError, BpfResult};
use bpfrt_core::kdebug;
use bpfrt_core::spinlock::SpinLock;

use crate::platform::{self, CachePadded};
use crate::work_queue::{TimedWorkQueue, WakeupMode};

const CACHE_LINE_SIZE: usize = bpfrt_core::constants::CACHE_LINE_SIZE;
const DEFAULT_STALE_FLUSH_MS: u64 = 10;

/// Interval of the per-CPU stale-item timers. Overridable through
/// `BPFRT_EPOCH_FLUSH_MS`; read once per process.
fn stale_flush_interval() -> Duration {
    static INTERVAL: OnceLock<Duration> = OnceLock::new();
    *INTERVAL.get_or_init(|| {
        let millis = std::env::var("BPFRT_EPOCH_FLUSH_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|&millis| millis > 0)
            .unwrap_or(DEFAULT_STALE_FLUSH_MS);
        Duration::from_millis(millis)
    })
}

#[derive(Clone, Copy)]
struct AllocationHeader {
    size: usize,
    align: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocationHeader>();

fn data_offset(align: usize) -> usize {
    align.max(HEADER_SIZE)
}

fn allocation_layout(size: usize, align: usize) -> BpfResult<Layout> {
    let total = data_offset(align)
        .checked_add(size)
        .ok_or(BpfError::NoMemory)?;
    Layout::from_size_align(total, align.max(core::mem::align_of::<AllocationHeader>()))
        .map_err(|_| BpfError::InvalidArgument)
}

enum DeferredAction {
    Free { base: *mut u8, layout: Layout },
    Retire(Box<dyn Any + Send>),
}

// Safety: the raw base pointer is owned by the entry; nothing else
// frees it.
unsafe impl Send for DeferredAction {}

impl Drop for DeferredAction {
    fn drop(&mut self) {
        if let DeferredAction::Free { base, layout } = self {
            unsafe { std::alloc::dealloc(*base, *layout) };
        }
    }
}

struct DeferredEntry {
    release_epoch: u64,
    action: DeferredAction,
}

struct SlotState {
    active_scopes: u32,
    // Epoch observed when the slot went active; meaningless while idle.
    epoch: u64,
}

struct CpuSlot {
    state: SpinLock<SlotState>,
    free_list: SpinLock<VecDeque<DeferredEntry>>,
    timer_armed: AtomicBool,
}

struct EpochRuntime {
    // Drained and joined by the terminating thread; a stale worker
    // must never end up owning the last runtime reference, or its
    // queue destructor would join the worker from itself.
    workers: SpinLock<Vec<TimedWorkQueue<()>>>,
    epoch: AtomicU64,
    slots: Vec<CachePadded<CpuSlot>>,
}

impl EpochRuntime {
    /// Lower bound below which deferred entries are releasable: the
    /// minimum epoch over active slots, or one past the global epoch
    /// when no slot is active.
    fn release_bound(&self) -> u64 {
        let mut bound = self.epoch.load(Ordering::Acquire) + 1;
        for slot in &self.slots {
            let state = slot.state.lock();
            if state.active_scopes > 0 {
                bound = bound.min(state.epoch);
            }
        }
        bound
    }

    /// Release every eligible entry on `cpu`'s free list.
    fn release_eligible(&self, cpu: usize) {
        let bound = self.release_bound();
        let released = {
            let mut free_list = self.slots[cpu].free_list.lock();
            let mut released = Vec::new();
            while free_list
                .front()
                .is_some_and(|entry| entry.release_epoch < bound)
            {
                released.extend(free_list.pop_front());
            }
            released
        };
        if !released.is_empty() {
            kdebug!("epoch: cpu {} released {} entries", cpu, released.len());
        }
        // Entries drop (and free their memory) outside the list lock.
        drop(released);
    }

    fn stale_timer_fired(&self, cpu: usize) {
        let slot = &self.slots[cpu];
        slot.timer_armed.store(false, Ordering::Release);

        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.release_eligible(cpu);

        if !slot.free_list.lock().is_empty() {
            self.arm_stale_timer(cpu);
        }
    }

    fn arm_stale_timer(&self, cpu: usize) {
        if !self.slots[cpu].timer_armed.swap(true, Ordering::AcqRel) {
            // Empty during teardown; entries left behind are released
            // when the free lists drop.
            if let Some(queue) = self.workers.lock().get(cpu) {
                queue.insert((), WakeupMode::OnTimer);
            }
        }
    }

    fn defer(&self, action: DeferredAction) {
        let cpu = platform::current_cpu();
        let release_epoch = self.epoch.load(Ordering::Acquire);
        self.slots[cpu].free_list.lock().push_back(DeferredEntry {
            release_epoch,
            action,
        });
        self.arm_stale_timer(cpu);
    }
}

// The stale workers hold only a weak reference back to the runtime,
// so the runtime owning the queues is not a cycle.
fn new_runtime(cpu_count: usize) -> BpfResult<Arc<EpochRuntime>> {
    let mut worker_error = None;
    let runtime = Arc::new_cyclic(|weak: &Weak<EpochRuntime>| {
        let mut workers = Vec::with_capacity(cpu_count);
        for cpu in 0..cpu_count {
            let weak = weak.clone();
            match TimedWorkQueue::new(cpu, stale_flush_interval(), move |cpu_id, ()| {
                if let Some(runtime) = weak.upgrade() {
                    runtime.stale_timer_fired(cpu_id);
                }
            }) {
                Ok(queue) => workers.push(queue),
                Err(error) => {
                    worker_error = Some(error);
                }
            }
        }

        let slots = (0..cpu_count)
            .map(|_| {
                CachePadded::new(CpuSlot {
                    state: SpinLock::new(SlotState {
                        active_scopes: 0,
                        epoch: 0,
                    }),
                    free_list: SpinLock::new(VecDeque::new()),
                    timer_armed: AtomicBool::new(false),
                })
            })
            .collect();

        EpochRuntime {
            workers: SpinLock::new(workers),
            epoch: AtomicU64::new(1),
            slots,
        }
    });
    match worker_error {
        Some(error) => Err(error),
        None => Ok(runtime),
    }
}

struct RuntimeHolder {
    runtime: Option<Arc<EpochRuntime>>,
    references: usize,
}

fn holder() -> &'static Mutex<RuntimeHolder> {
    static HOLDER: OnceLock<Mutex<RuntimeHolder>> = OnceLock::new();
    HOLDER.get_or_init(|| {
        Mutex::new(RuntimeHolder {
            runtime: None,
            references: 0,
        })
    })
}

// Fast-path pointer to the live runtime; null while uninitialized.
static CURRENT: AtomicPtr<EpochRuntime> = AtomicPtr::new(core::ptr::null_mut());

fn current_runtime() -> BpfResult<&'static EpochRuntime> {
    let pointer = CURRENT.load(Ordering::Acquire);
    if pointer.is_null() {
        return Err(BpfError::InvalidArgument);
    }
    // Valid until the last terminate; callers must not outlive it.
    Ok(unsafe { &*pointer })
}

/// Keeps the epoch runtime initialized; terminates on drop.
pub struct EpochState {
    _private: (),
}

impl Drop for EpochState {
    fn drop(&mut self) {
        terminate();
    }
}

/// Initialize (or share) the process-wide epoch runtime.
pub fn initiate() -> BpfResult<EpochState> {
    let mut holder = match holder().lock() {
        Ok(holder) => holder,
        Err(poisoned) => poisoned.into_inner(),
    };
    if holder.runtime.is_none() {
        let runtime = new_runtime(platform::cpu_count())?;
        CURRENT.store(Arc::as_ptr(&runtime) as *mut _, Ordering::Release);
        holder.runtime = Some(runtime);
    }
    holder.references += 1;
    Ok(EpochState { _private: () })
}

fn terminate() {
    let runtime = {
        let mut holder = match holder().lock() {
            Ok(holder) => holder,
            Err(poisoned) => poisoned.into_inner(),
        };
        holder.references -= 1;
        if holder.references > 0 {
            return;
        }
        CURRENT.store(core::ptr::null_mut(), Ordering::Release);
        holder.runtime.take()
    };
    let Some(runtime) = runtime else {
        return;
    };
    // Join the workers here while this thread still holds a strong
    // reference. A timer callback holds an upgraded reference for its
    // duration; were it the last one, the runtime would be dropped on
    // the worker thread and the queue destructor would join itself.
    let workers = std::mem::take(&mut *runtime.workers.lock());
    drop(workers);
    // Now the sole reference; the free lists drop and release every
    // remaining entry.
    drop(runtime);
}

/// An open epoch scope. Memory observed inside it is not released
/// until after it exits. Scopes are thread-bound.
pub struct EpochScope {
    runtime: *const EpochRuntime,
    cpu: usize,
}

impl EpochScope {
    #[inline]
    pub(crate) fn cpu(&self) -> usize {
        self.cpu
    }
}

/// Enter an epoch scope on the calling thread's CPU.
pub fn enter() -> BpfResult<EpochScope> {
    let runtime = current_runtime()?;
    let cpu = platform::current_cpu();
    {
        let mut state = runtime.slots[cpu].state.lock();
        if state.active_scopes == 0 {
            state.epoch = runtime.epoch.load(Ordering::Acquire);
        }
        state.active_scopes += 1;
    }
    Ok(EpochScope {
        runtime: runtime as *const _,
        cpu,
    })
}

impl Drop for EpochScope {
    fn drop(&mut self) {
        let runtime = unsafe { &*self.runtime };
        let now_idle = {
            let mut state = runtime.slots[self.cpu].state.lock();
            state.active_scopes -= 1;
            state.active_scopes == 0
        };
        if now_idle && !runtime.slots[self.cpu].free_list.lock().is_empty() {
            runtime.release_eligible(self.cpu);
        }
    }
}

/// Allocate `size` zeroed bytes whose release goes through the epoch.
pub fn allocate(size: usize) -> BpfResult<*mut u8> {
    allocate_with_align(size, 8)
}

/// As [`allocate`], but aligned to a cache line.
pub fn allocate_cache_aligned(size: usize) -> BpfResult<*mut u8> {
    allocate_with_align(size, CACHE_LINE_SIZE)
}

fn allocate_with_align(size: usize, align: usize) -> BpfResult<*mut u8> {
    if size == 0 {
        return Err(BpfError::InvalidArgument);
    }
    let layout = allocation_layout(size, align)?;
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return Err(BpfError::NoMemory);
    }
    let data = unsafe { base.add(data_offset(align)) };
    unsafe {
        data.sub(HEADER_SIZE)
            .cast::<AllocationHeader>()
            .write_unaligned(AllocationHeader { size, align });
    }
    Ok(data)
}

/// Defer the release of a block from [`allocate`] until no epoch
/// scope can still observe it.
///
/// # Safety
///
/// `pointer` must come from [`allocate`] or [`allocate_cache_aligned`]
/// and must not be freed twice or touched after this call by the
/// owner.
pub unsafe fn free(pointer: *mut u8) {
    let header = pointer
        .sub(HEADER_SIZE)
        .cast::<AllocationHeader>()
        .read_unaligned();
    let offset = data_offset(header.align);
    let base = pointer.sub(offset);
    let layout = match allocation_layout(header.size, header.align) {
        Ok(layout) => layout,
        Err(_) => return,
    };

    match current_runtime() {
        Ok(runtime) => runtime.defer(DeferredAction::Free { base, layout }),
        // No runtime means no scopes can exist; release immediately.
        Err(_) => std::alloc::dealloc(base, layout),
    }
}

/// Defer dropping `value` until no epoch scope can still observe it.
pub fn retire<T: Any + Send>(value: Box<T>) {
    match current_runtime() {
        Ok(runtime) => runtime.defer(DeferredAction::Retire(value)),
        Err(_) => drop(value),
    }
}

/// Advance the epoch and wait for a full grace period, then drain
/// every CPU's eligible entries.
///
/// Must not be called while the calling thread holds a scope.
pub fn synchronize() -> BpfResult {
    let runtime = current_runtime()?;
    let target = runtime.epoch.fetch_add(1, Ordering::AcqRel) + 1;

    loop {
        let all_observed = runtime.slots.iter().all(|slot| {
            let state = slot.state.lock();
            state.active_scopes == 0 || state.epoch >= target
        });
        if all_observed {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    for cpu in 0..runtime.slots.len() {
        runtime.release_eligible(cpu);
    }
    Ok(())
}

/// True if `cpu`'s free list holds no pending entries.
pub fn is_free_list_empty(cpu: usize) -> BpfResult<bool> {
    let runtime = current_runtime()?;
    if cpu >= runtime.slots.len() {
        return Err(BpfError::InvalidArgument);
    }
    Ok(runtime.slots[cpu].free_list.lock().is_empty())
}
