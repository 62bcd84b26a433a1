//! Per-execution-context state slots
//!
//! Extensions reserve a slot index once at startup and then read and
//! write a pointer-sized value in whatever execution-context carrier
//! the caller threads through. Indices are process-global, handed out
//! by a bump counter, and never recycled.

use crate::constants::MAX_STATE_SLOTS;
use crate::error::{BpfError, BpfResult};
use crate::spinlock::SpinLock;

/// Opaque carrier for slot values, owned by the execution context.
#[derive(Debug, Clone)]
pub struct ExecutionContextState {
    slots: [usize; MAX_STATE_SLOTS],
}

impl ExecutionContextState {
    pub fn new() -> Self {
        ExecutionContextState {
            slots: [0; MAX_STATE_SLOTS],
        }
    }
}

impl Default for ExecutionContextState {
    fn default() -> Self {
        ExecutionContextState::new()
    }
}

static NEXT_INDEX: SpinLock<usize> = SpinLock::new(0);

/// Reserve a unique slot index.
///
/// Fails with `OutOfSpace` once all slots are taken; indices are not
/// returned for the life of the process.
pub fn allocate_index() -> BpfResult<usize> {
    let mut next = NEXT_INDEX.lock();
    if *next >= MAX_STATE_SLOTS {
        return Err(BpfError::OutOfSpace);
    }
    let index = *next;
    *next += 1;
    Ok(index)
}

/// Write `value` into slot `index` of the given carrier.
pub fn store(index: usize, value: usize, state: &mut ExecutionContextState) -> BpfResult {
    let slot = state
        .slots
        .get_mut(index)
        .ok_or(BpfError::InvalidArgument)?;
    *slot = value;
    Ok(())
}

/// Read slot `index` of the given carrier.
pub fn load(index: usize, state: &ExecutionContextState) -> BpfResult<usize> {
    state
        .slots
        .get(index)
        .copied()
        .ok_or(BpfError::InvalidArgument)
}
