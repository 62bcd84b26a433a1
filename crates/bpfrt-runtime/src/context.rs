//! Program-context data access
//!
//! A program context is an opaque struct whose layout is described by
//! a [`ContextDescriptor`] packed into the u64 immediately preceding
//! the context pointer. The descriptor names the offsets of the
//! `data` and `data_end` pointer fields; this module is the single
//! checked accessor through which the runtime reads the packet range
//! out of a context, bounded by the descriptor's stated size.

use bpfrt_core::error::{BpfError, BpfResult};
use bpfrt_core::serialize::ContextDescriptor;

/// Offset value meaning "this field is absent".
pub const CONTEXT_FIELD_ABSENT: i16 = -1;

/// Pack a descriptor into the context header word.
pub fn pack_descriptor(descriptor: &ContextDescriptor) -> u64 {
    u64::from(descriptor.size)
        | (u64::from(descriptor.data as u16) << 16)
        | (u64::from(descriptor.end as u16) << 32)
        | (u64::from(descriptor.meta as u16) << 48)
}

/// Unpack the context header word.
pub fn unpack_descriptor(word: u64) -> ContextDescriptor {
    ContextDescriptor {
        size: word as u16,
        data: (word >> 16) as u16 as i16,
        end: (word >> 32) as u16 as i16,
        meta: (word >> 48) as u16 as i16,
    }
}

/// Read `capture_length` bytes of the packet data a context points at.
///
/// Fails with `OperationNotSupported` if the context's type has no
/// data pointer, and with `InvalidArgument` if the descriptor offsets
/// fall outside the context, the data range is empty, or it is
/// shorter than the capture.
///
/// # Safety
///
/// `context` must point at a live context struct directly preceded by
/// its packed descriptor word, as produced by the program dispatch
/// path; the `data`/`data_end` fields must either be null or point at
/// a readable range.
pub unsafe fn read_context_data<'a>(
    context: *const u8,
    capture_length: usize,
) -> BpfResult<&'a [u8]> {
    if context.is_null() {
        return Err(BpfError::InvalidArgument);
    }
    let descriptor = unpack_descriptor(context.cast::<u64>().sub(1).read_unaligned());

    if descriptor.data == CONTEXT_FIELD_ABSENT {
        return Err(BpfError::OperationNotSupported);
    }
    let pointer_size = core::mem::size_of::<*const u8>() as i64;
    let size = i64::from(descriptor.size);
    let data_offset = i64::from(descriptor.data);
    let end_offset = i64::from(descriptor.end);
    if descriptor.end == CONTEXT_FIELD_ABSENT
        || data_offset < 0
        || end_offset < 0
        || data_offset + pointer_size > size
        || end_offset + pointer_size > size
    {
        return Err(BpfError::InvalidArgument);
    }

    let data = context
        .add(data_offset as usize)
        .cast::<*const u8>()
        .read_unaligned();
    let data_end = context
        .add(end_offset as usize)
        .cast::<*const u8>()
        .read_unaligned();

    if data.is_null() || data_end <= data {
        return Err(BpfError::InvalidArgument);
    }
    let available = data_end as usize - data as usize;
    if capture_length > available {
        return Err(BpfError::InvalidArgument);
    }
    Ok(core::slice::from_raw_parts(data, capture_length))
}
