//! Per-CPU perf event array
//!
//! One ring buffer per CPU; a producer only ever writes the ring of
//! the CPU it is running on, which is what makes the rings
//! single-producer without any cross-CPU locking. The output flags
//! select the target ring and may request that a slice of the
//! program's packet data be captured after the payload.

use std::sync::atomic::{AtomicU64, Ordering};

use bpfrt_core::error::{BpfError, BpfResult};

use crate::context::read_context_data;
use crate::platform::{self, CachePadded};
use crate::ring_buffer::{RingBuffer, RingRecord};

/// Flag value selecting the caller's current CPU.
pub const CURRENT_CPU: u64 = 0xFFFF_FFFF;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const CTXLEN_SHIFT: u32 = 32;
const CTXLEN_MASK: u64 = 0xFFFF << CTXLEN_SHIFT;

const MINIMUM_RING_SIZE: usize = 4096;

/// Per-CPU array of SPSC rings.
pub struct PerfEventArray {
    rings: Vec<RingBuffer>,
    lost: Vec<CachePadded<AtomicU64>>,
}

impl PerfEventArray {
    /// Create an array whose total capacity is split across one ring
    /// per CPU, each rounded up to a power of two of at least a page.
    pub fn new(total_size: usize) -> BpfResult<Self> {
        if total_size == 0 {
            return Err(BpfError::InvalidArgument);
        }
        let cpu_count = platform::cpu_count();
        let per_cpu = (total_size / cpu_count)
            .next_power_of_two()
            .max(MINIMUM_RING_SIZE);

        let mut rings = Vec::with_capacity(cpu_count);
        let mut lost = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            rings.push(RingBuffer::new(per_cpu)?);
            lost.push(CachePadded::new(AtomicU64::new(0)));
        }
        Ok(PerfEventArray { rings, lost })
    }

    #[inline]
    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    /// The ring owned by `cpu`, for the consumer side.
    pub fn ring(&self, cpu: usize) -> BpfResult<&RingBuffer> {
        self.rings.get(cpu).ok_or(BpfError::InvalidArgument)
    }

    /// Consumer view of `cpu`'s ring.
    pub fn map_buffer(&self, cpu: usize) -> BpfResult<*const u8> {
        Ok(self.ring(cpu)?.map_buffer())
    }

    /// `(consumer, producer)` offsets of `cpu`'s ring.
    pub fn query(&self, cpu: usize) -> BpfResult<(u64, u64)> {
        Ok(self.ring(cpu)?.query())
    }

    /// Next committed record in `cpu`'s ring.
    pub fn next_record(&self, cpu: usize) -> BpfResult<Option<RingRecord<'_>>> {
        Ok(self.ring(cpu)?.next_record())
    }

    /// Advance `cpu`'s consumer offset.
    pub fn return_bytes(&self, cpu: usize, bytes: u64) -> BpfResult {
        self.ring(cpu)?.return_bytes(bytes)
    }

    /// Number of records dropped on `cpu` because its ring was full.
    pub fn lost_count(&self, cpu: usize) -> BpfResult<u64> {
        self.ring(cpu)?;
        Ok(self.lost[cpu].load(Ordering::Relaxed))
    }

    fn target_ring(&self, flags: u64) -> BpfResult<usize> {
        if flags & !(INDEX_MASK | CTXLEN_MASK) != 0 {
            return Err(BpfError::InvalidArgument);
        }
        let current = platform::current_cpu();
        let index = match flags & INDEX_MASK {
            CURRENT_CPU => current,
            target => target as usize,
        };
        // Writing another CPU's ring would break the SPSC contract.
        if index != current || index >= self.rings.len() {
            return Err(BpfError::InvalidArgument);
        }
        Ok(index)
    }

    /// Write `data` to the ring selected by `flags`.
    ///
    /// Fails with `InvalidArgument` if the flags request context
    /// capture; use [`output_with_context`](Self::output_with_context)
    /// for that.
    pub fn output(&self, flags: u64, data: &[u8]) -> BpfResult {
        if flags & CTXLEN_MASK != 0 {
            return Err(BpfError::InvalidArgument);
        }
        let index = self.target_ring(flags)?;
        let result = self.rings[index].output(data);
        if result == Err(BpfError::OutOfSpace) {
            self.lost[index].fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Write `data` to the ring selected by `flags`, appending the
    /// requested number of packet bytes read through `context`.
    ///
    /// # Safety
    ///
    /// `context` must satisfy the contract of
    /// [`read_context_data`]; it is only dereferenced when the flags
    /// carry a nonzero capture length.
    pub unsafe fn output_with_context(
        &self,
        context: *const u8,
        flags: u64,
        data: &[u8],
    ) -> BpfResult {
        let capture_length = ((flags & CTXLEN_MASK) >> CTXLEN_SHIFT) as usize;
        if capture_length == 0 {
            return self.output(flags, data);
        }
        let index = self.target_ring(flags)?;
        let captured = read_context_data(context, capture_length)?;

        let mut reservation = match self.rings[index].reserve(data.len() + capture_length) {
            Ok(reservation) => reservation,
            Err(error) => {
                if error == BpfError::OutOfSpace {
                    self.lost[index].fetch_add(1, Ordering::Relaxed);
                }
                return Err(error);
            }
        };
        let buffer = reservation.data();
        buffer[..data.len()].copy_from_slice(data);
        buffer[data.len()..].copy_from_slice(captured);
        reservation.submit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::TestContext;
    use crate::context::CONTEXT_FIELD_ABSENT;
    use bpfrt_core::serialize::ContextDescriptor;

    fn flags_with_capture(target: u64, capture: u16) -> u64 {
        target | (u64::from(capture) << CTXLEN_SHIFT)
    }

    #[test]
    fn test_output_to_current_cpu() {
        let _affinity = platform::pin_to_cpu(0).unwrap();
        let array = PerfEventArray::new(64 * 1024).unwrap();
        array.output(CURRENT_CPU, &[0x11; 10]).unwrap();

        let cpu = platform::current_cpu();
        let (consumer, producer) = array.query(cpu).unwrap();
        assert_eq!(producer - consumer, 24);

        let record = array.next_record(cpu).unwrap().unwrap();
        assert_eq!(record.payload(), &[0x11; 10]);
    }

    #[test]
    fn test_output_to_other_cpu_rejected() {
        let _affinity = platform::pin_to_cpu(0).unwrap();
        let array = PerfEventArray::new(64 * 1024).unwrap();
        let other = if array.ring_count() > 1 {
            1
        } else {
            // Out of range altogether on a single-CPU host.
            7
        };
        assert_eq!(array.output(other, &[0; 4]), Err(BpfError::InvalidArgument));
    }

    #[test]
    fn test_reserved_flag_bits_rejected() {
        let array = PerfEventArray::new(64 * 1024).unwrap();
        assert_eq!(
            array.output(CURRENT_CPU | 1 << 60, &[0; 4]),
            Err(BpfError::InvalidArgument)
        );
    }

    #[test]
    fn test_capture_appends_packet_bytes() {
        let _affinity = platform::pin_to_cpu(0).unwrap();
        let array = PerfEventArray::new(64 * 1024).unwrap();
        let context = TestContext::new(
            b"packet-bytes",
            ContextDescriptor {
                size: 24,
                data: 0,
                end: 8,
                meta: CONTEXT_FIELD_ABSENT,
            },
        );

        let flags = flags_with_capture(CURRENT_CPU, 6);
        unsafe {
            array
                .output_with_context(context.context_ptr(), flags, b"head")
                .unwrap();
        }

        let cpu = platform::current_cpu();
        let record = array.next_record(cpu).unwrap().unwrap();
        assert_eq!(record.payload(), b"headpacket");
    }

    #[test]
    fn test_capture_without_data_pointer() {
        let array = PerfEventArray::new(64 * 1024).unwrap();
        let context = TestContext::new(
            b"unused",
            ContextDescriptor {
                size: 24,
                data: CONTEXT_FIELD_ABSENT,
                end: CONTEXT_FIELD_ABSENT,
                meta: CONTEXT_FIELD_ABSENT,
            },
        );
        let flags = flags_with_capture(CURRENT_CPU, 4);
        assert_eq!(
            unsafe { array.output_with_context(context.context_ptr(), flags, b"x") },
            Err(BpfError::OperationNotSupported)
        );
    }

    #[test]
    fn test_plain_output_rejects_capture_flags() {
        let array = PerfEventArray::new(64 * 1024).unwrap();
        assert_eq!(
            array.output(flags_with_capture(CURRENT_CPU, 4), &[0; 4]),
            Err(BpfError::InvalidArgument)
        );
    }

    #[test]
    fn test_full_ring_counts_lost_records() {
        let _affinity = platform::pin_to_cpu(0).unwrap();
        let array = PerfEventArray::new(1).unwrap();
        let cpu = platform::current_cpu();
        assert_eq!(array.lost_count(cpu).unwrap(), 0);

        let payload = [0x33u8; 1016];
        while array.output(CURRENT_CPU, &payload).is_ok() {}
        assert_eq!(
            array.output(CURRENT_CPU, &payload),
            Err(BpfError::OutOfSpace)
        );
        assert_eq!(array.lost_count(cpu).unwrap(), 2);
        assert!(array.lost_count(array.ring_count()).is_err());
    }

    #[test]
    fn test_ring_sizing() {
        let array = PerfEventArray::new(1).unwrap();
        for cpu in 0..array.ring_count() {
            assert!(array.ring(cpu).unwrap().capacity() >= MINIMUM_RING_SIZE as u64);
        }
        assert!(array.ring(array.ring_count()).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_per_cpu_isolation() {
        if platform::cpu_count() < 2 {
            return;
        }
        let array = PerfEventArray::new(256 * 1024).unwrap();

        let target = 1;
        let _affinity = platform::pin_to_cpu(target).unwrap();
        array.output(CURRENT_CPU, &[0x22; 10]).unwrap();

        for cpu in 0..array.ring_count() {
            let (consumer, producer) = array.query(cpu).unwrap();
            if cpu == target {
                assert_eq!(producer - consumer, 24);
            } else {
                assert_eq!(producer - consumer, 0);
            }
        }
    }
}
