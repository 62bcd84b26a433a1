//! SPSC ring buffer with length-prefixed records
//!
//! Records are 8-byte-aligned blocks carrying an 8-byte header: a u32
//! length (header plus payload, excluding alignment padding) and a u32
//! flags word. The backing store is double-mapped, so a record
//! straddling the wrap point is still one contiguous range. One
//! producer and one consumer are assumed; multi-producer use goes
//! through the per-CPU perf array, which serializes by construction.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bpfrt_core::error::{BpfError, BpfResult};
use bpfrt_core::spinlock::SpinLock;

use crate::memory::DoubleMapping;
use crate::platform::CachePadded;

const RECORD_HEADER_SIZE: u64 = 8;
const RECORD_ALIGNMENT: u64 = 8;

const FLAG_LOCKED: u32 = 1 << 0;
const FLAG_DISCARDED: u32 = 1 << 1;

#[inline]
fn record_total_size(payload_length: u64) -> u64 {
    (RECORD_HEADER_SIZE + payload_length).div_ceil(RECORD_ALIGNMENT) * RECORD_ALIGNMENT
}

/// Single-producer single-consumer byte ring.
pub struct RingBuffer {
    mapping: DoubleMapping,
    capacity: u64,
    consumer: CachePadded<AtomicU64>,
    producer: CachePadded<AtomicU64>,
    producer_lock: SpinLock<()>,
}

impl RingBuffer {
    /// Create a ring of `size` bytes. `size` must be a power of two;
    /// the capacity rounds up to whole pages.
    pub fn new(size: usize) -> BpfResult<Self> {
        if size < 2 * RECORD_HEADER_SIZE as usize || !size.is_power_of_two() {
            return Err(BpfError::InvalidArgument);
        }
        let mapping = DoubleMapping::new(size)?;
        let capacity = mapping.len() as u64;
        Ok(RingBuffer {
            mapping,
            capacity,
            consumer: CachePadded::new(AtomicU64::new(0)),
            producer: CachePadded::new(AtomicU64::new(0)),
            producer_lock: SpinLock::new(()),
        })
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Current `(consumer, producer)` offsets.
    pub fn query(&self) -> (u64, u64) {
        (
            self.consumer.load(Ordering::Acquire),
            self.producer.load(Ordering::Acquire),
        )
    }

    /// Consumer view of the doubly-mapped region (2x capacity).
    pub fn map_buffer(&self) -> *const u8 {
        self.mapping.at(0)
    }

    #[inline]
    fn flags_word(&self, record_offset: u64) -> &AtomicU32 {
        // Record offsets are 8-aligned, so the flags word at +4 is
        // 4-aligned.
        unsafe { &*self.mapping.at(record_offset + 4).cast::<AtomicU32>() }
    }

    #[inline]
    fn record_length(&self, record_offset: u64) -> u32 {
        let mut bytes = [0u8; 4];
        unsafe { self.mapping.read_at(record_offset, &mut bytes) };
        u32::from_le_bytes(bytes)
    }

    fn acquire_record(&self, payload_length: u64, flags: u32) -> BpfResult<u64> {
        let total = record_total_size(payload_length);
        let _guard = self.producer_lock.lock();
        let producer = self.producer.load(Ordering::Relaxed);
        let consumer = self.consumer.load(Ordering::Acquire);
        if producer - consumer + total > self.capacity {
            return Err(BpfError::OutOfSpace);
        }

        let length = (RECORD_HEADER_SIZE + payload_length) as u32;
        unsafe { self.mapping.write_at(producer, &length.to_le_bytes()) };
        self.flags_word(producer).store(flags, Ordering::Release);
        self.producer.store(producer + total, Ordering::Release);
        Ok(producer)
    }

    /// Copy `data` into the ring as one committed record.
    pub fn output(&self, data: &[u8]) -> BpfResult {
        let total = record_total_size(data.len() as u64);
        if total > self.capacity {
            return Err(BpfError::OutOfSpace);
        }
        let offset = self.acquire_record(data.len() as u64, FLAG_LOCKED)?;
        unsafe {
            self.mapping.write_at(offset + RECORD_HEADER_SIZE, data);
        }
        // Publish: payload writes precede the flag clear.
        self.flags_word(offset).store(0, Ordering::Release);
        Ok(())
    }

    /// Reserve space for a `length`-byte payload.
    ///
    /// The record stays LOCKED (invisible to the consumer) until the
    /// reservation is submitted; dropping it unsubmitted discards it.
    pub fn reserve(&self, length: usize) -> BpfResult<RingReservation<'_>> {
        let total = record_total_size(length as u64);
        if total > self.capacity {
            return Err(BpfError::InvalidArgument);
        }
        let offset = self.acquire_record(length as u64, FLAG_LOCKED)?;
        Ok(RingReservation {
            ring: self,
            offset,
            length,
            resolved: false,
        })
    }

    /// Next committed, non-discarded record, or `None` if the ring is
    /// drained or blocked on an in-flight reservation.
    pub fn next_record(&self) -> Option<RingRecord<'_>> {
        let consumer = self.consumer.load(Ordering::Acquire);
        let producer = self.producer.load(Ordering::Acquire);

        let mut offset = consumer;
        while offset < producer {
            let flags = self.flags_word(offset).load(Ordering::Acquire);
            if flags & FLAG_LOCKED != 0 {
                return None;
            }
            let length = u64::from(self.record_length(offset));
            let total = record_total_size(length - RECORD_HEADER_SIZE);
            if flags & FLAG_DISCARDED == 0 {
                let payload_length = (length - RECORD_HEADER_SIZE) as usize;
                let payload = unsafe {
                    core::slice::from_raw_parts(
                        self.mapping.at(offset + RECORD_HEADER_SIZE),
                        payload_length,
                    )
                };
                return Some(RingRecord {
                    payload,
                    consume_to: offset + total - consumer,
                });
            }
            offset += total;
        }
        None
    }

    /// Advance the consumer by `bytes`.
    ///
    /// `bytes` must be a multiple of 8 that lands exactly on a record
    /// boundary at or before the producer.
    pub fn return_bytes(&self, bytes: u64) -> BpfResult {
        if bytes % RECORD_ALIGNMENT != 0 {
            return Err(BpfError::InvalidArgument);
        }
        let consumer = self.consumer.load(Ordering::Acquire);
        let producer = self.producer.load(Ordering::Acquire);
        if bytes > producer - consumer {
            return Err(BpfError::InvalidArgument);
        }

        // Walk the records to verify the target is a real boundary.
        let mut offset = consumer;
        let target = consumer + bytes;
        while offset < target {
            let length = u64::from(self.record_length(offset));
            if length < RECORD_HEADER_SIZE {
                return Err(BpfError::InvalidArgument);
            }
            offset += record_total_size(length - RECORD_HEADER_SIZE);
        }
        if offset != target {
            return Err(BpfError::InvalidArgument);
        }

        self.consumer.store(target, Ordering::Release);
        Ok(())
    }
}

/// Reference to one committed record.
pub struct RingRecord<'a> {
    payload: &'a [u8],
    consume_to: u64,
}

impl<'a> RingRecord<'a> {
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Byte count to pass to `return_bytes` to consume through this
    /// record, including any discarded records before it.
    #[inline]
    pub fn consume_length(&self) -> u64 {
        self.consume_to
    }
}

/// An uncommitted reserved record.
pub struct RingReservation<'a> {
    ring: &'a RingBuffer,
    offset: u64,
    length: usize,
    resolved: bool,
}

impl<'a> RingReservation<'a> {
    /// Writable payload slice, contiguous across the wrap.
    pub fn data(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.ring.mapping.at(self.offset + RECORD_HEADER_SIZE),
                self.length,
            )
        }
    }

    /// Commit the record for the consumer.
    pub fn submit(mut self) {
        self.resolved = true;
        self.ring.flags_word(self.offset).store(0, Ordering::Release);
    }

    /// Abandon the record; the consumer skips it.
    pub fn discard(mut self) {
        self.resolved = true;
        self.ring
            .flags_word(self.offset)
            .store(FLAG_DISCARDED, Ordering::Release);
    }
}

impl<'a> Drop for RingReservation<'a> {
    fn drop(&mut self) {
        if !self.resolved {
            self.ring
                .flags_word(self.offset)
                .store(FLAG_DISCARDED, Ordering::Release);
        }
    }
}
