//! Epoch-protected concurrent hash table
//!
//! Buckets are immutable once published. A writer takes the bucket's
//! spinlock, builds a replacement vector, publishes it with an atomic
//! pointer exchange, and retires the old one through the epoch, so
//! readers holding a scope keep a consistent view of whatever bucket
//! version they loaded. Readers never lock. Keys and values are fixed
//! size, set at creation.

use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bpfrt_core::error::{BpfError, BpfResult};
use bpfrt_core::random::random_uint32;
use bpfrt_core::spinlock::SpinLock;

use crate::epoch::{self, EpochScope};

const DEFAULT_BUCKET_COUNT: usize = 64;

/// How `update` treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Upsert.
    Any,
    /// Fail with `AlreadyExists` if the key is present.
    Insert,
    /// Fail with `KeyNotFound` if the key is absent.
    Replace,
}

/// Creation parameters.
#[derive(Debug, Clone)]
pub struct HashTableOptions {
    pub key_size: usize,
    pub value_size: usize,
    /// Rounded up to a power of two; 0 selects the default.
    pub min_bucket_count: usize,
    /// Fixed hash seed, for reproducible layouts in tests.
    pub seed: Option<u32>,
}

impl Default for HashTableOptions {
    fn default() -> Self {
        HashTableOptions {
            key_size: 0,
            value_size: 0,
            min_bucket_count: 0,
            seed: None,
        }
    }
}

struct BucketEntry {
    key: Box<[u8]>,
    value: Box<[u8]>,
}

struct Bucket {
    entries: Vec<BucketEntry>,
}

/// Concurrent fixed-key-size hash table.
pub struct HashTable {
    key_size: usize,
    value_size: usize,
    seed: u32,
    mask: usize,
    buckets: Vec<AtomicPtr<Bucket>>,
    locks: Vec<SpinLock<()>>,
    key_count: AtomicUsize,
}

// Safety: bucket pointers are published with release stores and only
// freed through the epoch after unpublication.
unsafe impl Send for HashTable {}
unsafe impl Sync for HashTable {}

impl HashTable {
    pub fn new(options: HashTableOptions) -> BpfResult<Self> {
        if options.key_size == 0 || options.value_size == 0 {
            return Err(BpfError::InvalidArgument);
        }
        let requested = if options.min_bucket_count == 0 {
            DEFAULT_BUCKET_COUNT
        } else {
            options.min_bucket_count
        };
        let bucket_count = requested.next_power_of_two();

        Ok(HashTable {
            key_size: options.key_size,
            value_size: options.value_size,
            seed: options.seed.unwrap_or_else(random_uint32),
            mask: bucket_count - 1,
            buckets: (0..bucket_count)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
            locks: (0..bucket_count).map(|_| SpinLock::new(())).collect(),
            key_count: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn bucket_index(&self, key: &[u8]) -> usize {
        murmur3_32(key, self.seed) as usize & self.mask
    }

    fn check_key(&self, key: &[u8]) -> BpfResult {
        if key.len() != self.key_size {
            return Err(BpfError::InvalidArgument);
        }
        Ok(())
    }

    /// Look up `key`; the returned value slice is valid for the
    /// duration of `scope`.
    pub fn find<'e>(&'e self, _scope: &'e EpochScope, key: &[u8]) -> BpfResult<&'e [u8]> {
        self.check_key(key)?;
        let bucket = self.buckets[self.bucket_index(key)].load(Ordering::Acquire);
        if bucket.is_null() {
            return Err(BpfError::KeyNotFound);
        }
        let bucket = unsafe { &*bucket };
        for entry in &bucket.entries {
            if entry.key.as_ref() == key {
                // The epoch keeps this bucket version alive past any
                // concurrent replacement for the life of the scope.
                let value = entry.value.as_ref();
                return Ok(unsafe {
                    core::slice::from_raw_parts(value.as_ptr(), value.len())
                });
            }
        }
        Err(BpfError::KeyNotFound)
    }

    /// Insert, replace, or upsert `key` according to `mode`.
    pub fn update(&self, key: &[u8], value: &[u8], mode: UpdateMode) -> BpfResult {
        self.check_key(key)?;
        if value.len() != self.value_size {
            return Err(BpfError::InvalidArgument);
        }

        let index = self.bucket_index(key);
        let _guard = self.locks[index].lock();

        let current = self.buckets[index].load(Ordering::Acquire);
        let entries = unsafe { current.as_ref() }.map(|b| b.entries.as_slice());
        let position = entries
            .unwrap_or(&[])
            .iter()
            .position(|entry| entry.key.as_ref() == key);

        match (position, mode) {
            (Some(_), UpdateMode::Insert) => return Err(BpfError::AlreadyExists),
            (None, UpdateMode::Replace) => return Err(BpfError::KeyNotFound),
            _ => {}
        }

        let mut new_entries: Vec<BucketEntry> = entries
            .unwrap_or(&[])
            .iter()
            .map(|entry| BucketEntry {
                key: entry.key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        match position {
            Some(found) => new_entries[found].value = value.into(),
            None => new_entries.push(BucketEntry {
                key: key.into(),
                value: value.into(),
            }),
        }

        let replacement = Box::into_raw(Box::new(Bucket {
            entries: new_entries,
        }));
        let old = self.buckets[index].swap(replacement, Ordering::AcqRel);
        if position.is_none() {
            self.key_count.fetch_add(1, Ordering::AcqRel);
        }
        self.retire_bucket(old);
        Ok(())
    }

    /// Remove `key`.
    pub fn delete(&self, key: &[u8]) -> BpfResult {
        self.check_key(key)?;
        let index = self.bucket_index(key);
        let _guard = self.locks[index].lock();

        let current = self.buckets[index].load(Ordering::Acquire);
        let bucket = unsafe { current.as_ref() }.ok_or(BpfError::KeyNotFound)?;
        let position = bucket
            .entries
            .iter()
            .position(|entry| entry.key.as_ref() == key)
            .ok_or(BpfError::KeyNotFound)?;

        let replacement = if bucket.entries.len() == 1 {
            core::ptr::null_mut()
        } else {
            let entries = bucket
                .entries
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != position)
                .map(|(_, entry)| BucketEntry {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                })
                .collect();
            Box::into_raw(Box::new(Bucket { entries }))
        };

        let old = self.buckets[index].swap(replacement, Ordering::AcqRel);
        self.key_count.fetch_sub(1, Ordering::AcqRel);
        self.retire_bucket(old);
        Ok(())
    }

    fn retire_bucket(&self, bucket: *mut Bucket) {
        if !bucket.is_null() {
            epoch::retire(unsafe { Box::from_raw(bucket) });
        }
    }

    /// Copy the key following `previous` (bucket order, then insertion
    /// order) into `out`. `None` restarts from the beginning, as does
    /// a `previous` that is no longer present.
    pub fn next_key(
        &self,
        _scope: &EpochScope,
        previous: Option<&[u8]>,
        out: &mut [u8],
    ) -> BpfResult {
        if out.len() != self.key_size {
            return Err(BpfError::InvalidArgument);
        }

        let start_bucket = match previous {
            None => 0,
            Some(previous) => {
                self.check_key(previous)?;
                let index = self.bucket_index(previous);
                let bucket = self.buckets[index].load(Ordering::Acquire);
                let position = unsafe { bucket.as_ref() }.and_then(|bucket| {
                    bucket
                        .entries
                        .iter()
                        .position(|entry| entry.key.as_ref() == previous)
                });
                match position {
                    Some(found) => {
                        let bucket = unsafe { &*bucket };
                        if let Some(entry) = bucket.entries.get(found + 1) {
                            out.copy_from_slice(&entry.key);
                            return Ok(());
                        }
                        index + 1
                    }
                    // Vanished cursor key restarts the traversal.
                    None => 0,
                }
            }
        };

        for index in start_bucket..self.buckets.len() {
            let bucket = self.buckets[index].load(Ordering::Acquire);
            if let Some(entry) =
                unsafe { bucket.as_ref() }.and_then(|bucket| bucket.entries.first())
            {
                out.copy_from_slice(&entry.key);
                return Ok(());
            }
        }
        Err(BpfError::NoMoreKeys)
    }

    /// Return one bucket's worth of `{key, value}` pairs per call.
    ///
    /// `cookie` starts at 0 and carries the resume position between
    /// calls. `keys` and `values` are cleared on entry, so a
    /// successful call holds exactly the returned bucket. If the
    /// bucket at the cursor holds more than `count` entries, fails
    /// with `InsufficientBuffer` and stores the needed count; past the
    /// last bucket, fails with `NoMoreKeys`. Returned slices live for
    /// the duration of `scope`.
    pub fn iterate<'e>(
        &'e self,
        _scope: &'e EpochScope,
        cookie: &mut u64,
        count: &mut usize,
        keys: &mut Vec<&'e [u8]>,
        values: &mut Vec<&'e [u8]>,
    ) -> BpfResult {
        keys.clear();
        values.clear();
        let mut index = *cookie as usize;
        while index < self.buckets.len() {
            let bucket = self.buckets[index].load(Ordering::Acquire);
            let bucket = match unsafe { bucket.as_ref() } {
                Some(bucket) if !bucket.entries.is_empty() => bucket,
                _ => {
                    index += 1;
                    continue;
                }
            };

            if bucket.entries.len() > *count {
                *count = bucket.entries.len();
                return Err(BpfError::InsufficientBuffer);
            }

            for entry in &bucket.entries {
                let key = entry.key.as_ref();
                let value = entry.value.as_ref();
                unsafe {
                    keys.push(core::slice::from_raw_parts(key.as_ptr(), key.len()));
                    values.push(core::slice::from_raw_parts(value.as_ptr(), value.len()));
                }
            }
            *count = bucket.entries.len();
            *cookie = (index + 1) as u64;
            return Ok(());
        }
        Err(BpfError::NoMoreKeys)
    }

    /// Number of keys currently present.
    pub fn key_count(&self) -> usize {
        self.key_count.load(Ordering::Acquire)
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }
}

impl Drop for HashTable {
    fn drop(&mut self) {
        // Exclusive access; no scope can still reference these buckets
        // through this table.
        for bucket in &self.buckets {
            let pointer = bucket.swap(core::ptr::null_mut(), Ordering::AcqRel);
            if !pointer.is_null() {
                drop(unsafe { Box::from_raw(pointer) });
            }
        }
    }
}

fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xCC9E_2D51;
    const C2: u32 = 0x1B87_3593;

    let mut hash = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash = (hash ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xE654_6B64);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut k = 0u32;
        for (i, byte) in remainder.iter().enumerate() {
            k |= u32::from(*byte) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85EB_CA6B);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xC2B2_AE35);
    hash ^ (hash >> 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn table(key_size: usize, value_size: usize) -> HashTable {
        HashTable::new(HashTableOptions {
            key_size,
            value_size,
            min_bucket_count: 0,
            seed: Some(0x1234_5678),
        })
        .unwrap()
    }

    #[test]
    fn test_update_modes() {
        let _epoch = epoch::initiate().unwrap();
        let table = table(4, 8);
        let scope = epoch::enter().unwrap();

        assert_eq!(
            table.update(b"key1", b"value_01", UpdateMode::Replace),
            Err(BpfError::KeyNotFound)
        );
        table.update(b"key1", b"value_01", UpdateMode::Insert).unwrap();
        assert_eq!(
            table.update(b"key1", b"value_02", UpdateMode::Insert),
            Err(BpfError::AlreadyExists)
        );
        table.update(b"key1", b"value_02", UpdateMode::Replace).unwrap();
        assert_eq!(table.find(&scope, b"key1").unwrap(), b"value_02");

        table.update(b"key2", b"value_03", UpdateMode::Any).unwrap();
        table.update(b"key2", b"value_04", UpdateMode::Any).unwrap();
        assert_eq!(table.find(&scope, b"key2").unwrap(), b"value_04");
        assert_eq!(table.key_count(), 2);
    }

    #[test]
    fn test_delete_and_key_count() {
        let _epoch = epoch::initiate().unwrap();
        let table = table(4, 4);
        let scope = epoch::enter().unwrap();

        for i in 0u32..100 {
            table
                .update(&i.to_le_bytes(), &(i * 2).to_le_bytes(), UpdateMode::Insert)
                .unwrap();
        }
        assert_eq!(table.key_count(), 100);

        for i in (0u32..100).step_by(2) {
            table.delete(&i.to_le_bytes()).unwrap();
        }
        assert_eq!(table.key_count(), 50);
        assert_eq!(table.delete(&0u32.to_le_bytes()), Err(BpfError::KeyNotFound));

        for i in 0u32..100 {
            let found = table.find(&scope, &i.to_le_bytes());
            if i % 2 == 0 {
                assert_eq!(found, Err(BpfError::KeyNotFound));
            } else {
                assert_eq!(found.unwrap(), (i * 2).to_le_bytes());
            }
        }
    }

    #[test]
    fn test_value_survives_delete_within_scope() {
        let _epoch = epoch::initiate().unwrap();
        let table = table(4, 4);
        let scope = epoch::enter().unwrap();

        table.update(b"aaaa", b"1111", UpdateMode::Insert).unwrap();
        let value = table.find(&scope, b"aaaa").unwrap();
        table.delete(b"aaaa").unwrap();
        // The old bucket version is retired, not freed, while the
        // scope is open.
        assert_eq!(value, b"1111");
    }

    #[test]
    fn test_next_key_visits_everything_once() {
        let _epoch = epoch::initiate().unwrap();
        let table = table(4, 4);
        let scope = epoch::enter().unwrap();

        let mut expected = BTreeSet::new();
        for i in 0u32..64 {
            table
                .update(&i.to_le_bytes(), &i.to_le_bytes(), UpdateMode::Insert)
                .unwrap();
            expected.insert(i.to_le_bytes().to_vec());
        }

        let mut seen = BTreeSet::new();
        let mut key = [0u8; 4];
        let mut previous: Option<[u8; 4]> = None;
        loop {
            match table.next_key(&scope, previous.as_ref().map(|k| &k[..]), &mut key) {
                Ok(()) => {
                    assert!(seen.insert(key.to_vec()), "duplicate key {key:?}");
                    previous = Some(key);
                }
                Err(BpfError::NoMoreKeys) => break,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_iterate_one_bucket_per_call() {
        let _epoch = epoch::initiate().unwrap();
        let table = HashTable::new(HashTableOptions {
            key_size: 13,
            value_size: 37,
            min_bucket_count: 1,
            seed: Some(7),
        })
        .unwrap();
        let scope = epoch::enter().unwrap();

        for i in 0u8..3 {
            let key = [i; 13];
            let value = [i; 37];
            table.update(&key, &value, UpdateMode::Insert).unwrap();
        }

        let mut cookie = 0u64;
        let mut count = 2usize;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        assert_eq!(
            table.iterate(&scope, &mut cookie, &mut count, &mut keys, &mut values),
            Err(BpfError::InsufficientBuffer)
        );
        assert_eq!(count, 3);

        table
            .iterate(&scope, &mut cookie, &mut count, &mut keys, &mut values)
            .unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(values.len(), 3);
        for (key, value) in keys.iter().zip(values.iter()) {
            assert_eq!(value[0], key[0]);
        }

        assert_eq!(
            table.iterate(&scope, &mut cookie, &mut count, &mut keys, &mut values),
            Err(BpfError::NoMoreKeys)
        );
    }

    #[test]
    fn test_iterate_resets_output_buffers() {
        let _epoch = epoch::initiate().unwrap();
        let table = HashTable::new(HashTableOptions {
            key_size: 4,
            value_size: 4,
            min_bucket_count: 4,
            seed: Some(3),
        })
        .unwrap();
        let scope = epoch::enter().unwrap();

        for i in 0u32..8 {
            table
                .update(&i.to_le_bytes(), &i.to_le_bytes(), UpdateMode::Insert)
                .unwrap();
        }

        let mut cookie = 0u64;
        let mut count = 8usize;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        // Reusing the vectors across calls must not accumulate prior
        // buckets; each call holds exactly what `count` reports.
        while table
            .iterate(&scope, &mut cookie, &mut count, &mut keys, &mut values)
            .is_ok()
        {
            assert_eq!(keys.len(), count);
            assert_eq!(values.len(), count);
            for key in &keys {
                assert!(seen.insert(key.to_vec()));
            }
            count = 8;
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn test_size_validation() {
        let _epoch = epoch::initiate().unwrap();
        let table = table(4, 4);
        let scope = epoch::enter().unwrap();

        assert_eq!(
            table.update(b"toolong!", b"vvvv", UpdateMode::Any),
            Err(BpfError::InvalidArgument)
        );
        assert_eq!(
            table.update(b"kkkk", b"xx", UpdateMode::Any),
            Err(BpfError::InvalidArgument)
        );
        assert_eq!(table.find(&scope, b"xx"), Err(BpfError::InvalidArgument));
        assert!(HashTable::new(HashTableOptions::default()).is_err());
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        use std::thread;

        let _epoch = epoch::initiate().unwrap();
        let table = Arc::new(table(8, 8));

        let cpu_count = crate::platform::cpu_count();
        let mut writers = vec![];
        for t in 0u64..4 {
            let table = Arc::clone(&table);
            writers.push(thread::spawn(move || {
                // Spread writers across CPUs; best effort.
                let _affinity = crate::platform::pin_to_cpu(t as usize % cpu_count);
                for i in 0u64..256 {
                    let key = (t << 32 | i).to_le_bytes();
                    table.update(&key, &i.to_le_bytes(), UpdateMode::Any).unwrap();
                }
            }));
        }

        let reader = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for _ in 0..64 {
                    let scope = epoch::enter().unwrap();
                    let mut key = [0u8; 8];
                    let mut previous: Option<[u8; 8]> = None;
                    while table
                        .next_key(&scope, previous.as_ref().map(|k| &k[..]), &mut key)
                        .is_ok()
                    {
                        previous = Some(key);
                    }
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(table.key_count(), 4 * 256);
    }
}
