//! Pinning table
//!
//! Associates UTF-8 byte-string names with tracked objects so a handle
//! can outlive its creating process view. Each pinned entry holds its
//! own reference; `find` hands the caller an additional one. Lookups
//! are rare relative to program execution, so a single table-wide lock
//! is sufficient.

use std::collections::HashMap;

use crate::constants::MAX_PIN_NAME_LENGTH;
use crate::error::{BpfError, BpfResult};
use crate::kdebug;
use crate::object::ObjectRef;
use crate::spinlock::SpinLock;

/// Name to object pinning table.
pub struct PinningTable {
    entries: SpinLock<HashMap<Vec<u8>, ObjectRef>>,
}

impl PinningTable {
    pub fn new() -> Self {
        PinningTable {
            entries: SpinLock::new(HashMap::new()),
        }
    }

    fn validate_name(name: &[u8]) -> BpfResult {
        if name.is_empty() || name.len() > MAX_PIN_NAME_LENGTH {
            return Err(BpfError::InvalidArgument);
        }
        Ok(())
    }

    /// Pin `object` under `name`, acquiring a reference held by the
    /// table. Fails with `AlreadyExists` if the name is taken.
    pub fn insert(&self, name: &[u8], object: &ObjectRef) -> BpfResult {
        Self::validate_name(name)?;
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return Err(BpfError::AlreadyExists);
        }
        entries.insert(name.to_vec(), object.clone());
        kdebug!(
            "pinning: insert {:?} id {}",
            String::from_utf8_lossy(name),
            object.id()
        );
        Ok(())
    }

    /// Look up `name`, acquiring a reference for the caller.
    pub fn find(&self, name: &[u8]) -> BpfResult<ObjectRef> {
        Self::validate_name(name)?;
        let entries = self.entries.lock();
        entries.get(name).cloned().ok_or(BpfError::KeyNotFound)
    }

    /// Unpin `name`, releasing the table's reference.
    pub fn delete(&self, name: &[u8]) -> BpfResult {
        Self::validate_name(name)?;
        let removed = {
            let mut entries = self.entries.lock();
            entries.remove(name)
        };
        // The release (and any zero-callback) runs outside the lock.
        match removed {
            Some(_object) => Ok(()),
            None => Err(BpfError::KeyNotFound),
        }
    }

    /// Number of pinned entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for PinningTable {
    fn default() -> Self {
        PinningTable::new()
    }
}

impl Drop for PinningTable {
    // Releases every remaining reference.
    fn drop(&mut self) {
        let count = self.entries.lock().len();
        if count > 0 {
            kdebug!("pinning: table freed with {} live entries", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_insert_find_delete_reference_flow() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed_clone = Arc::clone(&freed);

        let table = PinningTable::new();
        let object = ObjectRef::new(
            ObjectType::Map,
            (),
            Some(Box::new(move |_, _| {
                freed_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(object.ref_count(), 1);

        table.insert(b"my_map", &object).unwrap();
        assert_eq!(object.ref_count(), 2);

        let found = table.find(b"my_map").unwrap();
        assert_eq!(object.ref_count(), 3);
        assert_eq!(found.id(), object.id());

        table.delete(b"my_map").unwrap();
        assert_eq!(object.ref_count(), 2);

        drop(found);
        drop(object);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_table_drop_releases_references() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed_clone = Arc::clone(&freed);

        let table = PinningTable::new();
        let object = ObjectRef::new(
            ObjectType::Program,
            (),
            Some(Box::new(move |_, _| {
                freed_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        table.insert(b"prog_a", &object).unwrap();
        table.insert(b"prog_b", &object).unwrap();
        assert_eq!(object.ref_count(), 3);

        drop(object);
        assert_eq!(freed.load(Ordering::SeqCst), 0);

        drop(table);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let table = PinningTable::new();
        let object = ObjectRef::new(ObjectType::Map, (), None);

        table.insert(b"dup", &object).unwrap();
        assert_eq!(table.insert(b"dup", &object), Err(BpfError::AlreadyExists));
        assert_eq!(object.ref_count(), 2);
    }

    #[test]
    fn test_missing_name() {
        let table = PinningTable::new();
        assert!(matches!(table.find(b"absent"), Err(BpfError::KeyNotFound)));
        assert_eq!(table.delete(b"absent"), Err(BpfError::KeyNotFound));
    }

    #[test]
    fn test_name_validation() {
        let table = PinningTable::new();
        let object = ObjectRef::new(ObjectType::Map, (), None);

        assert_eq!(table.insert(b"", &object), Err(BpfError::InvalidArgument));
        let long_name = vec![b'x'; MAX_PIN_NAME_LENGTH + 1];
        assert_eq!(
            table.insert(&long_name, &object),
            Err(BpfError::InvalidArgument)
        );

        let max_name = vec![b'y'; MAX_PIN_NAME_LENGTH];
        table.insert(&max_name, &object).unwrap();
    }
}
