//! Reference-counted core objects
//!
//! Maps, programs, and links share one ownership scheme: an intrusive
//! header with an atomic reference count, a per-type monotonically
//! allocated id, and a registry that resolves `(type, id)` back to a
//! live object. [`ObjectRef`] is the only handle; cloning acquires a
//! reference and dropping releases one. When the count reaches zero
//! the object's storage is freed and the optional zero-callback is
//! notified with the released identity. Ids are never reused.

use core::any::TypeId;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::kdebug;
use crate::spinlock::SpinLock;

/// Type tag carried by every tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Map,
    Program,
    Link,
}

const OBJECT_TYPE_COUNT: usize = 3;

impl ObjectType {
    #[inline]
    fn index(self) -> usize {
        match self {
            ObjectType::Map => 0,
            ObjectType::Program => 1,
            ObjectType::Link => 2,
        }
    }
}

/// Notified after an object's storage is freed.
pub type ZeroCallback = Box<dyn Fn(ObjectType, u64) + Send + Sync>;

/// Intrusive header embedded ahead of the object payload.
pub struct ObjectHeader {
    object_type: ObjectType,
    id: u64,
    type_id: TypeId,
    ref_count: AtomicU64,
    free: unsafe fn(*mut ObjectHeader),
    on_zero: Option<ZeroCallback>,
}

#[repr(C)]
struct ObjectBox<T> {
    header: ObjectHeader,
    data: T,
}

unsafe fn free_object<T>(header: *mut ObjectHeader) {
    drop(Box::from_raw(header.cast::<ObjectBox<T>>()));
}

struct Registry {
    // (type, id) to header address; entries removed before free.
    objects: SpinLock<HashMap<(ObjectType, u64), usize>>,
    next_id: [AtomicU64; OBJECT_TYPE_COUNT],
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        objects: SpinLock::new(HashMap::new()),
        next_id: [AtomicU64::new(1), AtomicU64::new(1), AtomicU64::new(1)],
    })
}

/// Counted handle to a tracked object.
pub struct ObjectRef {
    header: NonNull<ObjectHeader>,
}

// Safety: payloads are constrained to Send + Sync at allocation and
// the header is only mutated through atomics until the count is zero.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Allocate a tracked object holding `data`, with an initial
    /// reference count of one and a freshly allocated id.
    pub fn new<T: Send + Sync + 'static>(
        object_type: ObjectType,
        data: T,
        on_zero: Option<ZeroCallback>,
    ) -> ObjectRef {
        let registry = registry();
        let id = registry.next_id[object_type.index()].fetch_add(1, Ordering::Relaxed);

        let boxed = Box::new(ObjectBox {
            header: ObjectHeader {
                object_type,
                id,
                type_id: TypeId::of::<T>(),
                ref_count: AtomicU64::new(1),
                free: free_object::<T>,
                on_zero,
            },
            data,
        });
        let header = NonNull::from(&mut Box::leak(boxed).header);

        registry
            .objects
            .lock()
            .insert((object_type, id), header.as_ptr() as usize);

        kdebug!("object: allocated {:?} id {}", object_type, id);
        ObjectRef { header }
    }

    /// Resolve `(type, id)` to a live object, acquiring a reference.
    ///
    /// Returns `None` if no such object exists or it is already on its
    /// way to being freed.
    pub fn find_by_id(object_type: ObjectType, id: u64) -> Option<ObjectRef> {
        let registry = registry();
        let objects = registry.objects.lock();
        let address = *objects.get(&(object_type, id))?;
        let header = address as *mut ObjectHeader;

        // A finder must never resurrect an object whose count already
        // hit zero; the releaser is about to free it.
        let count = unsafe { &(*header).ref_count };
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == 0 {
                    None
                } else {
                    Some(current + 1)
                }
            })
            .ok()?;

        Some(ObjectRef {
            header: NonNull::new(header)?,
        })
    }

    #[inline]
    pub fn object_type(&self) -> ObjectType {
        unsafe { self.header.as_ref() }.object_type
    }

    #[inline]
    pub fn id(&self) -> u64 {
        unsafe { self.header.as_ref() }.id
    }

    /// Current reference count (advisory under concurrency).
    #[inline]
    pub fn ref_count(&self) -> u64 {
        unsafe { self.header.as_ref() }
            .ref_count
            .load(Ordering::Acquire)
    }

    /// Borrow the payload as `T`, or `None` on a type mismatch.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        let header = unsafe { self.header.as_ref() };
        if header.type_id != TypeId::of::<T>() {
            return None;
        }
        let object = self.header.as_ptr().cast::<ObjectBox<T>>();
        Some(unsafe { &(*object).data })
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        unsafe { self.header.as_ref() }
            .ref_count
            .fetch_add(1, Ordering::AcqRel);
        ObjectRef {
            header: self.header,
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        let header = unsafe { self.header.as_ref() };
        if header.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);

        let object_type = header.object_type;
        let id = header.id;
        let free = header.free;
        registry().objects.lock().remove(&(object_type, id));

        // Count is zero and the registry entry is gone, so this thread
        // holds the only path to the object.
        let raw = self.header.as_ptr();
        let on_zero = unsafe { (*raw).on_zero.take() };
        unsafe { free(raw) };

        kdebug!("object: freed {:?} id {}", object_type, id);
        if let Some(callback) = on_zero {
            callback(object_type, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_refcount_lifecycle() {
        let object = ObjectRef::new(ObjectType::Map, 42u32, None);
        assert_eq!(object.ref_count(), 1);

        let second = object.clone();
        assert_eq!(object.ref_count(), 2);

        drop(second);
        assert_eq!(object.ref_count(), 1);
    }

    #[test]
    fn test_zero_callback_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let object = ObjectRef::new(
            ObjectType::Program,
            "payload".to_string(),
            Some(Box::new(move |object_type, _id| {
                assert_eq!(object_type, ObjectType::Program);
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let second = object.clone();

        drop(object);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_find_by_id() {
        let object = ObjectRef::new(ObjectType::Link, 7i64, None);
        let id = object.id();

        let found = ObjectRef::find_by_id(ObjectType::Link, id).unwrap();
        assert_eq!(found.id(), id);
        assert_eq!(object.ref_count(), 2);
        assert_eq!(found.downcast_ref::<i64>(), Some(&7));
        drop(found);

        drop(object);
        assert!(ObjectRef::find_by_id(ObjectType::Link, id).is_none());
    }

    #[test]
    fn test_ids_monotonic_per_type() {
        let a = ObjectRef::new(ObjectType::Map, (), None);
        let b = ObjectRef::new(ObjectType::Map, (), None);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_downcast_mismatch() {
        let object = ObjectRef::new(ObjectType::Map, 1u8, None);
        assert!(object.downcast_ref::<u16>().is_none());
    }

    #[test]
    fn test_concurrent_clone_drop() {
        use std::thread;

        let object = ObjectRef::new(ObjectType::Map, 0u64, None);
        let mut handles = vec![];
        for _ in 0..4 {
            let object = object.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let extra = object.clone();
                    drop(extra);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(object.ref_count(), 1);
    }
}
