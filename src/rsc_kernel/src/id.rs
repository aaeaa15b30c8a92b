//! Object identifiers and the id directory
use alloc::{sync::Arc, vec::Vec};
use core::{fmt, marker::PhantomData, num::NonZeroU32};
use slab::Slab;

const INDEX_BITS: u32 = 16;
const GENERATION_BITS: u32 = 12;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;
const CLASS_SHIFT: u32 = INDEX_BITS + GENERATION_BITS;

/// The maximum number of objects a directory can hold.
pub const MAX_OBJECTS: usize = 1 << INDEX_BITS;

/// The object class encoded in an [`Id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Class {
    Thread = 1,
    Sync = 2,
    Scheduler = 3,
}

/// A raw object identifier: `[class:4][generation:12][index:16]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(NonZeroU32);

impl Id {
    fn new(class: Class, generation: u16, index: usize) -> Self {
        debug_assert!(index < MAX_OBJECTS);
        let raw = ((class as u32) << CLASS_SHIFT)
            | ((u32::from(generation) & GENERATION_MASK) << INDEX_BITS)
            | index as u32;
        match NonZeroU32::new(raw) {
            Some(x) => Self(x),
            None => unreachable!(),
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }

    pub fn class(self) -> u32 {
        self.0.get() >> CLASS_SHIFT
    }

    pub fn index(self) -> usize {
        (self.0.get() & INDEX_MASK) as usize
    }

    fn generation(self) -> u16 {
        ((self.0.get() >> INDEX_BITS) & GENERATION_MASK) as u16
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}.{}", self.class(), self.index(), self.generation())
    }
}

/// A typed wrapper of [`Id`].
pub trait ObjectId: Copy + Eq + fmt::Debug {
    const CLASS: Class;
    fn from_id(id: Id) -> Self;
    fn id(self) -> Id;
}

macro_rules! define_id {
    ( $( #[$meta:meta] )* pub struct $name:ident: $class:ident; ) => {
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Id);

        impl ObjectId for $name {
            const CLASS: Class = Class::$class;

            #[inline]
            fn from_id(id: Id) -> Self {
                Self(id)
            }

            #[inline]
            fn id(self) -> Id {
                self.0
            }
        }

        impl $name {
            /// Reconstruct an identifier from [`Self::raw`]. Returns `None` if
            /// `raw` does not encode an identifier of this class.
            pub fn from_raw(raw: u32) -> Option<Self> {
                Id::from_raw(raw)
                    .filter(|id| id.class() == Class::$class as u32)
                    .map(Self)
            }

            #[inline]
            pub fn raw(self) -> u32 {
                self.0.raw()
            }

            #[inline]
            pub(crate) fn index(self) -> usize {
                self.0.index()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({}.{})"), self.0.index(), self.0.generation())
            }
        }
    };
}

define_id! {
    /// Identifies a thread.
    pub struct ThreadId: Thread;
}

define_id! {
    /// Identifies a synchronization object.
    pub struct SyncId: Sync;
}

define_id! {
    /// Identifies a scheduler instance.
    pub struct SchedulerId: Scheduler;
}

impl SchedulerId {
    /// Scheduler instances are created at boot and never deleted, so their
    /// identifiers are derived from their configuration index.
    pub(crate) fn from_index(index: usize) -> Self {
        Self(Id::new(Class::Scheduler, 1, index))
    }
}

/// The directory is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirectoryFull;

/// Maps identifiers to live objects.
///
/// The directory lock is a leaf lock: no other lock is ever acquired while
/// it's held, so it sits outside the ordered hierarchy.
pub(crate) struct Directory<T, I> {
    inner: spin::RwLock<DirectoryInner<T>>,
    _phantom: PhantomData<fn(I)>,
}

struct DirectoryInner<T> {
    slots: Slab<Arc<T>>,
    /// The generation of the next object allocated at each index.
    generations: Vec<u16>,
    capacity: usize,
}

impl<T, I: ObjectId> Directory<T, I> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_OBJECTS);
        Self {
            inner: spin::RwLock::new(DirectoryInner {
                slots: Slab::with_capacity(capacity),
                generations: Vec::with_capacity(capacity),
                capacity,
            }),
            _phantom: PhantomData,
        }
    }

    /// Allocate an identifier and store the object constructed by `f`.
    ///
    /// `f` runs with the directory locked and must not access it.
    pub(crate) fn allocate(&self, f: impl FnOnce(I) -> T) -> Result<(I, Arc<T>), DirectoryFull> {
        let mut inner = self.inner.write();
        if inner.slots.len() >= inner.capacity {
            return Err(DirectoryFull);
        }

        let index = inner.slots.vacant_key();
        if index >= inner.generations.len() {
            inner.generations.resize(index + 1, 1);
        }
        let generation = inner.generations[index];
        let id = I::from_id(Id::new(I::CLASS, generation, index));

        let object = Arc::new(f(id));
        let key = inner.slots.insert(Arc::clone(&object));
        debug_assert_eq!(key, index);

        Ok((id, object))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Look up a live object.
    pub(crate) fn get(&self, id: I) -> Option<Arc<T>> {
        let id = id.id();
        if id.class() != I::CLASS as u32 {
            return None;
        }
        let inner = self.inner.read();
        if inner.generations.get(id.index()).copied() != Some(id.generation()) {
            return None;
        }
        inner.slots.get(id.index()).cloned()
    }

    /// Remove an object. Its identifier becomes stale.
    pub(crate) fn free(&self, id: I) -> Option<Arc<T>> {
        let id = id.id();
        let mut inner = self.inner.write();
        let index = id.index();
        if inner.generations.get(index).copied() != Some(id.generation())
            || !inner.slots.contains(index)
        {
            return None;
        }

        let generation = &mut inner.generations[index];
        *generation = if *generation >= GENERATION_MASK as u16 {
            1
        } else {
            *generation + 1
        };
        Some(inner.slots.remove(index))
    }

    /// Take a snapshot of every live object.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.inner.read().slots.iter().map(|(_, x)| Arc::clone(x)).collect()
    }
}
