use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A typed position in one of the caller-owned GRES tables. Socket-view
/// records carry these instead of pointers back into job and node state;
/// a handle is only meaningful for the table it was issued against.
pub trait TableHandle: Copy {
    fn table_index(self) -> usize;
}

macro_rules! gres_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy,
            Clone,
            Default,
            Debug,
            Hash,
            Eq,
            PartialEq,
            Ord,
            PartialOrd,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub fn new(index: u32) -> Self {
                Self(index)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(index: u32) -> Self {
                Self(index)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

gres_id! {
    /// Job identifier, carried through for logging.
    JobId
}

gres_id! {
    /// Handle of a per-(job, kind) GRES request in a [`GresTable`].
    GresJobId
}

gres_id! {
    /// Handle of a per-(node, kind) GRES state in a [`GresTable`].
    GresNodeId
}

impl TableHandle for GresJobId {
    #[inline]
    fn table_index(self) -> usize {
        self.0 as usize
    }
}

impl TableHandle for GresNodeId {
    #[inline]
    fn table_index(self) -> usize {
        self.0 as usize
    }
}

/// Caller-owned storage addressed only by its matching handle type.
#[derive(Debug, Clone)]
pub struct GresTable<H, T> {
    entries: Vec<T>,
    _handle: PhantomData<H>,
}

impl<H, T> From<Vec<T>> for GresTable<H, T> {
    #[inline]
    fn from(entries: Vec<T>) -> Self {
        GresTable {
            entries,
            _handle: PhantomData,
        }
    }
}

impl<H: TableHandle, T> Index<H> for GresTable<H, T> {
    type Output = T;

    #[inline]
    fn index(&self, handle: H) -> &T {
        &self.entries[handle.table_index()]
    }
}

impl<H: TableHandle, T> IndexMut<H> for GresTable<H, T> {
    #[inline]
    fn index_mut(&mut self, handle: H) -> &mut T {
        &mut self.entries[handle.table_index()]
    }
}
