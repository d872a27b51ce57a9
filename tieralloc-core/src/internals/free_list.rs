//! Intrusive LIFO list of freed objects.
//!
//! The link of each freed object is stored within the object itself, in its first word, so that tracking freed
//! objects requires no extra memory.
//!
//! Invariants:
//!
//! -   Each object on the list spans at least `size_of::<FreeNode>()` bytes, and is suitably aligned for it.
//! -   No object on the list is accessed by anyone but the list, until popped.
//! -   The list is not accessed concurrently; it is always reached through `&mut`.

use core::{mem, ptr::{self, NonNull}};

/// Minimum size of an object stored on a FreeList.
pub(crate) const MINIMUM_OBJECT_SIZE: usize = mem::size_of::<FreeNode>();

/// FreeList
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<NonNull<FreeNode>>,
    length: usize,
}

impl FreeList {
    /// Returns whether the list is empty.
    pub(crate) fn is_empty(&self) -> bool { self.head.is_none() }

    /// Returns the number of objects on the list.
    pub(crate) fn len(&self) -> usize { self.length }

    /// Pushes an object on top of the list.
    ///
    /// #   Safety
    ///
    /// -   Assumes that `object` points to at least `MINIMUM_OBJECT_SIZE` writable bytes, aligned for a pointer.
    /// -   Assumes that `object` is not accessed by anyone else until popped.
    /// -   Assumes that `object` is not already on the list.
    pub(crate) unsafe fn push(&mut self, object: NonNull<u8>) {
        debug_assert!(object.as_ptr() as usize % mem::align_of::<FreeNode>() == 0);

        let node = object.cast::<FreeNode>();

        //  Safety:
        //  -   Writable and aligned, as per pre-conditions.
        unsafe { ptr::write(node.as_ptr(), FreeNode { next: self.head }) };

        self.head = Some(node);
        self.length += 1;
    }

    /// Pops the object on top of the list, if any.
    ///
    /// The link word of the returned object is zeroed.
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;

        //  Safety:
        //  -   `node` was pushed, hence is readable, writable and exclusively accessed by the list.
        unsafe {
            self.head = ptr::read(node.as_ptr()).next;
            ptr::write(node.as_ptr(), FreeNode { next: None });
        }

        self.length -= 1;

        Some(node.cast())
    }

    /// Forgets all objects on the list.
    ///
    /// Used when the memory backing the objects is released in bulk.
    pub(crate) fn clear(&mut self) {
        self.head = None;
        self.length = 0;
    }
}

//  Safety:
//  -   The objects on the list are exclusively owned by the list, as per invariants.
unsafe impl Send for FreeList {}

//
//  Implementation
//

#[derive(Debug)]
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}
