//! Host allocation through the caller's `VkAllocationCallbacks`.
//!
//! An [`Allocator`] is either the process allocator or a snapshot of a
//! caller-supplied callback set. Snapshots are plain copies: nothing here
//! keeps a pointer into caller memory.

use std::alloc::Layout;
use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};

use ash::vk;

use crate::error::ShimError;

/// Internal-allocation notification pair, inherited independently of the
/// primary callbacks.
#[derive(Debug, Clone, Copy)]
pub struct InternalNotifications {
    pub(crate) user_data: *mut c_void,
    pub(crate) pfn_allocation: vk::PFN_vkInternalAllocationNotification,
    pub(crate) pfn_free: vk::PFN_vkInternalFreeNotification,
}

impl InternalNotifications {
    pub fn user_data(&self) -> *mut c_void {
        self.user_data
    }
}

/// A caller-supplied callback set, invoked with the caller's convention.
#[derive(Debug, Clone, Copy)]
pub struct Callbacks {
    pub(crate) user_data: *mut c_void,
    pub(crate) pfn_allocation: vk::PFN_vkAllocationFunction,
    pub(crate) pfn_reallocation: vk::PFN_vkReallocationFunction,
    pub(crate) pfn_free: vk::PFN_vkFreeFunction,
    pub(crate) internal: Option<InternalNotifications>,
}

impl Callbacks {
    pub fn user_data(&self) -> *mut c_void {
        self.user_data
    }

    pub fn internal(&self) -> Option<&InternalNotifications> {
        self.internal.as_ref()
    }

    /// # Safety
    /// The caller's callbacks must be valid to invoke.
    pub unsafe fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> *mut c_void {
        match self.pfn_allocation {
            Some(pfn) => pfn(self.user_data, size, alignment, scope),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    /// The caller's callbacks must be valid to invoke and `original` must
    /// come from this callback set.
    pub unsafe fn reallocate(
        &self,
        original: *mut c_void,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> *mut c_void {
        match self.pfn_reallocation {
            Some(pfn) => pfn(self.user_data, original, size, alignment, scope),
            None => ptr::null_mut(),
        }
    }

    /// # Safety
    /// The caller's callbacks must be valid to invoke and `memory` must come
    /// from this callback set.
    pub unsafe fn free(&self, memory: *mut c_void) {
        if let Some(pfn) = self.pfn_free {
            pfn(self.user_data, memory);
        }
    }

    /// # Safety
    /// The caller's callbacks must be valid to invoke.
    pub unsafe fn notify_internal_allocation(
        &self,
        size: usize,
        ty: vk::InternalAllocationType,
        scope: vk::SystemAllocationScope,
    ) {
        if let Some(InternalNotifications {
            user_data,
            pfn_allocation: Some(pfn),
            ..
        }) = self.internal
        {
            pfn(user_data, size, ty, scope);
        }
    }

    /// # Safety
    /// The caller's callbacks must be valid to invoke.
    pub unsafe fn notify_internal_free(
        &self,
        size: usize,
        ty: vk::InternalAllocationType,
        scope: vk::SystemAllocationScope,
    ) {
        if let Some(InternalNotifications { user_data, pfn_free: Some(pfn), .. }) = self.internal {
            pfn(user_data, size, ty, scope);
        }
    }
}

/// Resolved allocator of an object: the caller's callbacks, or the process
/// allocator when nobody supplied any.
#[derive(Debug, Clone, Copy, Default)]
pub struct Allocator {
    callbacks: Option<Callbacks>,
}

impl Allocator {
    /// No custom allocator.
    pub const SYSTEM: Allocator = Allocator { callbacks: None };

    /// Combine an explicit callback set with the parent object's allocator.
    ///
    /// Without explicit callbacks the parent is copied as is. With them, the
    /// primary triple always comes from the explicit set, and the
    /// internal-notification pair comes from the explicit set if it has one,
    /// otherwise from the parent.
    pub fn merge(explicit: Option<&vk::AllocationCallbacks<'_>>, parent: &Allocator) -> Allocator {
        let Some(explicit) = explicit else {
            return *parent;
        };

        let internal = if explicit.pfn_internal_allocation.is_some() {
            Some(InternalNotifications {
                user_data: explicit.p_user_data,
                pfn_allocation: explicit.pfn_internal_allocation,
                pfn_free: explicit.pfn_internal_free,
            })
        } else {
            parent.callbacks.and_then(|cb| cb.internal)
        };

        Allocator {
            callbacks: Some(Callbacks {
                user_data: explicit.p_user_data,
                pfn_allocation: explicit.pfn_allocation,
                pfn_reallocation: explicit.pfn_reallocation,
                pfn_free: explicit.pfn_free,
                internal,
            }),
        }
    }

    /// [`Allocator::merge`] for a raw `pAllocator` argument.
    ///
    /// # Safety
    /// `p_allocator` must be null or point to a valid callback set.
    pub unsafe fn from_raw(
        p_allocator: *const vk::AllocationCallbacks<'_>,
        parent: &Allocator,
    ) -> Allocator {
        Self::merge(p_allocator.as_ref(), parent)
    }

    pub fn is_custom(&self) -> bool {
        self.callbacks.is_some()
    }

    pub fn callbacks(&self) -> Option<&Callbacks> {
        self.callbacks.as_ref()
    }

    /// Allocate `size` bytes. Without a custom allocator a zero-sized request
    /// returns null and nothing is invoked.
    ///
    /// # Safety
    /// Custom callbacks must be valid to invoke.
    pub unsafe fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> *mut c_void {
        match &self.callbacks {
            Some(cb) => cb.allocate(size, alignment, scope),
            None => {
                if size == 0 {
                    return ptr::null_mut();
                }
                match Layout::from_size_align(size, alignment) {
                    Ok(layout) => std::alloc::alloc(layout).cast(),
                    Err(_) => ptr::null_mut(),
                }
            }
        }
    }

    /// Free memory obtained from [`Allocator::allocate`] with the same size
    /// and alignment. Null is ignored.
    ///
    /// # Safety
    /// `memory` must come from this allocator.
    pub unsafe fn free(&self, memory: *mut c_void, size: usize, alignment: usize) {
        if memory.is_null() {
            return;
        }
        match &self.callbacks {
            Some(cb) => cb.free(memory),
            None => {
                if let Ok(layout) = Layout::from_size_align(size, alignment) {
                    std::alloc::dealloc(memory.cast(), layout);
                }
            }
        }
    }

    /// Allocate uninitialized storage for one `T`.
    ///
    /// # Safety
    /// Custom callbacks must be valid to invoke.
    pub unsafe fn allocate_object<T>(
        &self,
        scope: vk::SystemAllocationScope,
    ) -> Result<NonNull<T>, ShimError> {
        NonNull::new(self.allocate(mem::size_of::<T>(), mem::align_of::<T>(), scope).cast())
            .ok_or(ShimError::OutOfHostMemory)
    }

    /// Move `value` into storage from this allocator.
    ///
    /// # Safety
    /// Custom callbacks must be valid to invoke.
    pub unsafe fn create<T>(
        &self,
        value: T,
        scope: vk::SystemAllocationScope,
    ) -> Result<NonNull<T>, ShimError> {
        let ptr = self.allocate_object::<T>(scope)?;
        ptr.as_ptr().write(value);
        Ok(ptr)
    }

    /// Release storage from [`Allocator::allocate_object`] without dropping.
    ///
    /// # Safety
    /// `ptr` must come from this allocator.
    pub unsafe fn free_object<T>(&self, ptr: NonNull<T>) {
        self.free(ptr.as_ptr().cast(), mem::size_of::<T>(), mem::align_of::<T>());
    }

    /// Drop the value in place and release its storage.
    ///
    /// # Safety
    /// `ptr` must come from [`Allocator::create`] on this allocator.
    pub unsafe fn destroy<T>(&self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr());
        self.free_object(ptr);
    }

    /// Allocate uninitialized storage for `len` values. An empty array
    /// allocates nothing.
    ///
    /// # Safety
    /// Custom callbacks must be valid to invoke.
    pub unsafe fn allocate_array<T>(
        &self,
        len: usize,
        scope: vk::SystemAllocationScope,
    ) -> Result<NonNull<T>, ShimError> {
        if len == 0 {
            return Ok(NonNull::dangling());
        }
        let layout = Layout::array::<T>(len).map_err(|_| ShimError::OutOfHostMemory)?;
        NonNull::new(self.allocate(layout.size(), layout.align(), scope).cast())
            .ok_or(ShimError::OutOfHostMemory)
    }

    /// # Safety
    /// `ptr` must come from [`Allocator::allocate_array`] with the same `len`.
    pub unsafe fn free_array<T>(&self, ptr: NonNull<T>, len: usize) {
        if len == 0 {
            return;
        }
        if let Ok(layout) = Layout::array::<T>(len) {
            self.free(ptr.as_ptr().cast(), layout.size(), layout.align());
        }
    }
}
