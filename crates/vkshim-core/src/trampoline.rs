//! Native-convention entry points for the caller's allocation callbacks.
//!
//! The native library calls allocation callbacks with its own calling
//! convention, while the caller's callbacks expect the Vulkan `"system"`
//! convention. Handing the caller's pointers straight through would call them
//! with the wrong convention, so the native side gets these trampolines
//! instead. Their `user_data` is the [`Callbacks`] record they forward to.

use std::ffi::c_void;
use std::ptr;

use ash::vk;

use crate::allocator::{Allocator, Callbacks};

pub type NativeAllocationFunction = unsafe extern "C" fn(
    p_user_data: *mut c_void,
    size: usize,
    alignment: usize,
    allocation_scope: vk::SystemAllocationScope,
) -> *mut c_void;

pub type NativeReallocationFunction = unsafe extern "C" fn(
    p_user_data: *mut c_void,
    p_original: *mut c_void,
    size: usize,
    alignment: usize,
    allocation_scope: vk::SystemAllocationScope,
) -> *mut c_void;

pub type NativeFreeFunction = unsafe extern "C" fn(p_user_data: *mut c_void, p_memory: *mut c_void);

pub type NativeInternalNotification = unsafe extern "C" fn(
    p_user_data: *mut c_void,
    size: usize,
    allocation_type: vk::InternalAllocationType,
    allocation_scope: vk::SystemAllocationScope,
);

/// `VkAllocationCallbacks` as the native library reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeAllocationCallbacks {
    pub p_user_data: *mut c_void,
    pub pfn_allocation: Option<NativeAllocationFunction>,
    pub pfn_reallocation: Option<NativeReallocationFunction>,
    pub pfn_free: Option<NativeFreeFunction>,
    pub pfn_internal_allocation: Option<NativeInternalNotification>,
    pub pfn_internal_free: Option<NativeInternalNotification>,
}

impl Allocator {
    /// Callbacks to hand to the native library, or `None` for the process
    /// allocator.
    ///
    /// The result points back into `self`, which has to stay at the same
    /// address for as long as the native side may call it.
    pub fn native_callbacks(&self) -> Option<NativeAllocationCallbacks> {
        let callbacks = self.callbacks()?;
        let (pfn_internal_allocation, pfn_internal_free) = match callbacks.internal() {
            Some(_) => (
                Some(internal_allocation_trampoline as NativeInternalNotification),
                Some(internal_free_trampoline as NativeInternalNotification),
            ),
            None => (None, None),
        };

        Some(NativeAllocationCallbacks {
            p_user_data: callbacks as *const Callbacks as *mut c_void,
            pfn_allocation: Some(allocation_trampoline),
            pfn_reallocation: Some(reallocation_trampoline),
            pfn_free: Some(free_trampoline),
            pfn_internal_allocation,
            pfn_internal_free,
        })
    }
}

/// Pointer form of [`Allocator::native_callbacks`] for native calls.
pub fn as_native_ptr(
    callbacks: &Option<NativeAllocationCallbacks>,
) -> *const NativeAllocationCallbacks {
    callbacks.as_ref().map_or(ptr::null(), |cb| cb as *const NativeAllocationCallbacks)
}

unsafe fn recover<'a>(p_user_data: *mut c_void) -> &'a Callbacks {
    &*(p_user_data as *const Callbacks)
}

unsafe extern "C" fn allocation_trampoline(
    p_user_data: *mut c_void,
    size: usize,
    alignment: usize,
    allocation_scope: vk::SystemAllocationScope,
) -> *mut c_void {
    recover(p_user_data).allocate(size, alignment, allocation_scope)
}

unsafe extern "C" fn reallocation_trampoline(
    p_user_data: *mut c_void,
    p_original: *mut c_void,
    size: usize,
    alignment: usize,
    allocation_scope: vk::SystemAllocationScope,
) -> *mut c_void {
    recover(p_user_data).reallocate(p_original, size, alignment, allocation_scope)
}

unsafe extern "C" fn free_trampoline(p_user_data: *mut c_void, p_memory: *mut c_void) {
    recover(p_user_data).free(p_memory);
}

unsafe extern "C" fn internal_allocation_trampoline(
    p_user_data: *mut c_void,
    size: usize,
    allocation_type: vk::InternalAllocationType,
    allocation_scope: vk::SystemAllocationScope,
) {
    recover(p_user_data).notify_internal_allocation(size, allocation_type, allocation_scope);
}

unsafe extern "C" fn internal_free_trampoline(
    p_user_data: *mut c_void,
    size: usize,
    allocation_type: vk::InternalAllocationType,
    allocation_scope: vk::SystemAllocationScope,
) {
    recover(p_user_data).notify_internal_free(size, allocation_type, allocation_scope);
}
