//! A `VkAllocationCallbacks` implementation that counts what goes through it.

#![allow(dead_code)]

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;

use ash::vk;

#[derive(Default)]
pub struct CountingAllocator {
    live: RefCell<HashMap<usize, Layout>>,
    allocations: Cell<usize>,
    reallocations: Cell<usize>,
    frees: Cell<usize>,
    internal_allocations: Cell<usize>,
    internal_frees: Cell<usize>,
    /// Fail the allocation with this index (counted from the last reset).
    fail_at: Cell<Option<usize>>,
    scopes: RefCell<Vec<vk::SystemAllocationScope>>,
}

impl CountingAllocator {
    /// Boxed so the user-data pointer stays put.
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn callbacks(&self) -> vk::AllocationCallbacks<'static> {
        let mut callbacks = vk::AllocationCallbacks::default();
        callbacks.p_user_data = self as *const Self as *mut c_void;
        callbacks.pfn_allocation = Some(allocation);
        callbacks.pfn_reallocation = Some(reallocation);
        callbacks.pfn_free = Some(free);
        callbacks
    }

    /// Same as [`CountingAllocator::callbacks`] plus the internal
    /// notification pair.
    pub fn callbacks_with_internal(&self) -> vk::AllocationCallbacks<'static> {
        let mut callbacks = self.callbacks();
        callbacks.pfn_internal_allocation = Some(internal_allocation);
        callbacks.pfn_internal_free = Some(internal_free);
        callbacks
    }

    pub fn user_data(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }

    pub fn outstanding(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.get()
    }

    pub fn reallocations(&self) -> usize {
        self.reallocations.get()
    }

    pub fn frees(&self) -> usize {
        self.frees.get()
    }

    pub fn internal_allocations(&self) -> usize {
        self.internal_allocations.get()
    }

    pub fn internal_frees(&self) -> usize {
        self.internal_frees.get()
    }

    pub fn scopes(&self) -> Vec<vk::SystemAllocationScope> {
        self.scopes.borrow().clone()
    }

    /// Reset the allocation index and fail the `index`th allocation from now.
    pub fn fail_at(&self, index: Option<usize>) {
        self.allocations.set(0);
        self.fail_at.set(index);
    }

    fn alloc(
        &self,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> *mut c_void {
        let index = self.allocations.get();
        self.allocations.set(index + 1);
        if self.fail_at.get() == Some(index) {
            return ptr::null_mut();
        }
        let Ok(layout) = Layout::from_size_align(size.max(1), alignment.max(1)) else {
            return ptr::null_mut();
        };
        let memory = unsafe { std::alloc::alloc(layout) };
        if !memory.is_null() {
            self.live.borrow_mut().insert(memory as usize, layout);
            self.scopes.borrow_mut().push(scope);
        }
        memory.cast()
    }

    fn dealloc(&self, memory: *mut c_void) -> Option<Layout> {
        if memory.is_null() {
            return None;
        }
        let layout = self
            .live
            .borrow_mut()
            .remove(&(memory as usize))
            .expect("free of memory this allocator does not own");
        unsafe { std::alloc::dealloc(memory.cast(), layout) };
        self.frees.set(self.frees.get() + 1);
        Some(layout)
    }
}

impl Drop for CountingAllocator {
    fn drop(&mut self) {
        for (&memory, &layout) in self.live.borrow().iter() {
            unsafe { std::alloc::dealloc(memory as *mut u8, layout) };
        }
    }
}

unsafe fn this<'a>(p_user_data: *mut c_void) -> &'a CountingAllocator {
    &*(p_user_data as *const CountingAllocator)
}

unsafe extern "system" fn allocation(
    p_user_data: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope,
) -> *mut c_void {
    this(p_user_data).alloc(size, alignment, scope)
}

unsafe extern "system" fn reallocation(
    p_user_data: *mut c_void,
    p_original: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope,
) -> *mut c_void {
    let counter = this(p_user_data);
    counter.reallocations.set(counter.reallocations.get() + 1);
    let memory = counter.alloc(size, alignment, scope);
    if memory.is_null() {
        return memory;
    }
    if !p_original.is_null() {
        let old_size = counter.live.borrow().get(&(p_original as usize)).map_or(0, |l| l.size());
        ptr::copy_nonoverlapping(p_original.cast::<u8>(), memory.cast::<u8>(), old_size.min(size));
        counter.dealloc(p_original);
    }
    memory
}

unsafe extern "system" fn free(p_user_data: *mut c_void, p_memory: *mut c_void) {
    this(p_user_data).dealloc(p_memory);
}

unsafe extern "system" fn internal_allocation(
    p_user_data: *mut c_void,
    _size: usize,
    _ty: vk::InternalAllocationType,
    _scope: vk::SystemAllocationScope,
) {
    let counter = this(p_user_data);
    counter.internal_allocations.set(counter.internal_allocations.get() + 1);
}

unsafe extern "system" fn internal_free(
    p_user_data: *mut c_void,
    _size: usize,
    _ty: vk::InternalAllocationType,
    _scope: vk::SystemAllocationScope,
) {
    let counter = this(p_user_data);
    counter.internal_frees.set(counter.internal_frees.get() + 1);
}
