//! Command pools and command buffers.
//!
//! Pools are not dispatchable, so the native handle goes to the caller
//! unchanged; the pool's allocator lives in the device registry because
//! `vkFreeCommandBuffers` and `vkAllocateCommandBuffers` take none. Every
//! command buffer is a separately allocated wrapper that holds one
//! reference on its pool's registry entry.

use std::ptr::NonNull;

use ash::vk::{self, Handle};
use tracing::{trace, warn};

use vkshim_core::trampoline::as_native_ptr;
use vkshim_core::{Allocator, ShimError};

use crate::device::Device;
use crate::dispatch::{DispatchHeader, Dispatchable, ObjectKind};
use crate::native::DeviceFns;

/// Handles translated per native call in `vkCmdExecuteCommands` and
/// `vkFreeCommandBuffers`.
pub const EXECUTE_BATCH_SIZE: usize = 32;

/// Shim-side record behind a `VkCommandBuffer`.
#[repr(C)]
pub struct CommandBuffer {
    pub header: DispatchHeader,
    pub(crate) device: NonNull<Device>,
    pub(crate) pool: vk::CommandPool,
    pub(crate) native: vk::CommandBuffer,
}

unsafe impl Dispatchable for CommandBuffer {
    const KIND: ObjectKind = ObjectKind::CommandBuffer;
    type Handle = vk::CommandBuffer;
}

impl CommandBuffer {
    /// The native command buffer this wrapper stands for.
    pub fn native(&self) -> vk::CommandBuffer {
        self.native
    }

    /// # Safety
    /// The owning device must be alive.
    pub(crate) unsafe fn fns(&self) -> &DeviceFns {
        &self.device.as_ref().fns
    }
}

/// Wrap one native command buffer allocated from `pool`.
unsafe fn wrap(
    record: &mut Device,
    device: NonNull<Device>,
    pool: vk::CommandPool,
    allocator: &Allocator,
    native: vk::CommandBuffer,
) -> Result<NonNull<CommandBuffer>, ShimError> {
    record
        .registry
        .register(pool.as_raw(), allocator, vk::SystemAllocationScope::OBJECT)?;

    let wrapper = CommandBuffer {
        header: DispatchHeader::new(ObjectKind::CommandBuffer),
        device,
        pool,
        native,
    };
    match allocator.create(wrapper, vk::SystemAllocationScope::OBJECT) {
        Ok(ptr) => {
            record
                .command_buffers
                .insert((pool.as_raw(), ptr.as_ptr() as usize));
            Ok(ptr)
        }
        Err(e) => {
            record.registry.release(pool.as_raw());
            Err(e)
        }
    }
}

/// Free a wrapper with its pool's allocator and drop its pool reference.
/// The caller removes it from the device's live set.
pub(crate) unsafe fn free_wrapper(device: &mut Device, wrapper: NonNull<CommandBuffer>) {
    let pool = (*wrapper.as_ptr()).pool.as_raw();
    match device.registry.get(pool).copied() {
        Some(allocator) => allocator.destroy(wrapper),
        None => warn!("command buffer {:p} has no registered pool", wrapper.as_ptr()),
    }
    device.registry.release(pool);
}

/// Free every wrapper still allocated from `pool`.
unsafe fn free_pool_wrappers(device: &mut Device, pool: vk::CommandPool) {
    let range = (pool.as_raw(), 0)..=(pool.as_raw(), usize::MAX);
    while let Some(&key) = device.command_buffers.range(range.clone()).next() {
        device.command_buffers.remove(&key);
        free_wrapper(device, NonNull::new_unchecked(key.1 as *mut CommandBuffer));
    }
}

// ── Command pools ───────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkCreateCommandPool(
    device: vk::Device,
    p_create_info: *const vk::CommandPoolCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_command_pool: *mut vk::CommandPool,
) -> vk::Result {
    trace!(
        "vkCreateCommandPool({:?}, {:p}, {:p}, {:p})",
        device,
        p_create_info,
        p_allocator,
        p_command_pool
    );

    let record = match Device::from_handle_mut(device) {
        Ok(record) => record,
        Err(e) => return e.as_device_result(),
    };
    let allocator = Allocator::from_raw(p_allocator, &record.allocator);

    // The snapshot in the pending entry is the native pool's callback context.
    let pending = match record
        .registry
        .prepare(&allocator, vk::SystemAllocationScope::OBJECT)
    {
        Ok(pending) => pending,
        Err(e) => return e.as_device_result(),
    };
    let callbacks = pending.allocator().native_callbacks();

    let mut pool = vk::CommandPool::null();
    let result = (record.fns.create_command_pool)(
        record.native,
        p_create_info,
        as_native_ptr(&callbacks),
        &mut pool,
    );
    if result != vk::Result::SUCCESS {
        record.registry.discard(pending);
        return result;
    }

    record.registry.insert(pool.as_raw(), pending);
    *p_command_pool = pool;
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyCommandPool(
    device: vk::Device,
    command_pool: vk::CommandPool,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    trace!("vkDestroyCommandPool({:?}, {:?}, {:p})", device, command_pool, p_allocator);

    if command_pool == vk::CommandPool::null() {
        return;
    }
    let Ok(record) = Device::from_handle_mut(device) else {
        return;
    };

    let base = record
        .registry
        .get(command_pool.as_raw())
        .copied()
        .unwrap_or(record.allocator);
    let destroy_allocator = Allocator::from_raw(p_allocator, &base);
    let callbacks = destroy_allocator.native_callbacks();
    (record.fns.destroy_command_pool)(record.native, command_pool, as_native_ptr(&callbacks));

    free_pool_wrappers(record, command_pool);
    record.registry.release(command_pool.as_raw());
}

#[no_mangle]
pub unsafe extern "system" fn vkResetCommandPool(
    device: vk::Device,
    command_pool: vk::CommandPool,
    flags: vk::CommandPoolResetFlags,
) -> vk::Result {
    trace!("vkResetCommandPool({:?}, {:?}, {:?})", device, command_pool, flags);
    match Device::from_handle_ref(device) {
        Ok(record) => (record.fns.reset_command_pool)(record.native, command_pool, flags),
        Err(_) => vk::Result::ERROR_DEVICE_LOST,
    }
}

// ── Command buffers ─────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkAllocateCommandBuffers(
    device: vk::Device,
    p_allocate_info: *const vk::CommandBufferAllocateInfo<'_>,
    p_command_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    trace!(
        "vkAllocateCommandBuffers({:?}, {:p}, {:p})",
        device,
        p_allocate_info,
        p_command_buffers
    );

    if p_allocate_info.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let device_ptr = match Device::from_handle(device) {
        Ok(ptr) => ptr,
        Err(e) => return e.as_device_result(),
    };
    let record = &mut *device_ptr.as_ptr();
    let info = &*p_allocate_info;
    let pool = info.command_pool;
    let count = info.command_buffer_count as usize;

    let Some(allocator) = record.registry.get(pool.as_raw()).copied() else {
        warn!("vkAllocateCommandBuffers: unknown command pool {:?}", pool);
        return ShimError::InvalidHandle("command pool").as_device_result();
    };

    // Native handles land in the caller's array and are swapped for
    // wrappers in place.
    let result = (record.fns.allocate_command_buffers)(record.native, info, p_command_buffers);
    if result != vk::Result::SUCCESS {
        return result;
    }

    for i in 0..count {
        let slot = p_command_buffers.add(i);
        match wrap(record, device_ptr, pool, &allocator, *slot) {
            Ok(wrapper) => *slot = CommandBuffer::to_handle(wrapper),
            Err(e) => {
                for done in 0..i {
                    let slot = p_command_buffers.add(done);
                    let wrapper =
                        NonNull::new_unchecked(slot.read().as_raw() as usize as *mut CommandBuffer);
                    *slot = (*wrapper.as_ptr()).native;
                    record
                        .command_buffers
                        .remove(&(pool.as_raw(), wrapper.as_ptr() as usize));
                    free_wrapper(record, wrapper);
                }
                (record.fns.free_command_buffers)(
                    record.native,
                    pool,
                    count as u32,
                    p_command_buffers,
                );
                for j in 0..count {
                    *p_command_buffers.add(j) = vk::CommandBuffer::null();
                }
                return e.as_device_result();
            }
        }
    }
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkFreeCommandBuffers(
    device: vk::Device,
    command_pool: vk::CommandPool,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    trace!(
        "vkFreeCommandBuffers({:?}, {:?}, {}, {:p})",
        device,
        command_pool,
        command_buffer_count,
        p_command_buffers
    );

    if command_buffer_count == 0 || p_command_buffers.is_null() {
        return;
    }
    let Ok(record) = Device::from_handle_mut(device) else {
        return;
    };
    let handles = std::slice::from_raw_parts(p_command_buffers, command_buffer_count as usize);

    let mut natives = [vk::CommandBuffer::null(); EXECUTE_BATCH_SIZE];
    let mut wrappers: [Option<NonNull<CommandBuffer>>; EXECUTE_BATCH_SIZE] =
        [None; EXECUTE_BATCH_SIZE];
    for chunk in handles.chunks(EXECUTE_BATCH_SIZE) {
        for (k, &handle) in chunk.iter().enumerate() {
            // Null entries are allowed and ignored.
            wrappers[k] = if handle == vk::CommandBuffer::null() {
                None
            } else {
                CommandBuffer::from_handle(handle).ok()
            };
            natives[k] = match wrappers[k] {
                Some(wrapper) => (*wrapper.as_ptr()).native,
                None => vk::CommandBuffer::null(),
            };
        }

        (record.fns.free_command_buffers)(
            record.native,
            command_pool,
            chunk.len() as u32,
            natives.as_ptr(),
        );

        for wrapper in wrappers[..chunk.len()].iter_mut().filter_map(Option::take) {
            record
                .command_buffers
                .remove(&(command_pool.as_raw(), wrapper.as_ptr() as usize));
            free_wrapper(record, wrapper);
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkBeginCommandBuffer(
    command_buffer: vk::CommandBuffer,
    p_begin_info: *const vk::CommandBufferBeginInfo<'_>,
) -> vk::Result {
    trace!("vkBeginCommandBuffer({:?}, {:p})", command_buffer, p_begin_info);
    match CommandBuffer::from_handle_ref(command_buffer) {
        Ok(cb) => (cb.fns().begin_command_buffer)(cb.native, p_begin_info),
        Err(e) => e.as_device_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkEndCommandBuffer(command_buffer: vk::CommandBuffer) -> vk::Result {
    trace!("vkEndCommandBuffer({:?})", command_buffer);
    match CommandBuffer::from_handle_ref(command_buffer) {
        Ok(cb) => (cb.fns().end_command_buffer)(cb.native),
        Err(e) => e.as_device_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkResetCommandBuffer(
    command_buffer: vk::CommandBuffer,
    flags: vk::CommandBufferResetFlags,
) -> vk::Result {
    trace!("vkResetCommandBuffer({:?}, {:?})", command_buffer, flags);
    match CommandBuffer::from_handle_ref(command_buffer) {
        Ok(cb) => (cb.fns().reset_command_buffer)(cb.native, flags),
        Err(e) => e.as_device_result(),
    }
}

// ── Recording ───────────────────────────────────────────────

/// Record secondary command buffers, translated `EXECUTE_BATCH_SIZE` at a
/// time through a stack buffer.
#[no_mangle]
pub unsafe extern "system" fn vkCmdExecuteCommands(
    command_buffer: vk::CommandBuffer,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    trace!(
        "vkCmdExecuteCommands({:?}, {}, {:p})",
        command_buffer,
        command_buffer_count,
        p_command_buffers
    );

    let Ok(cb) = CommandBuffer::from_handle_ref(command_buffer) else {
        return;
    };
    if command_buffer_count == 0 || p_command_buffers.is_null() {
        return;
    }
    let secondaries = std::slice::from_raw_parts(p_command_buffers, command_buffer_count as usize);

    // Nothing reaches the primary unless every secondary is valid.
    if let Some(index) = secondaries
        .iter()
        .position(|&handle| CommandBuffer::from_handle(handle).is_err())
    {
        warn!("vkCmdExecuteCommands: invalid secondary at index {}, nothing recorded", index);
        return;
    }

    let mut natives = [vk::CommandBuffer::null(); EXECUTE_BATCH_SIZE];
    for chunk in secondaries.chunks(EXECUTE_BATCH_SIZE) {
        for (k, &handle) in chunk.iter().enumerate() {
            natives[k] = match CommandBuffer::from_handle_ref(handle) {
                Ok(secondary) => secondary.native,
                Err(_) => vk::CommandBuffer::null(),
            };
        }
        (cb.fns().cmd_execute_commands)(cb.native, chunk.len() as u32, natives.as_ptr());
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkCmdFillBuffer(
    command_buffer: vk::CommandBuffer,
    dst_buffer: vk::Buffer,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
    data: u32,
) {
    trace!(
        "vkCmdFillBuffer({:?}, {:?}, {}, {}, {:#x})",
        command_buffer,
        dst_buffer,
        dst_offset,
        size,
        data
    );
    let Ok(cb) = CommandBuffer::from_handle_ref(command_buffer) else {
        return;
    };
    (cb.fns().cmd_fill_buffer)(cb.native, dst_buffer, dst_offset, size, data);
}

#[no_mangle]
pub unsafe extern "system" fn vkCmdCopyBuffer(
    command_buffer: vk::CommandBuffer,
    src_buffer: vk::Buffer,
    dst_buffer: vk::Buffer,
    region_count: u32,
    p_regions: *const vk::BufferCopy,
) {
    trace!(
        "vkCmdCopyBuffer({:?}, {:?}, {:?}, {}, {:p})",
        command_buffer,
        src_buffer,
        dst_buffer,
        region_count,
        p_regions
    );
    let Ok(cb) = CommandBuffer::from_handle_ref(command_buffer) else {
        return;
    };
    (cb.fns().cmd_copy_buffer)(cb.native, src_buffer, dst_buffer, region_count, p_regions);
}

#[no_mangle]
pub unsafe extern "system" fn vkCmdDispatch(
    command_buffer: vk::CommandBuffer,
    group_count_x: u32,
    group_count_y: u32,
    group_count_z: u32,
) {
    trace!(
        "vkCmdDispatch({:?}, {}, {}, {})",
        command_buffer,
        group_count_x,
        group_count_y,
        group_count_z
    );
    let Ok(cb) = CommandBuffer::from_handle_ref(command_buffer) else {
        return;
    };
    (cb.fns().cmd_dispatch)(cb.native, group_count_x, group_count_y, group_count_z);
}

#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "system" fn vkCmdPipelineBarrier(
    command_buffer: vk::CommandBuffer,
    src_stage_mask: vk::PipelineStageFlags,
    dst_stage_mask: vk::PipelineStageFlags,
    dependency_flags: vk::DependencyFlags,
    memory_barrier_count: u32,
    p_memory_barriers: *const vk::MemoryBarrier<'_>,
    buffer_memory_barrier_count: u32,
    p_buffer_memory_barriers: *const vk::BufferMemoryBarrier<'_>,
    image_memory_barrier_count: u32,
    p_image_memory_barriers: *const vk::ImageMemoryBarrier<'_>,
) {
    trace!(
        "vkCmdPipelineBarrier({:?}, {:?}, {:?}, {:?}, {}, {}, {})",
        command_buffer,
        src_stage_mask,
        dst_stage_mask,
        dependency_flags,
        memory_barrier_count,
        buffer_memory_barrier_count,
        image_memory_barrier_count
    );
    let Ok(cb) = CommandBuffer::from_handle_ref(command_buffer) else {
        return;
    };
    (cb.fns().cmd_pipeline_barrier)(
        cb.native,
        src_stage_mask,
        dst_stage_mask,
        dependency_flags,
        memory_barrier_count,
        p_memory_barriers,
        buffer_memory_barrier_count,
        p_buffer_memory_barriers,
        image_memory_barrier_count,
        p_image_memory_barriers,
    );
}
