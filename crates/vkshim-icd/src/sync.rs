//! Queue submission and fences.

use std::alloc::Layout;
use std::ffi::c_void;

use ash::vk::{self, Handle};
use tracing::trace;

use vkshim_core::trampoline::as_native_ptr;
use vkshim_core::{Allocator, ShimError};

use crate::command::CommandBuffer;
use crate::device::{Device, Queue};
use crate::dispatch::Dispatchable;

/// One block holding `submit_count` submit infos followed by `total`
/// native command-buffer handles. Returns the layout and the handle offset.
fn submit_layout(submit_count: usize, total: usize) -> Result<(Layout, usize), ShimError> {
    let infos = Layout::array::<vk::SubmitInfo<'static>>(submit_count)
        .map_err(|_| ShimError::OutOfHostMemory)?;
    let handles =
        Layout::array::<vk::CommandBuffer>(total).map_err(|_| ShimError::OutOfHostMemory)?;
    infos.extend(handles).map_err(|_| ShimError::OutOfHostMemory)
}

unsafe fn queue_submit(
    queue: &Queue,
    submits: &[vk::SubmitInfo<'_>],
    fence: vk::Fence,
) -> Result<vk::Result, ShimError> {
    let device = queue.device();
    let total: usize = submits
        .iter()
        .map(|submit| submit.command_buffer_count as usize)
        .sum();

    if total == 0 {
        return Ok((device.fns.queue_submit)(
            queue.native,
            submits.len() as u32,
            submits.as_ptr(),
            fence,
        ));
    }

    let (layout, handle_offset) = submit_layout(submits.len(), total)?;
    let block = device
        .allocator
        .allocate(layout.size(), layout.align(), vk::SystemAllocationScope::COMMAND);
    if block.is_null() {
        return Err(ShimError::OutOfHostMemory);
    }
    let free = |block: *mut c_void| device.allocator.free(block, layout.size(), layout.align());

    let infos = block.cast::<vk::SubmitInfo<'_>>();
    let handles = block.cast::<u8>().add(handle_offset).cast::<vk::CommandBuffer>();

    let mut cursor = 0usize;
    for (i, submit) in submits.iter().enumerate() {
        let mut copy = *submit;
        let count = submit.command_buffer_count as usize;
        if count > 0 {
            for k in 0..count {
                let handle = *submit.p_command_buffers.add(k);
                match CommandBuffer::from_handle_ref(handle) {
                    Ok(cb) => handles.add(cursor + k).write(cb.native),
                    Err(e) => {
                        free(block);
                        return Err(e);
                    }
                }
            }
            copy.p_command_buffers = handles.add(cursor);
        }
        cursor += count;
        infos.add(i).write(copy);
    }

    let result = (device.fns.queue_submit)(queue.native, submits.len() as u32, infos, fence);
    free(block);
    Ok(result)
}

#[no_mangle]
pub unsafe extern "system" fn vkQueueSubmit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    trace!("vkQueueSubmit({:?}, {}, {:p}, {:?})", queue, submit_count, p_submits, fence);

    let record = match Queue::from_handle_ref(queue) {
        Ok(record) => record,
        Err(_) => return vk::Result::ERROR_DEVICE_LOST,
    };
    let submits = if submit_count == 0 || p_submits.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(p_submits, submit_count as usize)
    };

    match queue_submit(record, submits, fence) {
        Ok(result) => result,
        Err(e) => e.as_device_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkQueueWaitIdle(queue: vk::Queue) -> vk::Result {
    trace!("vkQueueWaitIdle({:?})", queue);
    match Queue::from_handle_ref(queue) {
        Ok(record) => (record.device().fns.queue_wait_idle)(record.native),
        Err(_) => vk::Result::ERROR_DEVICE_LOST,
    }
}

// ── Fences ──────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkCreateFence(
    device: vk::Device,
    p_create_info: *const vk::FenceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_fence: *mut vk::Fence,
) -> vk::Result {
    trace!(
        "vkCreateFence({:?}, {:p}, {:p}, {:p})",
        device,
        p_create_info,
        p_allocator,
        p_fence
    );

    let record = match Device::from_handle_mut(device) {
        Ok(record) => record,
        Err(e) => return e.as_device_result(),
    };

    if p_allocator.is_null() {
        let callbacks = record.allocator.native_callbacks();
        return (record.fns.create_fence)(
            record.native,
            p_create_info,
            as_native_ptr(&callbacks),
            p_fence,
        );
    }

    // An explicit allocator has to outlive this call, so it gets a
    // registry snapshot for the fence lifetime.
    let allocator = Allocator::from_raw(p_allocator, &record.allocator);
    let pending = match record
        .fence_allocators
        .prepare(&allocator, vk::SystemAllocationScope::OBJECT)
    {
        Ok(pending) => pending,
        Err(e) => return e.as_device_result(),
    };
    let callbacks = pending.allocator().native_callbacks();

    let mut fence = vk::Fence::null();
    let result = (record.fns.create_fence)(
        record.native,
        p_create_info,
        as_native_ptr(&callbacks),
        &mut fence,
    );
    if result != vk::Result::SUCCESS {
        record.fence_allocators.discard(pending);
        return result;
    }
    record.fence_allocators.insert(fence.as_raw(), pending);
    *p_fence = fence;
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyFence(
    device: vk::Device,
    fence: vk::Fence,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    trace!("vkDestroyFence({:?}, {:?}, {:p})", device, fence, p_allocator);

    if fence == vk::Fence::null() {
        return;
    }
    let Ok(record) = Device::from_handle_mut(device) else {
        return;
    };

    let base = record
        .fence_allocators
        .get(fence.as_raw())
        .copied()
        .unwrap_or(record.allocator);
    let destroy_allocator = Allocator::from_raw(p_allocator, &base);
    let callbacks = destroy_allocator.native_callbacks();
    (record.fns.destroy_fence)(record.native, fence, as_native_ptr(&callbacks));

    if record.fence_allocators.contains(fence.as_raw()) {
        record.fence_allocators.release(fence.as_raw());
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkWaitForFences(
    device: vk::Device,
    fence_count: u32,
    p_fences: *const vk::Fence,
    wait_all: vk::Bool32,
    timeout: u64,
) -> vk::Result {
    trace!(
        "vkWaitForFences({:?}, {}, {:p}, {}, {})",
        device,
        fence_count,
        p_fences,
        wait_all,
        timeout
    );
    match Device::from_handle_ref(device) {
        Ok(record) => (record.fns.wait_for_fences)(
            record.native,
            fence_count,
            p_fences,
            wait_all,
            timeout,
        ),
        Err(_) => vk::Result::ERROR_DEVICE_LOST,
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkResetFences(
    device: vk::Device,
    fence_count: u32,
    p_fences: *const vk::Fence,
) -> vk::Result {
    trace!("vkResetFences({:?}, {}, {:p})", device, fence_count, p_fences);
    match Device::from_handle_ref(device) {
        Ok(record) => (record.fns.reset_fences)(record.native, fence_count, p_fences),
        Err(_) => vk::Result::ERROR_DEVICE_LOST,
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetFenceStatus(device: vk::Device, fence: vk::Fence) -> vk::Result {
    trace!("vkGetFenceStatus({:?}, {:?})", device, fence);
    match Device::from_handle_ref(device) {
        Ok(record) => (record.fns.get_fence_status)(record.native, fence),
        Err(_) => vk::Result::ERROR_DEVICE_LOST,
    }
}
