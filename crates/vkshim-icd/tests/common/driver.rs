//! A native Vulkan driver made of C-convention functions, installed through
//! `native::use_static_entry`. Each test thread sees its own driver state.
//!
//! Native objects created with callbacks allocate through them, so the
//! bridged callbacks show up in a `CountingAllocator`.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_char, c_void, CStr};
use std::mem;

use ash::vk::{self, Handle};
use vkshim_core::trampoline::NativeAllocationCallbacks;
use vkshim_icd::native::{self, pfn, NativeVoidFunction};

pub const PHYSICAL_DEVICE_BASE: u64 = 0x0dd0_0000;
pub const QUEUE_BASE: u64 = 0x0ee0_0000;
pub const QUEUE_FAMILY_COUNT: u32 = 3;
pub const VENDOR_ID: u32 = 0x1af4;

pub struct MockDriver {
    pub physical_device_count: u32,
    /// Entry points the driver pretends not to have.
    pub missing: Vec<&'static str>,
    pub create_device_result: vk::Result,
    /// Live native objects; `Some` when allocated through callbacks.
    pub objects: HashMap<u64, Option<*mut c_void>>,
    /// Live native command buffers and their pools.
    pub command_buffers: BTreeMap<u64, u64>,
    pub execute_batches: Vec<u32>,
    pub executed: Vec<u64>,
    pub free_batches: Vec<u32>,
    /// Native command buffers per submit info, per submit call.
    pub submits: Vec<Vec<Vec<u64>>>,
    /// (operation, native handle) for forwarded calls.
    pub calls: Vec<(&'static str, u64)>,
    pub errors: Vec<String>,
    next_handle: u64,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self {
            physical_device_count: 3,
            missing: Vec::new(),
            create_device_result: vk::Result::SUCCESS,
            objects: HashMap::new(),
            command_buffers: BTreeMap::new(),
            execute_batches: Vec::new(),
            executed: Vec::new(),
            free_batches: Vec::new(),
            submits: Vec::new(),
            calls: Vec::new(),
            errors: Vec::new(),
            next_handle: 0x10_0000,
        }
    }
}

thread_local! {
    static DRIVER: RefCell<MockDriver> = RefCell::new(MockDriver::default());
}

/// Reset this thread's driver and point the ICD at it.
pub fn install() {
    DRIVER.with(|driver| *driver.borrow_mut() = MockDriver::default());
    native::use_static_entry(Some(get_instance_proc_addr));
}

pub fn with_driver<R>(f: impl FnOnce(&mut MockDriver) -> R) -> R {
    DRIVER.with(|driver| f(&mut driver.borrow_mut()))
}

pub fn live_objects() -> usize {
    with_driver(|d| d.objects.len())
}

fn record(op: &'static str, handle: u64) {
    with_driver(|d| d.calls.push((op, handle)));
}

unsafe fn new_object(
    p_allocator: *const NativeAllocationCallbacks,
    scope: vk::SystemAllocationScope,
) -> Option<u64> {
    match p_allocator.as_ref() {
        Some(callbacks) => {
            let allocate = callbacks.pfn_allocation?;
            let memory = allocate(callbacks.p_user_data, 16, 8, scope);
            if memory.is_null() {
                return None;
            }
            with_driver(|d| d.objects.insert(memory as u64, Some(memory)));
            Some(memory as u64)
        }
        None => Some(with_driver(|d| {
            d.next_handle += 1;
            d.objects.insert(d.next_handle, None);
            d.next_handle
        })),
    }
}

unsafe fn destroy_object(handle: u64, p_allocator: *const NativeAllocationCallbacks) {
    let object = with_driver(|d| d.objects.remove(&handle));
    let free = p_allocator
        .as_ref()
        .and_then(|cb| cb.pfn_free.map(|free| (cb, free)));
    match object {
        Some(Some(memory)) => match free {
            Some((callbacks, free)) => free(callbacks.p_user_data, memory),
            None => with_driver(|d| {
                d.errors.push(format!(
                    "object {handle:#x} allocated through callbacks destroyed without them"
                ))
            }),
        },
        Some(None) => {}
        None => with_driver(|d| d.errors.push(format!("destroy of unknown object {handle:#x}"))),
    }
}

macro_rules! export {
    ($ty:ident, $f:ident) => {
        Some(mem::transmute::<pfn::$ty, unsafe extern "C" fn()>($f as pfn::$ty))
    };
}

unsafe fn lookup(name: &str) -> NativeVoidFunction {
    if with_driver(|d| d.missing.iter().any(|missing| *missing == name)) {
        return None;
    }
    match name {
        "vkCreateInstance" => export!(CreateInstance, create_instance),
        "vkDestroyInstance" => export!(DestroyInstance, destroy_instance),
        "vkEnumeratePhysicalDevices" => {
            export!(EnumeratePhysicalDevices, enumerate_physical_devices)
        }
        "vkGetPhysicalDeviceFeatures" => {
            export!(GetPhysicalDeviceFeatures, get_physical_device_features)
        }
        "vkGetPhysicalDeviceProperties" => {
            export!(GetPhysicalDeviceProperties, get_physical_device_properties)
        }
        "vkGetPhysicalDeviceQueueFamilyProperties" => export!(
            GetPhysicalDeviceQueueFamilyProperties,
            get_physical_device_queue_family_properties
        ),
        "vkGetPhysicalDeviceMemoryProperties" => {
            export!(GetPhysicalDeviceMemoryProperties, get_physical_device_memory_properties)
        }
        "vkGetPhysicalDeviceFormatProperties" => {
            export!(GetPhysicalDeviceFormatProperties, get_physical_device_format_properties)
        }
        "vkCreateDevice" => export!(CreateDevice, create_device),
        "vkGetDeviceProcAddr" => export!(GetDeviceProcAddr, get_device_proc_addr),
        "vkDestroyDevice" => export!(DestroyDevice, destroy_device),
        "vkGetDeviceQueue" => export!(GetDeviceQueue, get_device_queue),
        "vkDeviceWaitIdle" => export!(DeviceWaitIdle, device_wait_idle),
        "vkQueueSubmit" => export!(QueueSubmit, queue_submit),
        "vkQueueWaitIdle" => export!(QueueWaitIdle, queue_wait_idle),
        "vkCreateCommandPool" => export!(CreateCommandPool, create_command_pool),
        "vkDestroyCommandPool" => export!(DestroyCommandPool, destroy_command_pool),
        "vkResetCommandPool" => export!(ResetCommandPool, reset_command_pool),
        "vkAllocateCommandBuffers" => export!(AllocateCommandBuffers, allocate_command_buffers),
        "vkFreeCommandBuffers" => export!(FreeCommandBuffers, free_command_buffers),
        "vkBeginCommandBuffer" => export!(BeginCommandBuffer, begin_command_buffer),
        "vkEndCommandBuffer" => export!(EndCommandBuffer, end_command_buffer),
        "vkResetCommandBuffer" => export!(ResetCommandBuffer, reset_command_buffer),
        "vkCmdExecuteCommands" => export!(CmdExecuteCommands, cmd_execute_commands),
        "vkCmdFillBuffer" => export!(CmdFillBuffer, cmd_fill_buffer),
        "vkCmdCopyBuffer" => export!(CmdCopyBuffer, cmd_copy_buffer),
        "vkCmdDispatch" => export!(CmdDispatch, cmd_dispatch),
        "vkCmdPipelineBarrier" => export!(CmdPipelineBarrier, cmd_pipeline_barrier),
        "vkCreateFence" => export!(CreateFence, create_fence),
        "vkDestroyFence" => export!(DestroyFence, destroy_fence),
        "vkWaitForFences" => export!(WaitForFences, wait_for_fences),
        "vkResetFences" => export!(ResetFences, reset_fences),
        "vkGetFenceStatus" => export!(GetFenceStatus, get_fence_status),
        _ => None,
    }
}

unsafe extern "C" fn get_instance_proc_addr(
    _instance: vk::Instance,
    p_name: *const c_char,
) -> NativeVoidFunction {
    lookup(CStr::from_ptr(p_name).to_str().unwrap_or(""))
}

unsafe extern "C" fn get_device_proc_addr(
    _device: vk::Device,
    p_name: *const c_char,
) -> NativeVoidFunction {
    lookup(CStr::from_ptr(p_name).to_str().unwrap_or(""))
}

// ── Instance ────────────────────────────────────────────────

unsafe extern "C" fn create_instance(
    _p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const NativeAllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    match new_object(p_allocator, vk::SystemAllocationScope::INSTANCE) {
        Some(handle) => {
            *p_instance = vk::Instance::from_raw(handle);
            vk::Result::SUCCESS
        }
        None => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
    }
}

unsafe extern "C" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const NativeAllocationCallbacks,
) {
    destroy_object(instance.as_raw(), p_allocator);
}

unsafe extern "C" fn enumerate_physical_devices(
    _instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    let total = with_driver(|d| d.physical_device_count);
    if p_physical_devices.is_null() {
        *p_physical_device_count = total;
        return vk::Result::SUCCESS;
    }
    let count = total.min(*p_physical_device_count);
    for i in 0..count {
        *p_physical_devices.add(i as usize) =
            vk::PhysicalDevice::from_raw(PHYSICAL_DEVICE_BASE + i as u64);
    }
    *p_physical_device_count = count;
    if count < total {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

unsafe extern "C" fn get_physical_device_features(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures,
) {
    record("features", physical_device.as_raw());
    (*p_features).shader_float64 = vk::TRUE;
}

unsafe extern "C" fn get_physical_device_properties(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties,
) {
    (*p_properties).vendor_id = VENDOR_ID;
    (*p_properties).device_id = (physical_device.as_raw() - PHYSICAL_DEVICE_BASE) as u32;
}

unsafe extern "C" fn get_physical_device_queue_family_properties(
    _physical_device: vk::PhysicalDevice,
    p_queue_family_property_count: *mut u32,
    p_queue_family_properties: *mut vk::QueueFamilyProperties,
) {
    if p_queue_family_properties.is_null() {
        *p_queue_family_property_count = QUEUE_FAMILY_COUNT;
        return;
    }
    let count = (*p_queue_family_property_count).min(QUEUE_FAMILY_COUNT);
    for i in 0..count as usize {
        let properties = &mut *p_queue_family_properties.add(i);
        properties.queue_flags = vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        properties.queue_count = 4;
    }
    *p_queue_family_property_count = count;
}

unsafe extern "C" fn get_physical_device_memory_properties(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties,
) {
    record("memory", physical_device.as_raw());
    (*p_memory_properties).memory_heap_count = 1;
    (*p_memory_properties).memory_heaps[0].size = 1 << 30;
}

unsafe extern "C" fn get_physical_device_format_properties(
    physical_device: vk::PhysicalDevice,
    _format: vk::Format,
    p_format_properties: *mut vk::FormatProperties,
) {
    record("format", physical_device.as_raw());
    (*p_format_properties).buffer_features = vk::FormatFeatureFlags::STORAGE_TEXEL_BUFFER;
}

unsafe extern "C" fn create_device(
    _physical_device: vk::PhysicalDevice,
    _p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const NativeAllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    let result = with_driver(|d| d.create_device_result);
    if result != vk::Result::SUCCESS {
        return result;
    }
    match new_object(p_allocator, vk::SystemAllocationScope::DEVICE) {
        Some(handle) => {
            *p_device = vk::Device::from_raw(handle);
            vk::Result::SUCCESS
        }
        None => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
    }
}

// ── Device ──────────────────────────────────────────────────

unsafe extern "C" fn destroy_device(
    device: vk::Device,
    p_allocator: *const NativeAllocationCallbacks,
) {
    destroy_object(device.as_raw(), p_allocator);
}

unsafe extern "C" fn get_device_queue(
    _device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    *p_queue =
        vk::Queue::from_raw(QUEUE_BASE | (queue_family_index as u64) << 8 | queue_index as u64);
}

unsafe extern "C" fn device_wait_idle(device: vk::Device) -> vk::Result {
    record("device_wait_idle", device.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn queue_submit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo<'_>,
    _fence: vk::Fence,
) -> vk::Result {
    record("queue_submit", queue.as_raw());
    let mut batches = Vec::new();
    for i in 0..submit_count as usize {
        let submit = &*p_submits.add(i);
        let handles = (0..submit.command_buffer_count as usize)
            .map(|k| (*submit.p_command_buffers.add(k)).as_raw())
            .collect();
        batches.push(handles);
    }
    with_driver(|d| d.submits.push(batches));
    vk::Result::SUCCESS
}

unsafe extern "C" fn queue_wait_idle(queue: vk::Queue) -> vk::Result {
    record("queue_wait_idle", queue.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn create_command_pool(
    _device: vk::Device,
    _p_create_info: *const vk::CommandPoolCreateInfo<'_>,
    p_allocator: *const NativeAllocationCallbacks,
    p_command_pool: *mut vk::CommandPool,
) -> vk::Result {
    match new_object(p_allocator, vk::SystemAllocationScope::OBJECT) {
        Some(handle) => {
            *p_command_pool = vk::CommandPool::from_raw(handle);
            vk::Result::SUCCESS
        }
        None => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
    }
}

unsafe extern "C" fn destroy_command_pool(
    _device: vk::Device,
    command_pool: vk::CommandPool,
    p_allocator: *const NativeAllocationCallbacks,
) {
    let pool = command_pool.as_raw();
    with_driver(|d| d.command_buffers.retain(|_, owner| *owner != pool));
    destroy_object(pool, p_allocator);
}

unsafe extern "C" fn reset_command_pool(
    _device: vk::Device,
    command_pool: vk::CommandPool,
    _flags: vk::CommandPoolResetFlags,
) -> vk::Result {
    record("reset_command_pool", command_pool.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn allocate_command_buffers(
    _device: vk::Device,
    p_allocate_info: *const vk::CommandBufferAllocateInfo<'_>,
    p_command_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    let info = &*p_allocate_info;
    let pool = info.command_pool.as_raw();
    with_driver(|d| {
        for i in 0..info.command_buffer_count as usize {
            d.next_handle += 1;
            d.command_buffers.insert(d.next_handle, pool);
            *p_command_buffers.add(i) = vk::CommandBuffer::from_raw(d.next_handle);
        }
    });
    vk::Result::SUCCESS
}

unsafe extern "C" fn free_command_buffers(
    _device: vk::Device,
    _command_pool: vk::CommandPool,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    with_driver(|d| {
        d.free_batches.push(command_buffer_count);
        for i in 0..command_buffer_count as usize {
            let handle = (*p_command_buffers.add(i)).as_raw();
            if handle != 0 && d.command_buffers.remove(&handle).is_none() {
                d.errors.push(format!("free of unknown command buffer {handle:#x}"));
            }
        }
    });
}

unsafe extern "C" fn begin_command_buffer(
    command_buffer: vk::CommandBuffer,
    _p_begin_info: *const vk::CommandBufferBeginInfo<'_>,
) -> vk::Result {
    record("begin", command_buffer.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn end_command_buffer(command_buffer: vk::CommandBuffer) -> vk::Result {
    record("end", command_buffer.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn reset_command_buffer(
    command_buffer: vk::CommandBuffer,
    _flags: vk::CommandBufferResetFlags,
) -> vk::Result {
    record("reset", command_buffer.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn cmd_execute_commands(
    command_buffer: vk::CommandBuffer,
    command_buffer_count: u32,
    p_command_buffers: *const vk::CommandBuffer,
) {
    record("execute", command_buffer.as_raw());
    with_driver(|d| {
        d.execute_batches.push(command_buffer_count);
        for i in 0..command_buffer_count as usize {
            d.executed.push((*p_command_buffers.add(i)).as_raw());
        }
    });
}

unsafe extern "C" fn cmd_fill_buffer(
    command_buffer: vk::CommandBuffer,
    _dst_buffer: vk::Buffer,
    _dst_offset: vk::DeviceSize,
    _size: vk::DeviceSize,
    _data: u32,
) {
    record("fill", command_buffer.as_raw());
}

unsafe extern "C" fn cmd_copy_buffer(
    command_buffer: vk::CommandBuffer,
    _src_buffer: vk::Buffer,
    _dst_buffer: vk::Buffer,
    _region_count: u32,
    _p_regions: *const vk::BufferCopy,
) {
    record("copy", command_buffer.as_raw());
}

unsafe extern "C" fn cmd_dispatch(command_buffer: vk::CommandBuffer, _x: u32, _y: u32, _z: u32) {
    record("dispatch", command_buffer.as_raw());
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn cmd_pipeline_barrier(
    command_buffer: vk::CommandBuffer,
    _src_stage_mask: vk::PipelineStageFlags,
    _dst_stage_mask: vk::PipelineStageFlags,
    _dependency_flags: vk::DependencyFlags,
    _memory_barrier_count: u32,
    _p_memory_barriers: *const vk::MemoryBarrier<'_>,
    _buffer_memory_barrier_count: u32,
    _p_buffer_memory_barriers: *const vk::BufferMemoryBarrier<'_>,
    _image_memory_barrier_count: u32,
    _p_image_memory_barriers: *const vk::ImageMemoryBarrier<'_>,
) {
    record("barrier", command_buffer.as_raw());
}

// ── Fences ──────────────────────────────────────────────────

unsafe extern "C" fn create_fence(
    _device: vk::Device,
    _p_create_info: *const vk::FenceCreateInfo<'_>,
    p_allocator: *const NativeAllocationCallbacks,
    p_fence: *mut vk::Fence,
) -> vk::Result {
    match new_object(p_allocator, vk::SystemAllocationScope::OBJECT) {
        Some(handle) => {
            *p_fence = vk::Fence::from_raw(handle);
            vk::Result::SUCCESS
        }
        None => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
    }
}

unsafe extern "C" fn destroy_fence(
    _device: vk::Device,
    fence: vk::Fence,
    p_allocator: *const NativeAllocationCallbacks,
) {
    destroy_object(fence.as_raw(), p_allocator);
}

unsafe extern "C" fn wait_for_fences(
    device: vk::Device,
    _fence_count: u32,
    _p_fences: *const vk::Fence,
    _wait_all: vk::Bool32,
    _timeout: u64,
) -> vk::Result {
    record("wait_for_fences", device.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn reset_fences(
    device: vk::Device,
    _fence_count: u32,
    _p_fences: *const vk::Fence,
) -> vk::Result {
    record("reset_fences", device.as_raw());
    vk::Result::SUCCESS
}

unsafe extern "C" fn get_fence_status(_device: vk::Device, fence: vk::Fence) -> vk::Result {
    record("fence_status", fence.as_raw());
    vk::Result::NOT_READY
}
