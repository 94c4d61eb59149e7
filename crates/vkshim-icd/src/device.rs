//! Vulkan device and queue lifecycle.

use std::collections::BTreeSet;
use std::ptr::{self, NonNull};

use ash::vk;
use tracing::{debug, trace, warn};

use vkshim_core::trampoline::as_native_ptr;
use vkshim_core::{Allocator, AllocatorRegistry, ShimError};

use crate::command::{self, CommandBuffer};
use crate::dispatch::{DispatchHeader, Dispatchable, ObjectKind};
use crate::native::{self, pfn, DeviceFns};
use crate::physical_device::PhysicalDevice;

/// Shim-side record behind a `VkDevice`.
#[repr(C)]
pub struct Device {
    pub header: DispatchHeader,
    pub(crate) native: vk::Device,
    /// Callback context for the native device; must not move.
    pub(crate) allocator: Allocator,
    queue_families: NonNull<QueueFamily>,
    queue_family_count: usize,
    /// Allocators of command pools, keyed by native pool handle.
    pub(crate) registry: AllocatorRegistry,
    /// Explicit allocators of fences, keyed by native fence handle.
    pub(crate) fence_allocators: AllocatorRegistry,
    /// Live command-buffer wrappers as (native pool, wrapper address).
    pub(crate) command_buffers: BTreeSet<(u64, usize)>,
    pub(crate) fns: DeviceFns,
}

unsafe impl Dispatchable for Device {
    const KIND: ObjectKind = ObjectKind::Device;
    type Handle = vk::Device;
}

/// Queues requested for one family at device creation.
pub(crate) struct QueueFamily {
    family_index: u32,
    queues: NonNull<Queue>,
    queue_count: u32,
}

/// Shim-side record behind a `VkQueue`. Lives as long as its device.
#[repr(C)]
pub struct Queue {
    pub header: DispatchHeader,
    pub(crate) device: NonNull<Device>,
    pub(crate) native: vk::Queue,
}

unsafe impl Dispatchable for Queue {
    const KIND: ObjectKind = ObjectKind::Queue;
    type Handle = vk::Queue;
}

impl Queue {
    /// # Safety
    /// The owning device must be alive.
    pub(crate) unsafe fn device(&self) -> &Device {
        self.device.as_ref()
    }
}

impl Device {
    fn queue_families(&self) -> &[QueueFamily] {
        // SAFETY: the family array is initialized for the device lifetime.
        unsafe { std::slice::from_raw_parts(self.queue_families.as_ptr(), self.queue_family_count) }
    }

    /// The pre-built wrapper for a queue requested at creation.
    pub fn queue(&self, family_index: u32, queue_index: u32) -> Option<NonNull<Queue>> {
        let family = self
            .queue_families()
            .iter()
            .find(|family| family.family_index == family_index)?;
        if queue_index >= family.queue_count {
            return None;
        }
        // SAFETY: in bounds of the family's queue array.
        Some(unsafe { NonNull::new_unchecked(family.queues.as_ptr().add(queue_index as usize)) })
    }

    /// Number of live command-buffer wrappers.
    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }
}

/// Allocate the family array and one queue array per requested family,
/// filling every queue from the native device.
unsafe fn create_queue_families(
    allocator: &Allocator,
    fns: &DeviceFns,
    device: NonNull<Device>,
    native: vk::Device,
    infos: &[vk::DeviceQueueCreateInfo<'_>],
) -> Result<NonNull<QueueFamily>, ShimError> {
    let families =
        allocator.allocate_array::<QueueFamily>(infos.len(), vk::SystemAllocationScope::DEVICE)?;

    for (i, info) in infos.iter().enumerate() {
        let queue_count = info.queue_count as usize;
        let queues = match allocator
            .allocate_array::<Queue>(queue_count, vk::SystemAllocationScope::DEVICE)
        {
            Ok(queues) => queues,
            Err(e) => {
                // Only families 0..i have queue arrays.
                for done in 0..i {
                    let family = &*families.as_ptr().add(done);
                    allocator.free_array(family.queues, family.queue_count as usize);
                }
                allocator.free_array(families, infos.len());
                return Err(e);
            }
        };

        for index in 0..info.queue_count {
            let mut queue = vk::Queue::null();
            (fns.get_device_queue)(native, info.queue_family_index, index, &mut queue);
            queues.as_ptr().add(index as usize).write(Queue {
                header: DispatchHeader::new(ObjectKind::Queue),
                device,
                native: queue,
            });
        }

        families.as_ptr().add(i).write(QueueFamily {
            family_index: info.queue_family_index,
            queues,
            queue_count: info.queue_count,
        });
    }

    Ok(families)
}

unsafe fn free_queue_families(allocator: &Allocator, families: NonNull<QueueFamily>, count: usize) {
    for i in 0..count {
        let family = &*families.as_ptr().add(i);
        allocator.free_array(family.queues, family.queue_count as usize);
    }
    allocator.free_array(families, count);
}

unsafe fn create_device(
    physical_device: &PhysicalDevice,
    create_info: &vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) -> Result<NonNull<Device>, ShimError> {
    #[allow(deprecated)]
    let layer_count = create_info.enabled_layer_count;
    if layer_count > 0 {
        return Err(ShimError::LayerNotPresent(layer_count));
    }
    if create_info.enabled_extension_count > 0 {
        return Err(ShimError::ExtensionNotPresent(create_info.enabled_extension_count));
    }

    let instance = physical_device.instance();
    let allocator = Allocator::from_raw(p_allocator, &instance.allocator);
    let storage = allocator.allocate_object::<Device>(vk::SystemAllocationScope::DEVICE)?;

    let allocator_slot = ptr::addr_of_mut!((*storage.as_ptr()).allocator);
    allocator_slot.write(allocator);
    let callbacks = (*allocator_slot).native_callbacks();

    let mut native = vk::Device::null();
    let result = (instance.fns.create_device)(
        physical_device.native,
        create_info,
        as_native_ptr(&callbacks),
        &mut native,
    );
    if result != vk::Result::SUCCESS {
        allocator.free_object(storage);
        return Err(ShimError::Native(result));
    }

    let get_device_proc_addr = instance.fns.get_device_proc_addr;
    let fns = match DeviceFns::load(get_device_proc_addr, native) {
        Ok(fns) => fns,
        Err(e) => {
            let destroy = native::resolve_device::<pfn::DestroyDevice>(
                get_device_proc_addr,
                native,
                c"vkDestroyDevice",
            );
            match destroy {
                Some(destroy) => destroy(native, as_native_ptr(&callbacks)),
                None => warn!("leaking native device {:?}: vkDestroyDevice missing", native),
            }
            allocator.free_object(storage);
            return Err(e);
        }
    };

    let infos = if create_info.queue_create_info_count == 0
        || create_info.p_queue_create_infos.is_null()
    {
        &[]
    } else {
        std::slice::from_raw_parts(
            create_info.p_queue_create_infos,
            create_info.queue_create_info_count as usize,
        )
    };

    let queue_families = match create_queue_families(&allocator, &fns, storage, native, infos) {
        Ok(families) => families,
        Err(e) => {
            (fns.destroy_device)(native, as_native_ptr(&callbacks));
            allocator.free_object(storage);
            return Err(e);
        }
    };

    storage.as_ptr().write(Device {
        header: DispatchHeader::new(ObjectKind::Device),
        native,
        allocator,
        queue_families,
        queue_family_count: infos.len(),
        registry: AllocatorRegistry::new(),
        fence_allocators: AllocatorRegistry::new(),
        command_buffers: BTreeSet::new(),
        fns,
    });
    debug!("created device {:?} with {} queue families", native, infos.len());
    Ok(storage)
}

#[no_mangle]
pub unsafe extern "system" fn vkCreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    trace!(
        "vkCreateDevice({:?}, {:p}, {:p}, {:p})",
        physical_device,
        p_create_info,
        p_allocator,
        p_device
    );

    if p_create_info.is_null() || p_device.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let pd = match PhysicalDevice::from_handle_ref(physical_device) {
        Ok(pd) => pd,
        Err(e) => return e.as_vk_result(),
    };

    match create_device(pd, &*p_create_info, p_allocator) {
        Ok(device) => {
            *p_device = Device::to_handle(device);
            vk::Result::SUCCESS
        }
        Err(e) => {
            trace!("vkCreateDevice failed: {}", e);
            e.as_vk_result()
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyDevice(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    trace!("vkDestroyDevice({:?}, {:p})", device, p_allocator);

    if device == vk::Device::null() {
        return;
    }
    let Ok(ptr) = Device::from_handle(device) else {
        return;
    };
    let record = &mut *ptr.as_ptr();

    let destroy_allocator = Allocator::from_raw(p_allocator, &record.allocator);
    let callbacks = destroy_allocator.native_callbacks();
    (record.fns.destroy_device)(record.native, as_native_ptr(&callbacks));

    if !record.command_buffers.is_empty() {
        debug!(
            count = record.command_buffers.len(),
            "freeing command buffers still allocated at device destruction"
        );
    }
    while let Some((_, addr)) = record.command_buffers.pop_first() {
        command::free_wrapper(record, NonNull::new_unchecked(addr as *mut CommandBuffer));
    }

    let allocator = record.allocator;
    free_queue_families(&allocator, record.queue_families, record.queue_family_count);

    // Dropping the record frees what is left in the registries.
    allocator.destroy(ptr);
}

#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceQueue(
    device: vk::Device,
    queue_family_index: u32,
    queue_index: u32,
    p_queue: *mut vk::Queue,
) {
    trace!(
        "vkGetDeviceQueue({:?}, {}, {}, {:p})",
        device,
        queue_family_index,
        queue_index,
        p_queue
    );

    if p_queue.is_null() {
        return;
    }
    let Ok(record) = Device::from_handle_ref(device) else {
        *p_queue = vk::Queue::null();
        return;
    };
    *p_queue = match record.queue(queue_family_index, queue_index) {
        Some(queue) => Queue::to_handle(queue),
        None => {
            warn!(
                "no queue {} in family {} was requested at device creation",
                queue_index, queue_family_index
            );
            vk::Queue::null()
        }
    };
}

#[no_mangle]
pub unsafe extern "system" fn vkDeviceWaitIdle(device: vk::Device) -> vk::Result {
    trace!("vkDeviceWaitIdle({:?})", device);
    match Device::from_handle_ref(device) {
        Ok(record) => (record.fns.device_wait_idle)(record.native),
        Err(_) => vk::Result::ERROR_DEVICE_LOST,
    }
}
