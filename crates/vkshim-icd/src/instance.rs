//! Vulkan instance and enumeration functions.

use std::ffi::c_char;
use std::ptr::{self, NonNull};

use ash::vk;
use tracing::{trace, warn};

use vkshim_core::trampoline::as_native_ptr;
use vkshim_core::{Allocator, ShimError};

use crate::dispatch::{DispatchHeader, Dispatchable, ObjectKind};
use crate::native::{pfn, GlobalFns, InstanceFns, NativeLibrary};
use crate::physical_device::PhysicalDevice;

/// Shim-side record behind a `VkInstance`.
#[repr(C)]
pub struct Instance {
    pub header: DispatchHeader,
    pub(crate) native: vk::Instance,
    /// Handed to the native library as callback context; must not move.
    pub(crate) allocator: Allocator,
    /// Filled on first enumeration, then never changed.
    physical_devices: Option<NonNull<PhysicalDevice>>,
    physical_device_count: u32,
    physical_device_capacity: u32,
    pub global: GlobalFns,
    pub(crate) fns: InstanceFns,
    library: NativeLibrary,
}

unsafe impl Dispatchable for Instance {
    const KIND: ObjectKind = ObjectKind::Instance;
    type Handle = vk::Instance;
}

impl Instance {
    /// Wrappers of every physical device, populating them on first use.
    ///
    /// # Safety
    /// The native instance must be live.
    pub unsafe fn physical_devices(&mut self) -> Result<&[PhysicalDevice], ShimError> {
        if self.physical_devices.is_none() {
            self.populate_physical_devices()?;
        }
        Ok(match self.physical_devices {
            Some(array) => {
                std::slice::from_raw_parts(array.as_ptr(), self.physical_device_count as usize)
            }
            None => &[],
        })
    }

    unsafe fn populate_physical_devices(&mut self) -> Result<(), ShimError> {
        let mut count = 0u32;
        ShimError::check((self.fns.enumerate_physical_devices)(
            self.native,
            &mut count,
            ptr::null_mut(),
        ))?;
        if count == 0 {
            return Ok(());
        }

        let capacity = count as usize;
        let scratch = self
            .allocator
            .allocate_array::<vk::PhysicalDevice>(capacity, vk::SystemAllocationScope::COMMAND)?;
        let array = match self
            .allocator
            .allocate_array::<PhysicalDevice>(capacity, vk::SystemAllocationScope::INSTANCE)
        {
            Ok(array) => array,
            Err(e) => {
                self.allocator.free_array(scratch, capacity);
                return Err(e);
            }
        };

        let result =
            (self.fns.enumerate_physical_devices)(self.native, &mut count, scratch.as_ptr());
        if result != vk::Result::SUCCESS {
            self.allocator.free_array(array, capacity);
            self.allocator.free_array(scratch, capacity);
            return Err(ShimError::Native(result));
        }

        let instance = NonNull::from(&mut *self);
        for i in 0..count as usize {
            array
                .as_ptr()
                .add(i)
                .write(PhysicalDevice::new(instance, *scratch.as_ptr().add(i)));
        }
        self.allocator.free_array(scratch, capacity);

        self.physical_devices = Some(array);
        self.physical_device_count = count;
        self.physical_device_capacity = capacity as u32;
        Ok(())
    }
}

unsafe fn create_instance(
    create_info: &vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) -> Result<NonNull<Instance>, ShimError> {
    if create_info.enabled_layer_count > 0 {
        return Err(ShimError::LayerNotPresent(create_info.enabled_layer_count));
    }
    if create_info.enabled_extension_count > 0 {
        return Err(ShimError::ExtensionNotPresent(create_info.enabled_extension_count));
    }

    let allocator = Allocator::from_raw(p_allocator, &Allocator::SYSTEM);
    let storage = allocator.allocate_object::<Instance>(vk::SystemAllocationScope::INSTANCE)?;

    // The native side keeps pointing at this slot for the instance lifetime,
    // so the allocator goes in before anything is handed out.
    let allocator_slot = ptr::addr_of_mut!((*storage.as_ptr()).allocator);
    allocator_slot.write(allocator);

    let library = match NativeLibrary::open(&crate::config().native) {
        Ok(library) => library,
        Err(e) => {
            allocator.free_object(storage);
            return Err(e);
        }
    };

    let global = match GlobalFns::load(&library) {
        Ok(global) => global,
        Err(e) => {
            drop(library);
            allocator.free_object(storage);
            return Err(e);
        }
    };

    let callbacks = (*allocator_slot).native_callbacks();
    let mut native = vk::Instance::null();
    let result = (global.create_instance)(create_info, as_native_ptr(&callbacks), &mut native);
    if result != vk::Result::SUCCESS {
        drop(library);
        allocator.free_object(storage);
        return Err(ShimError::Native(result));
    }

    let fns = match InstanceFns::load(&library, native) {
        Ok(fns) => fns,
        Err(e) => {
            let destroy = library.resolve::<pfn::DestroyInstance>(native, c"vkDestroyInstance");
            match destroy {
                Some(destroy) => destroy(native, as_native_ptr(&callbacks)),
                None => warn!("leaking native instance {:?}: vkDestroyInstance missing", native),
            }
            drop(library);
            allocator.free_object(storage);
            return Err(e);
        }
    };

    // Rewrites the allocator slot with the same value.
    storage.as_ptr().write(Instance {
        header: DispatchHeader::new(ObjectKind::Instance),
        native,
        allocator,
        physical_devices: None,
        physical_device_count: 0,
        physical_device_capacity: 0,
        global,
        fns,
        library,
    });
    Ok(storage)
}

#[no_mangle]
pub unsafe extern "system" fn vkCreateInstance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    crate::config();
    trace!("vkCreateInstance({:p}, {:p}, {:p})", p_create_info, p_allocator, p_instance);

    if p_create_info.is_null() || p_instance.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    match create_instance(&*p_create_info, p_allocator) {
        Ok(instance) => {
            *p_instance = Instance::to_handle(instance);
            vk::Result::SUCCESS
        }
        Err(e) => {
            trace!("vkCreateInstance failed: {}", e);
            e.as_vk_result()
        }
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    trace!("vkDestroyInstance({:?}, {:p})", instance, p_allocator);

    if instance == vk::Instance::null() {
        return;
    }
    let Ok(ptr) = Instance::from_handle(instance) else {
        return;
    };
    let record = &mut *ptr.as_ptr();

    let destroy_allocator = Allocator::from_raw(p_allocator, &record.allocator);
    let callbacks = destroy_allocator.native_callbacks();
    (record.fns.destroy_instance)(record.native, as_native_ptr(&callbacks));

    if let Some(array) = record.physical_devices.take() {
        record
            .allocator
            .free_array(array, record.physical_device_capacity as usize);
    }

    // Dropping the record closes the native library.
    let allocator = record.allocator;
    allocator.destroy(ptr);
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumeratePhysicalDevices(
    instance: vk::Instance,
    p_physical_device_count: *mut u32,
    p_physical_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    trace!(
        "vkEnumeratePhysicalDevices({:?}, {:p}, {:p})",
        instance,
        p_physical_device_count,
        p_physical_devices
    );

    if p_physical_device_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let record = match Instance::from_handle_mut(instance) {
        Ok(record) => record,
        Err(e) => return e.as_vk_result(),
    };

    let devices = match record.physical_devices() {
        Ok(devices) => devices,
        Err(e) => return e.as_vk_result(),
    };

    if p_physical_devices.is_null() {
        *p_physical_device_count = devices.len() as u32;
        return vk::Result::SUCCESS;
    }

    let count = std::cmp::min(*p_physical_device_count as usize, devices.len());
    for (i, device) in devices.iter().take(count).enumerate() {
        *p_physical_devices.add(i) = PhysicalDevice::to_handle(NonNull::from(device));
    }
    *p_physical_device_count = count as u32;

    if count < devices.len() {
        vk::Result::INCOMPLETE
    } else {
        vk::Result::SUCCESS
    }
}

/// Layers and extensions are refused at creation, so none are advertised.
#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceExtensionProperties(
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    trace!(
        "vkEnumerateInstanceExtensionProperties({:p}, {:p}, {:p})",
        p_layer_name,
        p_property_count,
        p_properties
    );

    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if !p_layer_name.is_null() {
        return vk::Result::ERROR_LAYER_NOT_PRESENT;
    }
    *p_property_count = 0;
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateInstanceLayerProperties(
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    trace!("vkEnumerateInstanceLayerProperties({:p}, {:p})", p_property_count, p_properties);
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    // No layers
    *p_property_count = 0;
    vk::Result::SUCCESS
}
