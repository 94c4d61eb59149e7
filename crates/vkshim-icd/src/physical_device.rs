//! Physical device queries. Everything here forwards to the native instance
//! table after unwrapping the handle.

use std::ffi::c_char;
use std::ptr::NonNull;

use ash::vk;
use tracing::trace;

use crate::dispatch::{DispatchHeader, Dispatchable, ObjectKind};
use crate::instance::Instance;
use crate::native::InstanceFns;

/// Immutable view of one native physical device. Lives in the owning
/// instance's array and is freed with it.
#[repr(C)]
pub struct PhysicalDevice {
    pub header: DispatchHeader,
    pub(crate) instance: NonNull<Instance>,
    pub(crate) native: vk::PhysicalDevice,
}

unsafe impl Dispatchable for PhysicalDevice {
    const KIND: ObjectKind = ObjectKind::PhysicalDevice;
    type Handle = vk::PhysicalDevice;
}

impl PhysicalDevice {
    pub(crate) fn new(instance: NonNull<Instance>, native: vk::PhysicalDevice) -> Self {
        Self {
            header: DispatchHeader::new(ObjectKind::PhysicalDevice),
            instance,
            native,
        }
    }

    /// # Safety
    /// The owning instance must be alive, which holds for any physical
    /// device handle the caller may legally pass.
    pub(crate) unsafe fn instance(&self) -> &Instance {
        self.instance.as_ref()
    }

    pub(crate) unsafe fn fns(&self) -> &InstanceFns {
        &self.instance().fns
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceFeatures(
    physical_device: vk::PhysicalDevice,
    p_features: *mut vk::PhysicalDeviceFeatures,
) {
    trace!("vkGetPhysicalDeviceFeatures({:?}, {:p})", physical_device, p_features);
    let Ok(pd) = PhysicalDevice::from_handle_ref(physical_device) else {
        return;
    };
    (pd.fns().get_physical_device_features)(pd.native, p_features);
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceProperties(
    physical_device: vk::PhysicalDevice,
    p_properties: *mut vk::PhysicalDeviceProperties,
) {
    trace!("vkGetPhysicalDeviceProperties({:?}, {:p})", physical_device, p_properties);
    let Ok(pd) = PhysicalDevice::from_handle_ref(physical_device) else {
        return;
    };
    (pd.fns().get_physical_device_properties)(pd.native, p_properties);
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceQueueFamilyProperties(
    physical_device: vk::PhysicalDevice,
    p_queue_family_property_count: *mut u32,
    p_queue_family_properties: *mut vk::QueueFamilyProperties,
) {
    trace!(
        "vkGetPhysicalDeviceQueueFamilyProperties({:?}, {:p}, {:p})",
        physical_device,
        p_queue_family_property_count,
        p_queue_family_properties
    );
    let Ok(pd) = PhysicalDevice::from_handle_ref(physical_device) else {
        return;
    };
    (pd.fns().get_physical_device_queue_family_properties)(
        pd.native,
        p_queue_family_property_count,
        p_queue_family_properties,
    );
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceMemoryProperties(
    physical_device: vk::PhysicalDevice,
    p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties,
) {
    trace!(
        "vkGetPhysicalDeviceMemoryProperties({:?}, {:p})",
        physical_device,
        p_memory_properties
    );
    let Ok(pd) = PhysicalDevice::from_handle_ref(physical_device) else {
        return;
    };
    (pd.fns().get_physical_device_memory_properties)(pd.native, p_memory_properties);
}

#[no_mangle]
pub unsafe extern "system" fn vkGetPhysicalDeviceFormatProperties(
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    p_format_properties: *mut vk::FormatProperties,
) {
    trace!(
        "vkGetPhysicalDeviceFormatProperties({:?}, {:?}, {:p})",
        physical_device,
        format,
        p_format_properties
    );
    let Ok(pd) = PhysicalDevice::from_handle_ref(physical_device) else {
        return;
    };
    (pd.fns().get_physical_device_format_properties)(pd.native, format, p_format_properties);
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateDeviceExtensionProperties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_property_count: *mut u32,
    _p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    trace!(
        "vkEnumerateDeviceExtensionProperties({:?}, {:p}, {:p})",
        physical_device,
        p_layer_name,
        p_property_count
    );
    if let Err(e) = PhysicalDevice::from_handle(physical_device) {
        return e.as_vk_result();
    }
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if !p_layer_name.is_null() {
        return vk::Result::ERROR_LAYER_NOT_PRESENT;
    }
    // Device extensions are refused at creation.
    *p_property_count = 0;
    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkEnumerateDeviceLayerProperties(
    physical_device: vk::PhysicalDevice,
    p_property_count: *mut u32,
    _p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    trace!(
        "vkEnumerateDeviceLayerProperties({:?}, {:p})",
        physical_device,
        p_property_count
    );
    if let Err(e) = PhysicalDevice::from_handle(physical_device) {
        return e.as_vk_result();
    }
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    *p_property_count = 0;
    vk::Result::SUCCESS
}
