//! Name → entry point resolution for the loader and the application.
//!
//! Two disjoint tables, each sorted by name in byte order and searched with
//! a binary search. A name that is in neither yields null: the loader and
//! applications probing for optional features read null as "not supported".

use ash::vk;

use crate::{command, device, instance, physical_device, sync};

/// One exported entry point.
pub struct ProcEntry {
    pub name: &'static str,
    pfn: *const (),
}

// SAFETY: entries only hold addresses of functions.
unsafe impl Sync for ProcEntry {}

impl ProcEntry {
    pub fn function(&self) -> vk::PFN_vkVoidFunction {
        // SAFETY: every entry holds a function address.
        Some(unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>(self.pfn) })
    }
}

macro_rules! entry {
    ($name:literal, $f:path) => {
        ProcEntry {
            name: $name,
            pfn: $f as *const (),
        }
    };
}

/// Entry points dispatched on an instance or physical device, plus the
/// loader-facing ones.
pub static INSTANCE_FUNCTIONS: &[ProcEntry] = &[
    entry!("vkCreateDevice", device::vkCreateDevice),
    entry!("vkCreateInstance", instance::vkCreateInstance),
    entry!("vkDestroyInstance", instance::vkDestroyInstance),
    entry!(
        "vkEnumerateDeviceExtensionProperties",
        physical_device::vkEnumerateDeviceExtensionProperties
    ),
    entry!("vkEnumerateDeviceLayerProperties", physical_device::vkEnumerateDeviceLayerProperties),
    entry!(
        "vkEnumerateInstanceExtensionProperties",
        instance::vkEnumerateInstanceExtensionProperties
    ),
    entry!("vkEnumerateInstanceLayerProperties", instance::vkEnumerateInstanceLayerProperties),
    entry!("vkEnumeratePhysicalDevices", instance::vkEnumeratePhysicalDevices),
    entry!("vkGetInstanceProcAddr", crate::vk_icdGetInstanceProcAddr),
    entry!("vkGetPhysicalDeviceFeatures", physical_device::vkGetPhysicalDeviceFeatures),
    entry!(
        "vkGetPhysicalDeviceFormatProperties",
        physical_device::vkGetPhysicalDeviceFormatProperties
    ),
    entry!(
        "vkGetPhysicalDeviceMemoryProperties",
        physical_device::vkGetPhysicalDeviceMemoryProperties
    ),
    entry!("vkGetPhysicalDeviceProperties", physical_device::vkGetPhysicalDeviceProperties),
    entry!(
        "vkGetPhysicalDeviceQueueFamilyProperties",
        physical_device::vkGetPhysicalDeviceQueueFamilyProperties
    ),
    entry!("vk_icdGetInstanceProcAddr", crate::vk_icdGetInstanceProcAddr),
    entry!(
        "vk_icdNegotiateLoaderICDInterfaceVersion",
        crate::vk_icdNegotiateLoaderICDInterfaceVersion
    ),
];

/// Entry points dispatched on a device, queue or command buffer.
pub static DEVICE_FUNCTIONS: &[ProcEntry] = &[
    entry!("vkAllocateCommandBuffers", command::vkAllocateCommandBuffers),
    entry!("vkBeginCommandBuffer", command::vkBeginCommandBuffer),
    entry!("vkCmdCopyBuffer", command::vkCmdCopyBuffer),
    entry!("vkCmdDispatch", command::vkCmdDispatch),
    entry!("vkCmdExecuteCommands", command::vkCmdExecuteCommands),
    entry!("vkCmdFillBuffer", command::vkCmdFillBuffer),
    entry!("vkCmdPipelineBarrier", command::vkCmdPipelineBarrier),
    entry!("vkCreateCommandPool", command::vkCreateCommandPool),
    entry!("vkCreateFence", sync::vkCreateFence),
    entry!("vkDestroyCommandPool", command::vkDestroyCommandPool),
    entry!("vkDestroyDevice", device::vkDestroyDevice),
    entry!("vkDestroyFence", sync::vkDestroyFence),
    entry!("vkDeviceWaitIdle", device::vkDeviceWaitIdle),
    entry!("vkEndCommandBuffer", command::vkEndCommandBuffer),
    entry!("vkFreeCommandBuffers", command::vkFreeCommandBuffers),
    entry!("vkGetDeviceProcAddr", crate::vkGetDeviceProcAddr),
    entry!("vkGetDeviceQueue", device::vkGetDeviceQueue),
    entry!("vkGetFenceStatus", sync::vkGetFenceStatus),
    entry!("vkQueueSubmit", sync::vkQueueSubmit),
    entry!("vkQueueWaitIdle", sync::vkQueueWaitIdle),
    entry!("vkResetCommandBuffer", command::vkResetCommandBuffer),
    entry!("vkResetCommandPool", command::vkResetCommandPool),
    entry!("vkResetFences", sync::vkResetFences),
    entry!("vkWaitForFences", sync::vkWaitForFences),
];

fn lookup(table: &'static [ProcEntry], name: &str) -> Option<&'static ProcEntry> {
    table
        .binary_search_by(|entry| entry.name.cmp(name))
        .ok()
        .map(|index| &table[index])
}

/// Instance-scope resolution. Device-level entry points are found here too,
/// as Vulkan requires of `vkGetInstanceProcAddr`.
pub fn lookup_instance(name: &str) -> vk::PFN_vkVoidFunction {
    lookup(INSTANCE_FUNCTIONS, name)
        .or_else(|| lookup(DEVICE_FUNCTIONS, name))
        .and_then(ProcEntry::function)
}

/// Device-scope resolution.
pub fn lookup_device(name: &str) -> vk::PFN_vkVoidFunction {
    lookup(DEVICE_FUNCTIONS, name).and_then(ProcEntry::function)
}
