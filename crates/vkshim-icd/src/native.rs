//! Dynamic loading of the native Vulkan library and the per-object tables
//! of native entry points.
//!
//! Uses `libloading` to open the platform's Vulkan library, resolves
//! `vkGetInstanceProcAddr` from it, and resolves everything else through
//! that. Native entry points use the platform C calling convention.

use std::ffi::CStr;
use std::mem;

use ash::vk;
use libloading::{Library, Symbol};
use parking_lot::{const_rwlock, RwLock};
use tracing::{debug, info, warn};

use vkshim_core::config::NativeConfig;
use vkshim_core::ShimError;

pub type NativeVoidFunction = Option<unsafe extern "C" fn()>;

/// Native function pointer types.
pub mod pfn {
    use std::ffi::c_char;

    use ash::vk;
    use vkshim_core::trampoline::NativeAllocationCallbacks as Callbacks;

    use super::NativeVoidFunction;

    pub type GetInstanceProcAddr =
        unsafe extern "C" fn(instance: vk::Instance, p_name: *const c_char) -> NativeVoidFunction;
    pub type GetDeviceProcAddr =
        unsafe extern "C" fn(device: vk::Device, p_name: *const c_char) -> NativeVoidFunction;

    // Global
    pub type CreateInstance = unsafe extern "C" fn(
        p_create_info: *const vk::InstanceCreateInfo<'_>,
        p_allocator: *const Callbacks,
        p_instance: *mut vk::Instance,
    ) -> vk::Result;

    // Instance
    pub type DestroyInstance =
        unsafe extern "C" fn(instance: vk::Instance, p_allocator: *const Callbacks);
    pub type EnumeratePhysicalDevices = unsafe extern "C" fn(
        instance: vk::Instance,
        p_physical_device_count: *mut u32,
        p_physical_devices: *mut vk::PhysicalDevice,
    ) -> vk::Result;
    pub type GetPhysicalDeviceFeatures = unsafe extern "C" fn(
        physical_device: vk::PhysicalDevice,
        p_features: *mut vk::PhysicalDeviceFeatures,
    );
    pub type GetPhysicalDeviceProperties = unsafe extern "C" fn(
        physical_device: vk::PhysicalDevice,
        p_properties: *mut vk::PhysicalDeviceProperties,
    );
    pub type GetPhysicalDeviceQueueFamilyProperties = unsafe extern "C" fn(
        physical_device: vk::PhysicalDevice,
        p_queue_family_property_count: *mut u32,
        p_queue_family_properties: *mut vk::QueueFamilyProperties,
    );
    pub type GetPhysicalDeviceMemoryProperties = unsafe extern "C" fn(
        physical_device: vk::PhysicalDevice,
        p_memory_properties: *mut vk::PhysicalDeviceMemoryProperties,
    );
    pub type GetPhysicalDeviceFormatProperties = unsafe extern "C" fn(
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
        p_format_properties: *mut vk::FormatProperties,
    );
    pub type CreateDevice = unsafe extern "C" fn(
        physical_device: vk::PhysicalDevice,
        p_create_info: *const vk::DeviceCreateInfo<'_>,
        p_allocator: *const Callbacks,
        p_device: *mut vk::Device,
    ) -> vk::Result;

    // Device
    pub type DestroyDevice =
        unsafe extern "C" fn(device: vk::Device, p_allocator: *const Callbacks);
    pub type GetDeviceQueue = unsafe extern "C" fn(
        device: vk::Device,
        queue_family_index: u32,
        queue_index: u32,
        p_queue: *mut vk::Queue,
    );
    pub type DeviceWaitIdle = unsafe extern "C" fn(device: vk::Device) -> vk::Result;
    pub type QueueSubmit = unsafe extern "C" fn(
        queue: vk::Queue,
        submit_count: u32,
        p_submits: *const vk::SubmitInfo<'_>,
        fence: vk::Fence,
    ) -> vk::Result;
    pub type QueueWaitIdle = unsafe extern "C" fn(queue: vk::Queue) -> vk::Result;
    pub type CreateCommandPool = unsafe extern "C" fn(
        device: vk::Device,
        p_create_info: *const vk::CommandPoolCreateInfo<'_>,
        p_allocator: *const Callbacks,
        p_command_pool: *mut vk::CommandPool,
    ) -> vk::Result;
    pub type DestroyCommandPool = unsafe extern "C" fn(
        device: vk::Device,
        command_pool: vk::CommandPool,
        p_allocator: *const Callbacks,
    );
    pub type ResetCommandPool = unsafe extern "C" fn(
        device: vk::Device,
        command_pool: vk::CommandPool,
        flags: vk::CommandPoolResetFlags,
    ) -> vk::Result;
    pub type AllocateCommandBuffers = unsafe extern "C" fn(
        device: vk::Device,
        p_allocate_info: *const vk::CommandBufferAllocateInfo<'_>,
        p_command_buffers: *mut vk::CommandBuffer,
    ) -> vk::Result;
    pub type FreeCommandBuffers = unsafe extern "C" fn(
        device: vk::Device,
        command_pool: vk::CommandPool,
        command_buffer_count: u32,
        p_command_buffers: *const vk::CommandBuffer,
    );
    pub type BeginCommandBuffer = unsafe extern "C" fn(
        command_buffer: vk::CommandBuffer,
        p_begin_info: *const vk::CommandBufferBeginInfo<'_>,
    ) -> vk::Result;
    pub type EndCommandBuffer =
        unsafe extern "C" fn(command_buffer: vk::CommandBuffer) -> vk::Result;
    pub type ResetCommandBuffer = unsafe extern "C" fn(
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> vk::Result;
    pub type CmdExecuteCommands = unsafe extern "C" fn(
        command_buffer: vk::CommandBuffer,
        command_buffer_count: u32,
        p_command_buffers: *const vk::CommandBuffer,
    );
    pub type CmdFillBuffer = unsafe extern "C" fn(
        command_buffer: vk::CommandBuffer,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    );
    pub type CmdCopyBuffer = unsafe extern "C" fn(
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        region_count: u32,
        p_regions: *const vk::BufferCopy,
    );
    pub type CmdDispatch = unsafe extern "C" fn(
        command_buffer: vk::CommandBuffer,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    );
    pub type CmdPipelineBarrier = unsafe extern "C" fn(
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
    );
    pub type CreateFence = unsafe extern "C" fn(
        device: vk::Device,
        p_create_info: *const vk::FenceCreateInfo<'_>,
        p_allocator: *const Callbacks,
        p_fence: *mut vk::Fence,
    ) -> vk::Result;
    pub type DestroyFence =
        unsafe extern "C" fn(device: vk::Device, fence: vk::Fence, p_allocator: *const Callbacks);
    pub type WaitForFences = unsafe extern "C" fn(
        device: vk::Device,
        fence_count: u32,
        p_fences: *const vk::Fence,
        wait_all: vk::Bool32,
        timeout: u64,
    ) -> vk::Result;
    pub type ResetFences = unsafe extern "C" fn(
        device: vk::Device,
        fence_count: u32,
        p_fences: *const vk::Fence,
    ) -> vk::Result;
    pub type GetFenceStatus =
        unsafe extern "C" fn(device: vk::Device, fence: vk::Fence) -> vk::Result;
}

// ── Native library ──────────────────────────────────────────

static STATIC_ENTRY: RwLock<Option<pfn::GetInstanceProcAddr>> = const_rwlock(None);

/// Use a `vkGetInstanceProcAddr` already present in the process instead of
/// opening the native library. `None` goes back to dynamic loading.
///
/// Only affects instances created afterwards.
pub fn use_static_entry(entry: Option<pfn::GetInstanceProcAddr>) {
    *STATIC_ENTRY.write() = entry;
}

/// The native library backing one instance. Closing happens on drop.
pub struct NativeLibrary {
    _lib: Option<Library>,
    get_instance_proc_addr: pfn::GetInstanceProcAddr,
}

impl NativeLibrary {
    /// Open the native library and resolve its bootstrap entry point.
    pub fn open(config: &NativeConfig) -> Result<Self, ShimError> {
        if let Some(entry) = *STATIC_ENTRY.read() {
            debug!("using static native entry point");
            return Ok(Self {
                _lib: None,
                get_instance_proc_addr: entry,
            });
        }

        let lib = Self::load_library(config)?;
        let get_instance_proc_addr = unsafe {
            let sym: Symbol<pfn::GetInstanceProcAddr> =
                lib.get(b"vkGetInstanceProcAddr\0").map_err(|e| {
                    warn!("could not resolve vkGetInstanceProcAddr: {}", e);
                    ShimError::MissingEntryPoint("vkGetInstanceProcAddr")
                })?;
            *sym
        };

        Ok(Self {
            _lib: Some(lib),
            get_instance_proc_addr,
        })
    }

    fn load_library(config: &NativeConfig) -> Result<Library, ShimError> {
        let configured = config.library.as_deref().map(|name| [name]);
        let lib_names: &[&str] = match &configured {
            Some(names) => names,
            None => vkshim_common::platform::native_library_names(),
        };

        let mut last_err = String::new();
        for name in lib_names {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    info!(
                        "loaded native Vulkan library from: {} ({})",
                        name,
                        vkshim_common::platform::platform_name()
                    );
                    return Ok(lib);
                }
                Err(e) => {
                    last_err = format!("{}: {}", name, e);
                    debug!("failed to load {}: {}", name, e);
                }
            }
        }

        warn!("native Vulkan library not found ({})", last_err);
        Err(ShimError::LibraryNotFound(last_err))
    }

    pub fn get_instance_proc_addr(&self) -> pfn::GetInstanceProcAddr {
        self.get_instance_proc_addr
    }

    /// Resolve one instance-level entry point.
    ///
    /// # Safety
    /// `F` must be the native function pointer type of `name`.
    pub unsafe fn resolve<F: Copy>(
        &self,
        instance: vk::Instance,
        name: &'static CStr,
    ) -> Option<F> {
        let gipa = self.get_instance_proc_addr;
        resolve(&|name: &CStr| gipa(instance, name.as_ptr()), name)
    }
}

// ── Resolution helpers ──────────────────────────────────────

type Getter<'a> = &'a dyn Fn(&CStr) -> NativeVoidFunction;

unsafe fn resolve<F: Copy>(get: Getter<'_>, name: &'static CStr) -> Option<F> {
    debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<unsafe extern "C" fn()>());
    get(name).map(|f| mem::transmute_copy::<unsafe extern "C" fn(), F>(&f))
}

unsafe fn require<F: Copy>(get: Getter<'_>, name: &'static CStr) -> Result<F, ShimError> {
    resolve(get, name).ok_or_else(|| {
        let name = name.to_str().unwrap_or("<invalid name>");
        warn!("native library does not provide {}", name);
        ShimError::MissingEntryPoint(name)
    })
}

/// Resolve one device-level entry point.
///
/// # Safety
/// `F` must be the native function pointer type of `name`.
pub unsafe fn resolve_device<F: Copy>(
    get_device_proc_addr: pfn::GetDeviceProcAddr,
    device: vk::Device,
    name: &'static CStr,
) -> Option<F> {
    resolve(&|name: &CStr| get_device_proc_addr(device, name.as_ptr()), name)
}

macro_rules! native_table {
    ($(#[$meta:meta])* $table:ident { $($field:ident: $ty:ident = $name:expr,)* }) => {
        $(#[$meta])*
        pub struct $table {
            $(pub $field: pfn::$ty,)*
        }

        impl $table {
            unsafe fn resolve_all(get: Getter<'_>) -> Result<Self, ShimError> {
                Ok(Self {
                    $($field: require(get, $name)?,)*
                })
            }
        }
    };
}

native_table! {
    /// Entry points callable without an instance.
    GlobalFns {
        create_instance: CreateInstance = c"vkCreateInstance",
    }
}

native_table! {
    /// Entry points of one native instance.
    InstanceFns {
        destroy_instance: DestroyInstance = c"vkDestroyInstance",
        enumerate_physical_devices: EnumeratePhysicalDevices = c"vkEnumeratePhysicalDevices",
        get_physical_device_features: GetPhysicalDeviceFeatures = c"vkGetPhysicalDeviceFeatures",
        get_physical_device_properties: GetPhysicalDeviceProperties =
            c"vkGetPhysicalDeviceProperties",
        get_physical_device_queue_family_properties: GetPhysicalDeviceQueueFamilyProperties =
            c"vkGetPhysicalDeviceQueueFamilyProperties",
        get_physical_device_memory_properties: GetPhysicalDeviceMemoryProperties =
            c"vkGetPhysicalDeviceMemoryProperties",
        get_physical_device_format_properties: GetPhysicalDeviceFormatProperties =
            c"vkGetPhysicalDeviceFormatProperties",
        create_device: CreateDevice = c"vkCreateDevice",
        get_device_proc_addr: GetDeviceProcAddr = c"vkGetDeviceProcAddr",
    }
}

native_table! {
    /// Entry points of one native device.
    DeviceFns {
        destroy_device: DestroyDevice = c"vkDestroyDevice",
        get_device_queue: GetDeviceQueue = c"vkGetDeviceQueue",
        device_wait_idle: DeviceWaitIdle = c"vkDeviceWaitIdle",
        queue_submit: QueueSubmit = c"vkQueueSubmit",
        queue_wait_idle: QueueWaitIdle = c"vkQueueWaitIdle",
        create_command_pool: CreateCommandPool = c"vkCreateCommandPool",
        destroy_command_pool: DestroyCommandPool = c"vkDestroyCommandPool",
        reset_command_pool: ResetCommandPool = c"vkResetCommandPool",
        allocate_command_buffers: AllocateCommandBuffers = c"vkAllocateCommandBuffers",
        free_command_buffers: FreeCommandBuffers = c"vkFreeCommandBuffers",
        begin_command_buffer: BeginCommandBuffer = c"vkBeginCommandBuffer",
        end_command_buffer: EndCommandBuffer = c"vkEndCommandBuffer",
        reset_command_buffer: ResetCommandBuffer = c"vkResetCommandBuffer",
        cmd_execute_commands: CmdExecuteCommands = c"vkCmdExecuteCommands",
        cmd_fill_buffer: CmdFillBuffer = c"vkCmdFillBuffer",
        cmd_copy_buffer: CmdCopyBuffer = c"vkCmdCopyBuffer",
        cmd_dispatch: CmdDispatch = c"vkCmdDispatch",
        cmd_pipeline_barrier: CmdPipelineBarrier = c"vkCmdPipelineBarrier",
        create_fence: CreateFence = c"vkCreateFence",
        destroy_fence: DestroyFence = c"vkDestroyFence",
        wait_for_fences: WaitForFences = c"vkWaitForFences",
        reset_fences: ResetFences = c"vkResetFences",
        get_fence_status: GetFenceStatus = c"vkGetFenceStatus",
    }
}

impl GlobalFns {
    /// # Safety
    /// The library's bootstrap entry point must be callable.
    pub unsafe fn load(library: &NativeLibrary) -> Result<Self, ShimError> {
        let gipa = library.get_instance_proc_addr();
        Self::resolve_all(&|name: &CStr| gipa(vk::Instance::null(), name.as_ptr()))
    }
}

impl InstanceFns {
    /// # Safety
    /// `instance` must be a live native instance created through `library`.
    pub unsafe fn load(library: &NativeLibrary, instance: vk::Instance) -> Result<Self, ShimError> {
        let gipa = library.get_instance_proc_addr();
        Self::resolve_all(&|name: &CStr| gipa(instance, name.as_ptr()))
    }
}

impl DeviceFns {
    /// # Safety
    /// `device` must be a live native device and `get_device_proc_addr` its
    /// instance's resolver.
    pub unsafe fn load(
        get_device_proc_addr: pfn::GetDeviceProcAddr,
        device: vk::Device,
    ) -> Result<Self, ShimError> {
        Self::resolve_all(&|name: &CStr| get_device_proc_addr(device, name.as_ptr()))
    }
}
