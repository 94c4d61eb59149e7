//! Dispatchable handle layout for the Vulkan ICD.
//!
//! The Vulkan loader requires that dispatchable handles (VkInstance,
//! VkPhysicalDevice, VkDevice, VkQueue, VkCommandBuffer) have their first
//! `sizeof(void*)` bytes free for its dispatch table pointer. It checks for
//! the magic value there, then overwrites it.

use std::ptr::NonNull;

use ash::vk;
use tracing::error;
use vkshim_core::ShimError;

/// The ICD loader magic value. The loader expects this in new dispatchable handles.
pub const ICD_LOADER_MAGIC: usize = 0x01CDC0DE;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Instance = 0x1057_0001,
    PhysicalDevice = 0x1057_0002,
    Device = 0x1057_0003,
    Queue = 0x1057_0004,
    CommandBuffer = 0x1057_0005,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::PhysicalDevice => "physical device",
            Self::Device => "device",
            Self::Queue => "queue",
            Self::CommandBuffer => "command buffer",
        }
    }
}

/// First field of every dispatchable record.
#[repr(C)]
pub struct DispatchHeader {
    /// The loader will overwrite this with its dispatch table pointer.
    pub loader_data: usize,
    /// Our own tag, checked whenever a handle comes back in. Stored raw so
    /// reading it from a bogus pointer never produces an invalid enum.
    pub kind: u32,
}

impl DispatchHeader {
    pub const fn new(kind: ObjectKind) -> Self {
        Self {
            loader_data: ICD_LOADER_MAGIC,
            kind: kind as u32,
        }
    }
}

/// A `#[repr(C)]` record that starts with a [`DispatchHeader`] and is handed
/// to the caller as a dispatchable handle.
///
/// # Safety
/// Implementors must be `#[repr(C)]` with a `DispatchHeader` as first field.
pub unsafe trait Dispatchable: Sized {
    const KIND: ObjectKind;
    type Handle: vk::Handle + Copy;

    fn to_handle(ptr: NonNull<Self>) -> Self::Handle {
        <Self::Handle as vk::Handle>::from_raw(ptr.as_ptr() as usize as u64)
    }

    /// Validate a handle coming in from the caller.
    ///
    /// # Safety
    /// A non-null handle must point to readable memory at least as large as
    /// a `DispatchHeader`.
    unsafe fn from_handle(handle: Self::Handle) -> Result<NonNull<Self>, ShimError> {
        let raw = vk::Handle::as_raw(handle) as usize as *mut Self;
        let Some(ptr) = NonNull::new(raw) else {
            error!("null {} handle", Self::KIND.name());
            return Err(ShimError::InvalidHandle(Self::KIND.name()));
        };
        let header = &*(ptr.as_ptr() as *const DispatchHeader);
        if header.kind != Self::KIND as u32 {
            error!("{:p} is not a {} handle", raw, Self::KIND.name());
            return Err(ShimError::InvalidHandle(Self::KIND.name()));
        }
        Ok(ptr)
    }

    /// # Safety
    /// See [`Dispatchable::from_handle`]; the record must not be aliased
    /// mutably for the returned lifetime.
    unsafe fn from_handle_ref<'a>(handle: Self::Handle) -> Result<&'a Self, ShimError> {
        Self::from_handle(handle).map(|ptr| &*ptr.as_ptr())
    }

    /// # Safety
    /// See [`Dispatchable::from_handle`]; the caller guarantees exclusive
    /// access per Vulkan's external synchronization rules.
    unsafe fn from_handle_mut<'a>(handle: Self::Handle) -> Result<&'a mut Self, ShimError> {
        Self::from_handle(handle).map(|ptr| &mut *ptr.as_ptr())
    }
}
