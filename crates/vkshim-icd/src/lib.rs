//! vkshim Vulkan ICD (Installable Client Driver)
//!
//! This cdylib implements a Vulkan ICD that forwards every call to the
//! platform's native Vulkan library. Callers talk to it with the Vulkan
//! `"system"` calling convention; the native library is driven with the
//! platform C convention, and allocation callbacks are bridged between the
//! two. The loader discovers everything through `vk_icdGetInstanceProcAddr`.

#![allow(non_snake_case)]

use std::ffi::{c_char, CStr};
use std::sync::OnceLock;

use ash::vk;
use tracing::{debug, trace};

use vkshim_core::config::ShimConfig;

pub mod command;
pub mod device;
pub mod dispatch;
pub mod instance;
pub mod native;
pub mod physical_device;
pub mod proc_addr;
pub mod sync;

/// Highest loader interface version this ICD speaks. Version 3 and later
/// require `vk_icdGetPhysicalDeviceProcAddr`.
pub const MAX_LOADER_INTERFACE_VERSION: u32 = 2;

// ── Configuration singleton ─────────────────────────────────

static CONFIG: OnceLock<ShimConfig> = OnceLock::new();

/// Process-wide configuration. The first call also sets up logging.
pub fn config() -> &'static ShimConfig {
    CONFIG.get_or_init(|| {
        let config = ShimConfig::from_env();
        vkshim_common::logging::init_logging(&config.logging.filter);
        debug!(?config, "vkshim initialized");
        config
    })
}

// ── ICD Negotiation ─────────────────────────────────────────

/// Negotiate the ICD interface version with the Vulkan loader.
#[no_mangle]
pub unsafe extern "system" fn vk_icdNegotiateLoaderICDInterfaceVersion(
    p_supported_version: *mut u32,
) -> vk::Result {
    config();
    trace!("vk_icdNegotiateLoaderICDInterfaceVersion({:p})", p_supported_version);

    if p_supported_version.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let requested = *p_supported_version;
    *p_supported_version = std::cmp::min(requested, MAX_LOADER_INTERFACE_VERSION);
    vk::Result::SUCCESS
}

/// Returns function pointers for Vulkan functions.
/// The Vulkan loader calls this to resolve all Vulkan entry points.
#[no_mangle]
pub unsafe extern "system" fn vk_icdGetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = match read_name(p_name) {
        Some(name) => name,
        None => return None,
    };
    trace!("vk_icdGetInstanceProcAddr({:?}, {})", instance, name);

    proc_addr::lookup_instance(name)
}

/// Device-scope resolver; only device-level entry points are visible here.
#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = match read_name(p_name) {
        Some(name) => name,
        None => return None,
    };
    trace!("vkGetDeviceProcAddr({:?}, {})", device, name);

    proc_addr::lookup_device(name)
}

unsafe fn read_name<'a>(p_name: *const c_char) -> Option<&'a str> {
    if p_name.is_null() {
        return None;
    }
    CStr::from_ptr(p_name).to_str().ok()
}
