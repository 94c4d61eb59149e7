/// File names of the native Vulkan library, in lookup order.
pub fn native_library_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["vulkan-1.dll"]
    }
    #[cfg(target_os = "macos")]
    {
        &["libvulkan.1.dylib", "libvulkan.dylib"]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        &["libvulkan.so.1"]
    }
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}
