use ash::vk;

/// Failures of a shim operation. Every variant maps onto the `vk::Result`
/// reported to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("host allocation failed")]
    OutOfHostMemory,

    #[error("layers are not supported ({0} requested)")]
    LayerNotPresent(u32),

    #[error("extensions are not supported ({0} requested)")]
    ExtensionNotPresent(u32),

    #[error("native Vulkan library not found: {0}")]
    LibraryNotFound(String),

    #[error("native entry point missing: {0}")]
    MissingEntryPoint(&'static str),

    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),

    #[error("native call failed: {0:?}")]
    Native(vk::Result),
}

impl ShimError {
    pub fn as_vk_result(&self) -> vk::Result {
        match self {
            Self::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            Self::LayerNotPresent(_) => vk::Result::ERROR_LAYER_NOT_PRESENT,
            Self::ExtensionNotPresent(_) => vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            Self::LibraryNotFound(_)
            | Self::MissingEntryPoint(_)
            | Self::InvalidHandle(_) => vk::Result::ERROR_INITIALIZATION_FAILED,
            Self::Native(result) => *result,
        }
    }

    /// Result reported by device-level entry points, where a handle that
    /// fails validation reads as a lost device.
    pub fn as_device_result(&self) -> vk::Result {
        match self {
            Self::InvalidHandle(_) => vk::Result::ERROR_DEVICE_LOST,
            _ => self.as_vk_result(),
        }
    }

    /// Turn a native result into `Ok(())` on success, `Native` otherwise.
    pub fn check(result: vk::Result) -> Result<(), ShimError> {
        if result == vk::Result::SUCCESS {
            Ok(())
        } else {
            Err(Self::Native(result))
        }
    }
}

impl From<ShimError> for vk::Result {
    fn from(err: ShimError) -> Self {
        err.as_vk_result()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}
