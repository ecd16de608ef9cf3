//! Error types shared by every component of the core
//!
//! Contract violations (invalid descriptors, wrong binding types, mapping
//! device-local memory) are assertions, not errors. The variants below cover
//! driver results and resource exhaustion that survives the single retry each
//! allocation path performs.

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Memory allocation failed after falling back to a dedicated allocation
    #[error("Out of memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// The device cannot perform an operation on the given format
    #[error("Format {format:?} does not support {feature:?}")]
    UnsupportedFormatFeature {
        /// Format that was queried
        format: vk::Format,
        /// Feature that is missing for optimal tiling
        feature: vk::FormatFeatureFlags,
    },

    /// A device extension required by the call was not enabled
    #[error("Extension not loaded: {0}")]
    ExtensionNotLoaded(&'static str),
}

impl VulkanError {
    /// Whether this error reports an out-of-date or lost presentation surface
    pub fn is_out_of_date(&self) -> bool {
        matches!(
            self,
            Self::Api(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR)
        )
    }
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
