//! Error type shared by every layer of the compute core.

use octoflow_vulkan::ash::vk;
use octoflow_vulkan::VulkanError;

/// Errors surfaced by buffers, algorithms, operations, sequences and devices.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// A transfer needs an allocation the buffer does not have.
    #[error("buffer not allocated: {0}")]
    NotAllocated(String),
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    /// The resource has been destroyed.
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("binding layout mismatch: {0}")]
    BindingLayoutMismatch(String),
    #[error("sequence is {state}, cannot {action}")]
    SequenceState { state: &'static str, action: &'static str },
    #[error("timed out after {0} ns")]
    Timeout(u64),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("no memory type matches filter {type_bits:#x} for {location}")]
    NoSuitableMemoryType { type_bits: u32, location: &'static str },
    #[error("element type mismatch: buffer holds {stored}, requested {requested}")]
    TypeMismatch { stored: String, requested: String },
    #[error("pipeline creation failed: {0}")]
    Pipeline(String),
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Vulkan(VulkanError),
}

impl From<VulkanError> for ComputeError {
    fn from(e: VulkanError) -> Self {
        match e {
            VulkanError::Vk(vk::Result::ERROR_DEVICE_LOST) => ComputeError::DeviceLost(e.to_string()),
            VulkanError::Vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | VulkanError::Vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                ComputeError::Allocation(e.to_string())
            }
            VulkanError::NoMemoryType { type_bits } => {
                ComputeError::NoSuitableMemoryType { type_bits, location: "requested properties" }
            }
            other => ComputeError::Vulkan(other),
        }
    }
}

impl From<vk::Result> for ComputeError {
    fn from(r: vk::Result) -> Self {
        VulkanError::Vk(r).into()
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_codes_map_to_core_errors() {
        assert!(matches!(
            ComputeError::from(vk::Result::ERROR_DEVICE_LOST),
            ComputeError::DeviceLost(_)
        ));
        assert!(matches!(
            ComputeError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            ComputeError::Allocation(_)
        ));
        assert!(matches!(
            ComputeError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            ComputeError::Vulkan(VulkanError::Vk(_))
        ));
    }

    #[test]
    fn test_messages() {
        let e = ComputeError::SizeMismatch { expected: 12, actual: 8 };
        assert_eq!(e.to_string(), "size mismatch: expected 12 bytes, got 8");
        let e = ComputeError::SequenceState { state: "Recording", action: "submit" };
        assert_eq!(e.to_string(), "sequence is Recording, cannot submit");
    }
}
