//! # Configuration System
//!
//! Serializable configuration for the GPU resource core. Every struct here can be
//! loaded from and saved to `.toml` or `.ron` files through the [`Config`] trait,
//! is `Default`, exposes builder-style `with_*` setters, and validates itself with
//! `validate()` before a [`GraphicsContext`](crate::context::GraphicsContext) is built.
//!
//! ## Configuration Categories
//!
//! - **Memory**: arena block size, arena growth limits, residency priority
//! - **Descriptors**: backing pool capacity and per-type sizing ratios
//! - **Swapchain**: present mode and surface format preference
//! - **Core**: frames in flight, shader cache location, validation layers

use ash::vk;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            Some("ron") => ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            Some("ron") => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
            _ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Configuration loaded but failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default arena block size (64 MiB)
pub const DEFAULT_ARENA_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// # Memory Configuration
///
/// Controls how the [`MemoryPool`](crate::memory::MemoryPool) carves device memory
/// into long-lived arenas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of every arena block in bytes
    pub arena_block_size: u64,
    /// Blocks an arena may grow to before requests fall back to dedicated allocations
    pub max_blocks_per_arena: u32,
    /// Residency priority hint handed to arena allocations
    pub arena_priority: f32,
    /// Allocate buffer arena blocks with `DEVICE_ADDRESS` so pooled buffers can
    /// expose a GPU virtual address
    pub buffer_device_address: bool,
}

impl MemoryConfig {
    /// Set the arena block size
    pub fn with_arena_block_size(mut self, bytes: u64) -> Self {
        self.arena_block_size = bytes;
        self
    }

    /// Set the number of blocks an arena may hold
    pub fn with_max_blocks_per_arena(mut self, blocks: u32) -> Self {
        self.max_blocks_per_arena = blocks;
        self
    }

    /// Set the arena residency priority
    pub fn with_arena_priority(mut self, priority: f32) -> Self {
        self.arena_priority = priority;
        self
    }

    /// Enable or disable device addresses for pooled buffers
    pub fn with_buffer_device_address(mut self, enabled: bool) -> Self {
        self.buffer_device_address = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.arena_block_size == 0 {
            return Err("Arena block size must be non-zero".to_string());
        }
        if !self.arena_block_size.is_power_of_two() {
            return Err(format!(
                "Arena block size must be a power of two, got {}",
                self.arena_block_size
            ));
        }
        if self.max_blocks_per_arena == 0 {
            return Err("An arena must be allowed at least one block".to_string());
        }
        if !(0.0..=1.0).contains(&self.arena_priority) {
            return Err(format!(
                "Arena priority must be within [0, 1], got {}",
                self.arena_priority
            ));
        }
        Ok(())
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_block_size: DEFAULT_ARENA_BLOCK_SIZE,
            max_blocks_per_arena: 8,
            arena_priority: 0.5,
            buffer_device_address: true,
        }
    }
}

/// Descriptors reserved per set for each descriptor type in a backing pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSizeRatios {
    /// Uniform buffers per set
    pub uniform_buffer: f32,
    /// Storage buffers per set
    pub storage_buffer: f32,
    /// Combined image samplers per set
    pub combined_image_sampler: f32,
    /// Storage images per set
    pub storage_image: f32,
    /// Acceleration structures per set (only used when ray tracing is enabled)
    pub acceleration_structure: f32,
}

impl Default for PoolSizeRatios {
    fn default() -> Self {
        Self {
            uniform_buffer: 10.0,
            storage_buffer: 4.0,
            combined_image_sampler: 10.0,
            storage_image: 2.0,
            acceleration_structure: 0.0,
        }
    }
}

impl PoolSizeRatios {
    /// Pool sizes for a backing pool holding `max_sets` sets
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn pool_sizes(&self, max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
        [
            (vk::DescriptorType::UNIFORM_BUFFER, self.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, self.storage_buffer),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, self.combined_image_sampler),
            (vk::DescriptorType::STORAGE_IMAGE, self.storage_image),
            (
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                self.acceleration_structure,
            ),
        ]
        .into_iter()
        .filter(|(_, ratio)| *ratio > 0.0)
        .map(|(ty, ratio)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: ((max_sets as f32 * ratio).ceil() as u32).max(1),
        })
        .collect()
    }
}

/// # Descriptor Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Sets each backing pool can hold before a new one is created
    pub max_sets_per_pool: u32,
    /// Per-type sizing policy of every backing pool
    pub pool_size_ratios: PoolSizeRatios,
}

impl DescriptorConfig {
    /// Set the number of sets per backing pool
    pub fn with_max_sets_per_pool(mut self, max_sets: u32) -> Self {
        self.max_sets_per_pool = max_sets;
        self
    }

    /// Set the per-type sizing ratios
    pub fn with_pool_size_ratios(mut self, ratios: PoolSizeRatios) -> Self {
        self.pool_size_ratios = ratios;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_sets_per_pool == 0 {
            return Err("Descriptor pools must hold at least one set".to_string());
        }
        let ratios = &self.pool_size_ratios;
        let all = [
            ratios.uniform_buffer,
            ratios.storage_buffer,
            ratios.combined_image_sampler,
            ratios.storage_image,
            ratios.acceleration_structure,
        ];
        if all.iter().any(|ratio| *ratio < 0.0) {
            return Err("Descriptor pool size ratios cannot be negative".to_string());
        }
        if all.iter().all(|ratio| *ratio == 0.0) {
            return Err("At least one descriptor type must be reserved".to_string());
        }
        Ok(())
    }
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            max_sets_per_pool: 1000,
            pool_size_ratios: PoolSizeRatios::default(),
        }
    }
}

/// Preferred presentable surface format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceFormatPreference {
    /// `B8G8R8A8_SRGB`
    Bgra8Srgb,
    /// `B8G8R8A8_UNORM`
    Bgra8Unorm,
    /// `R8G8B8A8_SRGB`
    Rgba8Srgb,
    /// `R8G8B8A8_UNORM`
    Rgba8Unorm,
}

impl SurfaceFormatPreference {
    /// Vulkan format for this preference
    pub const fn to_vk(self) -> vk::Format {
        match self {
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// # Swapchain Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapchainConfig {
    /// Use mailbox presentation when supported (FIFO otherwise)
    pub prefer_mailbox: bool,
    /// Preferred surface format
    pub preferred_format: SurfaceFormatPreference,
}

impl SwapchainConfig {
    /// Enable or disable mailbox presentation
    pub fn with_mailbox(mut self, enabled: bool) -> Self {
        self.prefer_mailbox = enabled;
        self
    }

    /// Set the preferred surface format
    pub fn with_preferred_format(mut self, format: SurfaceFormatPreference) -> Self {
        self.preferred_format = format;
        self
    }
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            prefer_mailbox: true,
            preferred_format: SurfaceFormatPreference::Bgra8Srgb,
        }
    }
}

/// # Core Configuration
///
/// Top-level configuration consumed by [`GraphicsContext`](crate::context::GraphicsContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Frames the renderer keeps in flight; also the delete queue grace period
    pub frames_in_flight: u32,
    /// Memory pool settings
    pub memory: MemoryConfig,
    /// Descriptor pool settings
    pub descriptors: DescriptorConfig,
    /// Swapchain settings
    pub swapchain: SwapchainConfig,
    /// Directory for compiled shader cache files
    pub shader_cache_dir: PathBuf,
    /// Whether to enable Vulkan validation layers
    pub enable_validation: bool,
}

impl CoreConfig {
    /// Set the number of frames in flight
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set memory configuration
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Set descriptor configuration
    pub fn with_descriptors(mut self, descriptors: DescriptorConfig) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Set swapchain configuration
    pub fn with_swapchain(mut self, swapchain: SwapchainConfig) -> Self {
        self.swapchain = swapchain;
        self
    }

    /// Set the shader cache directory
    pub fn with_shader_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_cache_dir = dir.into();
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.frames_in_flight == 0 {
            return Err("Frames in flight must be at least 1".to_string());
        }
        if self.frames_in_flight > 8 {
            return Err("Frames in flight should not exceed 8".to_string());
        }
        self.memory.validate()?;
        self.descriptors.validate()?;
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            memory: MemoryConfig::default(),
            descriptors: DescriptorConfig::default(),
            swapchain: SwapchainConfig::default(),
            shader_cache_dir: PathBuf::from("CachedShaders"),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl Config for CoreConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = CoreConfig::default()
            .with_frames_in_flight(3)
            .with_memory(MemoryConfig::default().with_arena_block_size(1 << 20))
            .with_descriptors(DescriptorConfig::default().with_max_sets_per_pool(4))
            .with_validation(false);

        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.memory.arena_block_size, 1 << 20);
        assert_eq!(config.descriptors.max_sets_per_pool, 4);
        assert!(!config.enable_validation);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(CoreConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(MemoryConfig::default().with_arena_block_size(3000).validate().is_err());
        assert!(MemoryConfig::default().with_arena_priority(2.0).validate().is_err());
        assert!(DescriptorConfig::default().with_max_sets_per_pool(0).validate().is_err());
    }

    #[test]
    fn test_pool_sizes_scale_with_max_sets() {
        let sizes = PoolSizeRatios::default().pool_sizes(4);
        let uniform = sizes
            .iter()
            .find(|size| size.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .map(|size| size.descriptor_count);
        assert_eq!(uniform, Some(40));
        assert!(sizes
            .iter()
            .all(|size| size.ty != vk::DescriptorType::ACCELERATION_STRUCTURE_KHR));
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.toml");
        let config = CoreConfig::default().with_frames_in_flight(3);

        config.save_to_file(&path).unwrap();
        let loaded = CoreConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_ron_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.ron");
        let config = CoreConfig::default()
            .with_swapchain(SwapchainConfig::default().with_mailbox(false));

        config.save_to_file(&path).unwrap();
        let loaded = CoreConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unsupported_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("core.json");
        let result = CoreConfig::default().save_to_file(&path);
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
