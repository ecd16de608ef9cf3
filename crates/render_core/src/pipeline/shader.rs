//! SPIR-V shader modules

use ash::vk;
use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use crate::backend::ShaderStageDesc;
use crate::context::GraphicsContext;
use crate::error::{VulkanError, VulkanResult};

/// Shader module wrapper with RAII cleanup
///
/// Modules are only read while pipelines are created, so they are destroyed
/// immediately on drop instead of going through the delete queue.
pub struct ShaderModule {
    context: Arc<GraphicsContext>,
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    /// Create a shader module from SPIR-V bytecode
    pub fn from_bytes(
        context: &Arc<GraphicsContext>,
        stage: vk::ShaderStageFlags,
        bytes: &[u8],
    ) -> VulkanResult<Self> {
        let words = spirv_words(bytes)?;
        Self::from_words(context, stage, &words)
    }

    /// Create a shader module from SPIR-V words
    pub fn from_words(
        context: &Arc<GraphicsContext>,
        stage: vk::ShaderStageFlags,
        words: &[u32],
    ) -> VulkanResult<Self> {
        let module = context.device().create_shader_module(words)?;
        log::trace!("Created {:?} shader module ({} words)", stage, words.len());
        Ok(Self {
            context: Arc::clone(context),
            module,
            stage,
        })
    }

    /// Load a shader from a SPIR-V file
    pub fn from_file<P: AsRef<Path>>(
        context: &Arc<GraphicsContext>,
        stage: vk::ShaderStageFlags,
        path: P,
    ) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            VulkanError::InitializationFailed(format!(
                "Failed to read shader file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_bytes(context, stage, &bytes)
    }

    /// Get shader module handle
    pub const fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Stage the module was compiled for
    pub const fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Stage description with the given entry point
    ///
    /// # Panics
    /// Panics if `entry_point` contains a NUL byte.
    pub fn stage_desc(&self, entry_point: &str) -> ShaderStageDesc {
        ShaderStageDesc {
            stage: self.stage,
            module: self.module,
            entry_point: CString::new(entry_point)
                .unwrap_or_else(|_| panic!("entry point {entry_point:?} contains a NUL byte")),
        }
    }

    /// Stage description for the conventional `main` entry point
    pub fn main_stage(&self) -> ShaderStageDesc {
        self.stage_desc("main")
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.context.device().destroy_shader_module(self.module);
    }
}

/// Reinterpret SPIR-V bytes as little-endian words
pub fn spirv_words(bytes: &[u8]) -> VulkanResult<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(VulkanError::InitializationFailed(format!(
            "SPIR-V bytecode length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::config::CoreConfig;

    /// Smallest byte stream the headless device accepts as SPIR-V
    pub(crate) fn fake_spirv() -> Vec<u8> {
        [0x0723_0203_u32, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_spirv_words_requires_whole_words() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[1, 2, 3]).is_err());
        assert_eq!(spirv_words(&fake_spirv()).unwrap()[0], 0x0723_0203);
    }

    #[test]
    fn test_module_lifecycle() {
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device.clone(), CoreConfig::default()).unwrap();
        let module =
            ShaderModule::from_bytes(&context, vk::ShaderStageFlags::VERTEX, &fake_spirv()).unwrap();
        let stage = module.main_stage();
        assert_eq!(stage.stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!(stage.entry_point.to_str().unwrap(), "main");

        let handle = module.handle();
        drop(module);
        assert!(!device.is_alive(handle));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device, CoreConfig::default()).unwrap();
        let result = ShaderModule::from_bytes(&context, vk::ShaderStageFlags::FRAGMENT, &[0; 8]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let device = Arc::new(HeadlessDevice::new());
        let context = GraphicsContext::new(device, CoreConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result =
            ShaderModule::from_file(&context, vk::ShaderStageFlags::COMPUTE, dir.path().join("nope.spv"));
        assert!(matches!(result, Err(VulkanError::InitializationFailed(_))));
    }
}
