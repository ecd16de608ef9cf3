//! On-disk cache of compiled shaders
//!
//! Each entry is two files in the cache directory:
//!
//! ```text
//! CachedShaders/
//!   lit.frag.spv    compiled SPIR-V
//!   lit.frag.hash   xxh3 of the GLSL source, as 16 hex digits
//! ```
//!
//! A lookup only hits when the stored hash matches the current source, so editing a
//! shader invalidates its entry without any bookkeeping.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::CoreConfig;

/// Shader cache errors
#[derive(Error, Debug)]
pub enum ShaderCacheError {
    /// Reading or writing the cache directory failed
    #[error("Shader cache IO error: {0}")]
    Io(#[from] io::Error),

    /// Compiled code is not a whole number of SPIR-V words
    #[error("Refusing to cache {0} bytes of SPIR-V")]
    InvalidSpirv(usize),
}

/// Compiled-shader cache rooted at one directory
#[derive(Debug, Clone)]
pub struct ShaderCache {
    dir: PathBuf,
}

impl ShaderCache {
    /// Cache rooted at `dir`; the directory is created on the first store
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache rooted at the configured `shader_cache_dir`
    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.shader_cache_dir.clone())
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hash recorded for a shader source
    pub fn source_hash(source: &[u8]) -> u64 {
        xxh3_64(source)
    }

    fn paths(&self, name: &str) -> (PathBuf, PathBuf) {
        assert!(
            !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != "..",
            "invalid shader cache entry name {name:?}"
        );
        (
            self.dir.join(format!("{name}.spv")),
            self.dir.join(format!("{name}.hash")),
        )
    }

    /// Cached SPIR-V for `name` if it was compiled from exactly `source`
    ///
    /// Missing, unreadable or stale entries are all misses.
    pub fn load(&self, name: &str, source: &[u8]) -> Option<Vec<u8>> {
        let (spv_path, hash_path) = self.paths(name);
        let stored = fs::read_to_string(&hash_path).ok()?;
        let stored = u64::from_str_radix(stored.trim(), 16).ok()?;
        if stored != Self::source_hash(source) {
            log::debug!("Shader cache entry {} is stale", name);
            return None;
        }
        match fs::read(&spv_path) {
            Ok(spirv) if !spirv.is_empty() && spirv.len() % 4 == 0 => {
                log::trace!("Shader cache hit for {}", name);
                Some(spirv)
            }
            Ok(spirv) => {
                log::warn!("Shader cache entry {} holds {} bytes, ignoring", name, spirv.len());
                None
            }
            Err(e) => {
                log::warn!("Shader cache entry {} has a hash but no code: {}", name, e);
                None
            }
        }
    }

    /// Record `spirv` as the compiled form of `source`
    ///
    /// The code is written before the hash, so an interrupted store leaves a
    /// stale entry rather than a hash that vouches for the wrong code.
    pub fn store(&self, name: &str, source: &[u8], spirv: &[u8]) -> Result<(), ShaderCacheError> {
        if spirv.is_empty() || spirv.len() % 4 != 0 {
            return Err(ShaderCacheError::InvalidSpirv(spirv.len()));
        }
        let (spv_path, hash_path) = self.paths(name);
        fs::create_dir_all(&self.dir)?;
        if hash_path.exists() {
            fs::remove_file(&hash_path)?;
        }
        fs::write(&spv_path, spirv)?;
        fs::write(&hash_path, format!("{:016x}", Self::source_hash(source)))?;
        log::debug!("Cached shader {} ({} bytes)", name, spirv.len());
        Ok(())
    }

    /// Cached SPIR-V for `source`, compiling and storing it on a miss
    ///
    /// A failure to write the cache is logged and the fresh code returned anyway.
    pub fn get_or_compile<F, E>(&self, name: &str, source: &[u8], compile: F) -> Result<Vec<u8>, E>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, E>,
    {
        if let Some(spirv) = self.load(name, source) {
            return Ok(spirv);
        }
        let spirv = compile(source)?;
        if let Err(e) = self.store(name, source, &spirv) {
            log::warn!("Failed to cache shader {}: {}", name, e);
        }
        Ok(spirv)
    }

    /// Delete the entry for `name`, if any
    pub fn remove(&self, name: &str) -> Result<(), ShaderCacheError> {
        let (spv_path, hash_path) = self.paths(name);
        for path in [hash_path, spv_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const SOURCE: &[u8] = b"#version 450\nvoid main() {}\n";
    const SPIRV: &[u8] = &[0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0];

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path().join("CachedShaders"));
        assert!(cache.load("basic.vert", SOURCE).is_none());

        cache.store("basic.vert", SOURCE, SPIRV).unwrap();
        assert_eq!(cache.load("basic.vert", SOURCE).as_deref(), Some(SPIRV));
        assert!(cache.dir().join("basic.vert.spv").exists());
        assert!(cache.dir().join("basic.vert.hash").exists());
    }

    #[test]
    fn test_changed_source_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path());
        cache.store("basic.frag", SOURCE, SPIRV).unwrap();
        assert!(cache.load("basic.frag", b"#version 460\n").is_none());
    }

    #[test]
    fn test_missing_code_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path());
        cache.store("basic.frag", SOURCE, SPIRV).unwrap();
        fs::remove_file(dir.path().join("basic.frag.spv")).unwrap();
        assert!(cache.load("basic.frag", SOURCE).is_none());
    }

    #[test]
    fn test_rejects_partial_words() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path());
        let result = cache.store("broken", SOURCE, &[1, 2, 3]);
        assert!(matches!(result, Err(ShaderCacheError::InvalidSpirv(3))));
    }

    #[test]
    fn test_get_or_compile_compiles_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ShaderCache::new(dir.path());
        let compiles = Cell::new(0);
        let compile = |_: &[u8]| -> Result<Vec<u8>, String> {
            compiles.set(compiles.get() + 1);
            Ok(SPIRV.to_vec())
        };

        assert_eq!(cache.get_or_compile("ui.vert", SOURCE, compile).unwrap(), SPIRV);
        assert_eq!(cache.get_or_compile("ui.vert", SOURCE, compile).unwrap(), SPIRV);
        assert_eq!(compiles.get(), 1);

        cache.remove("ui.vert").unwrap();
        cache.remove("ui.vert").unwrap();
        assert!(cache.load("ui.vert", SOURCE).is_none());
    }

    #[test]
    #[should_panic(expected = "invalid shader cache entry name")]
    fn test_path_names_are_rejected() {
        let cache = ShaderCache::new("CachedShaders");
        let _ = cache.load("../escape", SOURCE);
    }
}
