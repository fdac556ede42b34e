//! Guest images
//!
//! Compiled guest modules are cached for the life of the process. The cache
//! only grows; an image loaded once is never reloaded.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, info};
use wasmtime::{Engine, Module};

use crate::error::{CodegenError, Result};

static ENGINE: OnceCell<Engine> = OnceCell::new();

static IMAGES: Lazy<Mutex<HashMap<PathBuf, GuestImage>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Shared engine. Fuel metering is always enabled; stores without a budget
/// get an effectively unlimited tank.
pub(crate) fn engine() -> Result<&'static Engine> {
    ENGINE.get_or_try_init(|| {
        let mut config = wasmtime::Config::new();
        config.consume_fuel(true);
        Engine::new(&config).map_err(|e| CodegenError::GuestImage {
            path: PathBuf::new(),
            message: format!("engine initialization failed: {:#}", e),
        })
    })
}

/// A compiled guest program
#[derive(Clone)]
pub struct GuestImage {
    name: String,
    module: Module,
}

impl GuestImage {
    /// Load and compile a module from disk, or return the cached copy
    pub fn load(path: &Path) -> Result<Self> {
        let key = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        let mut images = IMAGES.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(image) = images.get(&key) {
            debug!(path = %key.display(), "guest image cache hit");
            return Ok(image.clone());
        }

        let bytes = fs::read(&key).map_err(|e| CodegenError::GuestImage {
            path: key.clone(),
            message: e.to_string(),
        })?;
        let name = key
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.display().to_string());
        let image = Self::compile(name, &bytes, &key)?;

        info!(path = %key.display(), "compiled guest image");
        images.insert(key, image.clone());
        Ok(image)
    }

    /// Compile an uncached image from binary or text format bytes
    pub fn from_bytes(name: impl Into<String>, bytes: impl AsRef<[u8]>) -> Result<Self> {
        let name = name.into();
        let path = PathBuf::from(&name);
        Self::compile(name, bytes.as_ref(), &path)
    }

    fn compile(name: String, bytes: &[u8], path: &Path) -> Result<Self> {
        let module = Module::new(engine()?, bytes).map_err(|e| CodegenError::GuestImage {
            path: path.to_path_buf(),
            message: format!("{:#}", e),
        })?;
        Ok(Self { name, module })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

impl std::fmt::Debug for GuestImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestImage").field("name", &self.name).finish()
    }
}
