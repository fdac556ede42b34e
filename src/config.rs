//! Configuration management for the codegen pipeline
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (protoc-sandbox.toml)
//! - Environment variables (PROTOC_SANDBOX__*)
//!
//! ## Example config file (protoc-sandbox.toml):
//! ```toml
//! test = false
//!
//! [paths]
//! source_dir = "src/main/proto"
//! work_dir = "target/protoc-sandbox"
//! out_dir = "target/generated-sources/protoc"
//!
//! [scan]
//! dependencies = "io.acme:billing-api, io.acme:common-types"
//! imports = "com.google.protobuf:protobuf-java"
//!
//! [scan.include]
//! "io.acme:billing-api" = ["acme/billing/**"]
//!
//! [scan.exclude]
//! "io.acme:billing-api" = ["**/internal/**"]
//!
//! [sandbox]
//! compiler_image = "wasm/protoc-wrapper.wasm"
//! fuel = 50000000000
//!
//! [generators]
//! enabled = ["java", "grpc-java"]
//!
//! [generators.guests.grpc-java]
//! args = ["grpc-java"]
//!
//! [descriptor_set]
//! generate = true
//! name = "services.dsc"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{CodegenError, Result};

/// Largest number of 64 KiB pages a 32-bit linear memory can address
pub const WASM32_MAX_PAGES: u32 = 65_536;

/// Main configuration for one pipeline run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodegenConfig {
    /// Test-scope run: dependency packages are not scanned
    #[serde(default)]
    pub test: bool,

    /// Skip code generation entirely
    #[serde(default)]
    pub skip: bool,

    /// Directory layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Dependency and import scanning
    #[serde(default)]
    pub scan: ScanConfig,

    /// Guest sandbox settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Code generator selection
    #[serde(default)]
    pub generators: GeneratorsConfig,

    /// Optional descriptor-set output
    #[serde(default)]
    pub descriptor_set: DescriptorSetConfig,
}

/// Directory layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Primary directory holding the project's own .proto files
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Scratch directory for extracted dependency files
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Root of the generated source tree
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
}

/// Which packages to scan and how to filter them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Packages whose .proto files are compiled alongside local sources
    #[serde(default)]
    pub dependencies: ScanPolicy,

    /// Packages whose .proto files are only made importable
    #[serde(default = "default_import_policy")]
    pub imports: ScanPolicy,

    /// File options removed from dependency sources on extraction
    #[serde(default = "default_strip_options")]
    pub strip_options: Vec<String>,

    /// Per-package include globs, keyed by `group:artifact`
    #[serde(default)]
    pub include: BTreeMap<String, Vec<String>>,

    /// Per-package exclude globs, keyed by `group:artifact`
    #[serde(default)]
    pub exclude: BTreeMap<String, Vec<String>>,
}

/// Package scan policy: `none`, `all`, or a comma separated list of `group:artifact` ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum ScanPolicy {
    #[default]
    None,
    All,
    Only(Vec<String>),
}

impl ScanPolicy {
    /// Parse a policy value
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("none") {
            return Ok(Self::None);
        }
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        let ids: Vec<String> = trimmed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if ids.is_empty() {
            return Err(CodegenError::InvalidScanPolicy {
                value: value.to_string(),
                reason: "expected 'none', 'all' or a list of group:artifact ids".to_string(),
            });
        }

        for id in &ids {
            match id.split_once(':') {
                Some((group, artifact))
                    if !group.is_empty() && !artifact.is_empty() && !artifact.contains(':') => {}
                _ => {
                    return Err(CodegenError::InvalidScanPolicy {
                        value: value.to_string(),
                        reason: format!("'{}' is not a group:artifact id", id),
                    })
                }
            }
        }

        Ok(Self::Only(ids))
    }

    /// Whether a package with the given `group:artifact` id is selected
    pub fn matches(&self, package_id: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Only(ids) => ids.iter().any(|id| id == package_id),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl TryFrom<String> for ScanPolicy {
    type Error = CodegenError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ScanPolicy> for String {
    fn from(policy: ScanPolicy) -> Self {
        policy.to_string()
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::All => write!(f, "all"),
            Self::Only(ids) => write!(f, "{}", ids.join(",")),
        }
    }
}

/// Guest sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// WebAssembly image of the protoc wrapper
    #[serde(default = "default_compiler_image")]
    pub compiler_image: PathBuf,

    /// argv[0] passed to guests
    #[serde(default = "default_program_name")]
    pub program_name: String,

    /// Sub-command selecting compile-to-descriptor mode
    #[serde(default = "default_descriptor_command")]
    pub descriptor_command: String,

    /// Initial linear memory, in 64 KiB pages
    #[serde(default = "default_min_memory_pages")]
    pub min_memory_pages: u32,

    /// Linear memory cap, in 64 KiB pages
    #[serde(default = "default_max_memory_pages")]
    pub max_memory_pages: u32,

    /// Execution budget per invocation; unbounded when unset
    #[serde(default)]
    pub fuel: Option<u64>,

    /// Capacity of each captured output stream, in bytes
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Code generator selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorsConfig {
    /// Generators to run, in order
    #[serde(default = "default_enabled_generators")]
    pub enabled: Vec<String>,

    /// Guest generators by id
    #[serde(default = "default_guest_generators")]
    pub guests: BTreeMap<String, GuestGeneratorConfig>,
}

/// A generator executed as a sandboxed guest in generate mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuestGeneratorConfig {
    /// Image to run; defaults to the compiler image
    #[serde(default)]
    pub image: Option<PathBuf>,

    /// Arguments following argv[0]
    #[serde(default)]
    pub args: Vec<String>,
}

/// Descriptor-set output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorSetConfig {
    /// Write the resolved descriptor set
    #[serde(default)]
    pub generate: bool,

    /// Output directory, relative to the work directory; the output directory when unset
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// File name
    #[serde(default = "default_descriptor_set_name")]
    pub name: String,
}

// Default value functions
fn default_source_dir() -> PathBuf {
    PathBuf::from("src/main/proto")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("target/protoc-sandbox")
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("target/generated-sources/protoc")
}

fn default_import_policy() -> ScanPolicy {
    ScanPolicy::Only(vec!["com.google.protobuf:protobuf-java".to_string()])
}

fn default_strip_options() -> Vec<String> {
    vec!["java_generic_services".to_string()]
}

fn default_compiler_image() -> PathBuf {
    PathBuf::from("protoc-wrapper.wasm")
}

fn default_program_name() -> String {
    "protoc-wrapper".to_string()
}

fn default_descriptor_command() -> String {
    "descriptors".to_string()
}

fn default_min_memory_pages() -> u32 {
    10
}

fn default_max_memory_pages() -> u32 {
    WASM32_MAX_PAGES
}

fn default_max_output_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_enabled_generators() -> Vec<String> {
    vec!["java".to_string(), "grpc-java".to_string()]
}

fn default_guest_generators() -> BTreeMap<String, GuestGeneratorConfig> {
    default_enabled_generators()
        .into_iter()
        .map(|id| {
            let guest = GuestGeneratorConfig {
                image: None,
                args: vec![id.clone()],
            };
            (id, guest)
        })
        .collect()
}

fn default_descriptor_set_name() -> String {
    "descriptor_set.dsc".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            work_dir: default_work_dir(),
            out_dir: default_out_dir(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            dependencies: ScanPolicy::None,
            imports: default_import_policy(),
            strip_options: default_strip_options(),
            include: BTreeMap::new(),
            exclude: BTreeMap::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compiler_image: default_compiler_image(),
            program_name: default_program_name(),
            descriptor_command: default_descriptor_command(),
            min_memory_pages: default_min_memory_pages(),
            max_memory_pages: default_max_memory_pages(),
            fuel: None,
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for GeneratorsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_generators(),
            guests: default_guest_generators(),
        }
    }
}

impl Default for DescriptorSetConfig {
    fn default() -> Self {
        Self {
            generate: false,
            output_dir: None,
            name: default_descriptor_set_name(),
        }
    }
}

impl ScanConfig {
    /// Include globs configured for a package
    pub fn includes_for(&self, package_id: &str) -> &[String] {
        self.include.get(package_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Exclude globs configured for a package
    pub fn excludes_for(&self, package_id: &str) -> &[String] {
        self.exclude.get(package_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl CodegenConfig {
    /// Load configuration from default locations
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = [
            "protoc-sandbox.toml",
            ".protoc-sandbox.toml",
            "config/protoc-sandbox.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "protoc-sandbox", "protoc-sandbox") {
            let xdg_config = config_dir.config_dir().join("protoc-sandbox.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (PROTOC_SANDBOX__*)
        builder = builder.add_source(
            Environment::with_prefix("PROTOC_SANDBOX")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Check values the type system cannot
    pub fn validate(&self) -> Result<()> {
        let sandbox = &self.sandbox;
        if sandbox.min_memory_pages > sandbox.max_memory_pages {
            return Err(CodegenError::InvalidConfig(format!(
                "sandbox.min_memory_pages ({}) exceeds sandbox.max_memory_pages ({})",
                sandbox.min_memory_pages, sandbox.max_memory_pages
            )));
        }
        if sandbox.max_memory_pages > WASM32_MAX_PAGES {
            return Err(CodegenError::InvalidConfig(format!(
                "sandbox.max_memory_pages ({}) exceeds the wasm32 limit of {}",
                sandbox.max_memory_pages, WASM32_MAX_PAGES
            )));
        }
        if sandbox.program_name.is_empty() || sandbox.descriptor_command.is_empty() {
            return Err(CodegenError::InvalidConfig(
                "sandbox.program_name and sandbox.descriptor_command must not be empty".to_string(),
            ));
        }
        if self.descriptor_set.generate && self.descriptor_set.name.trim().is_empty() {
            return Err(CodegenError::InvalidConfig(
                "descriptor_set.name must not be empty".to_string(),
            ));
        }
        for key in self.scan.include.keys().chain(self.scan.exclude.keys()) {
            if !key.contains(':') {
                return Err(CodegenError::InvalidConfig(format!(
                    "scan filter key '{}' is not a group:artifact id",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Primary source directory (resolves relative paths)
    pub fn source_dir(&self) -> PathBuf {
        absolutize(&self.paths.source_dir)
    }

    /// Work directory (resolves relative paths)
    pub fn work_dir(&self) -> PathBuf {
        absolutize(&self.paths.work_dir)
    }

    /// Output directory (resolves relative paths)
    pub fn out_dir(&self) -> PathBuf {
        absolutize(&self.paths.out_dir)
    }

    /// Where the descriptor set is written
    pub fn descriptor_set_path(&self) -> PathBuf {
        let dir = match &self.descriptor_set.output_dir {
            Some(dir) => self.work_dir().join(dir),
            None => self.out_dir(),
        };
        dir.join(&self.descriptor_set.name)
    }
}

fn absolutize(path: &std::path::Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}
