//! Error types for the codegen pipeline

use std::path::PathBuf;

use thiserror::Error;

use crate::sandbox::CapturedOutput;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, CodegenError>;

/// Pipeline errors. Every variant aborts the run it was raised in.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid scan policy '{value}': {reason}")]
    InvalidScanPolicy { value: String, reason: String },

    #[error("Unknown generator '{0}': not registered and no guest image configured")]
    UnknownGenerator(String),

    #[error("Source directory {path} is not readable: {source}")]
    SourceDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to extract {entry} from {package} into {target}: {source}")]
    Extraction {
        package: String,
        entry: String,
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read archive {archive}: {source}")]
    Archive {
        archive: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Failed to stage {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load guest image {path}: {message}")]
    GuestImage { path: PathBuf, message: String },

    #[error("Guest '{program}' could not be instantiated: {message}")]
    Instantiation { program: String, message: String },

    #[error("Guest '{program}' trapped: {message}\n{output}")]
    Trap {
        program: String,
        message: String,
        output: CapturedOutput,
    },

    #[error("Guest '{program}' exited with code {code}\n{output}")]
    NonZeroExit {
        program: String,
        code: i32,
        output: CapturedOutput,
    },

    #[error("Failed to decode {message} written by guest '{program}': {source}")]
    Decode {
        program: String,
        message: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("Dependency '{name}' imported by '{referenced_by}' was not found in any include directory")]
    UnresolvedDependency { name: String, referenced_by: String },

    #[error("Import cycle detected: '{name}' is imported while it is still being resolved")]
    DependencyCycle { name: String },

    #[error("Invalid compilation request: {0}")]
    InvalidRequest(String),

    #[error("Generator '{generator}' failed: {message}")]
    Generator { generator: String, message: String },

    #[error("Generator '{generator}' produced an invalid output path '{path}'")]
    InvalidOutputPath { generator: String, path: String },

    #[error("Output path '{path}' produced by both '{first}' and '{second}'")]
    OutputConflict {
        path: String,
        first: String,
        second: String,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodegenError {
    /// Pipeline stage the error belongs to, used in terminating messages
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_)
            | Self::InvalidConfig(_)
            | Self::InvalidScanPolicy { .. }
            | Self::UnknownGenerator(_)
            | Self::SourceDir { .. } => "configuration",
            Self::Extraction { .. } | Self::Archive { .. } => "collection",
            Self::Staging { .. } => "staging",
            Self::GuestImage { .. }
            | Self::Instantiation { .. }
            | Self::Trap { .. }
            | Self::NonZeroExit { .. }
            | Self::Decode { .. } => "sandbox",
            Self::UnresolvedDependency { .. }
            | Self::DependencyCycle { .. }
            | Self::InvalidRequest(_) => "resolution",
            Self::Generator { .. }
            | Self::InvalidOutputPath { .. }
            | Self::OutputConflict { .. }
            | Self::Write { .. } => "generation",
            Self::Io(_) => "io",
        }
    }
}
