//! Plugin protocol messages
//!
//! Hand-declared `prost` messages mirroring `google/protobuf/compiler/plugin.proto`.
//! Descriptor messages come from `prost-types`.

pub use prost_types::{FileDescriptorProto, FileDescriptorSet};

/// Compiler version reported to generators
#[derive(Clone, PartialEq, prost::Message)]
pub struct Version {
    #[prost(int32, optional, tag = "1")]
    pub major: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub minor: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub patch: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub suffix: Option<String>,
}

/// Input handed to every code generator
#[derive(Clone, PartialEq, prost::Message)]
pub struct CodeGeneratorRequest {
    /// Root file names generators should emit code for
    #[prost(string, repeated, tag = "1")]
    pub file_to_generate: Vec<String>,
    #[prost(string, optional, tag = "2")]
    pub parameter: Option<String>,
    /// Every descriptor in the closure, dependencies first
    #[prost(message, repeated, tag = "15")]
    pub proto_file: Vec<FileDescriptorProto>,
    #[prost(message, repeated, tag = "17")]
    pub source_file_descriptors: Vec<FileDescriptorProto>,
    #[prost(message, optional, tag = "3")]
    pub compiler_version: Option<Version>,
}

/// One generated file
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseFile {
    /// Output path; empty means "append to the previous file"
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub insertion_point: Option<String>,
    #[prost(string, optional, tag = "15")]
    pub content: Option<String>,
}

impl ResponseFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            insertion_point: None,
            content: Some(content.into()),
        }
    }
}

/// Output of a code generator
#[derive(Clone, PartialEq, prost::Message)]
pub struct CodeGeneratorResponse {
    /// Set when the generator rejected the request
    #[prost(string, optional, tag = "1")]
    pub error: Option<String>,
    #[prost(uint64, optional, tag = "2")]
    pub supported_features: Option<u64>,
    #[prost(message, repeated, tag = "15")]
    pub file: Vec<ResponseFile>,
}

impl CodeGeneratorResponse {
    pub fn with_files(files: Vec<ResponseFile>) -> Self {
        Self {
            error: None,
            supported_features: None,
            file: files,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            supported_features: None,
            file: Vec::new(),
        }
    }
}
