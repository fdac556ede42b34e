//! Protoc Sandbox
//!
//! Compiles protobuf schemas inside a WebAssembly sandbox and feeds the
//! resolved descriptors to code generators.
//!
//! ## Pipeline
//!
//! ```text
//! source dir ─┐
//! packages ───┴─► collect ─► stage ─► compile (wasm guest) ─► resolve ─► dispatch ─► out dir
//!                              │                                            ▲
//!                              └────────── staged view ─────────────────────┘
//! ```
//!
//! - **collect**: local `.proto` files, dependency packages (directories or
//!   zip/jar archives), import-only packages
//! - **stage**: an isolated in-memory file view, materialized per guest call
//! - **compile**: the protoc guest emits a `FileDescriptorSet` on stdout
//! - **resolve**: depth-first closure over imports, dependencies first
//! - **dispatch**: every generator gets the same `CodeGeneratorRequest`;
//!   output is written only when all of them succeed
//! - **output**: generated files and the descriptor set are committed together
//!
//! ## Example
//!
//! ```no_run
//! use protoc_sandbox::{CodegenConfig, Pipeline};
//!
//! let config = CodegenConfig::load()?;
//! let processed = Pipeline::new(config).run()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod checksum;
pub mod collect;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod protocol;
pub mod resolve;
pub mod sandbox;
pub mod stage;

pub use checksum::Checksum;
pub use collect::{
    CollectedSources, ContentEntry, Coordinate, IncludeDirectories, PackageContent, ResolvedPackage,
    SchemaFile, SourceCollector,
};
pub use config::{CodegenConfig, ScanPolicy};
pub use diagnostics::{DiagnosticCode, DiagnosticItem, Diagnostics, Severity};
pub use dispatch::{
    CodeGenerator, Dispatcher, GeneratedBatch, GeneratedFile, GuestGenerator, InProcessGenerator,
};
pub use error::{CodegenError, Result};
pub use output::OutputTransaction;
pub use pipeline::{Pipeline, PreparedRun, RunReport};
pub use resolve::{resolve, Closure, CompilationRequest, DescriptorSource};
pub use sandbox::{
    CapturedOutput, Execution, ExitOutcome, GuestImage, SandboxCompiler, SandboxExecutor,
    SandboxLimits,
};
pub use stage::{stage, Staged, StagedFilesystemView};
