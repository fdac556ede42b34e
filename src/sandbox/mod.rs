//! Sandboxed guest execution
//!
//! Runs WASI preview1 guests against a staged filesystem view. A guest gets
//! its argument vector, captured stdout/stderr, optional stdin, a read-only
//! view of the staged files at `.`, and a capped linear memory. Nothing else
//! of the host is visible.

pub mod image;

pub use image::GuestImage;

use std::fmt;

use prost::Message;
use tracing::debug;
use wasmtime::{
    ExternType, Linker, Memory, MemoryType, Store, StoreLimits, StoreLimitsBuilder, Trap,
};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::config::SandboxConfig;
use crate::error::{CodegenError, Result};
use crate::protocol::FileDescriptorSet;
use crate::resolve::DescriptorSource;
use crate::stage::StagedFilesystemView;

const WASM_PAGE_SIZE: usize = 65_536;

// =============================================================================
// Outcome
// =============================================================================

/// Captured guest output streams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- stdout ---")?;
        writeln!(f, "{}", String::from_utf8_lossy(&self.stdout).trim_end())?;
        writeln!(f, "--- stderr ---")?;
        write!(f, "{}", String::from_utf8_lossy(&self.stderr).trim_end())
    }
}

/// How a guest run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Returned from `_start` or called `proc_exit(0)`
    Success,
    /// Called `proc_exit` with a non-zero code
    Exit(i32),
    /// Trapped, including fuel exhaustion
    Trap(String),
}

/// Result of one guest invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: ExitOutcome,
    pub output: CapturedOutput,
}

impl Execution {
    /// Turn a failed outcome into an error, otherwise hand back stdout
    pub fn into_stdout(self, program: &str) -> Result<Vec<u8>> {
        match self.outcome {
            ExitOutcome::Success => Ok(self.output.stdout),
            ExitOutcome::Exit(code) => Err(CodegenError::NonZeroExit {
                program: program.to_string(),
                code,
                output: self.output,
            }),
            ExitOutcome::Trap(message) => Err(CodegenError::Trap {
                program: program.to_string(),
                message,
                output: self.output,
            }),
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Resource limits applied to every guest store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub min_memory_pages: u32,
    pub max_memory_pages: u32,
    pub fuel: Option<u64>,
    pub max_output_bytes: usize,
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            min_memory_pages: config.min_memory_pages,
            max_memory_pages: config.max_memory_pages,
            fuel: config.fuel,
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

struct GuestState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// Runs guest images. Stateless apart from its limits; every call builds a
/// fresh store, linker and WASI context.
#[derive(Debug, Clone, Default)]
pub struct SandboxExecutor {
    limits: SandboxLimits,
}

impl SandboxExecutor {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Run `image` and report how it ended. Only host-side failures
    /// (materialization, linking) are errors here.
    pub fn execute(
        &self,
        image: &GuestImage,
        args: &[String],
        stdin: Option<Vec<u8>>,
        view: &StagedFilesystemView,
    ) -> Result<Execution> {
        let program = args.first().map(String::as_str).unwrap_or(image.name());
        debug!(program, ?args, files = view.len(), "running guest");

        let materialized = view.materialize()?;
        let instantiation_error = |e: wasmtime::Error| CodegenError::Instantiation {
            program: program.to_string(),
            message: format!("{:#}", e),
        };

        let stdout = MemoryOutputPipe::new(self.limits.max_output_bytes);
        let stderr = MemoryOutputPipe::new(self.limits.max_output_bytes);

        let mut builder = WasiCtxBuilder::new();
        builder.args(args).stdout(stdout.clone()).stderr(stderr.clone());
        if let Some(input) = stdin {
            builder.stdin(MemoryInputPipe::new(input));
        }
        builder
            .preopened_dir(materialized.path(), ".", DirPerms::READ, FilePerms::READ)
            .map_err(instantiation_error)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.limits.max_memory_pages as usize * WASM_PAGE_SIZE)
            .build();
        let engine = image::engine()?;
        let mut store = Store::new(engine, GuestState {
            wasi: builder.build_p1(),
            limits,
        });
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.limits.fuel.unwrap_or(u64::MAX))
            .map_err(instantiation_error)?;

        let mut linker: Linker<GuestState> = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut GuestState| &mut state.wasi)
            .map_err(instantiation_error)?;
        self.define_imported_memory(image, &mut linker, &mut store)
            .map_err(instantiation_error)?;

        let result = match linker.instantiate(&mut store, image.module()) {
            Ok(instance) => instance
                .get_typed_func::<(), ()>(&mut store, "_start")
                .map_err(instantiation_error)?
                .call(&mut store, ()),
            Err(e) if e.downcast_ref::<Trap>().is_some() => Err(e),
            Err(e) => return Err(instantiation_error(e)),
        };

        let outcome = classify(result);
        drop(store);
        let output = CapturedOutput {
            stdout: stdout.contents().to_vec(),
            stderr: stderr.contents().to_vec(),
        };
        debug!(program, ?outcome, stdout = output.stdout.len(), "guest finished");

        Ok(Execution { outcome, output })
    }

    /// Execute and fail on anything but a clean exit
    pub fn run(
        &self,
        image: &GuestImage,
        args: &[String],
        stdin: Option<Vec<u8>>,
        view: &StagedFilesystemView,
    ) -> Result<Vec<u8>> {
        let program = args.first().cloned().unwrap_or_else(|| image.name().to_string());
        self.execute(image, args, stdin, view)?.into_stdout(&program)
    }

    fn define_imported_memory(
        &self,
        image: &GuestImage,
        linker: &mut Linker<GuestState>,
        store: &mut Store<GuestState>,
    ) -> wasmtime::Result<()> {
        for import in image.module().imports() {
            if import.module() != "env" || import.name() != "memory" {
                continue;
            }
            if let ExternType::Memory(ty) = import.ty() {
                let pages = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
                let maximum = ty
                    .maximum()
                    .map(|max| pages(max).min(self.limits.max_memory_pages))
                    .unwrap_or(self.limits.max_memory_pages);
                let minimum = pages(ty.minimum())
                    .max(self.limits.min_memory_pages.min(maximum));
                let memory = Memory::new(&mut *store, MemoryType::new(minimum, Some(maximum)))?;
                linker.define(&*store, "env", "memory", memory)?;
            }
        }
        Ok(())
    }
}

fn classify(result: wasmtime::Result<()>) -> ExitOutcome {
    match result {
        Ok(()) => ExitOutcome::Success,
        Err(e) => match e.downcast_ref::<I32Exit>() {
            Some(I32Exit(0)) => ExitOutcome::Success,
            Some(I32Exit(code)) => ExitOutcome::Exit(*code),
            None => ExitOutcome::Trap(format!("{:#}", e)),
        },
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// The schema compiler guest, run in descriptor mode
#[derive(Debug, Clone)]
pub struct SandboxCompiler {
    image: GuestImage,
    executor: SandboxExecutor,
    program: String,
    command: String,
    view: StagedFilesystemView,
}

impl SandboxCompiler {
    pub fn new(image: GuestImage, config: &SandboxConfig, view: StagedFilesystemView) -> Self {
        Self {
            image,
            executor: SandboxExecutor::new(SandboxLimits::from(config)),
            program: config.program_name.clone(),
            command: config.descriptor_command.clone(),
            view,
        }
    }

    pub fn view(&self) -> &StagedFilesystemView {
        &self.view
    }
}

impl DescriptorSource for SandboxCompiler {
    fn locate(&self, name: &str) -> bool {
        self.view.contains(name)
    }

    fn compile(&mut self, names: &[String]) -> Result<FileDescriptorSet> {
        let mut args = vec![self.program.clone(), self.command.clone()];
        args.extend(names.iter().cloned());

        let stdout = self.executor.run(&self.image, &args, None, &self.view)?;
        FileDescriptorSet::decode(stdout.as_slice()).map_err(|source| CodegenError::Decode {
            program: self.program.clone(),
            message: "FileDescriptorSet",
            source,
        })
    }
}
