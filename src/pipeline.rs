//! End-to-end orchestration
//!
//! ```text
//! collect → stage → compile roots → resolve closure → dispatch → write
//! ```
//!
//! [`Pipeline::prepare`] runs everything that does not execute a guest, so
//! configuration problems surface before the sandbox is touched. Guest images
//! are only loaded once there is something to compile.
//! [`PreparedRun::finish`] takes any [`DescriptorSource`] for the rest.

use std::path::PathBuf;

use prost::Message;
use serde::Serialize;
use tracing::info;

use crate::checksum::Checksum;
use crate::collect::{ResolvedPackage, SourceCollector};
use crate::config::CodegenConfig;
use crate::diagnostics::Diagnostics;
use crate::dispatch::{CodeGenerator, Dispatcher, GuestGenerator};
use crate::error::{CodegenError, Result};
use crate::output::OutputTransaction;
use crate::resolve::{CompilationRequest, DescriptorSource};
use crate::sandbox::{GuestImage, SandboxCompiler, SandboxExecutor, SandboxLimits};
use crate::stage::{self, Staged};

/// Summary of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// `false` when there was nothing to do
    pub processed: bool,
    pub roots: Vec<String>,
    /// Descriptors in the resolved closure
    pub request_files: usize,
    pub request_checksum: Option<Checksum>,
    pub written: Vec<PathBuf>,
    pub descriptor_set: Option<PathBuf>,
    pub diagnostics: Diagnostics,
}

/// One configured run
pub struct Pipeline {
    config: CodegenConfig,
    packages: Vec<ResolvedPackage>,
    generators: Vec<Box<dyn CodeGenerator>>,
}

impl Pipeline {
    pub fn new(config: CodegenConfig) -> Self {
        Self {
            config,
            packages: Vec::new(),
            generators: Vec::new(),
        }
    }

    pub fn with_packages(mut self, packages: impl IntoIterator<Item = ResolvedPackage>) -> Self {
        self.packages.extend(packages);
        self
    }

    /// Register a generator. Registered generators take precedence over
    /// guest generators with the same id.
    pub fn with_generator(mut self, generator: Box<dyn CodeGenerator>) -> Self {
        self.generators.push(generator);
        self
    }

    pub fn config(&self) -> &CodegenConfig {
        &self.config
    }

    /// Run and report whether anything was processed
    pub fn run(self) -> Result<bool> {
        Ok(self.execute()?.processed)
    }

    /// Run through the sandboxed compiler
    pub fn execute(self) -> Result<RunReport> {
        let Some(prepared) = self.prepare()? else {
            return Ok(RunReport::default());
        };
        let mut compiler = prepared.compiler()?;
        prepared.finish(&mut compiler)
    }

    /// Validate, collect and stage. `None` means there is nothing to do.
    pub fn prepare(self) -> Result<Option<PreparedRun>> {
        if self.config.skip {
            info!("code generation skipped by configuration");
            return Ok(None);
        }

        self.config.validate()?;
        let plan = plan_generators(&self.config, self.generators)?;

        let collected = SourceCollector::new(&self.config)?.collect(&self.packages)?;
        if collected.is_empty() {
            info!(source_dir = %self.config.source_dir().display(), "no schema files found");
            return Ok(None);
        }
        let dispatcher = build_dispatcher(&self.config, plan)?;

        let mut diagnostics = collected.diagnostics;
        let staged = stage::stage(&collected.include_dirs, &collected.import_dirs, &collected.roots)?;
        diagnostics.extend(staged.diagnostics.clone());

        Ok(Some(PreparedRun {
            config: self.config,
            dispatcher,
            staged,
            diagnostics,
        }))
    }
}

/// A generator chosen for a run, before any guest image is loaded
enum PlannedGenerator {
    Registered(Box<dyn CodeGenerator>),
    Guest {
        id: String,
        image: PathBuf,
        args: Vec<String>,
    },
}

/// Match enabled ids against registered generators and guest entries
fn plan_generators(
    config: &CodegenConfig,
    mut registered: Vec<Box<dyn CodeGenerator>>,
) -> Result<Vec<PlannedGenerator>> {
    let mut plan = Vec::with_capacity(config.generators.enabled.len());
    for id in &config.generators.enabled {
        if let Some(index) = registered.iter().position(|g| g.id() == id) {
            plan.push(PlannedGenerator::Registered(registered.remove(index)));
            continue;
        }
        let guest = config
            .generators
            .guests
            .get(id)
            .ok_or_else(|| CodegenError::UnknownGenerator(id.clone()))?;
        plan.push(PlannedGenerator::Guest {
            id: id.clone(),
            image: guest.image.clone().unwrap_or_else(|| config.sandbox.compiler_image.clone()),
            args: guest.args.clone(),
        });
    }
    Ok(plan)
}

fn build_dispatcher(config: &CodegenConfig, plan: Vec<PlannedGenerator>) -> Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new();
    let executor = SandboxExecutor::new(SandboxLimits::from(&config.sandbox));

    for planned in plan {
        match planned {
            PlannedGenerator::Registered(generator) => dispatcher.push(generator),
            PlannedGenerator::Guest { id, image, args } => {
                let image = GuestImage::load(&image)?;
                dispatcher.push(Box::new(GuestGenerator::new(
                    id,
                    config.sandbox.program_name.clone(),
                    image,
                    args,
                    executor.clone(),
                )));
            }
        }
    }
    Ok(dispatcher)
}

/// A collected and staged run waiting for compilation
pub struct PreparedRun {
    config: CodegenConfig,
    dispatcher: Dispatcher,
    staged: Staged,
    diagnostics: Diagnostics,
}

impl PreparedRun {
    pub fn staged(&self) -> &Staged {
        &self.staged
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn generator_ids(&self) -> Vec<&str> {
        self.dispatcher.ids()
    }

    /// The sandboxed schema compiler over this run's staged view
    pub fn compiler(&self) -> Result<SandboxCompiler> {
        let image = GuestImage::load(&self.config.sandbox.compiler_image)?;
        Ok(SandboxCompiler::new(image, &self.config.sandbox, self.staged.view.clone()))
    }

    /// Compile the roots and resolve their closure
    pub fn resolve<S>(&self, source: &mut S) -> Result<CompilationRequest>
    where
        S: DescriptorSource + ?Sized,
    {
        CompilationRequest::build(source, &self.staged.root_names)
    }

    /// Resolve, generate and write
    pub fn finish<S>(self, source: &mut S) -> Result<RunReport>
    where
        S: DescriptorSource + ?Sized,
    {
        let request = self.resolve(source)?;
        let batch = self.dispatcher.dispatch(&request, &self.staged.view)?;

        let mut transaction = OutputTransaction::new();
        batch.stage_into(&self.config.out_dir(), &mut transaction)?;
        let descriptor_set = if self.config.descriptor_set.generate {
            let path = self.config.descriptor_set_path();
            transaction.stage(&path, &request.descriptor_set().encode_to_vec())?;
            Some(path)
        } else {
            None
        };

        let mut written = transaction.commit()?;
        if let Some(path) = &descriptor_set {
            written.retain(|p| p != path);
            info!(path = %path.display(), "descriptor set written");
        }

        info!(
            roots = request.roots().len(),
            files = request.len(),
            generated = written.len(),
            warnings = self.diagnostics.warning_count(),
            "code generation finished"
        );

        Ok(RunReport {
            processed: true,
            roots: request.roots().to_vec(),
            request_files: request.len(),
            request_checksum: Some(request.checksum()),
            written,
            descriptor_set,
            diagnostics: self.diagnostics,
        })
    }
}
