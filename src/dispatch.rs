//! Generator Dispatch
//!
//! Hands one shared plugin request to every enabled generator, checks their
//! responses against each other, and writes the combined output only when
//! every generator succeeded.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use prost::Message;
use tracing::{debug, info};

use crate::error::{CodegenError, Result};
use crate::output::OutputTransaction;
use crate::protocol::{CodeGeneratorRequest, CodeGeneratorResponse};
use crate::resolve::CompilationRequest;
use crate::sandbox::{GuestImage, SandboxExecutor};
use crate::stage::StagedFilesystemView;

// =============================================================================
// Generators
// =============================================================================

/// A code generation back end
pub trait CodeGenerator {
    /// Identifier used in configuration and error messages
    fn id(&self) -> &str;

    fn generate(
        &self,
        request: &CodeGeneratorRequest,
        view: &StagedFilesystemView,
    ) -> Result<CodeGeneratorResponse>;
}

/// A generator compiled into the guest image, run in generate mode
#[derive(Debug, Clone)]
pub struct GuestGenerator {
    id: String,
    program: String,
    image: GuestImage,
    args: Vec<String>,
    executor: SandboxExecutor,
}

impl GuestGenerator {
    pub fn new(
        id: impl Into<String>,
        program: impl Into<String>,
        image: GuestImage,
        args: Vec<String>,
        executor: SandboxExecutor,
    ) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            image,
            args,
            executor,
        }
    }
}

impl CodeGenerator for GuestGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate(
        &self,
        request: &CodeGeneratorRequest,
        view: &StagedFilesystemView,
    ) -> Result<CodeGeneratorResponse> {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());

        let stdout = self
            .executor
            .run(&self.image, &args, Some(request.encode_to_vec()), view)?;
        CodeGeneratorResponse::decode(stdout.as_slice()).map_err(|source| CodegenError::Decode {
            program: self.program.clone(),
            message: "CodeGeneratorResponse",
            source,
        })
    }
}

type GenerateFn = dyn Fn(&CodeGeneratorRequest) -> Result<CodeGeneratorResponse> + Send + Sync;

/// A generator implemented as a host-side function
pub struct InProcessGenerator {
    id: String,
    generate: Box<GenerateFn>,
}

impl InProcessGenerator {
    pub fn new<F>(id: impl Into<String>, generate: F) -> Self
    where
        F: Fn(&CodeGeneratorRequest) -> Result<CodeGeneratorResponse> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            generate: Box::new(generate),
        }
    }
}

impl std::fmt::Debug for InProcessGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessGenerator").field("id", &self.id).finish()
    }
}

impl CodeGenerator for InProcessGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate(
        &self,
        request: &CodeGeneratorRequest,
        _view: &StagedFilesystemView,
    ) -> Result<CodeGeneratorResponse> {
        (self.generate)(request)
    }
}

// =============================================================================
// Generated Output
// =============================================================================

/// One output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    /// Path relative to the output directory, `/`-separated
    pub path: String,
    pub content: Vec<u8>,
    /// Generator that produced the file
    pub generator: String,
}

/// All files of one dispatch, checked for conflicts
#[derive(Debug, Clone, Default)]
pub struct GeneratedBatch {
    files: Vec<GeneratedFile>,
    /// File path → generator
    owners: HashMap<String, String>,
    /// Directory implied by a file path → first generator writing below it
    directories: HashMap<String, String>,
}

impl GeneratedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a generator's response into the batch
    pub fn add(&mut self, generator: &str, response: CodeGeneratorResponse) -> Result<()> {
        if let Some(message) = response.error.filter(|m| !m.is_empty()) {
            return Err(CodegenError::Generator {
                generator: generator.to_string(),
                message,
            });
        }

        let mut previous: Option<usize> = None;
        for file in response.file {
            if file.insertion_point.as_deref().is_some_and(|p| !p.is_empty()) {
                return Err(CodegenError::Generator {
                    generator: generator.to_string(),
                    message: format!(
                        "insertion point '{}' is not supported",
                        file.insertion_point.unwrap_or_default()
                    ),
                });
            }

            let name = file.name.unwrap_or_default();
            let content = file.content.unwrap_or_default();

            if name.is_empty() {
                let Some(index) = previous else {
                    return Err(CodegenError::Generator {
                        generator: generator.to_string(),
                        message: "file continuation without a preceding file".to_string(),
                    });
                };
                self.files[index].content.extend_from_slice(content.as_bytes());
                continue;
            }

            let path = normalize_output_path(&name).ok_or_else(|| CodegenError::InvalidOutputPath {
                generator: generator.to_string(),
                path: name.clone(),
            })?;

            if let Some(first) = self.overlapping_owner(&path) {
                return Err(CodegenError::OutputConflict {
                    path,
                    first: first.clone(),
                    second: generator.to_string(),
                });
            }

            debug!(generator, path = %path, bytes = content.len(), "generated file");
            for dir in parent_dirs(&path) {
                self.directories
                    .entry(dir.to_string())
                    .or_insert_with(|| generator.to_string());
            }
            self.owners.insert(path.clone(), generator.to_string());
            self.files.push(GeneratedFile {
                path,
                content: content.into_bytes(),
                generator: generator.to_string(),
            });
            previous = Some(self.files.len() - 1);
        }
        Ok(())
    }

    /// Generator already claiming `path`, either as the same file, as a file
    /// where `path` needs a directory, or as a directory where `path` is a file
    fn overlapping_owner(&self, path: &str) -> Option<&String> {
        self.owners
            .get(path)
            .or_else(|| parent_dirs(path).find_map(|dir| self.owners.get(dir)))
            .or_else(|| self.directories.get(path))
    }

    pub fn files(&self) -> &[GeneratedFile] {
        &self.files
    }

    pub fn get(&self, path: &str) -> Option<&GeneratedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Add every file, placed under `out_dir`, to `transaction`
    pub fn stage_into(&self, out_dir: &Path, transaction: &mut OutputTransaction) -> Result<()> {
        for file in &self.files {
            transaction.stage(out_dir.join(&file.path), &file.content)?;
        }
        Ok(())
    }

    /// Write every file under `out_dir`. Either all files are written or the
    /// directory is left untouched.
    pub fn write_to(&self, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut transaction = OutputTransaction::new();
        self.stage_into(out_dir, &mut transaction)?;
        transaction.commit()
    }
}

/// Directory prefixes of a `/`-separated path, outermost first
fn parent_dirs(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(index, _)| &path[..index])
}

/// Relative `/`-separated form of a generator path, or `None` if it could
/// leave the output directory
fn normalize_output_path(name: &str) -> Option<String> {
    if name.contains('\\') {
        return None;
    }
    let mut parts = Vec::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Runs all enabled generators against one compilation request
#[derive(Default)]
pub struct Dispatcher {
    generators: Vec<Box<dyn CodeGenerator>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, generator: Box<dyn CodeGenerator>) {
        self.generators.push(generator);
    }

    pub fn with(mut self, generator: Box<dyn CodeGenerator>) -> Self {
        self.push(generator);
        self
    }

    pub fn ids(&self) -> Vec<&str> {
        self.generators.iter().map(|g| g.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Run every generator in order. Fails on the first generator error or
    /// output conflict; nothing is written here.
    pub fn dispatch(
        &self,
        request: &CompilationRequest,
        view: &StagedFilesystemView,
    ) -> Result<GeneratedBatch> {
        let generator_request = request.to_generator_request();
        let mut batch = GeneratedBatch::new();

        for generator in &self.generators {
            info!(generator = generator.id(), files = request.len(), "running generator");
            let response = generator.generate(&generator_request, view)?;
            batch.add(generator.id(), response)?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FileDescriptorProto, ResponseFile};

    fn request() -> CompilationRequest {
        CompilationRequest::from_parts(
            vec![FileDescriptorProto {
                name: Some("order.proto".to_string()),
                ..Default::default()
            }],
            vec!["order.proto".to_string()],
        )
    }

    fn emitting(id: &str, files: &[(&'static str, &'static str)]) -> Box<dyn CodeGenerator> {
        let files: Vec<_> = files.iter().map(|(n, c)| ResponseFile::new(*n, *c)).collect();
        Box::new(InProcessGenerator::new(id, move |_| {
            Ok(CodeGeneratorResponse::with_files(files.clone()))
        }))
    }

    #[test]
    fn test_normalize_output_path() {
        assert_eq!(normalize_output_path("a/b/C.java").as_deref(), Some("a/b/C.java"));
        assert_eq!(normalize_output_path("./a/C.java").as_deref(), Some("a/C.java"));
        assert_eq!(normalize_output_path("../C.java"), None);
        assert_eq!(normalize_output_path("a/../../C.java"), None);
        assert_eq!(normalize_output_path("/etc/passwd"), None);
        assert_eq!(normalize_output_path("a\\..\\C.java"), None);
        assert_eq!(normalize_output_path(""), None);
    }

    #[test]
    fn test_every_generator_sees_the_same_request() {
        use std::sync::{Arc, Mutex};

        let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
        let mut dispatcher = Dispatcher::new();
        for id in ["first", "second"] {
            let seen = Arc::clone(&seen);
            dispatcher.push(Box::new(InProcessGenerator::new(id, move |req| {
                seen.lock().unwrap().push(req.file_to_generate.clone());
                Ok(CodeGeneratorResponse::default())
            })));
        }

        dispatcher.dispatch(&request(), &StagedFilesystemView::new()).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
    }

    #[test]
    fn test_conflict_between_generators() {
        let dispatcher = Dispatcher::new()
            .with(emitting("java", &[("acme/Order.java", "class Order {}")]))
            .with(emitting("kotlin", &[("acme/Order.java", "class Order")]));

        let err = dispatcher
            .dispatch(&request(), &StagedFilesystemView::new())
            .unwrap_err();
        match err {
            CodegenError::OutputConflict { path, first, second } => {
                assert_eq!(path, "acme/Order.java");
                assert_eq!(first, "java");
                assert_eq!(second, "kotlin");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_conflict_within_one_generator() {
        let dispatcher = Dispatcher::new().with(emitting("java", &[("A.java", "a"), ("./A.java", "b")]));
        let err = dispatcher
            .dispatch(&request(), &StagedFilesystemView::new())
            .unwrap_err();
        assert!(matches!(err, CodegenError::OutputConflict { .. }));
    }

    #[test]
    fn test_file_where_another_generator_needs_a_directory() {
        let dispatcher = Dispatcher::new()
            .with(emitting("java", &[("acme", "not a directory")]))
            .with(emitting("kotlin", &[("acme/Order.kt", "class Order")]));

        let err = dispatcher
            .dispatch(&request(), &StagedFilesystemView::new())
            .unwrap_err();
        match err {
            CodegenError::OutputConflict { path, first, second } => {
                assert_eq!(path, "acme/Order.kt");
                assert_eq!(first, "java");
                assert_eq!(second, "kotlin");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_directory_where_another_generator_writes_a_file() {
        let dispatcher = Dispatcher::new()
            .with(emitting("kotlin", &[("acme/billing/Order.kt", "class Order")]))
            .with(emitting("java", &[("acme/billing", "not a directory")]));

        let err = dispatcher
            .dispatch(&request(), &StagedFilesystemView::new())
            .unwrap_err();
        match err {
            CodegenError::OutputConflict { path, first, .. } => {
                assert_eq!(path, "acme/billing");
                assert_eq!(first, "kotlin");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_siblings_sharing_a_prefix_do_not_conflict() {
        let mut batch = GeneratedBatch::new();
        batch
            .add(
                "java",
                CodeGeneratorResponse::with_files(vec![
                    ResponseFile::new("acme/Order.java", "a"),
                    ResponseFile::new("acme/OrderOrBuilder.java", "b"),
                    ResponseFile::new("acme-extra/Order.java", "c"),
                ]),
            )
            .unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_generator_error_fails_dispatch() {
        let dispatcher = Dispatcher::new().with(Box::new(InProcessGenerator::new("java", |_| {
            Ok(CodeGeneratorResponse::failure("order.proto: unsupported option"))
        })));
        let err = dispatcher
            .dispatch(&request(), &StagedFilesystemView::new())
            .unwrap_err();
        assert!(matches!(err, CodegenError::Generator { generator, .. } if generator == "java"));
    }

    #[test]
    fn test_continuation_appends_to_previous_file() {
        let mut batch = GeneratedBatch::new();
        let response = CodeGeneratorResponse::with_files(vec![
            ResponseFile::new("A.java", "part one, "),
            ResponseFile {
                name: None,
                insertion_point: None,
                content: Some("part two".to_string()),
            },
        ]);
        batch.add("java", response).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get("A.java").unwrap().content, b"part one, part two");
    }

    #[test]
    fn test_insertion_points_rejected() {
        let mut batch = GeneratedBatch::new();
        let response = CodeGeneratorResponse::with_files(vec![ResponseFile {
            name: Some("A.java".to_string()),
            insertion_point: Some("class_scope:A".to_string()),
            content: Some("int x;".to_string()),
        }]);
        assert!(batch.add("java", response).is_err());
    }

    #[test]
    fn test_traversal_rejected() {
        let mut batch = GeneratedBatch::new();
        let response = CodeGeneratorResponse::with_files(vec![ResponseFile::new("../evil.sh", "rm")]);
        let err = batch.add("java", response).unwrap_err();
        assert!(matches!(err, CodegenError::InvalidOutputPath { .. }));
    }

    #[test]
    fn test_write_creates_parents() {
        let out = tempfile::tempdir().unwrap();
        let mut batch = GeneratedBatch::new();
        batch
            .add(
                "java",
                CodeGeneratorResponse::with_files(vec![ResponseFile::new("acme/billing/Order.java", "x")]),
            )
            .unwrap();

        let written = batch.write_to(out.path()).unwrap();
        assert_eq!(written, vec![out.path().join("acme/billing/Order.java")]);
        assert_eq!(std::fs::read_to_string(&written[0]).unwrap(), "x");
    }

    #[test]
    fn test_failed_write_leaves_nothing_behind() {
        let out = tempfile::tempdir().unwrap();
        // Left over from an earlier run, in the way of acme/Order.kt
        std::fs::write(out.path().join("acme"), "stale").unwrap();

        let mut batch = GeneratedBatch::new();
        batch
            .add(
                "kotlin",
                CodeGeneratorResponse::with_files(vec![
                    ResponseFile::new("Money.kt", "class Money"),
                    ResponseFile::new("acme/Order.kt", "class Order"),
                ]),
            )
            .unwrap();

        let err = batch.write_to(out.path()).unwrap_err();
        assert!(matches!(err, CodegenError::Write { .. }));
        assert!(!out.path().join("Money.kt").exists());
        assert_eq!(std::fs::read_to_string(out.path().join("acme")).unwrap(), "stale");
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 1);
    }
}
