//! Source Collection
//!
//! Finds the schema files to compile and the directories their imports are
//! resolved against. Sources come from three places:
//!
//! - the local source directory (compiled, registered as include root)
//! - dependency packages selected by the dependency scan policy (compiled,
//!   archive entries extracted and sanitized)
//! - import-only packages selected by the import scan policy (never compiled,
//!   only made available to imports)

pub mod package;
pub mod sanitize;

pub use package::{Coordinate, ContentEntry, PackageContent, PathFilter, ResolvedPackage};
pub use sanitize::{Sanitized, Sanitizer};

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::checksum::Checksum;
use crate::config::CodegenConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{CodegenError, Result};

/// File extension of schema sources
pub const SCHEMA_EXTENSION: &str = "proto";

/// Work directory subfolder for sources extracted from dependency packages
pub const DEPENDENCY_EXTRACT_DIR: &str = "protos-from-dependencies";

/// Work directory subfolder for import-only sources
pub const IMPORT_EXTRACT_DIR: &str = "proto-imports";

// =============================================================================
// Schema Files
// =============================================================================

/// Where a schema file came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// The primary source directory
    Local,
    /// A directory-backed dependency package, compiled in place
    Package(Coordinate),
    /// An archive-backed dependency package, extracted into the work directory
    Extracted(Coordinate),
}

/// A schema source selected for compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaFile {
    /// Absolute location on the host
    pub source: PathBuf,
    /// Include root the file was registered under
    pub owner_dir: PathBuf,
    pub provenance: Provenance,
}

impl SchemaFile {
    /// Path relative to the owning include root
    pub fn relative_name(&self) -> &Path {
        self.source.strip_prefix(&self.owner_dir).unwrap_or(&self.source)
    }
}

// =============================================================================
// Include Directories
// =============================================================================

/// Ordered, duplicate-free directory list. Earlier entries shadow later ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeDirectories {
    dirs: Vec<PathBuf>,
}

impl IncludeDirectories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a directory unless already present. Returns whether it was added.
    pub fn insert(&mut self, dir: impl Into<PathBuf>) -> bool {
        let dir = dir.into();
        if self.dirs.contains(&dir) {
            return false;
        }
        self.dirs.push(dir);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(PathBuf::as_path)
    }

    /// First directory containing `path`
    pub fn containing(&self, path: &Path) -> Option<&Path> {
        self.iter().find(|dir| path.starts_with(dir))
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for IncludeDirectories {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        let mut dirs = Self::new();
        for dir in iter {
            dirs.insert(dir);
        }
        dirs
    }
}

// =============================================================================
// Collector
// =============================================================================

/// Everything the stager needs
#[derive(Debug, Clone, Default)]
pub struct CollectedSources {
    pub roots: Vec<SchemaFile>,
    pub include_dirs: IncludeDirectories,
    pub import_dirs: IncludeDirectories,
    pub diagnostics: Diagnostics,
}

impl CollectedSources {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// How a package's entries are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Dependency,
    Import,
}

impl ScanKind {
    fn extract_dir(self) -> &'static str {
        match self {
            Self::Dependency => DEPENDENCY_EXTRACT_DIR,
            Self::Import => IMPORT_EXTRACT_DIR,
        }
    }
}

/// Collects schema sources for one run
pub struct SourceCollector<'a> {
    config: &'a CodegenConfig,
    sanitizer: Sanitizer,
}

impl<'a> SourceCollector<'a> {
    pub fn new(config: &'a CodegenConfig) -> Result<Self> {
        Ok(Self {
            config,
            sanitizer: Sanitizer::new(&config.scan.strip_options)?,
        })
    }

    pub fn collect(&self, packages: &[ResolvedPackage]) -> Result<CollectedSources> {
        let mut collected = CollectedSources::default();

        self.collect_local(&self.config.source_dir(), &mut collected)?;

        if self.config.test {
            debug!("test scope, dependency scanning skipped");
        } else if !self.config.scan.dependencies.is_none() {
            for package in packages {
                if self.config.scan.dependencies.matches(&package.coordinate.package_id()) {
                    self.collect_package(package, ScanKind::Dependency, &mut collected)?;
                }
            }
        }

        for package in packages {
            if self.config.scan.imports.matches(&package.coordinate.package_id()) {
                self.collect_package(package, ScanKind::Import, &mut collected)?;
            }
        }

        info!(
            roots = collected.roots.len(),
            include_dirs = collected.include_dirs.len(),
            import_dirs = collected.import_dirs.len(),
            "collected schema sources"
        );
        Ok(collected)
    }

    fn collect_local(&self, source_dir: &Path, collected: &mut CollectedSources) -> Result<()> {
        if !source_dir.exists() {
            debug!(path = %source_dir.display(), "no local source directory");
            return Ok(());
        }
        let source_dir = fs::canonicalize(source_dir).map_err(|source| CodegenError::SourceDir {
            path: source_dir.to_path_buf(),
            source,
        })?;

        let mut found = 0;
        for entry in WalkDir::new(&source_dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| CodegenError::SourceDir {
                path: source_dir.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() || !package::is_schema_file(entry.path()) {
                continue;
            }
            collected.roots.push(SchemaFile {
                source: entry.path().to_path_buf(),
                owner_dir: source_dir.clone(),
                provenance: Provenance::Local,
            });
            found += 1;
        }

        if found > 0 {
            collected.include_dirs.insert(source_dir);
        }
        Ok(())
    }

    fn collect_package(
        &self,
        package: &ResolvedPackage,
        kind: ScanKind,
        collected: &mut CollectedSources,
    ) -> Result<()> {
        let package_id = package.coordinate.package_id();
        let filter = match kind {
            ScanKind::Dependency => PathFilter::new(
                self.config.scan.includes_for(&package_id),
                self.config.scan.excludes_for(&package_id),
            )?,
            ScanKind::Import => PathFilter::allow_all(),
        };

        let entries = package.walk(&filter, &mut collected.diagnostics)?;
        debug!(package = %package.coordinate, entries = entries.len(), ?kind, "scanning package");

        let extraction_dir = self
            .config
            .work_dir()
            .join(kind.extract_dir())
            .join(Checksum::from_str(&package.coordinate.unique_name()).as_str());

        for entry in &entries {
            let file = match entry {
                ContentEntry::DirectoryBacked { root, path } => {
                    self.use_in_place(root, path, &package.coordinate)
                }
                ContentEntry::ArchiveBacked { archive, relative_path } => self.extract_archived(
                    archive,
                    relative_path,
                    &extraction_dir,
                    &package.coordinate,
                    kind,
                    &mut collected.diagnostics,
                )?,
            };

            match kind {
                ScanKind::Dependency => {
                    collected.include_dirs.insert(file.owner_dir.clone());
                    collected.roots.push(file);
                }
                ScanKind::Import => {
                    collected.import_dirs.insert(file.owner_dir);
                }
            }
        }
        Ok(())
    }

    /// Directory-backed entries compile where they are, owned by their parent directory
    fn use_in_place(&self, root: &Path, path: &Path, coordinate: &Coordinate) -> SchemaFile {
        SchemaFile {
            source: path.to_path_buf(),
            owner_dir: path.parent().unwrap_or(root).to_path_buf(),
            provenance: Provenance::Package(coordinate.clone()),
        }
    }

    /// Archive-backed entries are copied out into the package's extraction directory
    fn extract_archived(
        &self,
        archive: &Path,
        relative_path: &Path,
        extraction_dir: &Path,
        coordinate: &Coordinate,
        kind: ScanKind,
        diagnostics: &mut Diagnostics,
    ) -> Result<SchemaFile> {
        let target = extraction_dir.join(relative_path);
        let extraction_error = |source| CodegenError::Extraction {
            package: coordinate.unique_name(),
            entry: relative_path.display().to_string(),
            target: target.clone(),
            source,
        };

        let bytes = ContentEntry::read_archived(archive, relative_path).map_err(extraction_error)?;
        let bytes = match kind {
            ScanKind::Dependency if !self.sanitizer.is_empty() => {
                let text = String::from_utf8_lossy(&bytes);
                let sanitized = self.sanitizer.sanitize(&text);
                for option in &sanitized.stripped {
                    diagnostics.legacy_option_stripped(
                        &relative_path.display().to_string(),
                        option,
                        &coordinate.unique_name(),
                    );
                }
                if sanitized.changed() {
                    sanitized.content.into_bytes()
                } else {
                    bytes
                }
            }
            _ => bytes,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(extraction_error)?;
        }
        fs::write(&target, bytes).map_err(extraction_error)?;

        Ok(SchemaFile {
            source: target.clone(),
            owner_dir: extraction_dir.to_path_buf(),
            provenance: Provenance::Extracted(coordinate.clone()),
        })
    }
}
