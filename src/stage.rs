//! Sandbox Filesystem Staging
//!
//! Builds the isolated file view a guest sees. The view is assembled in memory
//! from the include and import directories and written to a private temporary
//! directory only for the lifetime of one guest invocation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::checksum::Checksum;
use crate::collect::{IncludeDirectories, SchemaFile};
use crate::diagnostics::Diagnostics;
use crate::error::{CodegenError, Result};

/// Owner bits kept on materialized directories so the temp tree stays removable
const OWNER_RWX: u32 = 0o700;

/// One staged file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub bytes: Vec<u8>,
    /// Unix permission bits, when the host reports them
    pub mode: Option<u32>,
}

/// Canonical relative path → file content, plus directory entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedFilesystemView {
    files: BTreeMap<String, StagedFile>,
    directories: BTreeMap<String, Option<u32>>,
}

impl StagedFilesystemView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file. Parent directories are recorded implicitly.
    pub fn insert_file(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.insert(name.into(), StagedFile {
            bytes: bytes.into(),
            mode: None,
        });
    }

    fn insert(&mut self, name: String, file: StagedFile) {
        let mut parent = Path::new(&name).parent();
        while let Some(dir) = parent.filter(|p| !p.as_os_str().is_empty()) {
            self.directories
                .entry(canonical_name(dir))
                .or_insert(None);
            parent = dir.parent();
        }
        self.files.insert(name, file);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&StagedFile> {
        self.files.get(name)
    }

    /// Staged file names in sorted order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Stable digest over names and contents
    pub fn digest(&self) -> Checksum {
        Checksum::from_parts(
            self.files
                .iter()
                .map(|(name, file)| (name.as_str(), file.bytes.as_slice())),
        )
    }

    /// Write the view into a fresh private directory.
    ///
    /// The directory is removed when the returned value is dropped.
    pub fn materialize(&self) -> Result<MaterializedView> {
        let dir = tempfile::Builder::new()
            .prefix("protoc-sandbox-")
            .tempdir()
            .map_err(|source| CodegenError::Staging {
                path: std::env::temp_dir(),
                source,
            })?;
        let root = dir.path();

        for name in self.directories.keys() {
            let path = root.join(name);
            fs::create_dir_all(&path).map_err(|source| CodegenError::Staging { path, source })?;
        }

        for (name, file) in &self.files {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| CodegenError::Staging {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&path, &file.bytes).map_err(|source| CodegenError::Staging {
                path: path.clone(),
                source,
            })?;
            if let Some(mode) = file.mode {
                set_mode(&path, mode)?;
            }
        }

        // Deepest first so a restrictive parent never blocks a child
        for (name, mode) in self.directories.iter().rev() {
            if let Some(mode) = mode {
                set_mode(&root.join(name), mode | OWNER_RWX)?;
            }
        }

        debug!(path = %root.display(), files = self.files.len(), "materialized staged view");
        Ok(MaterializedView { dir })
    }
}

/// A staged view written to disk
#[derive(Debug)]
pub struct MaterializedView {
    dir: TempDir,
}

impl MaterializedView {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
        CodegenError::Staging {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

/// Forward-slash relative name for a path
pub fn canonical_name(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// Staging
// =============================================================================

/// Staging result
#[derive(Debug, Clone, Default)]
pub struct Staged {
    pub view: StagedFilesystemView,
    /// Root names as the compiler sees them, duplicate-free, in collection order
    pub root_names: Vec<String>,
    pub diagnostics: Diagnostics,
}

/// Build the view from include directories, then import directories, then roots
pub fn stage(
    include_dirs: &IncludeDirectories,
    import_dirs: &IncludeDirectories,
    roots: &[SchemaFile],
) -> Result<Staged> {
    let mut staged = Staged::default();
    let mut origins: BTreeMap<String, PathBuf> = BTreeMap::new();

    for dir in include_dirs.iter().chain(import_dirs.iter()) {
        overlay(dir, &mut staged, &mut origins)?;
    }

    for root in roots {
        let name = match include_dirs.containing(&root.source) {
            Some(dir) => canonical_name(root.source.strip_prefix(dir).unwrap_or(&root.source)),
            None => {
                let name = root
                    .source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let bytes = fs::read(&root.source).map_err(|source| CodegenError::Staging {
                    path: root.source.clone(),
                    source,
                })?;
                match staged.view.get(&name) {
                    Some(existing) if existing.bytes != bytes => {
                        staged
                            .diagnostics
                            .shadowed(&name, &root.source.display().to_string());
                    }
                    Some(_) => {}
                    None => staged.view.insert_file(name.clone(), bytes),
                }
                staged
                    .diagnostics
                    .root_not_under_include(&root.source.display().to_string(), &name);
                name
            }
        };
        if !staged.root_names.contains(&name) {
            staged.root_names.push(name);
        }
    }

    debug!(
        files = staged.view.len(),
        roots = staged.root_names.len(),
        digest = %staged.view.digest(),
        "staged filesystem view"
    );
    Ok(staged)
}

fn overlay(dir: &Path, staged: &mut Staged, origins: &mut BTreeMap<String, PathBuf>) -> Result<()> {
    let staging_error = |path: &Path, source: std::io::Error| CodegenError::Staging {
        path: path.to_path_buf(),
        source,
    };

    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| staging_error(dir, e.into()))?;
        let path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            staged.diagnostics.symlink_skipped(&path.display().to_string());
            continue;
        }

        let relative = path.strip_prefix(dir).unwrap_or(path);
        let name = canonical_name(relative);
        if name.is_empty() {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| staging_error(path, e.into()))?;

        if file_type.is_dir() {
            staged.view.directories.entry(name).or_insert(mode_of(&metadata));
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let bytes = fs::read(path).map_err(|e| staging_error(path, e))?;
        if let Some(existing) = staged.view.get(&name) {
            if existing.bytes != bytes {
                let first = origins.get(&name).map(|p| p.display().to_string()).unwrap_or_default();
                staged.diagnostics.shadowed(&name, &path.display().to_string());
                debug!(name = %name, kept = %first, "kept earlier copy");
            }
            continue;
        }

        origins.insert(name.clone(), path.to_path_buf());
        staged.view.insert(name, StagedFile {
            bytes,
            mode: mode_of(&metadata),
        });
    }
    Ok(())
}
