//! Resolved dependency packages and their content trees

use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use ignore::overrides::{Override, OverrideBuilder};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::diagnostics::Diagnostics;
use crate::error::{CodegenError, Result};

use super::SCHEMA_EXTENSION;

/// Package coordinate as reported by the host build tool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub group_id: String,
    pub artifact_id: String,
    pub version: Option<String>,
    pub classifier: Option<String>,
}

impl Coordinate {
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: None,
            classifier: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// Parse `group:artifact[:version[:classifier]]`
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(':');
        let group = parts.next().filter(|s| !s.is_empty())?;
        let artifact = parts.next().filter(|s| !s.is_empty())?;
        let mut coordinate = Self::new(group, artifact);
        if let Some(version) = parts.next().filter(|s| !s.is_empty()) {
            coordinate = coordinate.with_version(version);
        }
        if let Some(classifier) = parts.next().filter(|s| !s.is_empty()) {
            coordinate = coordinate.with_classifier(classifier);
        }
        if parts.next().is_some() {
            return None;
        }
        Some(coordinate)
    }

    /// `group:artifact`, the key used by scan policies and filters
    pub fn package_id(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }

    /// `group:artifact[:version][-classifier]`, hashed into extraction directory names
    pub fn unique_name(&self) -> String {
        let mut name = self.package_id();
        if let Some(version) = &self.version {
            name.push(':');
            name.push_str(version);
        }
        if let Some(classifier) = &self.classifier {
            name.push('-');
            name.push_str(classifier);
        }
        name
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unique_name())
    }
}

/// Where a package's files live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageContent {
    /// An exploded directory, e.g. another module's build output
    Directory(PathBuf),
    /// A zip/jar archive
    Archive(PathBuf),
}

/// A dependency already resolved by the host build tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub coordinate: Coordinate,
    pub content: PackageContent,
}

impl ResolvedPackage {
    pub fn new(coordinate: Coordinate, content: PackageContent) -> Self {
        Self { coordinate, content }
    }

    /// Walk the content tree, yielding schema files accepted by `filter`.
    ///
    /// Entries come back sorted by their path inside the package.
    pub fn walk(&self, filter: &PathFilter, diagnostics: &mut Diagnostics) -> Result<Vec<ContentEntry>> {
        match &self.content {
            PackageContent::Directory(root) => walk_directory(root, filter),
            PackageContent::Archive(archive) => {
                walk_archive(archive, filter, &self.coordinate, diagnostics)
            }
        }
    }
}

/// One schema file inside a package content tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEntry {
    /// A real file on disk; `path` is absolute and lies under `root`
    DirectoryBacked { root: PathBuf, path: PathBuf },
    /// A file stored in an archive, addressed by its path inside the archive
    ArchiveBacked { archive: PathBuf, relative_path: PathBuf },
}

impl ContentEntry {
    /// Path of the entry relative to its content-tree root
    pub fn relative_path(&self) -> &Path {
        match self {
            Self::DirectoryBacked { root, path } => path.strip_prefix(root).unwrap_or(path),
            Self::ArchiveBacked { relative_path, .. } => relative_path,
        }
    }

    /// Read an archive-backed entry's bytes
    pub(crate) fn read_archived(archive: &Path, relative_path: &Path) -> std::io::Result<Vec<u8>> {
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(file).map_err(zip_to_io)?;
        let name = relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let mut entry = zip.by_name(&name).map_err(zip_to_io)?;
        let mut bytes = Vec::with_capacity(capacity_hint(entry.size()));
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Largest buffer reserved up front for an archive entry
const MAX_PREALLOCATION: u64 = 1024 * 1024;

/// Sizes in archive headers are untrusted; only a bounded part is reserved
fn capacity_hint(declared: u64) -> usize {
    declared.min(MAX_PREALLOCATION) as usize
}

fn zip_to_io(err: zip::result::ZipError) -> std::io::Error {
    match err {
        zip::result::ZipError::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
    }
}

/// Include/exclude glob filter over paths inside a content tree.
///
/// Globs use gitignore syntax. A path passes when it matches an include glob
/// (or no include globs are configured) and matches no exclude glob.
#[derive(Debug, Clone)]
pub struct PathFilter {
    includes: Option<Override>,
    excludes: Option<Override>,
}

impl PathFilter {
    /// A filter that accepts everything
    pub fn allow_all() -> Self {
        Self {
            includes: None,
            excludes: None,
        }
    }

    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        Ok(Self {
            includes: build_override(includes)?,
            excludes: build_override(excludes)?,
        })
    }

    pub fn matches(&self, relative: &Path) -> bool {
        let included = match &self.includes {
            Some(globs) => globs.matched(relative, false).is_whitelist(),
            None => true,
        };
        let excluded = match &self.excludes {
            Some(globs) => globs.matched(relative, false).is_whitelist(),
            None => false,
        };
        included && !excluded
    }
}

fn build_override(globs: &[String]) -> Result<Option<Override>> {
    if globs.is_empty() {
        return Ok(None);
    }
    let mut builder = OverrideBuilder::new("");
    for glob in globs {
        builder
            .add(glob)
            .map_err(|e| CodegenError::InvalidConfig(format!("invalid glob '{}': {}", glob, e)))?;
    }
    let globs = builder
        .build()
        .map_err(|e| CodegenError::InvalidConfig(e.to_string()))?;
    Ok(Some(globs))
}

pub(crate) fn is_schema_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == SCHEMA_EXTENSION).unwrap_or(false)
}

fn walk_directory(root: &Path, filter: &PathFilter) -> Result<Vec<ContentEntry>> {
    let root = fs::canonicalize(root).map_err(|source| CodegenError::SourceDir {
        path: root.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| CodegenError::SourceDir {
            path: root.clone(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() || !is_schema_file(entry.path()) {
            continue;
        }
        let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        if !filter.matches(relative) {
            continue;
        }
        entries.push(ContentEntry::DirectoryBacked {
            root: root.clone(),
            path: entry.path().to_path_buf(),
        });
    }
    Ok(entries)
}

fn walk_archive(
    archive: &Path,
    filter: &PathFilter,
    coordinate: &Coordinate,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<ContentEntry>> {
    let archive_error = |source| CodegenError::Archive {
        archive: archive.to_path_buf(),
        source,
    };
    let file = File::open(archive).map_err(|e| archive_error(e.into()))?;
    let mut zip = ZipArchive::new(file).map_err(archive_error)?;

    let mut entries = Vec::new();
    for index in 0..zip.len() {
        let entry = zip.by_index(index).map_err(archive_error)?;
        if !entry.is_file() || !entry.name().ends_with(&format!(".{}", SCHEMA_EXTENSION)) {
            continue;
        }
        let Some(relative_path) = entry.enclosed_name() else {
            diagnostics.unsafe_archive_entry(entry.name(), &coordinate.unique_name());
            continue;
        };
        if !filter.matches(&relative_path) {
            continue;
        }
        entries.push(ContentEntry::ArchiveBacked {
            archive: archive.to_path_buf(),
            relative_path,
        });
    }
    entries.sort_by(|a, b| a.relative_path().cmp(b.relative_path()));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_names() {
        let coordinate = Coordinate::new("io.acme", "billing-api")
            .with_version("1.4.0")
            .with_classifier("protos");
        assert_eq!(coordinate.package_id(), "io.acme:billing-api");
        assert_eq!(coordinate.unique_name(), "io.acme:billing-api:1.4.0-protos");
    }

    #[test]
    fn test_coordinate_parse() {
        let coordinate = Coordinate::parse("io.acme:billing-api:1.4.0").unwrap();
        assert_eq!(coordinate.version.as_deref(), Some("1.4.0"));
        assert!(coordinate.classifier.is_none());

        assert!(Coordinate::parse("io.acme").is_none());
        assert!(Coordinate::parse(":api").is_none());
        assert!(Coordinate::parse("a:b:c:d:e").is_none());
    }

    #[test]
    fn test_filter_include_and_exclude() {
        let filter = PathFilter::new(
            &["acme/**".to_string()],
            &["**/internal/**".to_string()],
        )
        .unwrap();

        assert!(filter.matches(Path::new("acme/billing/invoice.proto")));
        assert!(!filter.matches(Path::new("acme/internal/secret.proto")));
        assert!(!filter.matches(Path::new("other/thing.proto")));
    }

    #[test]
    fn test_filter_without_includes_accepts_everything_not_excluded() {
        let filter = PathFilter::new(&[], &["legacy/**".to_string()]).unwrap();
        assert!(filter.matches(Path::new("acme/a.proto")));
        assert!(!filter.matches(Path::new("legacy/old.proto")));
        assert!(PathFilter::allow_all().matches(Path::new("legacy/old.proto")));
    }

    #[test]
    fn test_declared_entry_size_is_capped() {
        assert_eq!(capacity_hint(512), 512);
        assert_eq!(capacity_hint(u64::MAX), MAX_PREALLOCATION as usize);
    }

    #[test]
    fn test_schema_extension() {
        assert!(is_schema_file(Path::new("a/b.proto")));
        assert!(!is_schema_file(Path::new("a/b.proto.bak")));
        assert!(!is_schema_file(Path::new("README.md")));
    }

    #[test]
    fn test_directory_walk_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b/z.proto"), "syntax = \"proto3\";").unwrap();
        fs::write(dir.path().join("a.proto"), "syntax = \"proto3\";").unwrap();
        fs::write(dir.path().join("notes.txt"), "not a schema").unwrap();

        let package = ResolvedPackage::new(
            Coordinate::new("io.acme", "api"),
            PackageContent::Directory(dir.path().to_path_buf()),
        );
        let mut diagnostics = Diagnostics::new();
        let entries = package.walk(&PathFilter::allow_all(), &mut diagnostics).unwrap();

        let names: Vec<_> = entries.iter().map(|e| e.relative_path().to_path_buf()).collect();
        assert_eq!(names, vec![PathBuf::from("a.proto"), PathBuf::from("b/z.proto")]);
    }
}
