//! Diagnostics
//!
//! Collects non-fatal findings during collection and staging. Anything fatal
//! is a [`CodegenError`](crate::CodegenError) instead; diagnostics only record
//! adjustments the pipeline made on its own.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Diagnostic Codes
// =============================================================================

/// Diagnostic code for categorizing findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    // === Collection ===
    /// A legacy service-generation option was stripped from a dependency file
    LegacyOptionStripped,
    /// An archive entry name would escape its extraction directory
    UnsafeArchiveEntry,

    // === Staging ===
    /// A root file lives outside every include directory
    RootNotUnderInclude,
    /// A symbolic link was skipped while staging a directory tree
    SymlinkSkipped,
    /// A later include directory provides a different file at an already staged path
    ShadowedFile,
}

impl DiagnosticCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LegacyOptionStripped => "I001",
            Self::ShadowedFile => "I002",
            Self::UnsafeArchiveEntry => "W001",
            Self::RootNotUnderInclude => "W002",
            Self::SymlinkSkipped => "W003",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::LegacyOptionStripped | Self::ShadowedFile => Severity::Info,

            Self::UnsafeArchiveEntry | Self::RootNotUnderInclude | Self::SymlinkSkipped => {
                Severity::Warning
            }
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Severity
// =============================================================================

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

// =============================================================================
// Diagnostic Item
// =============================================================================

/// A single diagnostic item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticItem {
    /// File or entry the diagnostic is about
    pub subject: String,
    /// Diagnostic code
    pub code: DiagnosticCode,
    /// Human-readable message
    pub message: String,
    /// Additional context (package coordinate, shadowing directory, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

impl DiagnosticItem {
    pub fn new(subject: impl Into<String>, code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            code,
            message: message.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context.push(ctx.into());
        self
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl fmt::Display for DiagnosticItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {} ({})",
            self.code,
            self.code.severity(),
            self.message,
            self.subject
        )?;

        for ctx in &self.context {
            write!(f, "\n  - {}", ctx)?;
        }

        Ok(())
    }
}

// =============================================================================
// Diagnostics Collection
// =============================================================================

/// Collection of diagnostics from one pipeline run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    items: Vec<DiagnosticItem>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a diagnostic item and mirror it to the log
    pub fn push(&mut self, item: DiagnosticItem) {
        match item.severity() {
            Severity::Info => tracing::info!(code = %item.code, subject = %item.subject, "{}", item.message),
            Severity::Warning => tracing::warn!(code = %item.code, subject = %item.subject, "{}", item.message),
        }
        self.items.push(item);
    }

    /// Append all items of another collection
    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    /// Record a stripped legacy option
    pub fn legacy_option_stripped(&mut self, file: &str, option: &str, package: &str) {
        self.push(
            DiagnosticItem::new(
                file,
                DiagnosticCode::LegacyOptionStripped,
                format!("Ignoring option {} in dependency file", option),
            )
            .with_context(format!("package: {}", package)),
        );
    }

    /// Record an archive entry that was not extracted
    pub fn unsafe_archive_entry(&mut self, entry: &str, package: &str) {
        self.push(
            DiagnosticItem::new(
                entry,
                DiagnosticCode::UnsafeArchiveEntry,
                "Archive entry escapes the extraction directory and was skipped",
            )
            .with_context(format!("package: {}", package)),
        );
    }

    /// Record a root that could not be relativized against any include directory
    pub fn root_not_under_include(&mut self, root: &str, staged_as: &str) {
        self.push(
            DiagnosticItem::new(
                root,
                DiagnosticCode::RootNotUnderInclude,
                format!("Root is not inside any include directory, staged as '{}'", staged_as),
            ),
        );
    }

    /// Record a skipped symbolic link
    pub fn symlink_skipped(&mut self, path: &str) {
        self.push(DiagnosticItem::new(
            path,
            DiagnosticCode::SymlinkSkipped,
            "Symbolic link skipped while staging",
        ));
    }

    /// Record a file hidden by an earlier include directory
    pub fn shadowed(&mut self, name: &str, hidden: &str) {
        self.push(
            DiagnosticItem::new(
                name,
                DiagnosticCode::ShadowedFile,
                "File shadowed by an earlier include directory",
            )
            .with_context(format!("hidden copy: {}", hidden)),
        );
    }

    /// Iterate over all items
    pub fn iter(&self) -> impl Iterator<Item = &DiagnosticItem> {
        self.items.iter()
    }

    /// Items with the given code
    pub fn with_code(&self, code: DiagnosticCode) -> Vec<&DiagnosticItem> {
        self.items.iter().filter(|i| i.code == code).collect()
    }

    /// Number of warnings
    pub fn warning_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.severity() == Severity::Warning)
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            writeln!(f, "{}", item)?;
        }
        Ok(())
    }
}
