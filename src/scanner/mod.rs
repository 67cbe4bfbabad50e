//! Input scanner for batch runs.
//!
//! Expands the paths given on the command line into the documents to
//! process, respecting the configured extensions, excludes and size limit.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::agent::upload_hint;
use crate::models::DocumentInput;

/// Configuration for input scanning.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// File extensions to include, lowercase without the dot.
    pub extensions: Vec<String>,
    /// Path components to skip (e.g. ["logs", "target"]).
    pub excludes: Vec<String>,
    /// Maximum file size in bytes.
    pub max_file_size: u64,
    /// Maximum number of files to return.
    pub max_files: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::from(&crate::config::ScannerConfig::default())
    }
}

impl From<&crate::config::ScannerConfig> for ScanConfig {
    fn from(config: &crate::config::ScannerConfig) -> Self {
        Self {
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            excludes: config.excludes.clone(),
            max_file_size: config.max_file_size,
            max_files: Some(config.max_files),
        }
    }
}

/// A file selected for processing.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    /// Lowercased extension without the dot.
    pub extension: String,
}

impl ScannedFile {
    /// Read the file into a document input carrying its upload hint.
    pub fn load(&self) -> Result<DocumentInput> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let input = DocumentInput::from_bytes(filename, None, bytes);
        let hint = upload_hint(&input);
        Ok(input.with_source(hint))
    }
}

/// Scanner over files and directories.
pub struct DocumentScanner {
    config: ScanConfig,
}

impl DocumentScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Expand `roots` into matching files, sorted by path within each root.
    ///
    /// Files named explicitly skip the extension filter but not the size
    /// limit. Directories are walked recursively.
    pub fn scan(&self, roots: &[PathBuf]) -> Result<Vec<ScannedFile>> {
        let mut files = Vec::new();

        for root in roots {
            if !root.exists() {
                anyhow::bail!("Input path does not exist: {}", root.display());
            }

            if root.is_file() {
                if let Some(file) = self.explicit_file(root)? {
                    files.push(file);
                }
            } else {
                self.walk(root, &mut files);
            }

            if self.limit_reached(files.len()) {
                break;
            }
        }

        if let Some(max) = self.config.max_files {
            files.truncate(max);
        }
        Ok(files)
    }

    fn explicit_file(&self, path: &Path) -> Result<Option<ScannedFile>> {
        let size = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        if size > self.config.max_file_size {
            warn!(
                "Skipping {}: {} bytes exceeds limit of {}",
                path.display(),
                size,
                self.config.max_file_size
            );
            return Ok(None);
        }
        Ok(Some(ScannedFile {
            path: path.to_path_buf(),
            size,
            extension: extension_of(path),
        }))
    }

    fn walk(&self, root: &Path, files: &mut Vec<ScannedFile>) {
        let root_path = root.to_path_buf();
        let mut entries: Vec<DirEntry> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.path() == root_path || !self.is_excluded(e))
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!("Cannot read entry: {}", err);
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));

        for entry in entries {
            if self.limit_reached(files.len()) {
                break;
            }
            if let Some(file) = self.matches(&entry) {
                files.push(file);
            }
        }
    }

    /// Check a walked file against the extension and size rules.
    fn matches(&self, entry: &DirEntry) -> Option<ScannedFile> {
        let extension = extension_of(entry.path());
        if !self.config.extensions.contains(&extension) {
            return None;
        }

        let size = entry.metadata().ok()?.len();
        if size > self.config.max_file_size {
            debug!("Skipping {}: too large", entry.path().display());
            return None;
        }

        Some(ScannedFile {
            path: entry.path().to_path_buf(),
            size,
            extension,
        })
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        // Hidden files
        if name.starts_with('.') {
            return true;
        }
        self.config.excludes.iter().any(|pattern| name == pattern.as_str())
    }

    fn limit_reached(&self, count: usize) -> bool {
        self.config.max_files.is_some_and(|max| count >= max)
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentFormat;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("inbox/nested")).unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("inbox/a.eml"), "Subject: hello\n\nbody").unwrap();
        fs::write(root.join("inbox/b.JSON"), "{}").unwrap();
        fs::write(root.join("inbox/nested/c.pdf"), "%PDF-1.4").unwrap();
        fs::write(root.join("inbox/notes.md"), "# notes").unwrap();
        fs::write(root.join("logs/app.json"), "{}").unwrap();
        fs::write(root.join(".cache/d.json"), "{}").unwrap();
        dir
    }

    fn names(files: &[ScannedFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_scan_directory_filters() {
        let dir = fixture();
        let scanner = DocumentScanner::new(ScanConfig::default());
        let files = scanner.scan(&[dir.path().to_path_buf()]).unwrap();

        assert_eq!(names(&files), vec!["a.eml", "b.JSON", "c.pdf"]);
        assert_eq!(files[1].extension, "json");
    }

    #[test]
    fn test_scan_max_files() {
        let dir = fixture();
        let config = ScanConfig {
            max_files: Some(2),
            ..ScanConfig::default()
        };
        let files = DocumentScanner::new(config)
            .scan(&[dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_explicit_file_skips_extension_filter() {
        let dir = fixture();
        let notes = dir.path().join("inbox/notes.md");
        let files = DocumentScanner::new(ScanConfig::default())
            .scan(&[notes])
            .unwrap();
        assert_eq!(names(&files), vec!["notes.md"]);
    }

    #[test]
    fn test_size_limit() {
        let dir = fixture();
        let config = ScanConfig {
            max_file_size: 3,
            ..ScanConfig::default()
        };
        let files = DocumentScanner::new(config)
            .scan(&[dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(names(&files), vec!["b.JSON"]);
    }

    #[test]
    fn test_missing_input_is_error() {
        let dir = TempDir::new().unwrap();
        let result = DocumentScanner::new(ScanConfig::default()).scan(&[dir.path().join("nope")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_applies_upload_hint() {
        let dir = fixture();
        let file = ScannedFile {
            path: dir.path().join("inbox/a.eml"),
            size: 0,
            extension: "eml".into(),
        };
        let input = file.load().unwrap();
        assert_eq!(input.source, Some(DocumentFormat::Email));
        assert_eq!(input.filename.as_deref(), Some("a.eml"));

        let pdf = ScannedFile {
            path: dir.path().join("inbox/nested/c.pdf"),
            size: 0,
            extension: "pdf".into(),
        };
        assert_eq!(pdf.load().unwrap().source, Some(DocumentFormat::Pdf));
    }
}
