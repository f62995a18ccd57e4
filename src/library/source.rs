//! Image sources for library ingestion.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

/// Where library images come from. Identifiers double as the stored
/// `image_path`, so existence checks during ingestion line up with
/// records written by earlier runs.
pub trait ImageSource: Send + Sync {
    /// Identifiers of every image under `library`, sorted. Each starts
    /// with the library name followed by a slash.
    fn list(&self, library: &str) -> Result<Vec<String>>;

    /// Raw bytes for one identifier returned by [`list`](ImageSource::list).
    fn open(&self, identifier: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed source rooted at a directory. An identifier is the
/// forward-slash path of a file relative to the root, so its first
/// component is the library name.
pub struct DirSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    fn wanted(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_lowercase();
                self.extensions.iter().any(|want| *want == ext)
            })
            .unwrap_or(false)
    }
}

impl ImageSource for DirSource {
    fn list(&self, library: &str) -> Result<Vec<String>> {
        let dir = self.root.join(library);
        if !dir.is_dir() {
            bail!("library directory {} not found", dir.display());
        }

        let mut identifiers = Vec::new();
        for entry in WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() || !self.wanted(entry.path()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .context("walked file escaped the source root")?;
            let identifier = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            identifiers.push(identifier);
        }

        identifiers.sort();
        Ok(identifiers)
    }

    fn open(&self, identifier: &str) -> Result<Vec<u8>> {
        let path = self.root.join(identifier);
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
    }
}
