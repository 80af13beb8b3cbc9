//! In-memory image tree.
//!
//! Holds every entry of an image in an ordered map. Useful wherever a real
//! ISO is not available; `write_image` materializes the tree as a plain
//! directory for inspection.

use super::{
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, ImageFs, check_length, dir_mode, file_mode, normalize,
};
use crate::error::{Error, Result};
use crate::manifest::for_each_chunk;
use crate::progress::{Progress, Update};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File { data: Vec<u8>, mode: u32 },
    Directory { mode: u32 },
}

impl Entry {
    #[must_use]
    pub const fn mode(&self) -> u32 {
        match self {
            Self::File { mode, .. } | Self::Directory { mode } => *mode,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryImage {
    entries: BTreeMap<PathBuf, Entry>,
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImage {
    /// An image containing only its root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            PathBuf::from("/"),
            Entry::Directory {
                mode: DEFAULT_DIR_MODE,
            },
        );
        Self { entries }
    }

    /// Inserts a file, creating missing parent directories and overwriting
    /// whatever was at `path`. Meant for seeding an image, not for builds.
    pub fn insert_file(&mut self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) -> &mut Self {
        let path = normalize(path.as_ref());
        for ancestor in path.ancestors().skip(1) {
            self.entries
                .entry(ancestor.to_path_buf())
                .or_insert(Entry::Directory {
                    mode: DEFAULT_DIR_MODE,
                });
        }
        self.entries.insert(
            path,
            Entry::File {
                data: data.into(),
                mode: DEFAULT_FILE_MODE,
            },
        );
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) -> Self {
        self.insert_file(path, data);
        self
    }

    #[must_use]
    pub fn entry(&self, path: &Path) -> Option<&Entry> {
        self.entries.get(&normalize(path))
    }

    /// Contents of the file at `path`, if there is one.
    #[must_use]
    pub fn file(&self, path: &Path) -> Option<&[u8]> {
        match self.entry(path)? {
            Entry::File { data, .. } => Some(data),
            Entry::Directory { .. } => None,
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    fn require_parent_dir(&self, path: &Path) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        match self.entries.get(parent) {
            Some(Entry::Directory { .. }) => Ok(()),
            _ => Err(Error::NotFound(parent.to_path_buf())),
        }
    }

    fn read_source(path: &Path, source: &mut dyn Read, length: u64) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let copied = for_each_chunk(source, |chunk| {
            data.extend_from_slice(chunk);
            Ok(())
        })?;
        check_length(path, length, copied)?;
        Ok(data)
    }
}

impl ImageFs for MemoryImage {
    fn read_file(&mut self, path: &Path) -> Result<Box<dyn Read + '_>> {
        let path = normalize(path);
        match self.entries.get(&path) {
            Some(Entry::File { data, .. }) => Ok(Box::new(Cursor::new(data.as_slice()))),
            _ => Err(Error::NotFound(path)),
        }
    }

    fn write_new_file(
        &mut self,
        path: &Path,
        source: &mut dyn Read,
        length: u64,
        mode: Option<u32>,
    ) -> Result<()> {
        let path = normalize(path);
        if self.entries.contains_key(&path) {
            return Err(Error::AlreadyExists(path));
        }
        self.require_parent_dir(&path)?;
        let data = Self::read_source(&path, source, length)?;
        let mode = mode.map_or(DEFAULT_FILE_MODE, file_mode);
        tracing::trace!(path = %path.display(), size = data.len(), mode = format!("{mode:o}"), "Added file");
        self.entries.insert(path, Entry::File { data, mode });
        Ok(())
    }

    fn replace_file(
        &mut self,
        path: &Path,
        source: &mut dyn Read,
        length: u64,
        mode: Option<u32>,
    ) -> Result<()> {
        let path = normalize(path);
        let old_mode = match self.entries.get(&path) {
            Some(Entry::File { mode, .. }) => *mode,
            _ => return Err(Error::NotFound(path)),
        };
        let data = Self::read_source(&path, source, length)?;
        let mode = mode.map_or(old_mode, file_mode);
        tracing::trace!(path = %path.display(), size = data.len(), "Replaced file");
        self.entries.insert(path, Entry::File { data, mode });
        Ok(())
    }

    fn remove_file(&mut self, path: &Path) -> Result<()> {
        let path = normalize(path);
        match self.entries.get(&path) {
            Some(Entry::File { .. }) => {
                self.entries.remove(&path);
                Ok(())
            }
            _ => Err(Error::NotFound(path)),
        }
    }

    fn create_directory(&mut self, path: &Path, mode: Option<u32>) -> Result<()> {
        let path = normalize(path);
        if self.entries.contains_key(&path) {
            return Err(Error::AlreadyExists(path));
        }
        self.require_parent_dir(&path)?;
        let mode = mode.map_or(DEFAULT_DIR_MODE, dir_mode);
        self.entries.insert(path, Entry::Directory { mode });
        Ok(())
    }

    fn mode(&self, path: &Path) -> Result<u32> {
        let path = normalize(path);
        self.entries
            .get(&path)
            .map(Entry::mode)
            .ok_or(Error::NotFound(path))
    }

    fn write_image(&mut self, destination: &Path, progress: Option<&dyn Progress>) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let total: u64 = self
            .entries
            .values()
            .map(|entry| match entry {
                Entry::File { data, .. } => data.len() as u64,
                Entry::Directory { .. } => 0,
            })
            .sum();
        let task = progress.map(|p| p.add_task("Write image", true, Some(total)));

        tracing::info!("Start writing image tree to '{}'", destination.display());
        let mut written = 0u64;
        for (path, entry) in &self.entries {
            let target = destination.join(path.strip_prefix("/").unwrap_or(path));
            match entry {
                Entry::Directory { .. } => {
                    fs::create_dir_all(&target).map_err(Error::at(&target))?;
                }
                Entry::File { data, mode } => {
                    fs::write(&target, data).map_err(Error::at(&target))?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                        .map_err(Error::at(&target))?;
                    written += data.len() as u64;
                    if let (Some(progress), Some(task)) = (progress, task) {
                        progress.update(task, Update::completed(written, total));
                    }
                }
            }
        }
        if let (Some(progress), Some(task)) = (progress, task) {
            progress.stop_task(task);
        }
        tracing::info!("Finished writing image tree");
        Ok(())
    }
}
