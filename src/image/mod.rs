//! Access to the filesystem inside an installer image.
//!
//! [`ImageFs`] is the narrow set of operations the build needs: read a file,
//! add or replace files and directories, and finally serialize the edited
//! image. Paths are absolute paths inside the image (`/boot/grub/grub.cfg`).
//!
//! Implementations must stage written content outside the image until
//! [`ImageFs::write_image`] is called, so an aborted build never leaves a
//! half-edited image behind.
pub mod memory;
pub mod xorriso;

pub use memory::MemoryImage;
pub use xorriso::XorrisoImage;

use crate::error::Result;
use crate::progress::Progress;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

/// Rock Ridge mode of a regular, read-only file.
pub const DEFAULT_FILE_MODE: u32 = 0o100_444;
/// Rock Ridge mode given to staged files whose source is executable.
pub const EXECUTABLE_FILE_MODE: u32 = 0o100_555;
/// Rock Ridge mode of a directory.
pub const DEFAULT_DIR_MODE: u32 = 0o040_555;

/// File type bits of a mode.
pub const MODE_TYPE_MASK: u32 = 0o170_000;
pub const MODE_FILE: u32 = 0o100_000;
pub const MODE_DIR: u32 = 0o040_000;

pub trait ImageFs {
    /// Opens an existing file for reading.
    ///
    /// Fails with [`crate::Error::NotFound`] if there is no file at `path`.
    fn read_file(&mut self, path: &Path) -> Result<Box<dyn Read + '_>>;

    /// Adds a new file with `length` bytes read from `source`.
    ///
    /// Fails with [`crate::Error::AlreadyExists`] if `path` is occupied. A
    /// `mode` of `None` gives the implementation's default file mode.
    fn write_new_file(
        &mut self,
        path: &Path,
        source: &mut dyn Read,
        length: u64,
        mode: Option<u32>,
    ) -> Result<()>;

    /// Replaces an existing file. A `mode` of `None` keeps the old file's mode.
    fn replace_file(
        &mut self,
        path: &Path,
        source: &mut dyn Read,
        length: u64,
        mode: Option<u32>,
    ) -> Result<()>;

    fn remove_file(&mut self, path: &Path) -> Result<()>;

    fn create_directory(&mut self, path: &Path, mode: Option<u32>) -> Result<()>;

    /// Mode of the entry at `path`, including its file type bits.
    fn mode(&self, path: &Path) -> Result<u32>;

    /// Serializes the image with every staged edit applied to `destination`.
    fn write_image(&mut self, destination: &Path, progress: Option<&dyn Progress>) -> Result<()>;
}

/// Reads a whole file as UTF-8 text.
pub fn read_text<I: ImageFs + ?Sized>(image: &mut I, path: &Path) -> Result<String> {
    let mut text = String::new();
    image.read_file(path)?.read_to_string(&mut text)?;
    Ok(text)
}

pub fn write_text<I: ImageFs + ?Sized>(
    image: &mut I,
    path: &Path,
    text: &str,
    mode: Option<u32>,
) -> Result<()> {
    let bytes = text.as_bytes();
    image.write_new_file(path, &mut Cursor::new(bytes), bytes.len() as u64, mode)
}

pub fn replace_text<I: ImageFs + ?Sized>(image: &mut I, path: &Path, text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    image.replace_file(path, &mut Cursor::new(bytes), bytes.len() as u64, None)
}

/// Lexically normalizes an image path to an absolute path without `.`/`..`.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    normalized
}

/// Fails unless a byte source delivered exactly the declared length.
pub(crate) fn check_length(path: &Path, declared: u64, copied: u64) -> Result<()> {
    if declared == copied {
        return Ok(());
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!(
            "{}: expected {declared} bytes from source, got {copied}",
            path.display()
        ),
    )
    .into())
}

/// Adds the regular-file type bits to a bare permission mode.
#[must_use]
pub const fn file_mode(mode: u32) -> u32 {
    if mode & MODE_TYPE_MASK == 0 { mode | MODE_FILE } else { mode }
}

/// Adds the directory type bits to a bare permission mode.
#[must_use]
pub const fn dir_mode(mode: u32) -> u32 {
    if mode & MODE_TYPE_MASK == 0 { mode | MODE_DIR } else { mode }
}

#[must_use]
pub const fn is_dir_mode(mode: u32) -> bool {
    mode & MODE_TYPE_MASK == MODE_DIR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("boot/grub")), Path::new("/boot/grub"));
        assert_eq!(
            normalize(Path::new("/nocloud/./x/../user-data")),
            Path::new("/nocloud/user-data")
        );
        assert_eq!(normalize(Path::new("/../..")), Path::new("/"));
    }

    #[test]
    fn test_mode_types() {
        assert!(is_dir_mode(DEFAULT_DIR_MODE));
        assert!(!is_dir_mode(DEFAULT_FILE_MODE));
        assert_eq!(EXECUTABLE_FILE_MODE & MODE_TYPE_MASK, MODE_FILE);
        assert_eq!(file_mode(0o755), 0o100_755);
        assert_eq!(file_mode(EXECUTABLE_FILE_MODE), EXECUTABLE_FILE_MODE);
        assert_eq!(dir_mode(0o700), 0o040_700);
    }
}
