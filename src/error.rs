//! Error types shared by every pipeline stage.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by fetching, building and writing images.
///
/// None of these are retried in-process. A failed fetch is recovered by
/// running the whole acquisition again, which discards stale downloads first.
#[derive(Debug, Error)]
pub enum Error {
    /// A checksum manifest line could not be split into digest and path.
    #[error("malformed manifest line {line}: {content:?}")]
    Format { line: usize, content: String },

    /// An expected path is missing inside the image.
    #[error("{} not found in image", .0.display())]
    NotFound(PathBuf),

    /// A new entry was requested on a path that is already occupied.
    #[error("{} already exists in image", .0.display())]
    AlreadyExists(PathBuf),

    /// Downloaded content does not match its published checksum.
    #[error("{0}")]
    Validation(String),

    /// Tree staging met something other than a regular file or directory.
    #[error("unsupported entry {}: only regular files and directories can be staged", .0.display())]
    UnsupportedEntry(PathBuf),

    /// The HTTP transfer itself failed.
    #[error("failed to download {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },

    /// An external tool exited unsuccessfully.
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Returns a closure attaching `path` to an I/O error, for use with `map_err`.
    pub fn at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::File {
            path: path.to_path_buf(),
            source,
        }
    }
}
