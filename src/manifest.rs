//! Checksum manifest codec.
//!
//! Manifests are the `md5sum`-style text files shipped with installer images
//! (`md5sum.txt` inside the image, `MD5SUMS`/`SHA256SUMS` next to it on the
//! mirror). Each line is `<hex digest><two spaces><path>`; paths inside an
//! image are written relative to its root with a leading `.`.

use crate::error::{Error, Result};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::io::{self, BufRead, Read, Write};
use std::path::Path;

/// Streaming reads are done in chunks of this size.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Marker some tools put in front of a path to flag binary-mode hashing.
const BINARY_MARKER: char = '*';

/// A single `(path, digest)` entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashRecord {
    pub path: String,
    pub digest: String,
}

impl HashRecord {
    pub fn new(path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            digest: digest.into(),
        }
    }

    /// Digests `reader` with MD5 and keys the record by the canonical form of `path`.
    pub fn from_reader<R: Read>(path: &Path, reader: R) -> io::Result<Self> {
        Ok(Self::new(canonical_path(path), digest(reader)?))
    }
}

/// Hash algorithms a manifest may be written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Md5,
    Sha256,
}

impl Algorithm {
    #[must_use]
    pub fn hasher(self) -> Hasher {
        match self {
            Self::Md5 => Hasher::Md5(Md5::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

/// Incremental digest state for one of the supported [`Algorithm`]s.
#[derive(Debug, Clone)]
pub enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(hasher) => hasher.update(data),
            Self::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Consumes the state and returns the lowercase hex digest.
    #[must_use]
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(hasher) => hex::encode(hasher.finalize()),
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }
}

/// Reader adapter that digests everything read through it.
///
/// Used to hash content while it is being copied into the image, so the
/// digest always describes the exact bytes written.
#[derive(Debug)]
pub struct DigestReader<R> {
    inner: R,
    hasher: Hasher,
    bytes: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_algorithm(inner, Algorithm::Md5)
    }

    pub fn with_algorithm(inner: R, algorithm: Algorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            bytes: 0,
        }
    }

    /// Number of bytes that passed through the reader so far.
    pub const fn bytes_read(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn finish(self) -> String {
        self.hasher.finalize_hex()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.bytes += read as u64;
        Ok(read)
    }
}

/// Calls `f` with successive chunks of at most [`CHUNK_SIZE`] bytes until EOF.
pub fn for_each_chunk<R, F>(mut reader: R, mut f: F) -> io::Result<u64>
where
    R: Read,
    F: FnMut(&[u8]) -> io::Result<()>,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        f(&buf[..read])?;
        total += read as u64;
    }
}

/// MD5 digest of a byte stream as lowercase hex.
pub fn digest<R: Read>(reader: R) -> io::Result<String> {
    digest_with(Algorithm::Md5, reader)
}

pub fn digest_with<R: Read>(algorithm: Algorithm, reader: R) -> io::Result<String> {
    let mut hasher = algorithm.hasher();
    for_each_chunk(reader, |chunk| {
        hasher.update(chunk);
        Ok(())
    })?;
    Ok(hasher.finalize_hex())
}

/// Manifest form of an image path: `/boot/grub/grub.cfg` becomes `./boot/grub/grub.cfg`.
#[must_use]
pub fn canonical_path(path: &Path) -> String {
    let path = path.to_string_lossy();
    if path.starts_with('/') {
        format!(".{path}")
    } else {
        format!("./{path}")
    }
}

/// Lazy, forward-only parser over manifest lines.
///
/// Blank lines are skipped; any other line without both a digest and a path
/// yields [`Error::Format`].
#[derive(Debug)]
pub struct Records<R> {
    lines: io::Lines<R>,
    line: usize,
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<HashRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            // Trailing whitespace belongs to the path.
            return Some(parse_line(line.trim_start()).ok_or_else(|| Error::Format {
                line: self.line,
                content: line.clone(),
            }));
        }
    }
}

fn parse_line(line: &str) -> Option<HashRecord> {
    let (digest, rest) = line.split_once(char::is_whitespace)?;
    let path = rest.trim_start().trim_start_matches(BINARY_MARKER);
    if path.is_empty() {
        return None;
    }
    Some(HashRecord::new(path, digest))
}

pub fn parse<R: BufRead>(reader: R) -> Records<R> {
    Records {
        lines: reader.lines(),
        line: 0,
    }
}

/// Writes one `<digest>  <path>` line per record.
pub fn write<'a, W, I>(mut writer: W, records: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a HashRecord>,
{
    for record in records {
        writeln!(writer, "{}  {}", record.digest, record.path)?;
    }
    writer.flush()
}

#[must_use]
pub fn serialize<'a, I>(records: I) -> String
where
    I: IntoIterator<Item = &'a HashRecord>,
{
    records
        .into_iter()
        .map(|record| format!("{}  {}\n", record.digest, record.path))
        .collect()
}
