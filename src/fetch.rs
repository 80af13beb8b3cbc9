//! Download and validation of the base installer image.
//!
//! The image and the mirror's checksum list are downloaded side by side into a
//! working directory. Once the image's digest has been checked against the
//! list, a `.validated` marker is touched next to it; later runs trust the
//! image for as long as the marker is not older than the image itself.

use crate::error::{Error, Result};
use crate::manifest::{self, Algorithm, for_each_chunk};
use crate::progress::{Progress, TaskId, Update};
use file_lock::{FileLock, FileOptions};
use filetime::FileTime;
use rayon::prelude::*;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Worker threads used for concurrent downloads.
pub const DOWNLOAD_WORKERS: usize = 4;

const LOCK_FILE: &str = ".autoiso.lock";
const MARKER_EXTENSION: &str = "validated";

/// Checksum list published alongside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Checksums {
    /// `MD5SUMS`
    #[default]
    Md5,
    /// `SHA256SUMS`
    Sha256,
}

impl Checksums {
    #[must_use]
    pub const fn manifest_name(self) -> &'static str {
        match self {
            Self::Md5 => "MD5SUMS",
            Self::Sha256 => "SHA256SUMS",
        }
    }

    #[must_use]
    pub const fn algorithm(self) -> Algorithm {
        match self {
            Self::Md5 => Algorithm::Md5,
            Self::Sha256 => Algorithm::Sha256,
        }
    }
}

/// A response body being downloaded.
pub struct Download {
    /// Size announced by the server, if any.
    pub length: Option<u64>,
    pub body: Box<dyn Read>,
}

/// Fetches URLs. Shared between download workers.
pub trait Transport: Sync {
    fn get(&self, url: &str) -> Result<Download>;
}

/// HTTP(S) transport backed by `ureq`.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<Download> {
        let response = self.agent.get(url).call().map_err(|e| Error::Transport {
            url: url.to_owned(),
            source: Box::new(e),
        })?;
        let length = response.body().content_length();
        Ok(Download {
            length,
            body: Box::new(response.into_body().into_reader()),
        })
    }
}

/// Where a previous acquisition left the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// The image was validated and has not been replaced since.
    Validated,
    /// Files from an earlier, unvalidated attempt are lying around.
    Stale,
    /// Nothing has been downloaded yet.
    Missing,
}

struct Job<'a> {
    description: &'static str,
    url: String,
    path: &'a Path,
}

/// Downloads a base image plus its checksum list and validates one against the other.
pub struct SourceFetcher<T = HttpTransport> {
    working_dir: PathBuf,
    base_url: String,
    image_name: String,
    manifest_name: String,
    algorithm: Algorithm,
    transport: T,
}

impl SourceFetcher {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        base_url: impl Into<String>,
        image_name: impl Into<String>,
        checksums: Checksums,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            image_name: image_name.into(),
            manifest_name: checksums.manifest_name().to_owned(),
            algorithm: checksums.algorithm(),
            transport: HttpTransport::default(),
        }
    }

    /// The amd64 live server image of an Ubuntu release from releases.ubuntu.com.
    pub fn ubuntu_server(working_dir: impl Into<PathBuf>, release: &str, checksums: Checksums) -> Self {
        Self::new(
            working_dir,
            format!("https://releases.ubuntu.com/{release}"),
            format!("ubuntu-{release}-live-server-amd64.iso"),
            checksums,
        )
    }
}

impl<T> SourceFetcher<T> {
    /// Replaces the transport used for downloads.
    pub fn with_transport<U: Transport>(self, transport: U) -> SourceFetcher<U> {
        SourceFetcher {
            working_dir: self.working_dir,
            base_url: self.base_url,
            image_name: self.image_name,
            manifest_name: self.manifest_name,
            algorithm: self.algorithm,
            transport,
        }
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.working_dir.join(&self.image_name)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.working_dir.join(&self.manifest_name)
    }

    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.image_path().with_extension(MARKER_EXTENSION)
    }

    /// Derives the acquisition state from which files exist and their mtimes.
    pub fn state(&self) -> Result<AcquisitionState> {
        let image = self.image_path();
        let marker = self.marker_path();

        if let (Some(image_mtime), Some(marker_mtime)) = (mtime(&image)?, mtime(&marker)?) {
            if marker_mtime >= image_mtime {
                return Ok(AcquisitionState::Validated);
            }
        }

        if image.exists() || marker.exists() || self.manifest_path().exists() {
            Ok(AcquisitionState::Stale)
        } else {
            Ok(AcquisitionState::Missing)
        }
    }

    fn clear(&self) -> Result<()> {
        for path in [self.manifest_path(), self.marker_path(), self.image_path()] {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::File { path, source: e }),
            }
        }
        Ok(())
    }
}

impl<T: Transport> SourceFetcher<T> {
    /// Returns the path of a validated base image, downloading it if needed.
    ///
    /// A previously validated image is returned without touching the network.
    /// Leftovers of an interrupted or failed attempt are deleted and fetched
    /// again.
    #[tracing::instrument(skip_all, fields(image = %self.image_name))]
    pub fn fetch(&self, progress: Option<&dyn Progress>) -> Result<PathBuf> {
        tracing::info!("Checking for existing image");
        if self.state()? == AcquisitionState::Validated {
            tracing::info!("Found existing validated image");
            return Ok(self.image_path());
        }

        fs::create_dir_all(&self.working_dir).map_err(Error::at(&self.working_dir))?;
        let lock_path = self.working_dir.join(LOCK_FILE);
        let _lock = FileLock::lock(
            &lock_path,
            true,
            FileOptions::new().write(true).create(true),
        )
        .map_err(Error::at(&lock_path))?;

        // Another process may have finished while we waited for the lock.
        match self.state()? {
            AcquisitionState::Validated => {
                tracing::info!("Found existing validated image");
                return Ok(self.image_path());
            }
            AcquisitionState::Stale => {
                tracing::info!("Removing existing unvalidated download");
                self.clear()?;
            }
            AcquisitionState::Missing => {}
        }

        tracing::info!("Start downloading image");
        self.download(progress)?;

        tracing::info!("Start validating image");
        self.validate()?;
        tracing::info!("Validated image");
        Ok(self.image_path())
    }

    fn download(&self, progress: Option<&dyn Progress>) -> Result<()> {
        let image = self.image_path();
        let manifest = self.manifest_path();
        let jobs = [
            Job {
                description: "Image",
                url: format!("{}/{}", self.base_url, self.image_name),
                path: &image,
            },
            Job {
                description: "Checksums",
                url: format!("{}/{}", self.base_url, self.manifest_name),
                path: &manifest,
            },
        ];
        let tasks: Vec<Option<TaskId>> = jobs
            .iter()
            .map(|job| progress.map(|p| p.add_task(job.description, false, None)))
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(DOWNLOAD_WORKERS)
            .thread_name(|index| format!("download-{index}"))
            .build()
            .map_err(io::Error::other)?;

        pool.install(|| {
            jobs.par_iter()
                .zip(tasks.par_iter())
                .try_for_each(|(job, task)| download(&self.transport, job, progress, *task))
        })
    }

    fn validate(&self) -> Result<()> {
        let image = self.image_path();
        let manifest_path = self.manifest_path();

        let actual = manifest::digest_with(
            self.algorithm,
            File::open(&image).map_err(Error::at(&image))?,
        )
        .map_err(Error::at(&image))?;

        let manifest_file = File::open(&manifest_path).map_err(Error::at(&manifest_path))?;
        let expected = manifest::parse(BufReader::new(manifest_file))
            .find_map(|record| match record {
                Ok(record) if record.path == self.image_name => Some(Ok(record.digest)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .transpose()?
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Could not find the digest for {} in {}.",
                    self.image_name,
                    manifest_path.display()
                ))
            })?;

        if !expected.eq_ignore_ascii_case(&actual) {
            tracing::error!(
                "For {}, expected digest: {}, actual digest: {}",
                self.image_name,
                expected,
                actual
            );
            return Err(Error::Validation(format!(
                "Validation of {} failed: expected digest {expected}, got {actual}. \
                 Re-run to attempt the download again.",
                self.image_name
            )));
        }

        let marker = self.marker_path();
        File::create(&marker).map_err(Error::at(&marker))?;
        filetime::set_file_mtime(&marker, FileTime::now()).map_err(Error::at(&marker))?;
        Ok(())
    }
}

fn mtime(path: &Path) -> Result<Option<FileTime>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(FileTime::from_last_modification_time(&metadata))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::File {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn download<T: Transport + ?Sized>(
    transport: &T,
    job: &Job<'_>,
    progress: Option<&dyn Progress>,
    task: Option<TaskId>,
) -> Result<()> {
    let Download { length, mut body } = transport.get(&job.url)?;
    let reporter = progress.zip(task);

    match (reporter, length) {
        (Some((progress, task)), Some(length)) => progress.update(task, Update::total(length)),
        (None, Some(length)) => tracing::info!(
            "{} download is {:.1} MiB",
            job.description,
            length as f64 / (1024.0 * 1024.0)
        ),
        _ => {}
    }

    let mut file = BufWriter::new(File::create(job.path).map_err(Error::at(job.path))?);
    if let Some((progress, task)) = reporter {
        progress.start_task(task);
    }
    tracing::info!("Start downloading {} from '{}'", job.description, job.url);

    let written = for_each_chunk(&mut body, |chunk| {
        file.write_all(chunk)?;
        if let Some((progress, task)) = reporter {
            progress.update(task, Update::advance(chunk.len() as u64));
        }
        Ok(())
    })?;
    file.flush().map_err(Error::at(job.path))?;

    if let Some((progress, task)) = reporter {
        progress.stop_task(task);
    }
    if let Some(length) = length {
        if written != length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "download of {} ended after {written} of {length} bytes",
                    job.url
                ),
            )
            .into());
        }
    }
    tracing::info!("Finished downloading {}", job.description);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const BASE: &str = "https://mirror.test/20.04";
    const IMAGE: &str = "ubuntu-20.04-live-server-amd64.iso";

    #[derive(Default)]
    struct MemoryTransport {
        files: Mutex<HashMap<String, Vec<u8>>>,
        /// Lengths announced instead of the real body size.
        announced: Mutex<HashMap<String, u64>>,
        requests: AtomicUsize,
    }

    impl MemoryTransport {
        fn serve(&self, name: &str, data: impl Into<Vec<u8>>) {
            self.files
                .lock()
                .unwrap()
                .insert(format!("{BASE}/{name}"), data.into());
        }

        /// Serves `data` while announcing `length` bytes, like a connection
        /// that drops mid-transfer.
        fn serve_cut_short(&self, name: &str, data: impl Into<Vec<u8>>, length: u64) {
            self.announced
                .lock()
                .unwrap()
                .insert(format!("{BASE}/{name}"), length);
            self.serve(name, data);
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    impl Transport for MemoryTransport {
        fn get(&self, url: &str) -> Result<Download> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let data = self
                .files
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| Error::NotFound(PathBuf::from(url)))?;
            let length = self
                .announced
                .lock()
                .unwrap()
                .remove(url)
                .unwrap_or(data.len() as u64);
            Ok(Download {
                length: Some(length),
                body: Box::new(Cursor::new(data)),
            })
        }
    }

    fn fetcher(dir: &Path, image: &[u8], manifest: &str) -> SourceFetcher<MemoryTransport> {
        let transport = MemoryTransport::default();
        transport.serve(IMAGE, image);
        transport.serve("MD5SUMS", manifest);
        SourceFetcher::new(dir, BASE, IMAGE, Checksums::Md5).with_transport(transport)
    }

    fn manifest_for(image: &[u8]) -> String {
        let digest = manifest::digest(Cursor::new(image)).unwrap();
        format!("0123456789abcdef0123456789abcdef *other.iso\n{digest} *{IMAGE}\n")
    }

    #[test]
    fn test_fetch_downloads_and_validates() {
        let temp_dir = TempDir::new().unwrap();
        let image = b"iso bytes".repeat(1000);
        let fetcher = fetcher(temp_dir.path(), &image, &manifest_for(&image));

        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Missing);
        let path = fetcher.fetch(None).unwrap();

        assert_eq!(path, temp_dir.path().join(IMAGE));
        assert_eq!(fs::read(&path).unwrap(), image);
        assert!(temp_dir.path().join("MD5SUMS").exists());
        assert!(fetcher.marker_path().exists());
        assert_eq!(
            fetcher.marker_path(),
            temp_dir.path().join("ubuntu-20.04-live-server-amd64.validated")
        );
        assert_eq!(fetcher.transport().requests(), 2);
        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Validated);
    }

    #[test]
    fn test_second_fetch_is_offline() {
        let temp_dir = TempDir::new().unwrap();
        let image = b"image".to_vec();
        let fetcher = fetcher(temp_dir.path(), &image, &manifest_for(&image));

        let first = fetcher.fetch(None).unwrap();
        let second = fetcher.fetch(None).unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.transport().requests(), 2);
    }

    #[test]
    fn test_stale_marker_triggers_fresh_download() {
        let temp_dir = TempDir::new().unwrap();
        let image = b"fresh image".to_vec();
        let fetcher = fetcher(temp_dir.path(), &image, &manifest_for(&image));

        fs::write(fetcher.image_path(), b"partial").unwrap();
        fs::write(fetcher.manifest_path(), b"junk").unwrap();
        fs::write(fetcher.marker_path(), b"").unwrap();
        filetime::set_file_mtime(fetcher.marker_path(), FileTime::from_unix_time(1_000, 0))
            .unwrap();
        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Stale);

        fetcher.fetch(None).unwrap();

        assert_eq!(fetcher.transport().requests(), 2);
        assert_eq!(fs::read(fetcher.image_path()).unwrap(), image);
        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Validated);
    }

    #[test]
    fn test_image_without_marker_is_stale() {
        let temp_dir = TempDir::new().unwrap();
        let image = b"fresh image".to_vec();
        let fetcher = fetcher(temp_dir.path(), &image, &manifest_for(&image));
        fs::write(fetcher.image_path(), b"old").unwrap();

        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Stale);
        fetcher.fetch(None).unwrap();
        assert_eq!(fs::read(fetcher.image_path()).unwrap(), image);
    }

    #[test]
    fn test_digest_mismatch_leaves_no_marker() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = fetcher(temp_dir.path(), b"corrupted", &manifest_for(b"original"));

        let err = fetcher.fetch(None).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("Re-run")));
        assert!(!fetcher.marker_path().exists());
        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Stale);
    }

    #[test]
    fn test_missing_manifest_entry() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = fetcher(
            temp_dir.path(),
            b"image",
            "0123456789abcdef0123456789abcdef  unrelated.iso\n",
        );

        let err = fetcher.fetch(None).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("Could not find")));
        assert!(!fetcher.marker_path().exists());
    }

    #[test]
    fn test_truncated_download_is_retried() {
        let temp_dir = TempDir::new().unwrap();
        let image = b"0123456789".repeat(80);
        let fetcher = fetcher(temp_dir.path(), &image, &manifest_for(&image));
        fetcher
            .transport()
            .serve_cut_short(IMAGE, &image[..400], image.len() as u64);

        let err = fetcher.fetch(None).unwrap_err();
        assert!(
            matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof),
            "unexpected error: {err}"
        );
        assert!(!fetcher.marker_path().exists());
        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Stale);

        // The connection recovers; the partial download is discarded and fetched again.
        fetcher.transport().serve(IMAGE, image.clone());
        let path = fetcher.fetch(None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), image);
        assert_eq!(fetcher.state().unwrap(), AcquisitionState::Validated);
    }

    #[test]
    fn test_transport_failure_propagates() {
        let temp_dir = TempDir::new().unwrap();
        let transport = MemoryTransport::default();
        transport.serve(IMAGE, b"image".to_vec());
        let fetcher =
            SourceFetcher::new(temp_dir.path(), BASE, IMAGE, Checksums::Md5).with_transport(transport);

        assert!(matches!(fetcher.fetch(None), Err(Error::NotFound(_))));
        assert!(!fetcher.marker_path().exists());
    }

    #[test]
    fn test_sha256_checksums() {
        let temp_dir = TempDir::new().unwrap();
        let image = b"image".to_vec();
        let digest = manifest::digest_with(Algorithm::Sha256, Cursor::new(&image)).unwrap();
        let transport = MemoryTransport::default();
        transport.serve(IMAGE, image);
        transport.serve("SHA256SUMS", format!("{digest} *{IMAGE}\n"));

        let fetcher = SourceFetcher::new(temp_dir.path(), format!("{BASE}/"), IMAGE, Checksums::Sha256)
            .with_transport(transport);
        fetcher.fetch(None).unwrap();
        assert!(temp_dir.path().join("SHA256SUMS").exists());
    }

    #[test]
    fn test_ubuntu_server_names() {
        let fetcher = SourceFetcher::ubuntu_server("/work", "22.04", Checksums::Sha256);
        assert_eq!(
            fetcher.image_path(),
            Path::new("/work/ubuntu-22.04-live-server-amd64.iso")
        );
        assert_eq!(fetcher.manifest_path(), Path::new("/work/SHA256SUMS"));
        assert_eq!(fetcher.base_url, "https://releases.ubuntu.com/22.04");
    }
}
