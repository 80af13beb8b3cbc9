//! Image access through the `xorriso` command line tool.
//!
//! The source image is never modified. Opening it lists its Rock Ridge tree;
//! files that are read get extracted into a staging directory, and every
//! write is copied there too and recorded as an edit. [`ImageFs::write_image`]
//! replays the edits in a single `xorriso` run that produces the new image
//! with the original boot setup (`-boot_image any replay`).

use super::{
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, ImageFs, check_length, dir_mode, file_mode, is_dir_mode,
    normalize,
};
use crate::error::{Error, Result};
use crate::manifest::for_each_chunk;
use crate::progress::{Progress, Update};
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

const XORRISO: &str = "xorriso";

/// Lines of xorriso's stderr kept for error reports.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Edit {
    Remove(PathBuf),
    Mkdir { path: PathBuf, mode: Option<u32> },
    Map { staged: PathBuf, path: PathBuf, mode: u32 },
}

/// An installer image opened for editing through `xorriso`.
///
/// The staging directory lives until [`XorrisoImage::close`] is called or the
/// value is dropped, whichever comes first, on success and failure alike.
#[derive(Debug)]
pub struct XorrisoImage {
    program: PathBuf,
    source: PathBuf,
    staging: TempDir,
    /// Current view of the tree: path to mode, type bits included.
    entries: BTreeMap<PathBuf, u32>,
    /// Files whose current content lives in the staging directory.
    staged: BTreeMap<PathBuf, PathBuf>,
    edits: Vec<Edit>,
    staged_count: usize,
}

impl XorrisoImage {
    /// Opens `path`, staging temporary files in `working_dir` when given,
    /// or in the system temporary directory otherwise.
    pub fn open(path: &Path, working_dir: Option<&Path>) -> Result<Self> {
        Self::open_with(Path::new(XORRISO), path, working_dir)
    }

    /// Like [`XorrisoImage::open`], running `program` instead of the
    /// `xorriso` found on `PATH`.
    pub fn open_with(program: &Path, path: &Path, working_dir: Option<&Path>) -> Result<Self> {
        let metadata = fs::metadata(path).map_err(Error::at(path))?;
        if !metadata.is_file() {
            return Err(Error::Config(format!(
                "{} is not an image file",
                path.display()
            )));
        }

        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("autoiso_");
            builder
        };
        let staging = match working_dir {
            Some(dir) => builder.tempdir_in(dir).map_err(Error::at(dir))?,
            None => builder.tempdir()?,
        };

        tracing::info!("Opening image '{}'", path.display());
        let output = run(program, &[
            "-indev".into(),
            path.into(),
            "-find".into(),
            "/".into(),
            "-exec".into(),
            "lsdl".into(),
        ])?;
        let listing = String::from_utf8_lossy(&output);
        let entries: BTreeMap<PathBuf, u32> = listing.lines().filter_map(parse_lsdl_line).collect();
        tracing::debug!(entries = entries.len(), "Listed image tree");

        Ok(Self {
            program: program.to_path_buf(),
            source: path.to_path_buf(),
            staging,
            entries,
            staged: BTreeMap::new(),
            edits: Vec::new(),
            staged_count: 0,
        })
    }

    /// Releases the image and removes the staging directory.
    pub fn close(self) -> Result<()> {
        let Self { staging, .. } = self;
        staging.close()?;
        Ok(())
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn next_staging_path(&mut self, kind: &str) -> PathBuf {
        self.staged_count += 1;
        self.staging
            .path()
            .join(format!("{kind}-{}", self.staged_count))
    }

    fn require_file(&self, path: &Path) -> Result<u32> {
        match self.entries.get(path) {
            Some(mode) if !is_dir_mode(*mode) => Ok(*mode),
            _ => Err(Error::NotFound(path.to_path_buf())),
        }
    }

    fn require_parent_dir(&self, path: &Path) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if parent == Path::new("/") {
            return Ok(());
        }
        match self.entries.get(parent) {
            Some(mode) if is_dir_mode(*mode) => Ok(()),
            _ => Err(Error::NotFound(parent.to_path_buf())),
        }
    }

    /// Copies `source` into a new staging file, removing it again on failure.
    fn stage(&mut self, path: &Path, source: &mut dyn Read, length: u64) -> Result<PathBuf> {
        let staged = self.next_staging_path("stage");
        let result = (|| -> Result<()> {
            let mut writer = BufWriter::new(File::create(&staged).map_err(Error::at(&staged))?);
            let copied = for_each_chunk(source, |chunk| writer.write_all(chunk))?;
            writer.flush().map_err(Error::at(&staged))?;
            check_length(path, length, copied)
        })();
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_file(&staged) {
                tracing::debug!("Failed to remove staging file {}: {}", staged.display(), cleanup);
            }
            return Err(e);
        }
        tracing::trace!(path = %path.display(), staged = %staged.display(), "Staged content");
        Ok(staged)
    }

    fn extract(&mut self, path: &Path) -> Result<PathBuf> {
        let target = self.next_staging_path("extract");
        tracing::debug!("Extracting {} from image", path.display());
        run(&self.program, &[
            "-osirrox".into(),
            "on".into(),
            "-indev".into(),
            self.source.clone().into(),
            "-extract".into(),
            path.into(),
            target.clone().into(),
        ])?;
        self.staged.insert(path.to_path_buf(), target.clone());
        Ok(target)
    }

    fn write_args(&self, destination: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-indev".into(),
            self.source.clone().into(),
            "-outdev".into(),
            destination.into(),
            "-boot_image".into(),
            "any".into(),
            "replay".into(),
        ];
        for edit in &self.edits {
            match edit {
                Edit::Remove(path) => args.extend([OsString::from("-rm"), path.into()]),
                Edit::Mkdir { path, mode } => {
                    args.extend([OsString::from("-mkdir"), path.into()]);
                    if let Some(mode) = mode {
                        args.extend(chmod_args(*mode, path));
                    }
                }
                Edit::Map { staged, path, mode } => {
                    args.extend([OsString::from("-map"), staged.into(), path.into()]);
                    args.extend(chmod_args(*mode, path));
                }
            }
        }
        args.push("-commit".into());
        args
    }
}

fn chmod_args(mode: u32, path: &Path) -> [OsString; 3] {
    [
        "-chmod".into(),
        format!("{:o}", mode & 0o7777).into(),
        path.into(),
    ]
}

impl ImageFs for XorrisoImage {
    fn read_file(&mut self, path: &Path) -> Result<Box<dyn Read + '_>> {
        let path = normalize(path);
        self.require_file(&path)?;
        let content = match self.staged.get(&path) {
            Some(staged) => staged.clone(),
            None => self.extract(&path)?,
        };
        let file = File::open(&content).map_err(Error::at(&content))?;
        Ok(Box::new(BufReader::new(file)))
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
        let staged = self.stage(&path, source, length)?;
        let mode = mode.map_or(DEFAULT_FILE_MODE, file_mode);

        self.entries.insert(path.clone(), mode);
        self.staged.insert(path.clone(), staged.clone());
        self.edits.push(Edit::Map { staged, path, mode });
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
        let old_mode = self.require_file(&path)?;
        let staged = self.stage(&path, source, length)?;
        let mode = mode.map_or(old_mode, file_mode);

        self.entries.insert(path.clone(), mode);
        self.staged.insert(path.clone(), staged.clone());
        self.edits.push(Edit::Remove(path.clone()));
        self.edits.push(Edit::Map { staged, path, mode });
        Ok(())
    }

    fn remove_file(&mut self, path: &Path) -> Result<()> {
        let path = normalize(path);
        self.require_file(&path)?;
        self.entries.remove(&path);
        self.staged.remove(&path);
        self.edits.push(Edit::Remove(path));
        Ok(())
    }

    fn create_directory(&mut self, path: &Path, mode: Option<u32>) -> Result<()> {
        let path = normalize(path);
        if self.entries.contains_key(&path) || path == Path::new("/") {
            return Err(Error::AlreadyExists(path));
        }
        self.require_parent_dir(&path)?;
        self.entries
            .insert(path.clone(), mode.map_or(DEFAULT_DIR_MODE, dir_mode));
        self.edits.push(Edit::Mkdir { path, mode });
        Ok(())
    }

    fn mode(&self, path: &Path) -> Result<u32> {
        let path = normalize(path);
        if path == Path::new("/") {
            return Ok(DEFAULT_DIR_MODE);
        }
        self.entries
            .get(&path)
            .copied()
            .ok_or(Error::NotFound(path))
    }

    /// Writes to a fresh temporary file next to `destination` and moves it
    /// into place only once `xorriso` succeeded, so a failed run leaves any
    /// previous image at `destination` untouched.
    fn write_image(&mut self, destination: &Path, progress: Option<&dyn Progress>) -> Result<()> {
        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        // Empty, so xorriso treats it as a blank medium rather than appending a session.
        let output = tempfile::Builder::new()
            .prefix(".autoiso-")
            .suffix(".iso")
            .tempfile_in(parent)
            .map_err(Error::at(parent))?;

        let total = fs::metadata(&self.source)
            .map_err(Error::at(&self.source))?
            .len();
        let task = progress.map(|p| p.add_task("Write image", true, Some(total)));

        tracing::info!(
            edits = self.edits.len(),
            "Start writing image to '{}'",
            destination.display()
        );
        let mut child = Command::new(&self.program)
            .args(self.write_args(output.path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error(&self.program))?;

        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines() {
                let line = line?;
                if let (Some(progress), Some(task), Some(percent)) =
                    (progress, task, parse_update_percent(&line))
                {
                    let completed = (total as f64 * percent / 100.0) as u64;
                    progress.update(task, Update::completed(completed.min(total), total));
                }
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        let status = child.wait()?;
        if let (Some(progress), Some(task)) = (progress, task) {
            progress.stop_task(task);
        }

        if !status.success() {
            tracing::error!("xorriso exited with {status} while writing image");
            return Err(Error::Command {
                command: self.program.display().to_string(),
                stderr: Vec::from(tail).join("\n"),
            });
        }

        output.persist(destination).map_err(|e| Error::File {
            path: destination.to_path_buf(),
            source: e.error,
        })?;
        tracing::info!("Finished writing image");
        Ok(())
    }
}

fn spawn_error(program: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| Error::Command {
        command: program.display().to_string(),
        stderr: format!("could not run {}: {e}. Install xorriso.", program.display()),
    }
}

/// Runs `xorriso` to completion and returns its stdout.
fn run(program: &Path, args: &[OsString]) -> Result<Vec<u8>> {
    tracing::trace!(?args, "Running {}", program.display());
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(spawn_error(program))?;

    if !output.status.success() {
        return Err(Error::Command {
            command: program.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output.stdout)
}

/// Parses one line of `-exec lsdl` output into the entry's path and mode.
///
/// Lines look like `-r--r--r--    1 0        0      1234 Jan  1  2020 '/md5sum.txt'`;
/// symbolic links add ` -> 'target'`.
fn parse_lsdl_line(line: &str) -> Option<(PathBuf, u32)> {
    let mode = parse_mode_string(line.split_whitespace().next()?)?;
    let quoted = &line[line.find('\'')? + 1..];
    let raw = match quoted.find("' -> '") {
        Some(end) => &quoted[..end],
        None => quoted.trim_end().strip_suffix('\'')?,
    };
    let path = raw.replace("'\"'\"'", "'");
    if path == "/" {
        return None;
    }
    Some((PathBuf::from(path), mode))
}

/// Converts an `ls -l` style mode such as `drwxr-xr-x` into numeric mode bits.
fn parse_mode_string(mode: &str) -> Option<u32> {
    let bytes = mode.as_bytes();
    if bytes.len() != 10 {
        return None;
    }
    let file_type = match bytes[0] {
        b'-' => 0o100_000,
        b'd' => 0o040_000,
        b'l' => 0o120_000,
        b'b' => 0o060_000,
        b'c' => 0o020_000,
        b'p' => 0o010_000,
        b's' => 0o140_000,
        _ => return None,
    };

    let mut bits = 0u32;
    for (triad, special) in [(1usize, 0o4000u32), (4, 0o2000), (7, 0o1000)] {
        let shift = (2 - (triad - 1) / 3) * 3;
        let mut value = 0;
        if bytes[triad] == b'r' {
            value |= 4;
        }
        if bytes[triad + 1] == b'w' {
            value |= 2;
        }
        match bytes[triad + 2] {
            b'x' => value |= 1,
            b's' | b't' => {
                value |= 1;
                bits |= special;
            }
            b'S' | b'T' => bits |= special,
            b'-' => {}
            _ => return None,
        }
        bits |= value << shift;
    }
    Some(file_type | bits)
}

/// Extracts the percentage from a pacifier line such as
/// `xorriso : UPDATE :  45.23% done, estimate finish Mon Jan  1 00:00:00 2024`.
fn parse_update_percent(line: &str) -> Option<f64> {
    let head = &line[..line.find("% done")?];
    head.split_whitespace().last()?.parse().ok()
}
