//! Unattended-install image builder.
//!
//! [`AutoInstallBuilder`] edits an open image in three fixed phases:
//!
//! 1. inject the `nocloud` configuration directory,
//! 2. patch the GRUB and isolinux boot menus,
//! 3. rewrite `/md5sum.txt` so it matches the patched content.
//!
//! Extra directory trees can be staged into the image beforehand with
//! [`AutoInstallBuilder::add_directory`]. Any error aborts the build; the
//! image handle's staging area is discarded by its owner.

use crate::bootmenu::{MenuPatch, StampMode};
use crate::error::{Error, Result};
use crate::image::{self, EXECUTABLE_FILE_MODE, ImageFs};
use crate::manifest::{self, DigestReader, HashRecord, canonical_path};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Boot menu read by GRUB on EFI systems. Covered by the image manifest.
pub const GRUB_PATH: &str = "/boot/grub/grub.cfg";
/// Boot menu read by isolinux on legacy BIOS systems. Not covered by the image manifest.
pub const ISOLINUX_PATH: &str = "/isolinux/txt.cfg";
/// Directory the `nocloud` data source reads from (`/cdrom/nocloud/` at install time).
pub const NOCLOUD_DIR: &str = "/nocloud";
/// In-image checksum manifest.
pub const MANIFEST_PATH: &str = "/md5sum.txt";

pub const DEFAULT_STAMP: &str = "AutoInstall";

/// `S_IXUSR`
const OWNER_EXECUTE: u32 = 0o100;

/// What to inject and how the boot menus are patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Autoinstall configuration written to `/nocloud/user-data`.
    pub user_data: String,
    /// Text appended, in parentheses, to the install menu entries.
    pub stamp: String,
    /// Keep the installer's confirmation prompt before it wipes disks.
    pub prompt: bool,
    pub supports_efi: bool,
    pub supports_mbr: bool,
}

impl BuildOptions {
    pub fn new(user_data: impl Into<String>) -> Self {
        Self {
            user_data: user_data.into(),
            stamp: DEFAULT_STAMP.to_owned(),
            prompt: true,
            supports_efi: true,
            supports_mbr: true,
        }
    }
}

pub struct AutoInstallBuilder<'a, I: ImageFs + ?Sized> {
    image: &'a mut I,
    options: BuildOptions,
    /// Records for tracked files staged through `add_directory`.
    staged: Vec<HashRecord>,
}

impl<'a, I: ImageFs + ?Sized> AutoInstallBuilder<'a, I> {
    pub fn new(image: &'a mut I, options: BuildOptions) -> Self {
        Self {
            image,
            options,
            staged: Vec::new(),
        }
    }

    /// Records collected so far for tracked staged files.
    pub fn staged_records(&self) -> &[HashRecord] {
        &self.staged
    }

    /// Mirrors the directory `source` into the image at `target`.
    ///
    /// `target` itself is created and must not exist yet. Files whose source
    /// is executable by its owner get [`EXECUTABLE_FILE_MODE`]; everything
    /// else gets the image's default mode. When `tracked` is set, a manifest
    /// record is kept for every copied file and written by [`Self::build`].
    ///
    /// Symbolic links and special files are rejected with
    /// [`Error::UnsupportedEntry`]. Returns the number of files copied.
    #[tracing::instrument(skip_all, fields(source = %source.display(), target = %target.display()))]
    pub fn add_directory(&mut self, source: &Path, target: &Path, tracked: bool) -> Result<usize> {
        let metadata = fs::symlink_metadata(source).map_err(Error::at(source))?;
        if !metadata.is_dir() {
            return Err(Error::UnsupportedEntry(source.to_path_buf()));
        }

        tracing::info!("Start staging directory");
        let mut files = 0;
        let walker = jwalk::WalkDir::new(source).sort(true).follow_links(false);
        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            let path = entry.path();
            let relative = path
                .strip_prefix(source)
                .map_err(|_| Error::UnsupportedEntry(path.clone()))?;
            let destination = image::normalize(&target.join(relative));

            // Links are not followed, so they show up here as links.
            let metadata = fs::symlink_metadata(&path).map_err(Error::at(&path))?;
            if metadata.is_dir() {
                tracing::debug!("Creating directory {}", destination.display());
                self.image.create_directory(&destination, None)?;
            } else if metadata.is_file() {
                let mode = (metadata.permissions().mode() & OWNER_EXECUTE != 0)
                    .then_some(EXECUTABLE_FILE_MODE);
                let file = File::open(&path).map_err(Error::at(&path))?;
                let mut reader = DigestReader::new(BufReader::new(file));
                tracing::debug!("Copying {} to {}", path.display(), destination.display());
                self.image
                    .write_new_file(&destination, &mut reader, metadata.len(), mode)?;
                if tracked {
                    self.staged
                        .push(HashRecord::new(canonical_path(&destination), reader.finish()));
                }
                files += 1;
            } else {
                tracing::error!("Cannot stage {}: not a file or directory", path.display());
                return Err(Error::UnsupportedEntry(path));
            }
        }
        tracing::info!(files, "Finished staging directory");
        Ok(files)
    }

    /// Runs the three build phases and returns the records written to the
    /// image manifest.
    #[tracing::instrument(skip_all)]
    pub fn build(mut self) -> Result<Vec<HashRecord>> {
        self.inject_configuration()?;
        let menu_record = self.patch_boot_menus()?;
        self.reconcile_manifest(menu_record)
    }

    fn inject_configuration(&mut self) -> Result<()> {
        tracing::info!("Start adding autoinstall configuration");
        let dir = Path::new(NOCLOUD_DIR);
        self.image.create_directory(dir, None)?;
        image::write_text(
            &mut *self.image,
            &dir.join("user-data"),
            &self.options.user_data,
            None,
        )?;
        image::write_text(&mut *self.image, &dir.join("meta-data"), "\n", None)?;
        tracing::info!("Finished adding autoinstall configuration");
        Ok(())
    }

    fn menu_patch(&self, mode: StampMode, escape_separator: bool) -> MenuPatch<'_> {
        MenuPatch {
            mode,
            stamp: &self.options.stamp,
            prompt: self.options.prompt,
            escape_separator,
        }
    }

    /// Rewrites both menus. Returns the record of the new GRUB menu, hashed
    /// from the exact bytes handed to the image.
    fn patch_boot_menus(&mut self) -> Result<HashRecord> {
        tracing::info!("Start patching boot menus");
        let grub_path = Path::new(GRUB_PATH);
        let isolinux_path = Path::new(ISOLINUX_PATH);

        let grub = image::read_text(&mut *self.image, grub_path)?;
        let isolinux = image::read_text(&mut *self.image, isolinux_path)?;

        let grub = self
            .menu_patch(StampMode::for_efi(self.options.supports_efi), true)
            .apply(&grub);
        let isolinux = self
            .menu_patch(StampMode::for_mbr(self.options.supports_mbr), false)
            .apply(&isolinux);

        let mut reader = DigestReader::new(grub.as_bytes());
        self.image
            .replace_file(grub_path, &mut reader, grub.len() as u64, None)?;
        let record = HashRecord::new(canonical_path(grub_path), reader.finish());
        tracing::debug!("New digest of {}: {}", GRUB_PATH, record.digest);

        image::replace_text(&mut *self.image, isolinux_path, &isolinux)?;
        tracing::info!("Finished patching boot menus");
        Ok(record)
    }

    fn reconcile_manifest(self, menu_record: HashRecord) -> Result<Vec<HashRecord>> {
        tracing::info!("Start updating {}", MANIFEST_PATH);
        let manifest_path = Path::new(MANIFEST_PATH);

        let existing = {
            let reader = BufReader::new(self.image.read_file(manifest_path)?);
            manifest::parse(reader).collect::<Result<Vec<_>>>()?
        };
        let before = existing.len();

        let isolinux = canonical_path(Path::new(ISOLINUX_PATH));
        let mut records: Vec<HashRecord> = {
            let superseded: HashSet<&str> = self
                .staged
                .iter()
                .map(|record| record.path.as_str())
                .chain([menu_record.path.as_str(), isolinux.as_str()])
                .collect();
            existing
                .into_iter()
                .filter(|record| !superseded.contains(record.path.as_str()))
                .collect()
        };
        records.extend(self.staged);
        records.push(menu_record);

        image::replace_text(self.image, manifest_path, &manifest::serialize(&records))?;
        tracing::info!(
            before,
            after = records.len(),
            "Finished updating {}",
            MANIFEST_PATH
        );
        Ok(records)
    }
}
