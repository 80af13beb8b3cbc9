//! Build parameters file.
//!
//! Every key is optional so that the same settings can come from a TOML file,
//! from command line flags, or from a mix of both. [`BuildConfig::resolve`]
//! merges the two and applies defaults.

use crate::builder::{BuildOptions, DEFAULT_STAMP};
use crate::error::{Error, Result};
use crate::fetch::Checksums;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Release of the base image, e.g. `20.04`.
    pub release: Option<String>,
    /// Download cache and staging directory.
    pub working_dir: Option<PathBuf>,
    /// Destination of the built image.
    pub output: Option<PathBuf>,
    pub checksums: Option<Checksums>,
    #[serde(default)]
    pub autoinstall: AutoInstallConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoInstallConfig {
    /// File holding the autoinstall `user-data`.
    pub user_data: Option<PathBuf>,
    pub stamp: Option<String>,
    pub prompt: Option<bool>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootConfig {
    pub efi: Option<bool>,
    pub mbr: Option<bool>,
}

/// A host directory staged into the image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Record manifest entries for the copied files.
    #[serde(default)]
    pub tracked: bool,
}

impl DirectoryConfig {
    /// Parses the command line form `SOURCE:TARGET`.
    pub fn parse_mapping(mapping: &str, tracked: bool) -> Result<Self> {
        match mapping.rsplit_once(':') {
            Some((source, target)) if !source.is_empty() && target.starts_with('/') => Ok(Self {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
                tracked,
            }),
            _ => Err(Error::Config(format!(
                "expected SOURCE:/TARGET for a staged directory, got '{mapping}'"
            ))),
        }
    }
}

/// Fully resolved parameters of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub release: String,
    pub working_dir: PathBuf,
    pub output: PathBuf,
    pub checksums: Checksums,
    pub user_data: PathBuf,
    pub stamp: String,
    pub prompt: bool,
    pub efi: bool,
    pub mbr: bool,
    pub directories: Vec<DirectoryConfig>,
}

impl BuildPlan {
    /// Reads the user data file and turns the plan into builder options.
    pub fn build_options(&self) -> Result<BuildOptions> {
        let user_data = fs::read_to_string(&self.user_data).map_err(Error::at(&self.user_data))?;
        Ok(BuildOptions {
            user_data,
            stamp: self.stamp.clone(),
            prompt: self.prompt,
            supports_efi: self.efi,
            supports_mbr: self.mbr,
        })
    }
}

impl BuildConfig {
    /// Loads a config file. Relative paths inside it are taken relative to
    /// the directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(Error::at(path))?;
        let mut config = Self::parse(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        if let Some(base) = path.parent() {
            config.rebase(base);
        }
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn rebase(&mut self, base: &Path) {
        let paths = self
            .working_dir
            .iter_mut()
            .chain(self.output.iter_mut())
            .chain(self.autoinstall.user_data.iter_mut())
            .chain(self.directories.iter_mut().map(|directory| &mut directory.source));
        for path in paths.filter(|path| path.is_relative()) {
            *path = base.join(&*path);
        }
    }

    /// Layers `overrides` on top of `self`. Set values in `overrides` win;
    /// directories from both are kept, file entries first.
    #[must_use]
    pub fn merge(self, overrides: Self) -> Self {
        let mut directories = self.directories;
        directories.extend(overrides.directories);
        Self {
            release: overrides.release.or(self.release),
            working_dir: overrides.working_dir.or(self.working_dir),
            output: overrides.output.or(self.output),
            checksums: overrides.checksums.or(self.checksums),
            autoinstall: AutoInstallConfig {
                user_data: overrides.autoinstall.user_data.or(self.autoinstall.user_data),
                stamp: overrides.autoinstall.stamp.or(self.autoinstall.stamp),
                prompt: overrides.autoinstall.prompt.or(self.autoinstall.prompt),
            },
            boot: BootConfig {
                efi: overrides.boot.efi.or(self.boot.efi),
                mbr: overrides.boot.mbr.or(self.boot.mbr),
            },
            directories,
        }
    }

    /// Applies defaults. Fails if no release or user data file was given.
    pub fn resolve(self) -> Result<BuildPlan> {
        let release = self
            .release
            .ok_or_else(|| Error::Config("no release given".to_owned()))?;
        let user_data = self
            .autoinstall
            .user_data
            .ok_or_else(|| Error::Config("no autoinstall user data file given".to_owned()))?;
        let output = self
            .output
            .unwrap_or_else(|| PathBuf::from(format!("ubuntu-{release}-autoinstall.iso")));

        Ok(BuildPlan {
            working_dir: self.working_dir.unwrap_or_else(|| PathBuf::from(".")),
            output,
            checksums: self.checksums.unwrap_or_default(),
            user_data,
            stamp: self
                .autoinstall
                .stamp
                .unwrap_or_else(|| DEFAULT_STAMP.to_owned()),
            prompt: self.autoinstall.prompt.unwrap_or(true),
            efi: self.boot.efi.unwrap_or(true),
            mbr: self.boot.mbr.unwrap_or(true),
            directories: self.directories,
            release,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
release = "20.04"
working_dir = "work"
output = "/srv/out.iso"
checksums = "sha256"

[autoinstall]
user_data = "user-data.yaml"
stamp = "Lab"
prompt = false

[boot]
mbr = false

[[directories]]
source = "payload"
target = "/payload"
tracked = true
"#;

    #[test]
    fn test_parse_and_resolve() {
        let plan = BuildConfig::parse(FULL).unwrap().resolve().unwrap();
        assert_eq!(plan.release, "20.04");
        assert_eq!(plan.working_dir, Path::new("work"));
        assert_eq!(plan.output, Path::new("/srv/out.iso"));
        assert_eq!(plan.checksums, Checksums::Sha256);
        assert_eq!(plan.stamp, "Lab");
        assert!(!plan.prompt);
        assert!(plan.efi);
        assert!(!plan.mbr);
        assert_eq!(
            plan.directories,
            [DirectoryConfig {
                source: PathBuf::from("payload"),
                target: PathBuf::from("/payload"),
                tracked: true,
            }]
        );
    }

    #[test]
    fn test_defaults() {
        let config = BuildConfig {
            release: Some("22.04".to_owned()),
            autoinstall: AutoInstallConfig {
                user_data: Some(PathBuf::from("ud")),
                ..AutoInstallConfig::default()
            },
            ..BuildConfig::default()
        };
        let plan = config.resolve().unwrap();
        assert_eq!(plan.working_dir, Path::new("."));
        assert_eq!(plan.output, Path::new("ubuntu-22.04-autoinstall.iso"));
        assert_eq!(plan.checksums, Checksums::Md5);
        assert_eq!(plan.stamp, "AutoInstall");
        assert!(plan.prompt && plan.efi && plan.mbr);
        assert!(plan.directories.is_empty());
    }

    #[test]
    fn test_missing_required_keys() {
        let err = BuildConfig::default().resolve().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("release")));

        let config = BuildConfig {
            release: Some("20.04".to_owned()),
            ..BuildConfig::default()
        };
        assert!(matches!(config.resolve(), Err(Error::Config(ref msg)) if msg.contains("user data")));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(BuildConfig::parse("relase = \"20.04\"").is_err());
        assert!(BuildConfig::parse("[boot]\nuefi = true").is_err());
        assert!(BuildConfig::parse("checksums = \"sha1\"").is_err());
    }

    #[test]
    fn test_overrides_win() {
        let file = BuildConfig::parse(FULL).unwrap();
        let overrides = BuildConfig {
            release: Some("22.04".to_owned()),
            boot: BootConfig {
                efi: Some(false),
                mbr: None,
            },
            directories: vec![DirectoryConfig::parse_mapping("extra:/extra", false).unwrap()],
            ..BuildConfig::default()
        };
        let plan = file.merge(overrides).resolve().unwrap();
        assert_eq!(plan.release, "22.04");
        assert_eq!(plan.stamp, "Lab");
        assert!(!plan.efi);
        assert!(!plan.mbr);
        assert_eq!(plan.directories.len(), 2);
        assert_eq!(plan.directories[1].target, Path::new("/extra"));
    }

    #[test]
    fn test_load_rebases_relative_paths() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("autoiso.toml");
        fs::write(&path, FULL).unwrap();

        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.working_dir, Some(temp_dir.path().join("work")));
        assert_eq!(config.output, Some(PathBuf::from("/srv/out.iso")));
        assert_eq!(
            config.autoinstall.user_data,
            Some(temp_dir.path().join("user-data.yaml"))
        );
        assert_eq!(config.directories[0].source, temp_dir.path().join("payload"));
    }

    #[test]
    fn test_directory_mapping() {
        let dir = DirectoryConfig::parse_mapping("./a:b/c:/opt/x", true).unwrap();
        assert_eq!(dir.source, Path::new("./a:b/c"));
        assert_eq!(dir.target, Path::new("/opt/x"));
        assert!(dir.tracked);

        assert!(DirectoryConfig::parse_mapping("payload", false).is_err());
        assert!(DirectoryConfig::parse_mapping("payload:relative", false).is_err());
        assert!(DirectoryConfig::parse_mapping(":/x", false).is_err());
    }

    #[test]
    fn test_build_options_reads_user_data() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let user_data = temp_dir.path().join("user-data");
        fs::write(&user_data, "#cloud-config\n").unwrap();

        let mut plan = BuildConfig {
            release: Some("20.04".to_owned()),
            ..BuildConfig::default()
        };
        plan.autoinstall.user_data = Some(user_data);
        let options = plan.resolve().unwrap().build_options().unwrap();
        assert_eq!(options.user_data, "#cloud-config\n");
        assert_eq!(options, BuildOptions::new("#cloud-config\n"));
    }
}
