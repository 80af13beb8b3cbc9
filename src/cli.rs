use crate::builder::AutoInstallBuilder;
use crate::config::{AutoInstallConfig, BootConfig, BuildConfig, BuildPlan, DirectoryConfig};
use crate::error::Result;
use crate::fetch::{Checksums, SourceFetcher};
use crate::image::{ImageFs, XorrisoImage};
use crate::progress::{LogProgress, Progress};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(version, about, author)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and validate a base installer image
    #[clap(name = "fetch", aliases = &["f"])]
    Fetch {
        /// Release to download, e.g. 20.04
        #[clap(long)]
        release: String,

        /// Directory the image is downloaded to
        #[clap(long, env = "AUTOISO_WORKING_DIR", default_value = ".")]
        working_dir: PathBuf,

        /// Checksum list to validate against
        #[clap(long, value_enum, default_value_t = Checksums::Md5)]
        checksums: Checksums,

        /// Don't report download progress
        #[clap(long, short)]
        quiet: bool,
    },

    /// Build an unattended-install image
    #[clap(name = "build", aliases = &["b"])]
    Build(BuildArgs),
}

/// Flags of `build`. Each one overrides the matching key of `--config`.
#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// TOML file with build parameters
    #[clap(long, short)]
    pub config: Option<PathBuf>,

    /// Release of the base image, e.g. 20.04
    #[clap(long)]
    pub release: Option<String>,

    /// Autoinstall configuration to inject as nocloud user-data
    #[clap(long)]
    pub user_data: Option<PathBuf>,

    /// Where to write the built image
    #[clap(long, short)]
    pub output: Option<PathBuf>,

    /// Text added to the install menu entries
    #[clap(long)]
    pub stamp: Option<String>,

    /// Install without asking for confirmation at boot
    #[clap(long)]
    pub no_prompt: bool,

    /// Mark unattended EFI boot as unsupported
    #[clap(long)]
    pub no_efi: bool,

    /// Mark unattended legacy BIOS boot as unsupported
    #[clap(long)]
    pub no_mbr: bool,

    /// Copy a host directory into the image
    #[clap(long = "add-dir", value_name = "SRC:DEST")]
    pub add_dir: Vec<String>,

    /// Record the files of --add-dir directories in the image manifest
    #[clap(long)]
    pub track_added: bool,

    /// Directory for downloads and staged files
    #[clap(long, env = "AUTOISO_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Checksum list to validate the download against
    #[clap(long, value_enum)]
    pub checksums: Option<Checksums>,

    /// Don't report progress
    #[clap(long, short)]
    pub quiet: bool,
}

impl BuildArgs {
    fn overrides(&self) -> Result<BuildConfig> {
        let directories = self
            .add_dir
            .iter()
            .map(|mapping| DirectoryConfig::parse_mapping(mapping, self.track_added))
            .collect::<Result<_>>()?;
        Ok(BuildConfig {
            release: self.release.clone(),
            working_dir: self.working_dir.clone(),
            output: self.output.clone(),
            checksums: self.checksums,
            autoinstall: AutoInstallConfig {
                user_data: self.user_data.clone(),
                stamp: self.stamp.clone(),
                prompt: self.no_prompt.then_some(false),
            },
            boot: BootConfig {
                efi: self.no_efi.then_some(false),
                mbr: self.no_mbr.then_some(false),
            },
            directories,
        })
    }

    /// Merges the config file, if any, with the flags.
    pub fn plan(&self) -> Result<BuildPlan> {
        let file = match &self.config {
            Some(path) => BuildConfig::load(path)?,
            None => BuildConfig::default(),
        };
        file.merge(self.overrides()?).resolve()
    }
}

fn reporter(progress: &LogProgress, quiet: bool) -> Option<&dyn Progress> {
    (!quiet).then_some(progress as &dyn Progress)
}

/// Fetches the base image, patches it and writes the result to `plan.output`.
#[tracing::instrument(skip_all, fields(release = %plan.release))]
pub fn build(plan: &BuildPlan, progress: Option<&dyn Progress>) -> Result<PathBuf> {
    let options = plan.build_options()?;
    let source = SourceFetcher::ubuntu_server(&plan.working_dir, &plan.release, plan.checksums)
        .fetch(progress)?;

    // The staging directory is removed when `image` goes out of scope, on
    // success and failure alike.
    let mut image = XorrisoImage::open(&source, Some(&plan.working_dir))?;
    let mut builder = AutoInstallBuilder::new(&mut image, options);
    for directory in &plan.directories {
        builder.add_directory(&directory.source, &directory.target, directory.tracked)?;
    }
    builder.build()?;

    image.write_image(&plan.output, progress)?;
    image.close()?;
    tracing::info!("Wrote image to '{}'", plan.output.display());
    Ok(plan.output.clone())
}

impl Cli {
    pub fn run(self) -> Result<()> {
        tracing::trace!("Running command: {:?}", self.command);
        let progress = LogProgress::new();
        match self.command {
            Commands::Fetch {
                release,
                working_dir,
                checksums,
                quiet,
            } => {
                let image = SourceFetcher::ubuntu_server(working_dir, &release, checksums)
                    .fetch(reporter(&progress, quiet))?;
                println!("{}", image.display());
            }
            Commands::Build(args) => {
                let plan = args.plan()?;
                tracing::debug!("Build plan: {:?}", plan);
                let output = build(&plan, reporter(&progress, args.quiet))?;
                println!("{}", output.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_flags_override_config() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = temp_dir.path().join("autoiso.toml");
        std::fs::write(
            &config,
            "release = \"20.04\"\n[autoinstall]\nuser_data = \"ud.yaml\"\nstamp = \"Lab\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "autoiso",
            "build",
            "--config",
            config.to_str().unwrap(),
            "--release",
            "22.04",
            "--no-prompt",
            "--no-mbr",
            "--add-dir",
            "payload:/payload",
            "--track-added",
            "--checksums",
            "sha256",
        ])
        .unwrap();
        let Commands::Build(args) = cli.command else {
            panic!("expected build command");
        };
        let plan = args.plan().unwrap();

        assert_eq!(plan.release, "22.04");
        assert_eq!(plan.user_data, temp_dir.path().join("ud.yaml"));
        assert_eq!(plan.stamp, "Lab");
        assert!(!plan.prompt);
        assert!(plan.efi);
        assert!(!plan.mbr);
        assert_eq!(plan.checksums, Checksums::Sha256);
        assert_eq!(plan.directories.len(), 1);
        assert_eq!(plan.directories[0].target, Path::new("/payload"));
        assert!(plan.directories[0].tracked);
    }

    #[test]
    fn test_bad_directory_mapping() {
        let args = BuildArgs {
            release: Some("20.04".to_owned()),
            user_data: Some(PathBuf::from("ud")),
            add_dir: vec!["payload".to_owned()],
            ..BuildArgs::default()
        };
        assert!(args.plan().is_err());
    }
}
