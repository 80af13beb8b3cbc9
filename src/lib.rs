//! Builds unattended-install Ubuntu Server images.
//!
//! A stock installer image is downloaded and validated ([`fetch`]), an
//! autoinstall configuration is injected, the boot menus are patched
//! ([`bootmenu`]) and the image's `md5sum.txt` is brought up to date
//! ([`builder`], [`manifest`]) before the edited image is written out
//! through an [`image::ImageFs`] implementation.
pub mod bootmenu;
pub mod builder;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod image;
pub mod manifest;
pub mod progress;

pub use error::{Error, Result};
