//! Boot menu rewriting.
//!
//! Both the GRUB (EFI) and isolinux (legacy BIOS/MBR) menus of the server
//! installer share the same two landmarks: the `Install Ubuntu Server` entry
//! title, and kernel command lines ending in `---`. The title gets a stamp so
//! the patched media is recognisable at boot, and the command lines get the
//! cloud-init `nocloud` data source pointing at the injected configuration.

/// Title of the menu entries that get stamped.
pub const PRODUCT_ANCHOR: &str = "Install Ubuntu Server";

/// Token ending every kernel command line in the installer menus.
pub const BOOT_LINE_TERMINATOR: &str = "---";

/// Mount path of the injected configuration as seen by the installer.
pub const DATASOURCE_PATH: &str = "/cdrom/nocloud/";

/// Which stamp is appended to the install entry title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampMode {
    /// The configured short stamp, e.g. `(AutoInstall)`.
    Normal,
    /// A warning that unattended EFI boot is not supported by this image.
    EfiUnsupported,
    /// A warning that unattended legacy/MBR boot is not supported by this image.
    MbrUnsupported,
}

impl StampMode {
    /// Picks the stamp for a menu given whether its boot path is supported.
    #[must_use]
    pub const fn for_efi(supported: bool) -> Self {
        if supported { Self::Normal } else { Self::EfiUnsupported }
    }

    #[must_use]
    pub const fn for_mbr(supported: bool) -> Self {
        if supported { Self::Normal } else { Self::MbrUnsupported }
    }

    fn render(self, stamp: &str) -> String {
        match self {
            Self::Normal => format!("({stamp})"),
            Self::EfiUnsupported => unsupported_stamp("EFI"),
            Self::MbrUnsupported => unsupported_stamp("MBR"),
        }
    }
}

fn unsupported_stamp(mode: &str) -> String {
    format!("*AutoInstall with {mode} boot not supported by this ISO*")
}

/// Parameters for one menu rewrite.
#[derive(Debug, Clone, Copy)]
pub struct MenuPatch<'a> {
    pub mode: StampMode,
    /// Text shown for [`StampMode::Normal`].
    pub stamp: &'a str,
    /// Leave the installer's confirmation prompt in place (no `autoinstall` flag).
    pub prompt: bool,
    /// Backslash-escape the `;` in the data source directive. GRUB needs it,
    /// isolinux does not.
    pub escape_separator: bool,
}

impl MenuPatch<'_> {
    /// Kernel parameters inserted in front of the terminator.
    #[must_use]
    pub fn kernel_parameters(&self) -> String {
        let separator = if self.escape_separator { "\\;" } else { ";" };
        let datasource = format!("ds=nocloud{separator}s={DATASOURCE_PATH}");
        if self.prompt {
            datasource
        } else {
            format!("autoinstall {datasource}")
        }
    }

    /// Returns `text` with every install entry stamped and every boot line patched.
    #[must_use]
    pub fn apply(&self, text: &str) -> String {
        let stamped = text.replace(
            PRODUCT_ANCHOR,
            &format!("{PRODUCT_ANCHOR} {}", self.mode.render(self.stamp)),
        );
        let parameters = self.kernel_parameters();

        let mut out = String::with_capacity(stamped.len() + 64);
        for line in stamped.split_inclusive('\n') {
            let (body, ending) = split_line_ending(line);
            let content = body.trim_end();
            match content.strip_suffix(BOOT_LINE_TERMINATOR) {
                Some(head) => {
                    let head = head.trim_end();
                    out.push_str(head);
                    if !head.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&parameters);
                    out.push(' ');
                    out.push_str(BOOT_LINE_TERMINATOR);
                }
                None => out.push_str(body),
            }
            out.push_str(ending);
        }
        out
    }
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Convenience wrapper around [`MenuPatch::apply`].
#[must_use]
pub fn transform(
    text: &str,
    mode: StampMode,
    stamp: &str,
    prompt: bool,
    escape_separator: bool,
) -> String {
    MenuPatch {
        mode,
        stamp,
        prompt,
        escape_separator,
    }
    .apply(text)
}
