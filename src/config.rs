use std::path::PathBuf;

use clap::Parser;
use fuser::MountOption;

/// Mount an EFS image through the kernel user-space filesystem
/// interface.
#[derive(Parser)]
#[command(
    name = "efsfuse",
    // --version reports the transport library in use; fuser has no
    // runtime version query, so the pinned release is named here.
    version = concat!("fuser 0.14 (efsfuse ", env!("CARGO_PKG_VERSION"), ")")
)]
pub struct Config {
    /// Directory to mount the filesystem on
    #[clap(value_parser = positional)]
    pub mountpoint: PathBuf,

    /// Backing image holding the entire filesystem
    #[clap(value_parser = positional)]
    pub image: PathBuf,

    /// Allow other users to access the mount
    #[clap(long)]
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    #[clap(long)]
    pub auto_unmount: bool,
}

// Trailing positional arguments must not begin with '-'.
fn positional(arg: &str) -> Result<PathBuf, String> {
    if arg.starts_with('-') {
        return Err("must not begin with '-'".to_string());
    }
    Ok(PathBuf::from(arg))
}

impl Config {
    /// The published surface is read-only, so the kernel is told so.
    pub fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![MountOption::FSName("efs".to_string()), MountOption::RO];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}
