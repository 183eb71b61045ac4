// SPDX-License-Identifier: GPL-3.0-or-later
//! LazFS mount binary
//!
//! `lazfs [OPTIONS] BACKING_ROOT MOUNT_POINT` serves the backing tree over
//! FUSE, exposing `.laz` point-cloud archives as uncompressed `.las` files.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lazfs_vfs::{mount, MountConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lazfs")]
#[command(version, about = "Serve .laz point-cloud archives as plain .las files", long_about = None)]
struct Cli {
    /// Directory tree to serve
    backing_root: PathBuf,

    /// Where to attach the filesystem
    mount_point: PathBuf,

    /// Directory for decompressed scratch files (default: system temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Worker threads for compression jobs (default: one per CPU)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Mount read-only
    #[arg(long)]
    read_only: bool,

    /// Unmount automatically when the process exits
    #[arg(long)]
    auto_unmount: bool,

    /// Verbose filesystem logging
    #[arg(short, long)]
    debug: bool,
}

/// A passthrough daemon running as root would hand its privileges to every
/// user that can reach the mount, so a root invocation is refused outright.
fn is_root(uid: u32, euid: u32) -> bool {
    uid == 0 || euid == 0
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if is_root(
        nix::unistd::getuid().as_raw(),
        nix::unistd::geteuid().as_raw(),
    ) {
        eprintln!("lazfs: running as root opens unacceptable security holes, refusing");
        return ExitCode::FAILURE;
    }

    let filter = if cli.debug {
        EnvFilter::new("lazfs_vfs=debug,lazfs_cache=debug,lazfs_codec=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = MountConfig {
        backing_root: cli.backing_root,
        mount_point: cli.mount_point,
        scratch_dir: cli.scratch_dir,
        threads: cli.threads,
        allow_other: cli.allow_other,
        read_only: cli.read_only,
        auto_unmount: cli.auto_unmount,
    };

    match mount(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lazfs: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_in_either_identity_is_refused() {
        assert!(is_root(0, 1000));
        assert!(is_root(1000, 0));
        assert!(is_root(0, 0));
        assert!(!is_root(1000, 1000));
    }

    #[test]
    fn cli_parses_positionals_and_flags() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["lazfs", "--threads", "2", "/data", "/mnt/clouds"]);
        assert_eq!(cli.backing_root, PathBuf::from("/data"));
        assert_eq!(cli.mount_point, PathBuf::from("/mnt/clouds"));
        assert_eq!(cli.threads, Some(2));
        assert!(!cli.allow_other);
    }

    #[test]
    fn leading_dash_positionals_are_rejected() {
        assert!(Cli::try_parse_from(["lazfs", "/data", "-mnt"]).is_err());
    }
}
