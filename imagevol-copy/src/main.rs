//! `imagevol-copy` - statically linked copy tool run inside extraction containers.
//!
//! The host places this binary into the volume's support directory, which is
//! mounted into the extraction container. The container's command then runs
//! it against the image root:
//!
//! ```text
//! imagevol-copy --exclude /proc --exclude <support> / <content>
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use imagevol_copy::{CopyOptions, copy_path};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "imagevol-copy", version, about = "Copy a file or directory tree")]
struct CopyArgs {
    /// Source path to skip, together with everything below it (repeatable)
    #[arg(long = "exclude")]
    excludes: Vec<PathBuf>,

    /// Do not copy uid/gid (default: preserved when running as root)
    #[arg(long)]
    no_preserve_ownership: bool,

    /// Source file or directory
    source: PathBuf,

    /// Destination path
    destination: PathBuf,
}

fn main() -> ExitCode {
    let args = CopyArgs::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let options = CopyOptions {
        excludes: args.excludes,
        preserve_ownership: !args.no_preserve_ownership && nix::unistd::geteuid().is_root(),
    };

    match copy_path(&args.source, &args.destination, &options) {
        Ok(stats) => {
            tracing::info!(
                files = stats.files,
                dirs = stats.dirs,
                symlinks = stats.symlinks,
                skipped = stats.skipped,
                "Copied {} to {}",
                args.source.display(),
                args.destination.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Copy failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
