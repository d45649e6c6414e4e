use anyhow::{Result, bail};
use clap::Args;
use tokio::net::UnixStream;

use crate::cli::{GlobalFlags, PluginFlags};

/// One-shot cleanup for a stopped plugin.
///
/// In-flight extractions of a running `serve` are invisible to this process,
/// so the command refuses to run while something answers on the CSI socket.
#[derive(Args, Debug)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub plugin: PluginFlags,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: ReconcileArgs, global: &GlobalFlags) -> Result<()> {
    let options = global.load_options(&args.plugin)?;

    let socket = imagevol::server::socket_path(&options.endpoint)?;
    if UnixStream::connect(&socket).await.is_ok() {
        bail!(
            "a plugin is serving on {}; stop it before reconciling",
            socket.display()
        );
    }

    let driver = imagevol::Driver::connect(options).await?;
    let report = driver.reconcile().await?;

    if args.json {
        let value = serde_json::json!({
            "removed_dirs": report.removed_dirs,
            "removed_sandboxes": report.removed_sandboxes,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for id in &report.removed_dirs {
            println!("Removed incomplete volume: {}", id);
        }
        for id in &report.removed_sandboxes {
            println!("Removed sandbox: {}", id);
        }
        if report.removed_dirs.is_empty() && report.removed_sandboxes.is_empty() {
            println!("Nothing to clean up");
        }
    }

    Ok(())
}
