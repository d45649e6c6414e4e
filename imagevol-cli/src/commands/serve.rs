use anyhow::Result;
use clap::Args;

use crate::cli::{GlobalFlags, PluginFlags};

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub plugin: PluginFlags,

    /// Skip the startup cleanup of incomplete volumes and lingering sandboxes
    #[arg(long)]
    pub skip_reconcile: bool,
}

pub async fn execute(args: ServeArgs, global: &GlobalFlags) -> Result<()> {
    let options = global.load_options(&args.plugin)?;
    let driver = imagevol::Driver::connect(options).await?;

    if !args.skip_reconcile {
        // A failed cleanup must not keep the node from serving volumes.
        if let Err(e) = driver.reconcile().await {
            tracing::warn!("Startup reconciliation failed: {}", e);
        }
    }

    driver.serve(imagevol::server::shutdown_signal()).await?;
    Ok(())
}
