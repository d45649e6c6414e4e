//! CLI definition and argument parsing for the imagevol plugin.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use imagevol::PluginOptions;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "imagevol", author, version, about = "Container image CSI volume plugin")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the CSI node plugin
    Serve(crate::commands::serve::ServeArgs),

    /// Remove incomplete volumes and lingering extraction sandboxes
    Reconcile(crate::commands::reconcile::ReconcileArgs),
}

// ============================================================================
// GLOBAL FLAGS
// ============================================================================

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// JSON config file, overridden by individual flags
    #[arg(long, global = true, env = "IMAGEVOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write logs to a daily rotated file in this directory instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

impl GlobalFlags {
    /// Config file (or defaults) with the plugin flags applied on top.
    pub fn load_options(&self, flags: &PluginFlags) -> anyhow::Result<PluginOptions> {
        let mut opts = match &self.config {
            Some(path) => PluginOptions::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PluginOptions::default(),
        };
        flags.apply_to(&mut opts);
        Ok(opts)
    }
}

// ============================================================================
// PLUGIN FLAGS
// ============================================================================

#[derive(Args, Debug, Clone, Default)]
pub struct PluginFlags {
    /// CSI endpoint to listen on
    #[arg(long, env = "CSI_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Node identifier reported to the orchestrator
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,

    /// CRI endpoint of the container runtime
    #[arg(long)]
    pub runtime_endpoint: Option<String>,

    /// Base directory for volume content
    #[arg(long)]
    pub root_dir: Option<PathBuf>,

    /// Host path of the static copy tool
    #[arg(long)]
    pub copy_tool: Option<PathBuf>,

    /// Driver name advertised through GetPluginInfo
    #[arg(long)]
    pub driver_name: Option<String>,

    /// Default path inside the image to expose
    #[arg(long)]
    pub source_path: Option<String>,

    /// Runtime handler for extraction sandboxes
    #[arg(long)]
    pub runtime_handler: Option<String>,

    /// Seconds to wait for the container runtime at startup
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,
}

impl PluginFlags {
    pub fn apply_to(&self, opts: &mut PluginOptions) {
        if let Some(endpoint) = &self.endpoint {
            opts.endpoint = endpoint.clone();
        }
        if let Some(node_id) = &self.node_id {
            opts.node_id = node_id.clone();
        }
        if let Some(runtime_endpoint) = &self.runtime_endpoint {
            opts.runtime_endpoint = runtime_endpoint.clone();
        }
        if let Some(root_dir) = &self.root_dir {
            opts.root_dir = root_dir.clone();
        }
        if let Some(copy_tool) = &self.copy_tool {
            opts.copy_tool = copy_tool.clone();
        }
        if let Some(driver_name) = &self.driver_name {
            opts.driver_name = driver_name.clone();
        }
        if let Some(source_path) = &self.source_path {
            opts.source_path = source_path.clone();
        }
        if let Some(handler) = &self.runtime_handler {
            opts.runtime_handler = handler.clone();
        }
        if let Some(secs) = self.connect_timeout_secs {
            opts.timeouts.connect_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let flags = PluginFlags {
            node_id: Some("node-a".into()),
            root_dir: Some(PathBuf::from("/srv/imagevol")),
            connect_timeout_secs: Some(3),
            ..Default::default()
        };
        let mut opts = PluginOptions::default();
        flags.apply_to(&mut opts);

        assert_eq!(opts.node_id, "node-a");
        assert_eq!(opts.root_dir, PathBuf::from("/srv/imagevol"));
        assert_eq!(opts.timeouts.connect_secs, 3);
        assert_eq!(opts.source_path, "/");
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"node_id": "from-file", "source_path": "/usr"}"#).unwrap();

        let global = GlobalFlags {
            debug: false,
            config: Some(path),
            log_dir: None,
        };
        let flags = PluginFlags {
            node_id: Some("from-flag".into()),
            ..Default::default()
        };
        let opts = global.load_options(&flags).unwrap();
        assert_eq!(opts.node_id, "from-flag");
        assert_eq!(opts.source_path, "/usr");
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from([
            "imagevol",
            "--debug",
            "serve",
            "--node-id",
            "n1",
            "--endpoint",
            "unix:///tmp/csi.sock",
        ])
        .unwrap();
        assert!(cli.global.debug);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.plugin.node_id.as_deref(), Some("n1"));
                assert!(!args.skip_reconcile);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
