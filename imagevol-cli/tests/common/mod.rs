use assert_cmd::Command;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// `imagevol` with an isolated root dir and a runtime socket that does
    /// not exist.
    pub fn new(subcommand: &str) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let mut cmd = Command::cargo_bin("imagevol").expect("binary");
        cmd.env_remove("IMAGEVOL_CONFIG")
            .env_remove("NODE_ID")
            .env_remove("CSI_ENDPOINT")
            .arg(subcommand)
            .arg("--node-id")
            .arg("test-node")
            .arg("--root-dir")
            .arg(home.path().join("volumes"))
            .arg("--endpoint")
            .arg(format!("unix://{}", home.path().join("csi.sock").display()))
            .arg("--runtime-endpoint")
            .arg(format!("unix://{}", home.path().join("missing.sock").display()))
            .arg("--connect-timeout-secs")
            .arg("1");
        Self { cmd, home }
    }
}
