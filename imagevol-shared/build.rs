//! Build script to compile the CSI and CRI protocol definitions.
//!
//! CSI is compiled server-side only (imagevol is the plugin), CRI client-side
//! only (imagevol talks to the node's container runtime).

use std::process::Command;

fn protoc_version() -> Result<String, Box<dyn std::error::Error>> {
    let protoc = std::env::var("PROTOC").unwrap_or_else(|_| "protoc".to_string());
    let output = Command::new(&protoc).arg("--version").output()?;

    if !output.status.success() {
        return Err(format!("{} --version failed", protoc).into());
    }

    // "libprotoc 3.21.12"
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout
        .split_whitespace()
        .nth(1)
        .ok_or("Invalid protoc version output")?;
    Ok(version.to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = protoc_version() {
        return Err(format!(
            "Failed to run protoc: {}. imagevol-shared needs protoc (set PROTOC to override).",
            e
        )
        .into());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["proto/csi/v1/csi.proto"], &["proto"])?;

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/cri/v1/api.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/");
    Ok(())
}
