// build.rs - stamps build metadata used by src/build_info.rs

use std::env;
use std::process::Command;

fn main() {
    if env::var("CARGO_CFG_TEST").is_ok() {
        return;
    }

    println!("cargo:rerun-if-changed=Cargo.toml");

    println!(
        "cargo:rustc-env=RELAY_BUILD_TIMESTAMP={}",
        chrono::Utc::now().to_rfc3339()
    );

    let rustc_version = Command::new("rustc")
        .arg("--version")
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=RELAY_RUST_VERSION={}", rustc_version);

    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=RELAY_GIT_HASH={}", git_hash);
}
