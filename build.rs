//! Build script for devflow
//!
//! Stamps the binary with a UTC build time and the git revision it was built
//! from. `SOURCE_DATE_EPOCH` pins the stamp for reproducible builds.

use std::process::Command;

/// Stdout of a successful command, `None` if it failed or printed nothing
fn capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn build_stamp() -> String {
    const FORMAT: &str = "+%Y-%m-%dT%H:%M:%SZ";
    let pinned = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|epoch| capture("date", &["-u", "-d", &format!("@{epoch}"), FORMAT]));
    pinned
        .or_else(|| capture("date", &["-u", FORMAT]))
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=BUILD_STAMP={}", build_stamp());

    let revision = capture("git", &["describe", "--always", "--dirty", "--abbrev=10"])
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={revision}");

    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
