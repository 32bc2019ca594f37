//! Stamps the `heos-control` binary with a version and commit.
//!
//! `HEOS_VERSION` overrides the package version. The commit comes from
//! `HEOS_GIT_SHA`, then CI's `GITHUB_SHA`, then the local checkout.

use std::env;
use std::process::Command;

const SHORT_SHA: usize = 7;

fn main() {
    for var in ["HEOS_VERSION", "HEOS_GIT_SHA", "GITHUB_SHA"] {
        println!("cargo:rerun-if-env-changed={}", var);
    }

    let version = env::var("HEOS_VERSION")
        .or_else(|_| env::var("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| "unknown".to_string());

    let commit = env::var("HEOS_GIT_SHA")
        .ok()
        .or_else(|| env::var("GITHUB_SHA").ok().map(short_sha))
        .or_else(local_commit)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=HEOS_VERSION={}", version);
    println!("cargo:rustc-env=HEOS_GIT_SHA={}", commit);
}

fn short_sha(sha: String) -> String {
    sha.chars().take(SHORT_SHA).collect()
}

fn local_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8(output.stdout).ok()?;
    Some(sha.trim().to_string())
}
