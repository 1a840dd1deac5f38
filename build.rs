//! Stamps the binary with its build time and source revision, exposed as
//! `DUET_BUILD_TIMESTAMP` and `DUET_GIT_COMMIT` for `env!`.

use std::process::Command;

fn main() {
    for watched in [".git/HEAD", ".git/index"] {
        println!("cargo:rerun-if-changed={}", watched);
    }

    let built_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let revision = short_revision().unwrap_or_else(|| String::from("unknown"));

    println!("cargo:rustc-env=DUET_BUILD_TIMESTAMP={}", built_at);
    println!("cargo:rustc-env=DUET_GIT_COMMIT={}", revision);
}

/// Abbreviated hash of HEAD, if this is a git checkout.
fn short_revision() -> Option<String> {
    let out = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())?;
    let hash = String::from_utf8(out.stdout).ok()?;
    Some(hash.trim().to_owned()).filter(|hash| !hash.is_empty())
}
