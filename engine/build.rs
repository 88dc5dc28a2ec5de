//! Stamps the engine with the revision it was built from, reported by
//! `--version` and `GET /version`.

use std::process::Command;

use chrono::Utc;

fn main() {
    // release tarballs carry no .git, their packaging sets the revision
    let revision = std::env::var("SHIPYARD_REVISION").ok().or_else(|| {
        let output = Command::new("git")
            .args(["rev-parse", "--short=12", "HEAD"])
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    });

    println!(
        "cargo:rustc-env=SHIPYARD_REVISION={}",
        revision.unwrap_or_else(|| "unknown".to_string())
    );
    println!(
        "cargo:rustc-env=SHIPYARD_BUILT_AT={}",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    println!("cargo:rerun-if-env-changed=SHIPYARD_REVISION");
    println!("cargo:rerun-if-changed=../.git/HEAD");
}
