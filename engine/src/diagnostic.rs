//! `--diagnostic`: checks the engine can start with the given data directory

use colored::Colorize;
use tokio::process::Command;

use crate::storage::layout::StorageLayout;
use crate::storage::settings::{BackendKind, BackendSettings, Settings};
use crate::storage::state::StateStore;

enum Check {
    Pass(String),
    Warn(String),
    Fail(String),
}

fn print(name: &str, check: &Check) {
    match check {
        Check::Pass(detail) => println!("{} {:<16} {}", "✓".green(), name, detail),
        Check::Warn(detail) => println!("{} {:<16} {}", "!".yellow(), name, detail.yellow()),
        Check::Fail(detail) => println!("{} {:<16} {}", "✗".red(), name, detail.red()),
    }
}

fn backend(settings: &BackendSettings) -> Check {
    match (settings.kind, &settings.base_url) {
        (BackendKind::Local, _) => Check::Pass("local".to_string()),
        (BackendKind::Http, Some(url)) => Check::Pass(url.clone()),
        (BackendKind::Http, None) => Check::Fail("http backend without base_url".to_string()),
    }
}

/// Run every check, print the results, and report whether all passed
pub async fn run_diagnostic(layout: &StorageLayout, settings: Option<&Settings>) -> bool {
    println!("{}", "Shipyard diagnostic".bold());
    let mut checks = Vec::new();

    checks.push((
        "data directory",
        match layout.setup().await {
            Ok(()) => Check::Pass(layout.base_dir.display().to_string()),
            Err(e) => Check::Fail(e.to_string()),
        },
    ));

    checks.push((
        "state",
        match StateStore::open(layout.state_file()).await {
            Ok(state) => {
                let (projects, deployments) = state
                    .read(|data| (data.projects.len(), data.deployments.len()))
                    .await;
                Check::Pass(format!("{} projects, {} deployments", projects, deployments))
            }
            Err(e) => Check::Fail(e.to_string()),
        },
    ));

    checks.push((
        "git",
        match Command::new("git").arg("--version").output().await {
            Ok(output) if output.status.success() => {
                Check::Pass(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => Check::Fail(format!("git exited with {}", output.status)),
            Err(e) => Check::Fail(format!("git not found: {}", e)),
        },
    ));

    match settings {
        Some(settings) => {
            checks.push(("settings", Check::Pass(format!("{} workers", settings.concurrency))));
            checks.push(("object store", backend(&settings.object_store)));
            checks.push(("runtime", backend(&settings.runtime)));
            checks.push(("edge", backend(&settings.edge)));
            checks.push((
                "webhooks",
                match settings.webhook_secret {
                    Some(_) => Check::Pass("signature secret set".to_string()),
                    None => Check::Warn("no webhook_secret, pushes are rejected".to_string()),
                },
            ));
        }
        None => checks.push(("settings", Check::Fail("unreadable settings file".to_string()))),
    }

    for (name, check) in &checks {
        print(name, check);
    }
    checks.iter().all(|(_, check)| !matches!(check, Check::Fail(_)))
}
