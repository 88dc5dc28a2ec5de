//! Fetching the exact source revision into a sandbox

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::deploy::logstream::LogStream;
use crate::deploy::sandbox::{Sandbox, StepError};
use crate::filesys::dir::Dir;
use crate::models::deployment::{BuildStep, SourceRevision};

/// Everything a fetcher needs for one deployment
pub struct FetchContext<'a> {
    pub repo_url: &'a str,
    pub revision: &'a SourceRevision,
    pub sandbox: &'a Sandbox,
    pub timeout: Duration,
    pub log: &'a LogStream,
    pub cancel: &'a CancellationToken,
}

/// Source of revisions
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Place the tree of `ctx.revision` into the sandbox source directory
    async fn fetch(&self, ctx: FetchContext<'_>) -> Result<(), StepError>;
}

/// Shallow git fetch of a single commit
#[derive(Debug, Clone, Default)]
pub struct GitFetcher;

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, ctx: FetchContext<'_>) -> Result<(), StepError> {
        info!(
            "Fetching {} at {} ({})",
            ctx.repo_url, ctx.revision.commit, ctx.revision.branch
        );
        let deadline = Instant::now() + ctx.timeout;
        let src = ctx.sandbox.source_dir();

        git(&ctx, &src, deadline, &["init", "-q"]).await?;
        git(&ctx, &src, deadline, &["remote", "add", "--", "origin", ctx.repo_url]).await?;

        let by_commit = git(
            &ctx,
            &src,
            deadline,
            &["fetch", "-q", "--depth", "1", "--", "origin", &ctx.revision.commit],
        )
        .await;
        match by_commit {
            Ok(()) => {}
            Err(StepError::Exit { .. }) => {
                // servers that refuse fetching unadvertised commits
                ctx.log
                    .system(
                        Some(BuildStep::Fetch),
                        format!("Commit not fetchable directly, fetching branch {}", ctx.revision.branch),
                    )
                    .await;
                git(&ctx, &src, deadline, &["fetch", "-q", "--", "origin", &ctx.revision.branch])
                    .await?;
            }
            Err(e) => return Err(e),
        }

        git(
            &ctx,
            &src,
            deadline,
            &["checkout", "-q", "--detach", &ctx.revision.commit, "--"],
        )
        .await
    }
}

async fn git(
    ctx: &FetchContext<'_>,
    cwd: &Dir,
    deadline: Instant,
    args: &[&str],
) -> Result<(), StepError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(StepError::TimedOut(ctx.timeout));
    }
    let argv = std::iter::once("git")
        .chain(args.iter().copied())
        .map(String::from)
        .collect();
    ctx.sandbox
        .run(argv, cwd.path(), BuildStep::Fetch, remaining, ctx.log, ctx.cancel)
        .await
        .map_err(|e| match e {
            StepError::TimedOut(_) => StepError::TimedOut(ctx.timeout),
            other => other,
        })
}

/// Copies a local directory named by the repository URL.
///
/// Used for locally mounted sources; the revision is recorded but not
/// resolved.
#[derive(Debug, Clone, Default)]
pub struct CopyFetcher;

#[async_trait]
impl SourceFetcher for CopyFetcher {
    async fn fetch(&self, ctx: FetchContext<'_>) -> Result<(), StepError> {
        let path = ctx.repo_url.strip_prefix("file://").unwrap_or(ctx.repo_url);
        if !Path::new(path).is_dir() {
            return Err(StepError::Spawn(format!("source directory {} does not exist", path)));
        }
        let source = Dir::new(path);
        let dest = ctx.sandbox.source_dir();
        let copy = source.copy_to(dest.path());
        let bytes = tokio::select! {
            result = copy => result.map_err(|e| StepError::Spawn(e.to_string()))?,
            _ = tokio::time::sleep(ctx.timeout) => return Err(StepError::TimedOut(ctx.timeout)),
            _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
        };
        ctx.log
            .system(
                Some(BuildStep::Fetch),
                format!("Copied {} bytes from {} ({})", bytes, path, ctx.revision.commit),
            )
            .await;
        Ok(())
    }
}
