use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::EdgeConfig;
use crate::error::{OverseerError, Result};

/// Version-control operations a promotion needs, as opaque calls.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Current head of the edge's source branch.
    async fn source_head(&self, edge: &EdgeConfig) -> Result<String>;

    /// Commit and feature-commit counts on the source branch after `since`.
    /// With no baseline, counts the whole branch.
    async fn count_since(&self, edge: &EdgeConfig, since: Option<&str>) -> Result<(u64, u64)>;

    /// Merge source into target; returns the merge ref on the target branch.
    async fn merge(&self, edge: &EdgeConfig) -> Result<String>;

    /// Most recent tag matching the edge's prefix, if any.
    async fn latest_tag(&self, edge: &EdgeConfig) -> Result<Option<String>>;

    async fn tag(&self, edge: &EdgeConfig, name: &str) -> Result<()>;

    /// Hard-reset the target branch to `git_ref`, dropping the merge.
    async fn revert_to(&self, edge: &EdgeConfig, git_ref: &str) -> Result<()>;

    /// Head of the target branch, used as the rollback point.
    async fn target_head(&self, edge: &EdgeConfig) -> Result<String>;
}

/// Runs a git subcommand in `repo`, returning trimmed stdout.
async fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OverseerError::Vcs(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `Vcs` backed by the git CLI.
#[derive(Debug, Default)]
pub struct GitVcs;

#[async_trait]
impl Vcs for GitVcs {
    async fn source_head(&self, edge: &EdgeConfig) -> Result<String> {
        git(&edge.repo_path, &["rev-parse", &edge.source_branch]).await
    }

    async fn count_since(&self, edge: &EdgeConfig, since: Option<&str>) -> Result<(u64, u64)> {
        let range = match since {
            Some(baseline) => format!("{baseline}..{}", edge.source_branch),
            None => edge.source_branch.clone(),
        };
        let log = git(&edge.repo_path, &["log", "--format=%s", &range]).await?;
        let mut commits = 0;
        let mut features = 0;
        for subject in log.lines().filter(|l| !l.is_empty()) {
            commits += 1;
            if subject.starts_with(&edge.feature_marker) {
                features += 1;
            }
        }
        Ok((commits, features))
    }

    async fn merge(&self, edge: &EdgeConfig) -> Result<String> {
        git(&edge.repo_path, &["checkout", &edge.target_branch]).await?;
        git(
            &edge.repo_path,
            &[
                "merge",
                "--no-ff",
                &edge.source_branch,
                "-m",
                &format!("Promote {} into {}", edge.source_branch, edge.target_branch),
            ],
        )
        .await?;
        git(&edge.repo_path, &["rev-parse", "HEAD"]).await
    }

    async fn latest_tag(&self, edge: &EdgeConfig) -> Result<Option<String>> {
        let pattern = format!("{}*", edge.tag_prefix);
        let out = git(
            &edge.repo_path,
            &["tag", "--list", &pattern, "--sort=-v:refname"],
        )
        .await?;
        Ok(out.lines().next().map(str::to_string))
    }

    async fn tag(&self, edge: &EdgeConfig, name: &str) -> Result<()> {
        git(&edge.repo_path, &["tag", name]).await?;
        Ok(())
    }

    async fn revert_to(&self, edge: &EdgeConfig, git_ref: &str) -> Result<()> {
        git(&edge.repo_path, &["checkout", &edge.target_branch]).await?;
        git(&edge.repo_path, &["reset", "--hard", git_ref]).await?;
        Ok(())
    }

    async fn target_head(&self, edge: &EdgeConfig) -> Result<String> {
        git(&edge.repo_path, &["rev-parse", &edge.target_branch]).await
    }
}

/// Next tag in the edge's series: bump the patch of the latest, or start
/// the series at `<prefix>0.1.0`.
pub fn next_tag(prefix: &str, latest: Option<&str>) -> String {
    if let Some(latest) = latest {
        let bare = latest.strip_prefix(prefix).unwrap_or(latest);
        let parts: Vec<u64> = bare.split('.').filter_map(|p| p.parse().ok()).collect();
        if parts.len() == 3 {
            return format!("{prefix}{}.{}.{}", parts[0], parts[1], parts[2] + 1);
        }
    }
    format!("{prefix}0.1.0")
}
