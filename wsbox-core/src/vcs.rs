//! Host version control used when approved changes are promoted.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Output, Stdio};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;
use wsbox_config::VcsConfig;

/// What an approval commit records.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub message: String,
    /// Name of whoever approved the changes.
    pub actor: String,
    pub sandbox_id: Uuid,
}

#[async_trait]
pub trait VcsAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `root` lives inside a working tree this adapter manages.
    async fn is_tracked(&self, root: &Path) -> Result<bool>;

    /// Record `paths` (relative to `root`) in the index, including deletions.
    async fn stage(&self, root: &Path, paths: &[String]) -> Result<()>;

    /// Commit whatever [`VcsAdapter::stage`] recorded for `paths`. Returns
    /// `None` when nothing was staged.
    async fn commit(
        &self,
        root: &Path,
        paths: &[String],
        request: &CommitRequest,
    ) -> Result<Option<String>>;

    /// Roll back a failed approval: undo [`VcsAdapter::stage`] for `paths`.
    async fn rollback(&self, root: &Path, paths: &[String]) -> Result<()>;
}

/// `git` CLI adapter.
#[derive(Debug, Clone)]
pub struct GitAdapter {
    program: OsString,
    commit_trailer: bool,
    author_email_domain: String,
    run_hooks: bool,
}

impl GitAdapter {
    pub fn new(config: &VcsConfig) -> Self {
        Self {
            program: OsString::from("git"),
            commit_trailer: config.commit_trailer,
            author_email_domain: config.author_email_domain.clone(),
            run_hooks: config.run_hooks,
        }
    }

    fn command<I, S>(&self, root: &Path, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(root);
        cmd.env("LC_ALL", "C");
        cmd.env("GIT_CONFIG_NOSYSTEM", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["--no-pager", "-c", "color.ui=never"]);
        cmd.args(args);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn output(&self, mut cmd: Command, what: &str) -> Result<Output> {
        cmd.output()
            .await
            .with_context(|| format!("failed to execute git {what}"))
    }

    /// Run git and fail on a non-zero exit.
    async fn git(&self, root: &Path, args: &[&str], paths: &[String], what: &str) -> Result<Output> {
        let mut cmd = self.command(root, args);
        if !paths.is_empty() {
            cmd.arg("--");
            cmd.args(paths);
        }
        let output = self.output(cmd, what).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {what} failed: {}", stderr.trim()));
        }
        Ok(output)
    }

    /// Paths among `paths` that git ignores.
    async fn ignored(&self, root: &Path, paths: &[String]) -> Result<Vec<String>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        // `-z` is only accepted together with `--stdin`.
        let mut cmd = self.command(root, ["check-ignore", "--stdin", "-z"]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("failed to execute git check-ignore")?;
        let mut input = Vec::new();
        for path in paths {
            input.extend_from_slice(path.as_bytes());
            input.push(0);
        }
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("git check-ignore stdin unavailable"))?;
        // Feed stdin while stdout drains so a long path list cannot fill both pipes.
        let feed = async move {
            let written = stdin.write_all(&input).await;
            drop(stdin);
            written
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("failed to wait for git check-ignore")?;
        // 0: some paths ignored, 1: none ignored.
        match output.status.code() {
            Some(0) | Some(1) => {
                written.context("failed to write paths to git check-ignore")?;
                Ok(split_nul(&output.stdout))
            }
            _ => Err(anyhow!(
                "git check-ignore failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    async fn staged(&self, root: &Path, paths: &[String]) -> Result<Vec<String>> {
        let output = self
            .git(
                root,
                &["diff", "--cached", "--name-only", "--no-renames", "-z", "--relative"],
                paths,
                "diff --cached",
            )
            .await?;
        Ok(split_nul(&output.stdout))
    }

    fn author_email(&self, actor: &str) -> String {
        let local: String = actor
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let local = local.trim_matches('-');
        let local = if local.is_empty() { "wsbox" } else { local };
        format!("{local}@{}", self.author_email_domain)
    }

    fn message(&self, request: &CommitRequest) -> String {
        let message = request.message.trim();
        let message = if message.is_empty() {
            format!("Apply sandbox {} changes", request.sandbox_id)
        } else {
            message.to_string()
        };
        if self.commit_trailer {
            format!("{message}\n\nSandbox-Id: {}", request.sandbox_id)
        } else {
            message
        }
    }
}

fn split_nul(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

#[async_trait]
impl VcsAdapter for GitAdapter {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn is_tracked(&self, root: &Path) -> Result<bool> {
        let cmd = self.command(root, ["rev-parse", "--is-inside-work-tree"]);
        match self.output(cmd, "rev-parse").await {
            Ok(output) => Ok(output.status.success()
                && String::from_utf8_lossy(&output.stdout).trim() == "true"),
            Err(error) => {
                debug!(error = ?error, "git unavailable; treating tree as untracked");
                Ok(false)
            }
        }
    }

    async fn stage(&self, root: &Path, paths: &[String]) -> Result<()> {
        let ignored = self.ignored(root, paths).await?;
        let (present, absent): (Vec<String>, Vec<String>) = paths
            .iter()
            .filter(|path| !ignored.contains(path))
            .cloned()
            .partition(|path| std::fs::symlink_metadata(root.join(path)).is_ok());

        if !absent.is_empty() {
            self.git(
                root,
                &["rm", "-r", "-q", "--cached", "--ignore-unmatch"],
                &absent,
                "rm --cached",
            )
            .await?;
        }
        if !present.is_empty() {
            self.git(root, &["add", "-A"], &present, "add").await?;
        }
        if !ignored.is_empty() {
            debug!(count = ignored.len(), "ignored paths left out of the commit");
        }
        Ok(())
    }

    async fn commit(
        &self,
        root: &Path,
        paths: &[String],
        request: &CommitRequest,
    ) -> Result<Option<String>> {
        let staged = self.staged(root, paths).await?;
        if staged.is_empty() {
            return Ok(None);
        }

        let email = self.author_email(&request.actor);
        let message = self.message(request);
        let mut args = vec!["-c", "commit.gpgsign=false", "commit", "-q", "-m", &message];
        if !self.run_hooks {
            args.push("--no-verify");
        }
        let mut cmd = self.command(root, &args);
        cmd.env("GIT_AUTHOR_NAME", &request.actor)
            .env("GIT_AUTHOR_EMAIL", &email)
            .env("GIT_COMMITTER_NAME", &request.actor)
            .env("GIT_COMMITTER_EMAIL", &email)
            .arg("--")
            .args(&staged);
        let output = self.output(cmd, "commit").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(anyhow!("git commit failed: {detail}"));
        }

        let head = self.git(root, &["rev-parse", "HEAD"], &[], "rev-parse").await?;
        let hash = String::from_utf8_lossy(&head.stdout).trim().to_string();
        Ok(Some(hash))
    }

    async fn rollback(&self, root: &Path, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        if let Err(error) = self.git(root, &["reset", "-q", "HEAD"], paths, "reset").await {
            // An unborn branch has no HEAD to reset to.
            warn!(error = ?error, "git reset failed; dropping paths from the index instead");
            self.git(
                root,
                &["rm", "-r", "-q", "--cached", "--ignore-unmatch"],
                paths,
                "rm --cached",
            )
            .await?;
        }
        Ok(())
    }
}
