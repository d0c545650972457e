//! Git operations the merge queue needs, behind a trait.
//!
//! [`GitCli`] shells out to `git` inside the refinery's clone. Every child is
//! spawned with `kill_on_drop`, so a stage timeout that drops the future also
//! stops the process. Test commands run in their own process group, which is
//! killed as a whole so nothing they started outlives the stage.
//!
//! A dropped rebase can leave the clone mid-rebase. Every operation that
//! checks something out first aborts such a leftover.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::{layout::DEFAULT_REMOTE, Error, Result};

/// How to replay a candidate onto the target tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseStrategy {
    /// Plain rebase; any conflict aborts.
    Standard,
    /// Conflicting hunks resolve to the candidate's version.
    PreferCandidate,
}

impl std::fmt::Display for RebaseStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::PreferCandidate => write!(f, "prefer-candidate"),
        }
    }
}

/// A branch on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBranch {
    pub name: String,
    pub head: String,
    pub committed_at: DateTime<Utc>,
}

/// Outcome of one test command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub rev: String,
    pub passed: bool,
    /// Trailing output, for notifications and issues.
    pub output: String,
}

impl TestRun {
    /// Convert a failed run into [`Error::TestFailure`].
    pub fn into_failure(self) -> Error {
        Error::TestFailure {
            summary: summarize(&self.output),
            rev: self.rev,
        }
    }
}

/// Last few lines of command output.
pub fn summarize(output: &str) -> String {
    const KEEP: usize = 20;
    let lines: Vec<&str> = output.lines().collect();
    lines[lines.len().saturating_sub(KEEP)..].join("\n")
}

/// Repository primitives used by the merge queue engine.
///
/// Branch names are remote branch names (`polecat/ace/fix-auth`); `target`
/// is the integration branch (`main`).
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Update remote-tracking refs.
    async fn fetch(&self) -> Result<()>;

    /// Current remote tip of `branch`.
    async fn remote_head(&self, branch: &str) -> Result<String>;

    /// Remote branches whose name starts with `prefix`.
    async fn list_remote_branches(&self, prefix: &str) -> Result<Vec<RemoteBranch>>;

    async fn merge_base(&self, a: &str, b: &str) -> Result<String>;

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;

    /// Replay the remote `branch` onto `onto` and return the new head.
    ///
    /// Always starts from the remote tip, so repeating it is safe. Conflicts
    /// abort the rebase and return [`Error::RebaseConflict`]; a rebase that
    /// fails without conflicted paths is an [`Error::Git`].
    async fn rebase(&self, branch: &str, onto: &str, strategy: RebaseStrategy) -> Result<String>;

    /// Run `command` against a checkout of `rev`.
    async fn run_tests(&self, rev: &str, command: &str) -> Result<TestRun>;

    /// Move the local `target` to `rev`, fast-forward only. Returns the new head.
    async fn fast_forward(&self, target: &str, rev: &str) -> Result<String>;

    /// Push the local `target` to the remote; [`Error::PushRejected`] if it moved.
    async fn push(&self, target: &str) -> Result<()>;

    /// Discard local `target` state and point it at the remote tip.
    async fn reset_to_remote(&self, target: &str) -> Result<()>;

    async fn delete_remote_branch(&self, branch: &str) -> Result<()>;
}

/// [`GitOps`] backed by the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
    remote: String,
}

struct CommandOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Kills a whole process group when dropped.
#[cfg(unix)]
struct GroupGuard(Option<u32>);

#[cfg(unix)]
impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.0.take() {
            let _ = std::process::Command::new("kill")
                .args(["-KILL", "--", &format!("-{pgid}")])
                .stderr(Stdio::null())
                .output();
        }
    }
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            remote: DEFAULT_REMOTE.to_string(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{branch}", self.remote)
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::io(&self.workdir, e))?;

        Ok(output.into())
    }

    /// Run a shell command as leader of a new process group. The group is
    /// killed when the command finishes or the future is dropped.
    #[cfg(unix)]
    async fn exec_shell(&self, command: &str) -> Result<CommandOutput> {
        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.workdir)
            .process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(&self.workdir, e))?;
        let _group = GroupGuard(child.id());

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::io(&self.workdir, e))?;
        Ok(output.into())
    }

    #[cfg(not(unix))]
    async fn exec_shell(&self, command: &str) -> Result<CommandOutput> {
        self.exec("cmd", &["/C", command]).await
    }

    async fn git_raw(&self, args: &[&str]) -> Result<CommandOutput> {
        tracing::trace!(args = ?args, "git");
        self.exec("git", args).await
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let out = self.git_raw(args).await?;
        if out.success {
            Ok(out.stdout.trim().to_string())
        } else {
            Err(Error::Git {
                command: args.first().copied().unwrap_or("git").to_string(),
                detail: out.stderr.trim().to_string(),
            })
        }
    }

    async fn head(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"]).await
    }

    /// Abort a rebase an interrupted stage left behind and drop its changes.
    async fn clear_interrupted_rebase(&self) -> Result<()> {
        let git_dir = self.workdir.join(self.git(&["rev-parse", "--git-dir"]).await?);
        let in_progress = ["rebase-merge", "rebase-apply"]
            .iter()
            .any(|state| git_dir.join(state).exists());
        if !in_progress {
            return Ok(());
        }

        tracing::warn!(workdir = %self.workdir.display(), "aborting interrupted rebase");
        if !self.git_raw(&["rebase", "--abort"]).await?.success {
            self.git(&["rebase", "--quit"]).await?;
        }
        self.git(&["reset", "--hard"]).await.map(|_| ())
    }
}

fn parse_branch_line(line: &str) -> Option<RemoteBranch> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    let head = fields.next()?.trim();
    let date = fields.next()?.trim();
    let committed_at = DateTime::parse_from_rfc3339(date).ok()?.with_timezone(&Utc);
    if name.is_empty() || head.is_empty() {
        return None;
    }
    Some(RemoteBranch {
        name: name.to_string(),
        head: head.to_string(),
        committed_at,
    })
}

fn is_push_rejection(stderr: &str) -> bool {
    ["[rejected]", "non-fast-forward", "fetch first", "failed to push some refs"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

#[async_trait]
impl GitOps for GitCli {
    async fn fetch(&self) -> Result<()> {
        self.git(&["fetch", "--prune", &self.remote]).await.map(|_| ())
    }

    async fn remote_head(&self, branch: &str) -> Result<String> {
        self.git(&["rev-parse", &self.remote_ref(branch)]).await
    }

    async fn list_remote_branches(&self, prefix: &str) -> Result<Vec<RemoteBranch>> {
        let pattern = self.remote_ref(prefix.trim_end_matches('/'));
        let listing = self
            .git(&[
                "for-each-ref",
                "--format=%(refname:lstrip=3)%09%(objectname)%09%(committerdate:iso-strict)",
                &pattern,
            ])
            .await?;

        Ok(listing.lines().filter_map(parse_branch_line).collect())
    }

    async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        self.git(&["merge-base", a, b]).await
    }

    async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let out = self
            .git_raw(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        match out.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::Git {
                command: "merge-base".to_string(),
                detail: out.stderr.trim().to_string(),
            }),
        }
    }

    async fn rebase(&self, branch: &str, onto: &str, strategy: RebaseStrategy) -> Result<String> {
        self.clear_interrupted_rebase().await?;
        let source = self.remote_ref(branch);
        self.git(&["checkout", "--force", "-B", branch, &source])
            .await?;

        let mut args = vec!["rebase"];
        if strategy == RebaseStrategy::PreferCandidate {
            // During a rebase "theirs" is the commit being replayed
            args.extend(["-X", "theirs"]);
        }
        args.push(onto);

        let out = self.git_raw(&args).await?;
        if out.success {
            return self.head().await;
        }

        let conflicted = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .await
            .unwrap_or_default();
        self.clear_interrupted_rebase().await?;

        if conflicted.is_empty() {
            return Err(Error::Git {
                command: "rebase".to_string(),
                detail: out.stderr.trim().to_string(),
            });
        }
        Err(Error::RebaseConflict {
            branch: branch.to_string(),
            onto: onto.to_string(),
            detail: conflicted.lines().collect::<Vec<_>>().join(", "),
        })
    }

    async fn run_tests(&self, rev: &str, command: &str) -> Result<TestRun> {
        self.clear_interrupted_rebase().await?;
        self.git(&["checkout", "--force", "--detach", rev]).await?;
        let out = self.exec_shell(command).await?;

        Ok(TestRun {
            rev: rev.to_string(),
            passed: out.success,
            output: format!("{}{}", out.stdout, out.stderr),
        })
    }

    async fn fast_forward(&self, target: &str, rev: &str) -> Result<String> {
        self.clear_interrupted_rebase().await?;
        let source = self.remote_ref(target);
        self.git(&["checkout", "--force", "-B", target, &source])
            .await?;
        self.git(&["merge", "--ff-only", rev]).await?;
        self.head().await
    }

    async fn push(&self, target: &str) -> Result<()> {
        let refspec = format!("{target}:{target}");
        let out = self.git_raw(&["push", &self.remote, &refspec]).await?;
        if out.success {
            Ok(())
        } else if is_push_rejection(&out.stderr) {
            Err(Error::PushRejected {
                target: target.to_string(),
                detail: out.stderr.trim().to_string(),
            })
        } else {
            Err(Error::Git {
                command: "push".to_string(),
                detail: out.stderr.trim().to_string(),
            })
        }
    }

    async fn reset_to_remote(&self, target: &str) -> Result<()> {
        self.clear_interrupted_rebase().await?;
        let source = self.remote_ref(target);
        self.git(&["checkout", "--force", "-B", target, &source])
            .await
            .map(|_| ())
    }

    async fn delete_remote_branch(&self, branch: &str) -> Result<()> {
        self.git(&["push", &self.remote, "--delete", branch])
            .await
            .map(|_| ())
    }
}
