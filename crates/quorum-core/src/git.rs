use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin wrapper over the `git` CLI rooted at the integration repository.
#[derive(Debug, Clone)]
pub struct Git {
    pub repo_path: String,
    author: Option<(String, String)>,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            author: None,
        }
    }

    /// Identity used for merge and revert commits. Ignored when either part is empty.
    pub fn with_author(mut self, name: &str, email: &str) -> Self {
        if !name.is_empty() && !email.is_empty() {
            self.author = Some((name.to_string(), email.to_string()));
        }
        self
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        self.exec_env(dir, args, &[])
    }

    pub fn exec_env(&self, dir: &str, args: &[&str], env: &[(&str, &str)]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Runs a command that creates commits, with the configured author if any.
    fn exec_committing(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        match &self.author {
            Some((name, email)) => self.exec_env(
                dir,
                args,
                &[
                    ("GIT_AUTHOR_NAME", name.as_str()),
                    ("GIT_AUTHOR_EMAIL", email.as_str()),
                    ("GIT_COMMITTER_NAME", name.as_str()),
                    ("GIT_COMMITTER_EMAIL", email.as_str()),
                ],
            ),
            None => self.exec(dir, args),
        }
    }

    fn run(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(dir, args)?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed in {dir}: {}",
                args.join(" "),
                result.combined_output()
            ));
        }
        Ok(result)
    }

    // ── Worktrees ─────────────────────────────────────────────────────────

    pub fn worktree_add_detached(&self, path: &str, rev: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["worktree", "add", "--detach", path, rev])?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add failed for {path} at {rev}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn prune_worktrees(&self) -> Result<()> {
        self.run(&self.repo_path, &["worktree", "prune"])?;
        Ok(())
    }

    /// Returns a worktree to a pristine detached checkout of `rev`.
    pub fn reset_worktree(&self, dir: &str, rev: &str) -> Result<()> {
        let _ = self.abort_rebase(dir);
        let _ = self.abort_merge(dir);
        self.reset_hard(dir, "HEAD")?;
        self.run(dir, &["clean", "-fdx"])?;
        self.checkout_detached(dir, rev)
    }

    // ── Refs ──────────────────────────────────────────────────────────────

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        self.rev_parse_in(&self.repo_path, refname)
    }

    pub fn rev_parse_in(&self, dir: &str, refname: &str) -> Result<String> {
        let result = self.exec(dir, &["rev-parse", "--verify", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse {refname} failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        let result = self.exec(&self.repo_path, &["checkout", branch])?;
        if !result.success() {
            return Err(anyhow!(
                "git checkout {branch} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn checkout_detached(&self, dir: &str, rev: &str) -> Result<()> {
        self.run(dir, &["checkout", "--detach", rev])?;
        Ok(())
    }

    pub fn reset_hard(&self, dir: &str, ref_: &str) -> Result<()> {
        let result = self.exec(dir, &["reset", "--hard", ref_])?;
        if !result.success() {
            return Err(anyhow!(
                "git reset --hard {ref_} failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    // ── Rebase / merge / revert ───────────────────────────────────────────

    pub fn rebase_onto(&self, worktree_path: &str, upstream: &str) -> Result<()> {
        let result = self.exec_committing(worktree_path, &["rebase", upstream])?;
        if !result.success() {
            return Err(anyhow!(
                "git rebase {upstream} failed in {worktree_path}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn abort_rebase(&self, dir: &str) -> Result<ExecResult> {
        self.exec(dir, &["rebase", "--abort"])
    }

    pub fn abort_merge(&self, dir: &str) -> Result<ExecResult> {
        self.exec(dir, &["merge", "--abort"])
    }

    /// Merges `rev` into `target` with a merge commit; returns the merge commit sha.
    /// A conflicting merge is aborted before the error is returned.
    pub fn merge_no_ff(&self, target: &str, rev: &str, message: &str) -> Result<String> {
        self.checkout(target)?;
        let merge =
            self.exec_committing(&self.repo_path, &["merge", "--no-ff", "-m", message, rev])?;
        if !merge.success() {
            let _ = self.abort_merge(&self.repo_path);
            return Err(anyhow!(
                "git merge --no-ff {rev} failed: {}",
                merge.combined_output()
            ));
        }
        self.rev_parse("HEAD")
    }

    /// Reverts a merge commit on the currently checked-out branch; returns the new head.
    pub fn revert_merge(&self, merge_commit: &str) -> Result<String> {
        let result = self.exec_committing(
            &self.repo_path,
            &["revert", "-m", "1", "--no-edit", merge_commit],
        )?;
        if !result.success() {
            let _ = self.exec(&self.repo_path, &["revert", "--abort"]);
            return Err(anyhow!(
                "git revert -m 1 {merge_commit} failed: {}",
                result.combined_output()
            ));
        }
        self.rev_parse("HEAD")
    }

    /// Reverts an ordinary commit on the worktree's HEAD; returns the new HEAD.
    pub fn revert_in(&self, dir: &str, commit: &str) -> Result<String> {
        let result = self.exec_committing(dir, &["revert", "--no-edit", commit])?;
        if !result.success() {
            let _ = self.exec(dir, &["revert", "--abort"]);
            return Err(anyhow!(
                "git revert {commit} failed in {dir}: {}",
                result.combined_output()
            ));
        }
        self.rev_parse_in(dir, "HEAD")
    }

    pub fn is_ancestor_in(&self, dir: &str, ancestor: &str, rev: &str) -> Result<bool> {
        let result = self.exec(dir, &["merge-base", "--is-ancestor", ancestor, rev])?;
        match result.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(anyhow!(
                "git merge-base --is-ancestor {ancestor} {rev} failed: {}",
                result.combined_output()
            )),
        }
    }

    /// True when the two revisions have byte-identical trees.
    pub fn trees_identical(&self, a: &str, b: &str) -> Result<bool> {
        let result = self.exec(&self.repo_path, &["diff", "--quiet", a, b])?;
        match result.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(anyhow!(
                "git diff --quiet {a} {b} failed: {}",
                result.combined_output()
            )),
        }
    }

    pub fn status_clean(&self, dir: &str) -> Result<bool> {
        let result = self.exec(dir, &["status", "--porcelain"])?;
        Ok(result.stdout.trim().is_empty() && result.exit_code == 0)
    }
}
