use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quorum_core::agent::{ReviewRequest, ReviewerAgent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::extract::{extract_findings, final_text};

/// Runs a review CLI (Claude Code by default) as a subprocess in the leased
/// worktree and parses findings from its output.
pub struct CommandReviewer {
    id: String,
    category: String,
    /// Path to the CLI binary.
    pub bin: String,
    pub model: String,
    /// Kill the subprocess after this many seconds (0 = no limit).
    pub timeout_s: u64,
}

impl CommandReviewer {
    pub fn new(
        category: impl Into<String>,
        bin: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let category = category.into();
        Self {
            id: format!("cli-{category}"),
            category,
            bin: bin.into(),
            model: model.into(),
            timeout_s: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    fn args(&self, prompt: String) -> Vec<String> {
        let mut args = Vec::new();
        if !self.model.is_empty() {
            args.push("--model".to_string());
            args.push(self.model.clone());
        }
        args.extend([
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            "Read,Glob,Grep".to_string(),
            "--print".to_string(),
            prompt,
        ]);
        args
    }
}

#[async_trait]
impl ReviewerAgent for CommandReviewer {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> &str {
        &self.category
    }

    async fn review(&self, request: &ReviewRequest) -> Result<Vec<serde_json::Value>> {
        let prompt = crate::prompt::build_review_prompt(request);

        let mut cmd = Command::new(&self.bin);
        cmd.args(self.args(prompt))
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &request.worktree {
            cmd.current_dir(dir);
        }

        info!(
            job_id = %request.job_id,
            reviewer = %self.id,
            bin = %self.bin,
            "spawning reviewer subprocess"
        );
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn reviewer: {}", self.bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let job_id = request.job_id.clone();
        let reviewer = self.id.clone();

        let io_future = async move {
            let mut raw = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();
            let mut stderr_open = true;

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                raw.push_str(&l);
                                raw.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line(), if stderr_open => {
                        match line {
                            Ok(Some(l)) if !l.is_empty() => {
                                warn!(job_id = %job_id, reviewer = %reviewer, "reviewer stderr: {l}");
                            }
                            Ok(Some(_)) => {}
                            _ => stderr_open = false,
                        }
                    }
                }
            }

            let status = child.wait().await.context("failed to wait for reviewer")?;
            anyhow::Ok((raw, status))
        };

        let (raw, status) = if self.timeout_s > 0 {
            tokio::time::timeout(std::time::Duration::from_secs(self.timeout_s), io_future)
                .await
                .map_err(|_| anyhow::anyhow!("reviewer subprocess timed out after {}s", self.timeout_s))??
        } else {
            io_future.await?
        };

        if !status.success() {
            anyhow::bail!("reviewer exited with {status}");
        }

        let text = final_text(&raw).map_err(|msg| anyhow::anyhow!("reviewer reported an error: {msg}"))?;
        let findings = match extract_findings(&text) {
            Some(f) => f,
            None => {
                warn!(
                    job_id = %request.job_id,
                    reviewer = %self.id,
                    output_len = text.len(),
                    "no finding list in reviewer output"
                );
                anyhow::bail!("reviewer output contained no JSON finding list");
            }
        };

        info!(
            job_id = %request.job_id,
            reviewer = %self.id,
            findings = findings.len(),
            "reviewer subprocess finished"
        );
        Ok(findings)
    }
}
