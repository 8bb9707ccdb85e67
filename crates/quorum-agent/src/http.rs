use anyhow::{Context, Result};
use async_trait::async_trait;
use quorum_core::agent::{ReviewRequest, ReviewerAgent};
use serde::Serialize;
use tracing::{info, warn};

use crate::extract::extract_findings;

/// Posts each review to an HTTP reviewer endpoint.
///
/// The endpoint receives `{job_id, diff, files, reviewer_category, model,
/// prompt}` and answers with a JSON array of findings, an object carrying a
/// `findings` array, or text containing either.
pub struct HttpReviewer {
    id: String,
    category: String,
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
    client: reqwest::Client,
}

impl HttpReviewer {
    pub fn new(
        category: impl Into<String>,
        url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let category = category.into();
        Self {
            id: format!("http-{category}"),
            category,
            url: url.into(),
            model: model.into(),
            timeout_secs: 300,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Serialize)]
struct HttpReviewBody<'a> {
    #[serde(flatten)]
    request: &'a ReviewRequest,
    model: &'a str,
    prompt: String,
}

#[async_trait]
impl ReviewerAgent for HttpReviewer {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> &str {
        &self.category
    }

    async fn review(&self, request: &ReviewRequest) -> Result<Vec<serde_json::Value>> {
        let body = HttpReviewBody {
            request,
            model: &self.model,
            prompt: crate::prompt::build_review_prompt(request),
        };

        info!(
            job_id = %request.job_id,
            reviewer = %self.id,
            url = %self.url,
            "calling reviewer endpoint"
        );

        let response = self
            .client
            .post(&self.url)
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("reviewer request to {} failed", self.url))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read reviewer response")?;
        if !status.is_success() {
            warn!(
                job_id = %request.job_id,
                reviewer = %self.id,
                status = %status,
                "reviewer endpoint returned an error"
            );
            anyhow::bail!("reviewer endpoint returned {status}: {}", text.trim());
        }

        let findings = extract_findings(&text)
            .context("reviewer response contained no JSON finding list")?;
        info!(
            job_id = %request.job_id,
            reviewer = %self.id,
            findings = findings.len(),
            "reviewer response received"
        );
        Ok(findings)
    }
}
