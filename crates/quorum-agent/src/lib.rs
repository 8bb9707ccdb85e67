pub mod command;
pub mod extract;
pub mod http;
pub mod prompt;

use std::sync::Arc;

use anyhow::Result;
use quorum_core::{agent::ReviewerAgent, config::Config};

pub use command::CommandReviewer;
pub use http::HttpReviewer;

/// One reviewer per configured category, all on the configured backend.
pub fn build_panel(config: &Config) -> Result<Vec<Arc<dyn ReviewerAgent>>> {
    if config.reviewer_categories.is_empty() {
        anyhow::bail!("REVIEWER_CATEGORIES must name at least one category");
    }
    let panel = match config.reviewer_backend.as_str() {
        "http" => {
            if config.reviewer_url.is_empty() {
                anyhow::bail!("REVIEWER_BACKEND=http requires REVIEWER_URL");
            }
            config
                .reviewer_categories
                .iter()
                .map(|c| {
                    Arc::new(
                        HttpReviewer::new(c, &config.reviewer_url, &config.reviewer_model)
                            .with_timeout(config.reviewer_timeout_s),
                    ) as Arc<dyn ReviewerAgent>
                })
                .collect()
        }
        "command" => config
            .reviewer_categories
            .iter()
            .map(|c| {
                Arc::new(
                    CommandReviewer::new(c, &config.reviewer_bin, &config.reviewer_model)
                        .with_timeout(config.reviewer_timeout_s),
                ) as Arc<dyn ReviewerAgent>
            })
            .collect(),
        other => anyhow::bail!("unknown REVIEWER_BACKEND {other:?} (expected command or http)"),
    };
    Ok(panel)
}
