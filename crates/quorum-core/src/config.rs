use std::{collections::HashMap, time::Duration};

use anyhow::Result;

use crate::db::Db;

/// Full service configuration.
/// Non-sensitive tunables are seeded to and loaded from the DB `config` table.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // HTTP
    pub web_bind: String,
    pub web_port: u16,
    pub max_body_bytes: usize,

    // Admission control
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_s: f64,

    // Worktree pool
    pub max_worktrees: usize,
    pub lease_acquire_timeout_s: u64,
    pub lease_stale_hours: i64,
    pub sweep_interval_s: u64,

    // Review jobs
    pub job_timeout_s: u64,
    pub reviewer_timeout_s: u64,
    pub max_pending_jobs: u32,
    pub reviewer_categories: Vec<String>,
    /// "command" (default) or "http".
    pub reviewer_backend: String,
    pub reviewer_url: String,
    pub reviewer_bin: String,
    pub reviewer_model: String,

    // Merge engine
    /// Empty disables the merge engine and the pool falls back to scratch dirs.
    pub integration_repo: String,
    pub integration_branch: String,
    pub unit_test_cmd: String,
    pub integration_test_cmd: String,
    pub merge_retry_budget: u32,
    pub bypass_ttl_hours: i64,
    /// Shared secret for operator-only actions. Empty disables bypass.
    pub operator_token: String,

    // Git attribution
    pub git_author_name: String,
    pub git_author_email: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "store".into(),
            web_bind: "127.0.0.1".into(),
            web_port: 3141,
            max_body_bytes: 1024 * 1024,
            rate_limit_capacity: 10,
            rate_limit_refill_per_s: 10.0,
            max_worktrees: 10,
            lease_acquire_timeout_s: 30,
            lease_stale_hours: 24,
            sweep_interval_s: 300,
            job_timeout_s: 600,
            reviewer_timeout_s: 300,
            max_pending_jobs: 100,
            reviewer_categories: DEFAULT_CATEGORIES.iter().map(|s| s.to_string()).collect(),
            reviewer_backend: "command".into(),
            reviewer_url: String::new(),
            reviewer_bin: "claude".into(),
            reviewer_model: "claude-sonnet-4-6".into(),
            integration_repo: String::new(),
            integration_branch: "main".into(),
            unit_test_cmd: String::new(),
            integration_test_cmd: String::new(),
            merge_retry_budget: 2,
            bypass_ttl_hours: 24,
            operator_token: String::new(),
            git_author_name: String::new(),
            git_author_email: String::new(),
        }
    }
}

pub const DEFAULT_CATEGORIES: &[&str] = &[
    "security",
    "reliability",
    "correctness",
    "performance",
    "maintainability",
];

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_parsed<T: std::str::FromStr>(key: &str, dotenv: &HashMap<String, String>, default: T) -> T {
    get(key, dotenv)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma-separated list; blanks dropped, case folded, duplicates removed in order.
pub fn parse_categories(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for c in raw.split(',') {
        let c = c.trim().to_lowercase();
        if !c.is_empty() && !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

impl Config {
    pub fn db_path(&self) -> String {
        format!("{}/quorum.db", self.data_dir)
    }

    pub fn worktree_root(&self) -> String {
        format!("{}/worktrees", self.data_dir)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_s)
    }

    pub fn reviewer_timeout(&self) -> Duration {
        Duration::from_secs(self.reviewer_timeout_s)
    }

    pub fn lease_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_acquire_timeout_s)
    }

    pub fn merge_enabled(&self) -> bool {
        !self.integration_repo.is_empty()
    }

    /// Write all non-sensitive fields to DB if not already present (first-run seeding).
    pub fn seed_db(&self, db: &Db) -> Result<()> {
        let entries: &[(&str, String)] = &[
            ("rate_limit_capacity", self.rate_limit_capacity.to_string()),
            (
                "rate_limit_refill_per_s",
                self.rate_limit_refill_per_s.to_string(),
            ),
            ("max_worktrees", self.max_worktrees.to_string()),
            (
                "lease_acquire_timeout_s",
                self.lease_acquire_timeout_s.to_string(),
            ),
            ("lease_stale_hours", self.lease_stale_hours.to_string()),
            ("sweep_interval_s", self.sweep_interval_s.to_string()),
            ("job_timeout_s", self.job_timeout_s.to_string()),
            ("reviewer_timeout_s", self.reviewer_timeout_s.to_string()),
            ("max_pending_jobs", self.max_pending_jobs.to_string()),
            ("reviewer_categories", self.reviewer_categories.join(",")),
            ("reviewer_backend", self.reviewer_backend.clone()),
            ("reviewer_model", self.reviewer_model.clone()),
            ("max_body_bytes", self.max_body_bytes.to_string()),
            ("integration_branch", self.integration_branch.clone()),
            ("unit_test_cmd", self.unit_test_cmd.clone()),
            ("integration_test_cmd", self.integration_test_cmd.clone()),
            ("merge_retry_budget", self.merge_retry_budget.to_string()),
            ("bypass_ttl_hours", self.bypass_ttl_hours.to_string()),
            ("git_author_name", self.git_author_name.clone()),
            ("git_author_email", self.git_author_email.clone()),
        ];
        for (key, value) in entries {
            db.seed_config(key, value)?;
        }
        Ok(())
    }

    /// Return a new Config with non-sensitive fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let get = |key: &str| db.get_config(key).ok().flatten();
        let get_str = |key: &str, cur: &str| get(key).unwrap_or_else(|| cur.to_string());
        macro_rules! load_parsed {
            ($key:expr, $field:expr) => {
                if let Some(v) = get($key).and_then(|s| s.parse().ok()) {
                    $field = v;
                }
            };
        }
        c.reviewer_backend = get_str("reviewer_backend", &c.reviewer_backend);
        c.reviewer_model = get_str("reviewer_model", &c.reviewer_model);
        c.integration_branch = get_str("integration_branch", &c.integration_branch);
        c.unit_test_cmd = get_str("unit_test_cmd", &c.unit_test_cmd);
        c.integration_test_cmd = get_str("integration_test_cmd", &c.integration_test_cmd);
        c.git_author_name = get_str("git_author_name", &c.git_author_name);
        c.git_author_email = get_str("git_author_email", &c.git_author_email);
        if let Some(raw) = get("reviewer_categories") {
            let cats = parse_categories(&raw);
            if !cats.is_empty() {
                c.reviewer_categories = cats;
            }
        }
        load_parsed!("rate_limit_capacity", c.rate_limit_capacity);
        load_parsed!("rate_limit_refill_per_s", c.rate_limit_refill_per_s);
        load_parsed!("max_worktrees", c.max_worktrees);
        load_parsed!("lease_acquire_timeout_s", c.lease_acquire_timeout_s);
        load_parsed!("lease_stale_hours", c.lease_stale_hours);
        load_parsed!("sweep_interval_s", c.sweep_interval_s);
        load_parsed!("job_timeout_s", c.job_timeout_s);
        load_parsed!("reviewer_timeout_s", c.reviewer_timeout_s);
        load_parsed!("max_pending_jobs", c.max_pending_jobs);
        load_parsed!("max_body_bytes", c.max_body_bytes);
        load_parsed!("merge_retry_budget", c.merge_retry_budget);
        load_parsed!("bypass_ttl_hours", c.bypass_ttl_hours);
        c
    }

    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        let d = Config::default();

        let mut reviewer_categories = parse_categories(&get_str(
            "REVIEWER_CATEGORIES",
            &dotenv,
            &DEFAULT_CATEGORIES.join(","),
        ));
        if reviewer_categories.is_empty() {
            reviewer_categories = d.reviewer_categories.clone();
        }

        let cfg = Config {
            data_dir: get_str("DATA_DIR", &dotenv, &d.data_dir),
            web_bind: get_str("WEB_BIND", &dotenv, &d.web_bind),
            web_port: get_parsed("WEB_PORT", &dotenv, d.web_port),
            max_body_bytes: get_parsed("MAX_BODY_BYTES", &dotenv, d.max_body_bytes),
            rate_limit_capacity: get_parsed("RATE_LIMIT_CAPACITY", &dotenv, d.rate_limit_capacity),
            rate_limit_refill_per_s: get_parsed(
                "RATE_LIMIT_REFILL_PER_S",
                &dotenv,
                d.rate_limit_refill_per_s,
            ),
            max_worktrees: get_parsed("MAX_WORKTREES", &dotenv, d.max_worktrees),
            lease_acquire_timeout_s: get_parsed(
                "LEASE_ACQUIRE_TIMEOUT_S",
                &dotenv,
                d.lease_acquire_timeout_s,
            ),
            lease_stale_hours: get_parsed("LEASE_STALE_HOURS", &dotenv, d.lease_stale_hours),
            sweep_interval_s: get_parsed("SWEEP_INTERVAL_S", &dotenv, d.sweep_interval_s),
            job_timeout_s: get_parsed("JOB_TIMEOUT_S", &dotenv, d.job_timeout_s),
            reviewer_timeout_s: get_parsed("REVIEWER_TIMEOUT_S", &dotenv, d.reviewer_timeout_s),
            max_pending_jobs: get_parsed("MAX_PENDING_JOBS", &dotenv, d.max_pending_jobs),
            reviewer_categories,
            reviewer_backend: get_str("REVIEWER_BACKEND", &dotenv, &d.reviewer_backend),
            reviewer_url: get_str("REVIEWER_URL", &dotenv, ""),
            reviewer_bin: get_str("REVIEWER_BIN", &dotenv, &d.reviewer_bin),
            reviewer_model: get_str("REVIEWER_MODEL", &dotenv, &d.reviewer_model),
            integration_repo: get_str("INTEGRATION_REPO", &dotenv, ""),
            integration_branch: get_str("INTEGRATION_BRANCH", &dotenv, &d.integration_branch),
            unit_test_cmd: get_str("UNIT_TEST_CMD", &dotenv, ""),
            integration_test_cmd: get_str("INTEGRATION_TEST_CMD", &dotenv, ""),
            merge_retry_budget: get_parsed("MERGE_RETRY_BUDGET", &dotenv, d.merge_retry_budget),
            bypass_ttl_hours: get_parsed("BYPASS_TTL_HOURS", &dotenv, d.bypass_ttl_hours),
            operator_token: get_str("OPERATOR_TOKEN", &dotenv, "").trim().to_string(),
            git_author_name: get_str("GIT_AUTHOR_NAME", &dotenv, ""),
            git_author_email: get_str("GIT_AUTHOR_EMAIL", &dotenv, ""),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject tunables no component can run with. Applies to env values and
    /// to overrides read back from the `config` table alike.
    pub fn validate(&self) -> Result<()> {
        if self.max_worktrees == 0 {
            anyhow::bail!("max_worktrees must be at least 1");
        }
        if self.rate_limit_capacity == 0 {
            anyhow::bail!("rate_limit_capacity must be at least 1");
        }
        if !self.rate_limit_refill_per_s.is_finite() || self.rate_limit_refill_per_s <= 0.0 {
            anyhow::bail!(
                "rate_limit_refill_per_s must be a positive number, got {}",
                self.rate_limit_refill_per_s
            );
        }
        if self.max_body_bytes == 0 {
            anyhow::bail!("max_body_bytes must be positive");
        }
        if self.max_pending_jobs == 0 {
            anyhow::bail!("max_pending_jobs must be at least 1");
        }
        let positive_secs = [
            ("job_timeout_s", self.job_timeout_s),
            ("reviewer_timeout_s", self.reviewer_timeout_s),
            ("lease_acquire_timeout_s", self.lease_acquire_timeout_s),
            ("sweep_interval_s", self.sweep_interval_s),
        ];
        for (key, v) in positive_secs {
            if v == 0 {
                anyhow::bail!("{key} must be positive");
            }
        }
        if self.lease_stale_hours <= 0 || self.bypass_ttl_hours <= 0 {
            anyhow::bail!("lease_stale_hours and bypass_ttl_hours must be positive");
        }
        if self.reviewer_categories.is_empty() {
            anyhow::bail!("reviewer_categories must name at least one category");
        }
        Ok(())
    }
}
