mod logging;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use quorum_core::{
    config::Config,
    db::Db,
    git::Git,
    merge::{merge_queue, MergeEngine, MergeSettings},
    orchestrator::{Orchestrator, OrchestratorSettings},
    pool::{GitWorkspace, ScratchWorkspace, Workspace, WorktreePool},
    ratelimit::RateLimiter,
};
use quorum_server::{middleware::hash_secret, router, AppState};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let env_config = Config::from_env()?;

    std::fs::create_dir_all(&env_config.data_dir)
        .with_context(|| format!("create data dir {}", env_config.data_dir))?;
    let mut db = Db::open(&env_config.db_path())?;
    db.migrate()?;
    env_config.seed_db(&db)?;
    let config = env_config.load_from_db(&db);
    config.validate().context("invalid configuration in config table")?;
    let db = Arc::new(db);

    std::fs::create_dir_all(config.worktree_root())?;
    let git = Git::new(&config.integration_repo)
        .with_author(&config.git_author_name, &config.git_author_email);
    let workspace: Arc<dyn Workspace> = if config.merge_enabled() {
        info!(repo = %config.integration_repo, "using git worktrees for leases");
        Arc::new(GitWorkspace::new(
            git.clone(),
            config.worktree_root(),
            config.integration_branch.clone(),
        ))
    } else {
        warn!("INTEGRATION_REPO not set; leases use scratch directories and merging is disabled");
        Arc::new(ScratchWorkspace::new(config.worktree_root()))
    };
    let pool = Arc::new(WorktreePool::new(
        config.max_worktrees,
        config.lease_stale_hours,
        workspace,
    ));

    let reviewers = quorum_agent::build_panel(&config)?;
    info!(
        backend = %config.reviewer_backend,
        reviewers = reviewers.len(),
        "reviewer panel ready"
    );

    // Merge worker
    let merge_queue = if config.merge_enabled() {
        let (queue, rx) = merge_queue();
        let engine = Arc::new(MergeEngine::new(
            Arc::clone(&db),
            Arc::clone(&pool),
            git,
            MergeSettings::from(&config),
        ));
        match engine.resume_pending(&queue) {
            Ok(0) => {}
            Ok(n) => info!("resuming {n} pending merges"),
            Err(e) => error!("resume pending merges: {e:#}"),
        }
        tokio::spawn(Arc::clone(&engine).run_worker(queue.clone(), rx));
        Some(queue)
    } else {
        None
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&pool),
        reviewers,
        OrchestratorSettings::from(&config),
        merge_queue,
    ));
    orchestrator.fail_interrupted()?;

    // Orphan sweep loop
    {
        let orchestrator = Arc::clone(&orchestrator);
        let every = std::time::Duration::from_secs(config.sweep_interval_s.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let orphaned = orchestrator.sweep();
                if !orphaned.is_empty() {
                    warn!(count = orphaned.len(), "orphan sweep reclaimed leases");
                }
            }
        });
    }

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_capacity,
        config.rate_limit_refill_per_s,
    )?);
    let operator_token_hash =
        (!config.operator_token.is_empty()).then(|| hash_secret(&config.operator_token));
    if operator_token_hash.is_none() {
        warn!("OPERATOR_TOKEN not set; emergency bypass is disabled");
    }
    let state = Arc::new(AppState {
        db,
        orchestrator,
        limiter,
        max_body_bytes: config.max_body_bytes,
        operator_token_hash,
        start_time: Instant::now(),
    });
    let app = router(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("quorum-server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
