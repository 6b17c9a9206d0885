// src/main.rs
//! Maintenance entry point: brings the database up, sweeps stale state left
//! by a dead orchestrator, resumes interrupted projects and prints a status
//! report. Pipeline execution itself needs engine clients injected and lives
//! behind [`video_factory::pipeline::runner::PipelineRunner`].

use futures::future::join_all;

use video_factory::config::AppConfig;
use video_factory::db;
use video_factory::recovery::RecoveryManager;
use video_factory::registry::ProjectRegistry;
use video_factory::workflow::state_machine::WorkflowStateMachine;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    let config = AppConfig::from_env();

    // Ensure working directories exist before anything touches them
    if let Err(e) = std::fs::create_dir_all(&config.projects_root) {
        tracing::warn!("Failed to create projects directory: {}", e);
    } else {
        tracing::info!("Projects directory ready");
    }
    if let Err(e) = std::fs::create_dir_all(&config.checkpoints_root) {
        tracing::warn!("Failed to create checkpoints directory: {}", e);
    } else {
        tracing::info!("Checkpoints directory ready");
    }

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool. Is DATABASE_URL correct?");
    tracing::info!("✅ Database connection established");

    let registry = ProjectRegistry::new(pool.clone(), config.projects_root.clone());
    let workflow = WorkflowStateMachine::new(pool.clone());
    let recovery = RecoveryManager::new(
        registry.clone(),
        workflow.clone(),
        config.checkpoints_root.clone(),
    );

    // Anything still marked running did not survive the previous process.
    match recovery.mark_stale_projects_interrupted().await {
        Ok(stale) if !stale.is_empty() => {
            tracing::warn!("⚠️ {} project(s) were left running by a dead process", stale.len());
        }
        Ok(_) => {}
        Err(e) => tracing::error!("❌ Stale project sweep failed: {}", e),
    }

    let interrupted = match recovery.find_interrupted_projects().await {
        Ok(projects) => projects,
        Err(e) => {
            tracing::error!("❌ Could not query interrupted projects: {}", e);
            Vec::new()
        }
    };

    if interrupted.is_empty() {
        tracing::info!("No interrupted projects found");
    } else {
        tracing::info!("🔄 Resuming {} interrupted project(s)...", interrupted.len());
        let resumes = interrupted.iter().map(|project| {
            let recovery = recovery.clone();
            let project_id = project.id.clone();
            async move {
                let outcome = recovery.resume_interrupted_project(&project_id).await;
                (project_id, outcome)
            }
        });
        for (project_id, outcome) in join_all(resumes).await {
            match outcome {
                Ok(resume) => {
                    match &resume.current_step {
                        Some(step) => tracing::info!(
                            "🔄 Project {} resumes at step {} ({})",
                            project_id,
                            step.step_number,
                            step.step_name
                        ),
                        None => tracing::info!(
                            "🔄 Project {} has no runnable step left",
                            project_id
                        ),
                    }
                    for action in &resume.next_actions {
                        tracing::info!("   next: {}", action);
                    }
                }
                Err(e) => tracing::error!("❌ Could not resume project {}: {}", project_id, e),
            }
        }
    }

    // Status report over everything on file.
    match registry.list_projects().await {
        Ok(projects) if projects.is_empty() => {
            tracing::info!("No projects on file yet");
        }
        Ok(projects) => {
            for project in projects {
                let progress = match workflow.get_project_progress(&project.id).await {
                    Ok(progress) => progress,
                    Err(e) => {
                        tracing::error!("❌ Progress check failed for {}: {}", project.id, e);
                        continue;
                    }
                };
                let eta = workflow
                    .calculate_estimated_remaining_time(&project.id)
                    .await
                    .map(|d| d.num_seconds())
                    .unwrap_or(0);
                tracing::info!(
                    "📊 {} [{}] {:.1}% ({}/{} steps, {} failed, ~{}s remaining) theme: {}",
                    project.id,
                    project.status,
                    progress.completion_percentage,
                    progress.completed_steps,
                    progress.total_steps,
                    progress.failed_steps,
                    eta,
                    project.theme
                );
                if progress.failed_steps > 0 {
                    if let Ok(recommendations) =
                        recovery.get_recovery_recommendations(&project.id).await
                    {
                        for action in &recommendations.recommended_actions {
                            tracing::warn!("   ⚠️ {}", action);
                        }
                    }
                }
                if let Err(e) =
                    recovery.cleanup_old_checkpoints(&project.id, config.checkpoint_keep_count)
                {
                    tracing::warn!("Checkpoint cleanup failed for {}: {}", project.id, e);
                }
            }
        }
        Err(e) => tracing::error!("❌ Could not list projects: {}", e),
    }

    pool.close().await;
    tracing::info!("Done");
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    // Get log level from environment or default to INFO for production
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,video_factory=trace,sqlx=info".to_string()
        } else {
            "info,video_factory=info,sqlx=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    // JSON logging for aggregation, human-readable otherwise
    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("🎬 video_factory starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Build mode: {}",
        if cfg!(debug_assertions) { "development" } else { "production" }
    );
    tracing::info!("Log level: {}", log_level);

    Ok(())
}
