// tests/recovery_flow.rs
//! Crash and restart scenarios across a real database file: everything a
//! second process needs must come from SQLite and the checkpoint directory,
//! not from anything held in memory by the first one.

use serde_json::json;
use tempfile::TempDir;

use video_factory::db;
use video_factory::models::{ProjectStatus, StepStatus};
use video_factory::pipeline::standard_pipeline;
use video_factory::recovery::RecoveryManager;
use video_factory::registry::ProjectRegistry;
use video_factory::workflow::state_machine::WorkflowStateMachine;

struct Stack {
    registry: ProjectRegistry,
    workflow: WorkflowStateMachine,
    recovery: RecoveryManager,
    pool: sqlx::SqlitePool,
}

async fn open_stack(dir: &TempDir) -> Stack {
    let url = format!("sqlite://{}", dir.path().join("factory.db").display());
    let pool = db::create_pool(&url).await.expect("open database");
    let registry = ProjectRegistry::new(pool.clone(), dir.path().join("projects"));
    let workflow = WorkflowStateMachine::new(pool.clone());
    let recovery = RecoveryManager::new(
        registry.clone(),
        workflow.clone(),
        dir.path().join("checkpoints"),
    );
    Stack {
        registry,
        workflow,
        recovery,
        pool,
    }
}

#[tokio::test]
async fn interrupted_project_survives_process_restart() {
    let dir = TempDir::new().unwrap();

    // First process: get partway through a pipeline, then die mid-step.
    let project_id = {
        let stack = open_stack(&dir).await;
        let project = stack
            .registry
            .create_project("lighthouses of the baltic", 4.0, json!({}))
            .await
            .unwrap();
        stack
            .workflow
            .initialize_workflow_steps(&project.id, &standard_pipeline())
            .await
            .unwrap();

        for number in [1, 2] {
            stack
                .workflow
                .start_step(&project.id, number, json!({}))
                .await
                .unwrap();
            stack
                .workflow
                .complete_step(
                    &project.id,
                    number,
                    json!({ "files": [], "data": { "text": "done" } }),
                )
                .await
                .unwrap();
        }
        stack
            .workflow
            .start_step(&project.id, 3, json!({ "script": "..." }))
            .await
            .unwrap();
        stack
            .registry
            .update_project_status(&project.id, ProjectStatus::Running)
            .await
            .unwrap();
        stack.recovery.auto_save_checkpoint(&project.id).await.unwrap();

        stack.pool.close().await;
        project.id
    };

    // Second process: sweep, find, resume.
    let stack = open_stack(&dir).await;

    let stale = stack.recovery.mark_stale_projects_interrupted().await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, project_id);

    let interrupted = stack.recovery.find_interrupted_projects().await.unwrap();
    assert_eq!(interrupted.len(), 1);

    let outcome = stack
        .recovery
        .resume_interrupted_project(&project_id)
        .await
        .unwrap();
    assert!(outcome.resumable);
    let current = outcome.current_step.unwrap();
    assert_eq!(current.step_number, 3, "mid-flight step is where work continues");
    assert_eq!(current.status, StepStatus::Running);

    // Finished steps kept their results; nothing needs re-running.
    let steps = stack.workflow.get_workflow_steps(&project_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[0].output_data["data"]["text"], "done");

    let project = stack.registry.get_project(&project_id).await.unwrap().unwrap();
    assert_eq!(project.status, ProjectStatus::Running);

    stack.pool.close().await;
}

#[tokio::test]
async fn checkpoint_restore_works_after_restart() {
    let dir = TempDir::new().unwrap();

    // First process: checkpoint a known-good state, then make a mess of it.
    let project_id = {
        let stack = open_stack(&dir).await;
        let project = stack
            .registry
            .create_project("soviet era metro stations", 6.0, json!({}))
            .await
            .unwrap();
        stack
            .workflow
            .initialize_workflow_steps(&project.id, &standard_pipeline())
            .await
            .unwrap();
        stack
            .workflow
            .start_step(&project.id, 1, json!({}))
            .await
            .unwrap();
        stack
            .workflow
            .complete_step(&project.id, 1, json!({ "files": [], "data": { "theme": "mayakovskaya" } }))
            .await
            .unwrap();
        stack.recovery.auto_save_checkpoint(&project.id).await.unwrap();

        // Post-checkpoint damage: a failed step with retries burned.
        stack
            .workflow
            .start_step(&project.id, 2, json!({}))
            .await
            .unwrap();
        stack
            .workflow
            .fail_step(&project.id, 2, "script model returned garbage")
            .await
            .unwrap();
        stack
            .workflow
            .retry_step(&project.id, 2, json!({}))
            .await
            .unwrap();
        stack
            .workflow
            .fail_step(&project.id, 2, "still garbage")
            .await
            .unwrap();

        stack.pool.close().await;
        project.id
    };

    // Second process: roll the steps back to the snapshot.
    let stack = open_stack(&dir).await;

    let latest = stack
        .recovery
        .list_checkpoints(&project_id)
        .unwrap()
        .into_iter()
        .next()
        .expect("checkpoint file from the first process");
    let outcome = stack
        .recovery
        .restore_project_from_checkpoint(&project_id, &latest)
        .await
        .unwrap();
    assert_eq!(outcome.restored_steps, 13);

    let steps = stack.workflow.get_workflow_steps(&project_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].output_data["data"]["theme"], "mayakovskaya");
    assert_eq!(steps[1].status, StepStatus::Pending);
    assert_eq!(steps[1].retry_count, 0);
    assert!(steps[1].error_message.is_none());

    stack.pool.close().await;
}
