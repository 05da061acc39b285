//! The `graft status` command: list workflows or show one workflow's
//! tasks.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use graft_db::queries::{tasks as task_db, workflows as workflow_db};

/// Shorten a single-line string to at most `max` bytes on a char boundary.
fn ellipsize(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Show all workflows, or the task breakdown of one.
pub async fn run_status(pool: &PgPool, workflow_id: Option<&str>) -> Result<()> {
    match workflow_id {
        Some(raw) => {
            let id = Uuid::parse_str(raw).with_context(|| format!("invalid workflow ID: {raw}"))?;
            show_workflow(pool, id).await
        }
        None => list_workflows(pool).await,
    }
}

async fn list_workflows(pool: &PgPool) -> Result<()> {
    let workflows = workflow_db::list_workflows(pool).await?;
    if workflows.is_empty() {
        println!("No workflows.");
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:>8}  {}",
        "WORKFLOW", "STATUS", "REWARD", "PROMPT"
    );
    for workflow in workflows {
        let prompt = ellipsize(&workflow.prompt.replace('\n', " "), 60);
        println!(
            "{:<38} {:<12} {:>8.2}  {}",
            workflow.workflow_id, workflow.final_status, workflow.total_reward, prompt
        );
    }
    Ok(())
}

async fn show_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<()> {
    let workflow = workflow_db::get_workflow(pool, workflow_id)
        .await?
        .with_context(|| format!("workflow {workflow_id} not found"))?;

    println!("Workflow {}", workflow.workflow_id);
    println!("  prompt:  {}", workflow.prompt);
    println!("  status:  {}", workflow.final_status);
    println!("  reward:  {:.2}", workflow.total_reward);
    println!("  created: {}", workflow.created_at);
    if let Some(finalized_at) = workflow.finalized_at {
        println!("  finalized: {finalized_at}");
    }

    let tasks = task_db::list_tasks_for_workflow(pool, workflow_id).await?;
    if tasks.is_empty() {
        println!("  (no tasks)");
        return Ok(());
    }

    println!();
    println!(
        "{:<38} {:<12} {:<16} {:>4} {:>7}  {}",
        "TASK", "STATUS", "TYPE", "GEN", "REWARD", "DESCRIPTION"
    );
    for task in tasks {
        let description = ellipsize(&task.description.replace('\n', " "), 48);
        println!(
            "{:<38} {:<12} {:<16} {:>4} {:>7.2}  {}",
            task.task_id,
            task.status,
            task.executor_type,
            task.correction_generation,
            task.reward,
            description
        );
    }
    Ok(())
}
