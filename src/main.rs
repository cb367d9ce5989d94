use std::sync::Arc;
use std::time::Duration;

use agent_foreman::config::{OrchestratorConfig, WorkerConfig};
use agent_foreman::orchestrator::{DelegateRequest, Orchestrator};
use agent_foreman::runner::types::EnvPolicy;
use agent_foreman::store::{LibSqlTaskStore, TaskStatus, TaskStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let instruction: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if instruction.trim().is_empty() {
        eprintln!("Usage: agent-foreman <instruction for the worker>");
        eprintln!("  AGENT_FOREMAN_DB_PATH      registry path (default ./data/foreman.db)");
        eprintln!("  AGENT_FOREMAN_WORKER_CMD   worker binary (default agent-worker)");
        eprintln!("  AGENT_FOREMAN_MODEL        model selector passed to the worker");
        eprintln!("  AGENT_FOREMAN_INHERIT_ENV  set to 1 to pass the full environment through");
        std::process::exit(2);
    }

    let db_path = std::env::var("AGENT_FOREMAN_DB_PATH")
        .unwrap_or_else(|_| "./data/foreman.db".to_string());
    let worker_cmd =
        std::env::var("AGENT_FOREMAN_WORKER_CMD").unwrap_or_else(|_| "agent-worker".to_string());
    let model = std::env::var("AGENT_FOREMAN_MODEL").ok();
    let inherit_env = std::env::var("AGENT_FOREMAN_INHERIT_ENV").is_ok_and(|v| v == "1");

    eprintln!("agent-foreman v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Registry: {db_path}");
    eprintln!("   Worker:   {worker_cmd}\n");

    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlTaskStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: failed to open registry at {db_path}: {e}");
                std::process::exit(1);
            }),
    );

    let config = OrchestratorConfig {
        worker: WorkerConfig {
            program: worker_cmd,
            env: if inherit_env {
                EnvPolicy::All
            } else {
                EnvPolicy::None
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(store, config);
    let reclaimer = orchestrator.spawn_reclaim_loop();

    let working_dir = std::env::current_dir()
        .ok()
        .map(|p| p.display().to_string());
    let task = orchestrator
        .delegate(DelegateRequest {
            working_dir,
            model,
            ..DelegateRequest::local(instruction)
        })
        .await?;
    eprintln!("Delegated task {}", task.id);

    // Poll the registry until the task is terminal, echoing progress.
    let mut last_action: Option<String> = None;
    let final_task = loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let Some(current) = orchestrator.status(&task.id).await? else {
            eprintln!("Task {} disappeared from the registry", task.id);
            std::process::exit(1);
        };
        if let Some(progress) = &current.progress {
            let action = progress["current_action"].as_str().map(String::from);
            if action.is_some() && action != last_action {
                if let Some(a) = &action {
                    eprintln!("  [{:>3}%] {a}", progress["percent"]);
                }
                last_action = action;
            }
        }
        if current.status.is_terminal() {
            break current;
        }
    };
    reclaimer.abort();

    match final_task.status {
        TaskStatus::Completed | TaskStatus::CompletedWithWarnings => {
            if let Some(result) = &final_task.result {
                eprintln!("Done: {result}");
            } else {
                eprintln!("Done.");
            }
            Ok(())
        }
        status => {
            if let Some(error) = &final_task.error {
                eprintln!("Task ended {}: {error}", status.as_str());
            } else {
                eprintln!("Task ended {}", status.as_str());
            }
            std::process::exit(1);
        }
    }
}
