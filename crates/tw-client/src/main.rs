//! # tw-watch
//!
//! Follows one or more backend tasks until they resolve, over the push
//! channel when it is reachable and by polling otherwise.

use std::collections::{BTreeMap, HashSet};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use tw_client::{ConnectionEvent, ObserverHandle, PollHandle, TaskClient, TaskOutcome};
use tw_common::AppConfig;
use tw_protocol::{TaskId, TaskUpdate};

#[derive(Parser, Debug)]
#[command(name = "tw-watch", about = "Follow backend task status until completion")]
struct Args {
    /// Task id to follow; repeat for several tasks.
    #[arg(long = "task", required = true)]
    tasks: Vec<TaskId>,

    /// Skip the push channel and poll the REST API only.
    #[arg(long)]
    poll_only: bool,

    /// Print scheduler status snapshots as they arrive.
    #[arg(long)]
    scheduler: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,
}

enum Progress {
    Update(TaskId, TaskUpdate),
    Outcome(TaskId, Option<TaskOutcome>),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = AppConfig::load().context("Failed to load configuration")?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let client = TaskClient::from_config(&config).context("Failed to build client")?;
    tracing::info!(client_id = %client.identity(), tasks = ?args.tasks, "tw-watch starting");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut guards: Vec<ObserverHandle> = Vec::new();

    guards.push(client.on_connection_event(|event| match event {
        ConnectionEvent::StateChanged { to, attempt, .. } => {
            tracing::info!(state = ?to, attempt, "Push channel");
        }
        ConnectionEvent::ServerWarning { message } => {
            tracing::warn!(%message, "Server warning");
        }
    }));

    if args.scheduler {
        guards.push(client.on_scheduler_status(|status| {
            println!(
                "scheduler: running={} pending={} max={} active={}",
                status.running_tasks,
                status.pending_tasks,
                status.max_concurrent,
                status.scheduler_running
            );
        }));
    }

    if !args.poll_only {
        if let Err(e) = client.connect().await {
            tracing::warn!("Push channel unavailable, falling back to polling: {}", e);
        } else if args.scheduler {
            client.request_scheduler_status();
        }
    }

    let mut pending: HashSet<TaskId> = args.tasks.iter().copied().collect();
    for &task_id in &pending {
        let updates = tx.clone();
        let follow = client.follow(task_id, move |update| {
            let _ = updates.send(Progress::Update(task_id, update.clone()));
        });
        guards.push(follow.observer);
        if let Some(poll) = follow.poll {
            forward_outcome(poll, tx.clone());
        }
    }

    let mut results: BTreeMap<TaskId, Option<TaskOutcome>> = BTreeMap::new();
    while !pending.is_empty() {
        let progress = tokio::select! {
            p = rx.recv() => match p {
                Some(p) => p,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        };

        match progress {
            Progress::Update(task_id, update) => {
                println!(
                    "task {}: {} {:.1}%",
                    task_id, update.status, update.progress
                );
                if let Some(outcome) = TaskOutcome::from_update(&update) {
                    if pending.remove(&task_id) {
                        client.cancel_tracking(task_id);
                        results.insert(task_id, Some(outcome));
                    }
                }
            }
            Progress::Outcome(task_id, outcome) => {
                if pending.remove(&task_id) {
                    results.insert(task_id, outcome);
                }
            }
        }
    }

    drop(guards);
    client.shutdown().await;

    let mut all_completed = pending.is_empty();
    for (task_id, outcome) in &results {
        match outcome {
            Some(outcome) => {
                println!("task {}: {}", task_id, describe(outcome));
                all_completed &= outcome.is_success();
            }
            None => {
                println!("task {}: cancelled", task_id);
                all_completed = false;
            }
        }
    }
    for task_id in &pending {
        println!("task {}: unresolved", task_id);
    }

    Ok(if all_completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn forward_outcome(poll: PollHandle, tx: mpsc::UnboundedSender<Progress>) {
    tokio::spawn(async move {
        let outcome = poll.outcome().await;
        let _ = tx.send(Progress::Outcome(poll.task_id(), outcome));
    });
}

fn describe(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Completed { result_ref: Some(r) } => format!("completed ({})", r),
        TaskOutcome::Completed { result_ref: None } => "completed".to_string(),
        TaskOutcome::Failed { reason } => format!("failed: {}", reason),
        TaskOutcome::TimedOut => "timed out".to_string(),
        TaskOutcome::Stuck { progress } => format!("stuck at {:.1}%", progress),
    }
}
